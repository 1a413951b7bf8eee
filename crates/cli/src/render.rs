use std::io::{self, Write};

use types::{FragmentKind, RenderFragment};

/// Line-oriented terminal sink for render fragments.
///
/// Answer content goes to `out` so it can be piped; reasoning, tool status
/// lines and errors go to `err`.
pub struct TerminalRenderer<O, E> {
    out: O,
    err: E,
    /// Whether the last byte written to `out` for the current response was
    /// a newline (or nothing was written yet).
    content_at_line_start: bool,
    reasoning_open: bool,
}

impl TerminalRenderer<io::Stdout, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> TerminalRenderer<O, E> {
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            content_at_line_start: true,
            reasoning_open: false,
        }
    }

    pub fn apply_fragment(&mut self, fragment: &RenderFragment) -> io::Result<()> {
        if fragment.kind != FragmentKind::Reasoning {
            self.close_reasoning()?;
        }
        match fragment.kind {
            FragmentKind::Content => {
                if fragment.text.is_empty() {
                    return Ok(());
                }
                self.out.write_all(fragment.text.as_bytes())?;
                self.content_at_line_start = fragment.text.ends_with('\n');
                self.out.flush()
            }
            FragmentKind::Reasoning => {
                if !self.reasoning_open {
                    self.err.write_all(b"[reasoning] ")?;
                    self.reasoning_open = true;
                }
                self.err.write_all(fragment.text.as_bytes())?;
                self.err.flush()
            }
            FragmentKind::ToolStatus => {
                self.break_content_line()?;
                writeln!(self.err, "{}", fragment.text)?;
                self.err.flush()
            }
            FragmentKind::Error => {
                self.break_content_line()?;
                writeln!(self.err, "[error] {}", fragment.text)?;
                self.err.flush()
            }
        }
    }

    /// Terminate the current response so the next prompt starts on a fresh
    /// line.
    pub fn finish_response(&mut self) -> io::Result<()> {
        self.close_reasoning()?;
        self.break_content_line()?;
        self.out.flush()
    }

    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }

    fn break_content_line(&mut self) -> io::Result<()> {
        if !self.content_at_line_start {
            self.out.write_all(b"\n")?;
            self.content_at_line_start = true;
        }
        Ok(())
    }

    fn close_reasoning(&mut self) -> io::Result<()> {
        if self.reasoning_open {
            self.err.write_all(b"\n")?;
            self.reasoning_open = false;
        }
        Ok(())
    }
}
