//! Incremental markdown promotion.
//!
//! Streamed text is split into a stable prefix that is safe to render and an
//! unstable tail that may still change meaning. Only complete lines are ever
//! promoted, and an unclosed code fence holds back everything from its
//! opening line onward so a code block is rendered in one piece.

use std::mem;

/// Result of [`MarkdownStabilizer::finalize`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Finalized {
    /// Whatever was still held back, if anything.
    pub fragment: Option<String>,
    /// The full text of the turn.
    pub document: String,
}

#[derive(Debug, Default)]
pub struct MarkdownStabilizer {
    stable_text: String,
    unstable_buffer: String,
}

impl MarkdownStabilizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stable_text(&self) -> &str {
        &self.stable_text
    }

    pub fn unstable_buffer(&self) -> &str {
        &self.unstable_buffer
    }

    /// Feed one chunk and return the newly promoted text, if any.
    pub fn advance(&mut self, chunk: &str) -> Option<String> {
        if chunk.is_empty() {
            return None;
        }
        self.unstable_buffer.push_str(chunk);

        let split = stable_split_point(&self.unstable_buffer);
        if split == 0 {
            return None;
        }
        let promoted = self.unstable_buffer.drain(..split).collect::<String>();
        self.stable_text.push_str(&promoted);
        Some(promoted)
    }

    /// Promote the remainder and reset for the next turn.
    pub fn finalize(&mut self) -> Finalized {
        let remainder = mem::take(&mut self.unstable_buffer);
        self.stable_text.push_str(&remainder);
        Finalized {
            fragment: (!remainder.is_empty()).then_some(remainder),
            document: mem::take(&mut self.stable_text),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFence {
    start: usize,
    backticks: usize,
}

/// Byte offset up to which `buffer` can be promoted. The buffer always starts
/// outside a code fence.
fn stable_split_point(buffer: &str) -> usize {
    let mut open: Option<OpenFence> = None;
    let mut line_start = 0;

    for (newline, _) in buffer.match_indices('\n') {
        let line = buffer[line_start..newline].trim_end_matches('\r');
        match open {
            None => {
                if let Some(backticks) = opening_fence(line) {
                    open = Some(OpenFence {
                        start: line_start,
                        backticks,
                    });
                }
            }
            Some(fence) => {
                if is_closing_fence(line, fence.backticks) {
                    open = None;
                }
            }
        }
        line_start = newline + 1;
    }

    match open {
        Some(fence) => fence.start,
        // After the last newline; zero when no line is complete yet.
        None => line_start,
    }
}

/// Split a line into its backtick run and the rest, allowing up to three
/// spaces of indentation.
fn fence_run(line: &str) -> Option<(usize, &str)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let body = &line[indent..];
    let backticks = body.len() - body.trim_start_matches('`').len();
    (backticks >= 3).then(|| (backticks, &body[backticks..]))
}

fn opening_fence(line: &str) -> Option<usize> {
    let (backticks, info) = fence_run(line)?;
    (!info.contains('`')).then_some(backticks)
}

fn is_closing_fence(line: &str, opener_backticks: usize) -> bool {
    fence_run(line).is_some_and(|(backticks, rest)| {
        backticks >= opener_backticks && rest.trim().is_empty()
    })
}
