use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use types::SideInput;

/// One scratch directory per chat session, created on first use and removed
/// when the session is released.
#[derive(Debug)]
pub struct SessionWorkspaces {
    root: PathBuf,
    sessions: Mutex<HashMap<String, PathBuf>>,
}

impl SessionWorkspaces {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self, session_id: &str) -> io::Result<PathBuf> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = sessions.get(session_id) {
            return Ok(path.clone());
        }
        let path = self.root.join(format!("session-{}", sanitize(session_id)));
        fs::create_dir_all(&path)?;
        tracing::debug!(session_id, path = %path.display(), "created session workspace");
        sessions.insert(session_id.to_owned(), path.clone());
        Ok(path)
    }

    pub fn get(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn release(&self, session_id: &str) {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if let Some(path) = removed
            && let Err(error) = fs::remove_dir_all(&path)
        {
            tracing::warn!(session_id, path = %path.display(), %error, "failed to remove session workspace");
        }
    }

    /// Write attachments into the workspace under their base names.
    pub fn materialize(&self, workspace: &Path, side_inputs: &[SideInput]) -> io::Result<()> {
        for input in side_inputs {
            let name = input.file_name();
            if name.is_empty() || name == "." || name == ".." {
                tracing::warn!(path = %input.path, "skipping attachment without a usable file name");
                continue;
            }
            fs::write(workspace.join(name), &input.data)?;
        }
        Ok(())
    }
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
