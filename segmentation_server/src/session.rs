use parking_lot::RwLock;
use std::{collections::HashMap, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// State kept for one caller-chosen session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub source_path: Option<PathBuf>,
    pub active: bool,
}

impl Session {
    /// Image uploads are registered for bookkeeping only and never stream.
    pub fn image() -> Self {
        Self {
            source_path: None,
            active: false,
        }
    }

    pub fn video(source_path: PathBuf) -> Self {
        Self {
            source_path: Some(source_path),
            active: true,
        }
    }
}

/// Process-wide map from session id to [`Session`].
///
/// The lock is only ever held for the map access itself, never across
/// decoding, inference or I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins.
    pub fn put(&self, id: &str, session: Session) {
        self.sessions.write().insert(id.to_string(), session);
    }

    pub fn get(&self, id: &str) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.active = active;
        Ok(())
    }

    /// Flip the session inactive and return what it looked like at that moment.
    pub fn deactivate(&self, id: &str) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.active = false;
        Ok(session.clone())
    }

    /// Unknown ids read as inactive.
    pub fn is_active(&self, id: &str) -> bool {
        self.sessions
            .read()
            .get(id)
            .map(|session| session.active)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
