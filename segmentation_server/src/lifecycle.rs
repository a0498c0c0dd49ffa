use crate::session::{Session, SessionRegistry};
use bytes::Bytes;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("Unsupported media kind: {0:?}")]
    UnsupportedMediaKind(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if content_type.starts_with("image/") {
            Some(Self::Image)
        } else if content_type.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

#[derive(Debug)]
pub enum Registration {
    /// Raw bytes handed to the one-shot image path.
    Image(Bytes),
    /// Where the upload was persisted; the session is now streamable.
    Video(PathBuf),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    CleanupConflict(PathBuf),
}

pub struct SessionLifecycle {
    registry: Arc<SessionRegistry>,
    temp_root: PathBuf,
}

impl SessionLifecycle {
    pub fn new(registry: Arc<SessionRegistry>, temp_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            temp_root: temp_root.into(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.temp_root.join(session_id)
    }

    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, content_type = %upload.content_type))]
    pub async fn register(
        &self,
        session_id: &str,
        upload: Upload,
    ) -> Result<Registration, LifecycleError> {
        validate_session_id(session_id)?;

        match MediaKind::from_content_type(&upload.content_type) {
            Some(MediaKind::Image) => {
                self.registry.put(session_id, Session::image());
                tracing::info!("Registered image session {}", session_id);
                Ok(Registration::Image(upload.data))
            }
            Some(MediaKind::Video) => {
                let path = self.source_path(session_id, &upload.file_name)?;
                let dir = self.session_dir(session_id);
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|source| LifecycleError::Io {
                        path: dir.clone(),
                        source,
                    })?;
                fs::write(&path, &upload.data)
                    .await
                    .map_err(|source| LifecycleError::Io {
                        path: path.clone(),
                        source,
                    })?;

                self.registry.put(session_id, Session::video(path.clone()));
                tracing::info!(
                    "Registered video session {} ({} bytes at {:?})",
                    session_id,
                    upload.data.len(),
                    path
                );
                Ok(Registration::Video(path))
            }
            None => Err(LifecycleError::UnsupportedMediaKind(upload.content_type)),
        }
    }

    /// Stop any stream for `session_id` and remove its temp storage.
    ///
    /// The liveness flag is flipped before anything is deleted, so a running
    /// stream sees the stop request no later than its next frame.
    #[instrument(skip(self))]
    pub async fn clear(&self, session_id: &str) -> Result<ClearOutcome, LifecycleError> {
        let session = self
            .registry
            .deactivate(session_id)
            .map_err(|_| LifecycleError::SessionNotFound(session_id.to_string()))?;

        if let Some(path) = &session.source_path {
            remove_if_exists(path, fs::remove_file(path).await)?;
        }

        let dir = self.session_dir(session_id);
        match fs::remove_dir(&dir).await {
            Ok(()) => Ok(ClearOutcome::Cleared),
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                tracing::warn!("Session directory {:?} not empty, leaving it", dir);
                Ok(ClearOutcome::CleanupConflict(dir))
            }
            Err(e) => remove_if_exists(&dir, Err(e)).map(|_| ClearOutcome::Cleared),
        }
    }

    fn source_path(&self, session_id: &str, file_name: &str) -> Result<PathBuf, LifecycleError> {
        let name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| LifecycleError::InvalidFileName(file_name.to_string()))?;
        Ok(self.session_dir(session_id).join(name))
    }
}

fn remove_if_exists(path: &Path, result: std::io::Result<()>) -> Result<(), LifecycleError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LifecycleError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Session ids become a directory name under the temp root.
fn validate_session_id(session_id: &str) -> Result<(), LifecycleError> {
    let invalid = session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(LifecycleError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}
