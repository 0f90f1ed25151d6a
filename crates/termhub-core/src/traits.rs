//! Core types and collaborator traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::{ControlDir, SessionMetadata};

/// Session identifier.
///
/// Assigned externally by whatever process creates the session directory.
pub type SessionId = String;

/// Session lookup error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Invalid session id: {0:?}")]
    InvalidId(SessionId),
    #[error("Invalid session metadata for {id}: {source}")]
    InvalidMetadata {
        id: SessionId,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner of the PTY processes backing sessions.
///
/// Process spawning lives outside termhub; components only ever ask whether
/// a session is known.
#[async_trait]
pub trait PtyManager: Send + Sync {
    /// Look up a session by id.
    async fn get_session(&self, id: &str) -> Option<SessionMetadata>;
}

/// The control directory itself is the simplest session source: a session
/// exists while its metadata file is readable.
#[async_trait]
impl PtyManager for ControlDir {
    async fn get_session(&self, id: &str) -> Option<SessionMetadata> {
        self.read_metadata(id).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_dir_as_pty_manager() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        std::fs::create_dir_all(dir.session_dir("abc").unwrap()).unwrap();
        std::fs::write(dir.metadata_path("abc").unwrap(), r#"{"id":"abc","name":"shell"}"#).unwrap();

        let manager: &dyn PtyManager = &dir;
        let found = manager.get_session("abc").await.unwrap();
        assert_eq!(found.name.as_deref(), Some("shell"));
        assert!(manager.get_session("missing").await.is_none());
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::NotFound("s1".to_string());
        assert_eq!(err.to_string(), "Session not found: s1");
    }
}
