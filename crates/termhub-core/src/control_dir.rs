//! Control directory layout and session metadata.
//!
//! Every session lives in `<root>/<session_id>/`, holding a `session.json`
//! metadata file written by the session creator and a `stdout` transcript.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::{SessionError, SessionId};

/// Metadata file name inside a session directory.
pub const METADATA_FILE: &str = "session.json";

/// Transcript file name inside a session directory.
pub const TRANSCRIPT_FILE: &str = "stdout";

/// Default terminal size when metadata carries none.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Contents of a session's `session.json`.
///
/// Only a handful of fields matter to termhub; everything else is kept in
/// `extra` so it can be passed through to API consumers untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,

    /// Older writers use `session_id` instead of `id`.
    #[serde(default, rename = "session_id", skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<SessionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Either a string or an argv array, depending on the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_cols: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_rows: Option<u16>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SessionMetadata {
    /// The session id this metadata declares, preferring `id`.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.id.as_deref().or(self.legacy_id.as_deref())
    }

    /// Initial terminal dimensions as `(cols, rows)`, falling back to 80x24.
    #[must_use]
    pub fn dimensions(&self) -> (u16, u16) {
        (
            self.initial_cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS),
            self.initial_rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS),
        )
    }
}

/// Check that `id` is a single plain path component.
///
/// # Errors
/// Returns `InvalidId` if it is not.
pub fn validate_session_id(id: &str) -> Result<(), SessionError> {
    let mut components = Path::new(id).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || id.contains(['/', '\\']) || id.contains("..") || id.contains('\0') {
        return Err(SessionError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// The shared control directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDir {
    root: PathBuf,
}

impl ControlDir {
    /// Create a handle rooted at `root`. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.vibetunnel/control`, or a relative path if there is no home.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vibetunnel")
            .join("control")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory of one session. The id must name a direct child of the root.
    ///
    /// # Errors
    /// Returns `InvalidId` for ids that are empty, contain a separator or
    /// `..`, or would otherwise escape the root.
    pub fn session_dir(&self, id: &str) -> Result<PathBuf, SessionError> {
        validate_session_id(id)?;
        Ok(self.root.join(id))
    }

    /// # Errors
    /// Same as [`Self::session_dir`].
    pub fn metadata_path(&self, id: &str) -> Result<PathBuf, SessionError> {
        Ok(self.session_dir(id)?.join(METADATA_FILE))
    }

    /// # Errors
    /// Same as [`Self::session_dir`].
    pub fn transcript_path(&self, id: &str) -> Result<PathBuf, SessionError> {
        Ok(self.session_dir(id)?.join(TRANSCRIPT_FILE))
    }

    /// Create the directory if it does not exist yet.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn ensure_exists(&self) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Read and parse a session's metadata file.
    ///
    /// When the file names no id, the directory name is used.
    ///
    /// # Errors
    /// Returns `InvalidId` for an id outside the root, `NotFound` if the file
    /// is missing, `InvalidMetadata` if it is not valid JSON.
    pub async fn read_metadata(&self, id: &str) -> Result<SessionMetadata, SessionError> {
        let raw = match tokio::fs::read(self.metadata_path(id)?).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut metadata: SessionMetadata =
            serde_json::from_slice(&raw).map_err(|source| SessionError::InvalidMetadata {
                id: id.to_string(),
                source,
            })?;
        if metadata.session_id().is_none() {
            metadata.id = Some(id.to_string());
        }
        Ok(metadata)
    }

    /// List every session directory that has readable metadata.
    ///
    /// Directories without metadata (still being created, or foreign) are
    /// skipped.
    ///
    /// # Errors
    /// Returns error if the control directory itself cannot be read.
    pub async fn list_sessions(&self) -> Result<Vec<SessionMetadata>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.read_metadata(&name).await {
                Ok(metadata) => sessions.push(metadata),
                Err(e) => tracing::debug!(session_id = %name, "Skipping session directory: {e}"),
            }
        }
        sessions.sort_by(|a, b| a.session_id().cmp(&b.session_id()));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_parsing() {
        let json = r#"{
            "id": "abc",
            "name": "build",
            "command": ["bash", "-l"],
            "workingDir": "/tmp",
            "initialCols": 120,
            "initialRows": 40,
            "pid": 42
        }"#;
        let metadata: SessionMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.session_id(), Some("abc"));
        assert_eq!(metadata.dimensions(), (120, 40));
        assert_eq!(metadata.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(metadata.extra.get("pid"), Some(&Value::from(42)));
    }

    #[test]
    fn test_legacy_id_and_default_size() {
        let metadata: SessionMetadata =
            serde_json::from_str(r#"{"session_id":"old","initialCols":0}"#).unwrap();
        assert_eq!(metadata.session_id(), Some("old"));
        assert_eq!(metadata.dimensions(), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[tokio::test]
    async fn test_read_metadata_falls_back_to_dir_name() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        std::fs::create_dir_all(dir.session_dir("s1").unwrap()).unwrap();
        std::fs::write(dir.metadata_path("s1").unwrap(), r#"{"name":"x"}"#).unwrap();

        let metadata = dir.read_metadata("s1").await.unwrap();
        assert_eq!(metadata.session_id(), Some("s1"));

        assert!(matches!(
            dir.read_metadata("s2").await,
            Err(SessionError::NotFound(id)) if id == "s2"
        ));
    }

    #[tokio::test]
    async fn test_list_sessions_skips_incomplete() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        for id in ["b", "a"] {
            std::fs::create_dir_all(dir.session_dir(id).unwrap()).unwrap();
            std::fs::write(dir.metadata_path(id).unwrap(), format!(r#"{{"id":"{id}"}}"#)).unwrap();
        }
        std::fs::create_dir_all(dir.session_dir("pending").unwrap()).unwrap();
        std::fs::create_dir_all(dir.session_dir("broken").unwrap()).unwrap();
        std::fs::write(dir.metadata_path("broken").unwrap(), "{not json").unwrap();

        let ids: Vec<_> = dir
            .list_sessions()
            .await
            .unwrap()
            .iter()
            .filter_map(|m| m.session_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_session_ids_stay_inside_root() {
        let dir = ControlDir::new("/srv/control");
        assert_eq!(
            dir.transcript_path("abc-123").unwrap(),
            Path::new("/srv/control/abc-123/stdout")
        );
        assert!(dir.session_dir("v1.2").is_ok());

        for id in ["", ".", "..", "../secret", "a/b", "a\\b", "/etc/passwd", "x..y", "nul\0"] {
            assert!(
                matches!(dir.session_dir(id), Err(SessionError::InvalidId(ref bad)) if bad == id),
                "{id:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_read_metadata_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("control");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(tmp.path().join("outside")).unwrap();
        std::fs::write(tmp.path().join("outside").join(METADATA_FILE), r#"{"id":"x"}"#).unwrap();

        let dir = ControlDir::new(&root);
        assert!(matches!(
            dir.read_metadata("../outside").await,
            Err(SessionError::InvalidId(_))
        ));
        let absolute = tmp.path().join("outside").to_string_lossy().into_owned();
        assert!(matches!(
            dir.read_metadata(&absolute).await,
            Err(SessionError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sessions_missing_root() {
        let dir = ControlDir::new("/nonexistent/termhub/control");
        assert!(dir.list_sessions().await.unwrap().is_empty());
    }
}
