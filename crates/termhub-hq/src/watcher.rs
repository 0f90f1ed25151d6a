//! Control-directory watcher.
//!
//! Session creators make a directory first and write `session.json` into it
//! a moment later, so a new directory is polled with backoff before it is
//! reported. Deletions need no polling: the directory name is the id.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::ModifyKind,
};
use termhub_core::{ControlDir, PtyManager, SessionError, SessionId, ShutdownState};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use crate::{
    client::{HqClient, HqError, SessionAction},
    registry::RemoteRegistry,
};

/// Watcher error.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("HQ notification failed: {0}")]
    Hq(#[from] HqError),
}

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Attempts to find `session.json` in a new directory.
    pub metadata_attempts: u32,
    /// Delay after the first failed attempt; doubles each time.
    pub metadata_backoff: Duration,
    /// Repeated created events for the same session inside this window are
    /// ignored.
    pub dedup_window: Duration,
    /// Dedup entries older than this are pruned.
    pub dedup_retention: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            metadata_attempts: 5,
            metadata_backoff: Duration::from_millis(100),
            dedup_window: Duration::from_secs(5),
            dedup_retention: Duration::from_secs(60),
        }
    }
}

/// Role of this process, deciding where session changes are propagated.
#[derive(Clone)]
pub enum WatcherMode {
    /// No HQ involved.
    Standalone,
    /// A registered Remote: push changes to HQ.
    Remote(Arc<HqClient>),
    /// HQ itself: update the registry directly.
    Hq(Arc<RemoteRegistry>),
}

/// A session appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    Created(SessionId),
    Deleted(SessionId),
}

/// What [`ControlDirWatcher::handle_file_change`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    Created { session_id: SessionId, notified: bool },
    Deleted { session_id: SessionId, notified: bool },
    /// Already reported inside the dedup window.
    Duplicate(SessionId),
    /// Not a session directory, or its metadata never showed up.
    Ignored,
}

struct WatcherInner {
    control_dir: ControlDir,
    mode: WatcherMode,
    shutdown: ShutdownState,
    pty_manager: Option<Arc<dyn PtyManager>>,
    config: WatcherConfig,
    recent: Mutex<HashMap<SessionId, Instant>>,
    changes: broadcast::Sender<SessionChange>,
}

/// Watches the control directory for session creation and deletion.
pub struct ControlDirWatcher {
    inner: Arc<WatcherInner>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ControlDirWatcher {
    #[must_use]
    pub fn new(control_dir: ControlDir, mode: WatcherMode, shutdown: ShutdownState) -> Self {
        Self::with_config(control_dir, mode, shutdown, WatcherConfig::default())
    }

    #[must_use]
    pub fn with_config(
        control_dir: ControlDir,
        mode: WatcherMode,
        shutdown: ShutdownState,
        config: WatcherConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(WatcherInner {
                control_dir,
                mode,
                shutdown,
                pty_manager: None,
                config,
                recent: Mutex::new(HashMap::new()),
                changes,
            }),
            watcher: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Consult `pty_manager` when a session shows up.
    ///
    /// Must be called before [`Self::start`].
    #[must_use]
    pub fn with_pty_manager(mut self, pty_manager: Arc<dyn PtyManager>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.pty_manager = Some(pty_manager);
        }
        self
    }

    /// Subscribe to session changes seen by this watcher.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.inner.changes.subscribe()
    }

    /// Create the control directory if needed and start watching it.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or watched.
    pub async fn start(&self) -> Result<(), WatcherError> {
        self.inner.control_dir.ensure_exists().await?;
        let root: PathBuf = self.inner.control_dir.path().to_path_buf();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let watched_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Control directory watch error: {e}");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            ) {
                return;
            }
            for path in event.paths {
                if path.parent() != Some(watched_root.as_path()) {
                    continue;
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    let _ = tx.send(name.to_string());
                }
            }
        })?;
        watcher.watch(&root, RecursiveMode::NonRecursive)?;

        let inner = Arc::clone(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(name) = rx.recv().await {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = inner.handle_file_change(&name).await {
                        tracing::warn!(file = %name, "Failed to handle control directory change: {e}");
                    }
                });
            }
        });

        *self.watcher.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(watcher);
        if let Some(previous) = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(pump)
        {
            previous.abort();
        }
        tracing::info!(path = %root.display(), "Watching control directory");
        Ok(())
    }

    /// Stop watching. In-flight change handlers run to completion.
    pub fn stop(&self) {
        self.watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }

    /// Process one entry name from the control directory.
    ///
    /// # Errors
    /// Returns error if the entry cannot be inspected or HQ could not be
    /// notified outside of shutdown.
    pub async fn handle_file_change(&self, name: &str) -> Result<ChangeOutcome, WatcherError> {
        self.inner.handle_file_change(name).await
    }
}

impl WatcherInner {
    async fn handle_file_change(&self, name: &str) -> Result<ChangeOutcome, WatcherError> {
        let Ok(path) = self.control_dir.session_dir(name) else {
            tracing::debug!(entry = name, "Ignoring entry that is not a session id");
            return Ok(ChangeOutcome::Ignored);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => self.session_created(name).await,
            Ok(_) => Ok(ChangeOutcome::Ignored),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.session_deleted(name).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn session_created(&self, name: &str) -> Result<ChangeOutcome, WatcherError> {
        let Some(metadata) = self.wait_for_metadata(name).await else {
            tracing::warn!(dir = name, "Session directory has no readable session.json, ignoring");
            return Ok(ChangeOutcome::Ignored);
        };
        let session_id = metadata.session_id().unwrap_or(name).to_string();

        if !self.mark_seen(&session_id) {
            tracing::debug!(session_id, "Duplicate session created event");
            return Ok(ChangeOutcome::Duplicate(session_id));
        }

        if let Some(pty_manager) = &self.pty_manager {
            let known = pty_manager.get_session(&session_id).await.is_some();
            tracing::debug!(session_id, known, "Checked session against PTY manager");
        }
        tracing::info!(session_id, "Session created");
        let _ = self.changes.send(SessionChange::Created(session_id.clone()));

        let notified = self.notify_hq(SessionAction::Created, &session_id).await?;
        Ok(ChangeOutcome::Created { session_id, notified })
    }

    async fn session_deleted(&self, name: &str) -> Result<ChangeOutcome, WatcherError> {
        let session_id = name.to_string();
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&session_id);

        tracing::info!(session_id, "Session deleted");
        let _ = self.changes.send(SessionChange::Deleted(session_id.clone()));

        let notified = match &self.mode {
            WatcherMode::Hq(registry) => {
                if let Some(owner) = registry.remove_session_from_remote(&session_id) {
                    tracing::debug!(session_id, remote_id = %owner, "Removed deleted session from registry");
                }
                false
            }
            _ => self.notify_hq(SessionAction::Deleted, &session_id).await?,
        };
        Ok(ChangeOutcome::Deleted { session_id, notified })
    }

    /// Poll for `session.json`, backing off between attempts.
    async fn wait_for_metadata(&self, name: &str) -> Option<termhub_core::SessionMetadata> {
        let mut delay = self.config.metadata_backoff;
        for attempt in 1..=self.config.metadata_attempts {
            match self.control_dir.read_metadata(name).await {
                Ok(metadata) => return Some(metadata),
                Err(e) => {
                    tracing::trace!(dir = name, attempt, "session.json not ready: {e}");
                }
            }
            if attempt < self.config.metadata_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        None
    }

    /// Record a created event. Returns `false` if one was already recorded
    /// inside the dedup window.
    fn mark_seen(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut recent = self
            .recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let retention = self.config.dedup_retention;
        recent.retain(|_, seen| now.duration_since(*seen) < retention);

        if recent
            .get(session_id)
            .is_some_and(|seen| now.duration_since(*seen) < self.config.dedup_window)
        {
            return false;
        }
        recent.insert(session_id.to_string(), now);
        true
    }

    /// Push a session change to HQ when running as a Remote.
    ///
    /// Returns whether HQ acknowledged it.
    async fn notify_hq(&self, action: SessionAction, session_id: &str) -> Result<bool, WatcherError> {
        let WatcherMode::Remote(client) = &self.mode else {
            return Ok(false);
        };
        if self.shutdown.is_shutting_down() {
            tracing::debug!(session_id, "Shutting down, not notifying HQ");
            return Ok(false);
        }

        match client.notify_session_change(action, session_id).await {
            Ok(()) => {
                tracing::debug!(session_id, ?action, "Notified HQ of session change");
                Ok(true)
            }
            Err(e) if e.status() == Some(503) && self.shutdown.is_shutting_down() => {
                tracing::debug!(session_id, "HQ is refusing work while we shut down");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;
    use crate::registry::RemoteRegistration;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            metadata_backoff: Duration::from_millis(20),
            ..WatcherConfig::default()
        }
    }

    fn remote_watcher(
        dir: &ControlDir,
        server: &MockServer,
        shutdown: ShutdownState,
        config: WatcherConfig,
    ) -> ControlDirWatcher {
        let client = HqClient::new(server.uri(), "u", "p", "remote-a", "http://remote", "tok");
        ControlDirWatcher::with_config(dir.clone(), WatcherMode::Remote(Arc::new(client)), shutdown, config)
    }

    #[tokio::test]
    async fn test_late_metadata_is_retried_and_notified_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/remotes/remote-a/refresh-sessions"))
            .and(body_json(serde_json::json!({"action": "created", "sessionId": "s1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let watcher = remote_watcher(&dir, &server, ShutdownState::new(), WatcherConfig::default());

        std::fs::create_dir_all(dir.session_dir("s1").unwrap()).unwrap();
        let metadata_path = dir.metadata_path("s1").unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            tokio::fs::write(metadata_path, r#"{"id":"s1","name":"late"}"#).await.unwrap();
        });

        let outcome = watcher.handle_file_change("s1").await.unwrap();
        writer.await.unwrap();
        assert_eq!(
            outcome,
            ChangeOutcome::Created {
                session_id: "s1".to_string(),
                notified: true
            }
        );

        let again = watcher.handle_file_change("s1").await.unwrap();
        assert_eq!(again, ChangeOutcome::Duplicate("s1".to_string()));
    }

    #[tokio::test]
    async fn test_missing_metadata_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let watcher = ControlDirWatcher::with_config(
            dir.clone(),
            WatcherMode::Standalone,
            ShutdownState::new(),
            fast_config(),
        );
        std::fs::create_dir_all(dir.session_dir("empty").unwrap()).unwrap();

        assert_eq!(watcher.handle_file_change("empty").await.unwrap(), ChangeOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_entries_outside_root_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path().join("control"));
        std::fs::create_dir_all(tmp.path().join("elsewhere")).unwrap();
        let watcher = remote_watcher(&dir, &server, ShutdownState::new(), fast_config());
        let mut changes = watcher.subscribe();

        for name in ["../elsewhere", "..", ""] {
            assert_eq!(watcher.handle_file_change(name).await.unwrap(), ChangeOutcome::Ignored);
        }
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_session_notifies_hq() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/remotes/remote-a/refresh-sessions"))
            .and(body_json(serde_json::json!({"action": "deleted", "sessionId": "gone"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let watcher = remote_watcher(&dir, &server, ShutdownState::new(), fast_config());
        let mut changes = watcher.subscribe();

        let outcome = watcher.handle_file_change("gone").await.unwrap();
        assert_eq!(
            outcome,
            ChangeOutcome::Deleted {
                session_id: "gone".to_string(),
                notified: true
            }
        );
        assert_eq!(changes.try_recv().unwrap(), SessionChange::Deleted("gone".to_string()));
    }

    #[tokio::test]
    async fn test_hq_mode_removes_session_from_registry() {
        let registry = Arc::new(RemoteRegistry::new());
        registry
            .register(RemoteRegistration {
                id: "r1".to_string(),
                name: "one".to_string(),
                url: "http://r1".to_string(),
                token: "t".to_string(),
            })
            .unwrap();
        registry.add_session_to_remote("r1", "s1");

        let tmp = tempfile::tempdir().unwrap();
        let watcher = ControlDirWatcher::with_config(
            ControlDir::new(tmp.path()),
            WatcherMode::Hq(Arc::clone(&registry)),
            ShutdownState::new(),
            fast_config(),
        );

        let outcome = watcher.handle_file_change("s1").await.unwrap();
        assert!(matches!(outcome, ChangeOutcome::Deleted { notified: false, .. }));
        assert!(registry.get_remote_by_session_id("s1").is_none());
    }

    #[tokio::test]
    async fn test_no_hq_calls_after_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let shutdown = ShutdownState::new();
        shutdown.begin();
        let watcher = remote_watcher(&dir, &server, shutdown, fast_config());

        let outcome = watcher.handle_file_change("s1").await.unwrap();
        assert!(matches!(outcome, ChangeOutcome::Deleted { notified: false, .. }));
    }

    #[tokio::test]
    async fn test_503_during_shutdown_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let shutdown = ShutdownState::new();
        let watcher = remote_watcher(&dir, &server, shutdown.clone(), fast_config());

        let flip = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.begin();
        });
        let outcome = watcher.handle_file_change("s1").await.unwrap();
        flip.await.unwrap();
        assert!(matches!(outcome, ChangeOutcome::Deleted { notified: false, .. }));
    }

    #[tokio::test]
    async fn test_503_while_running_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path());
        let watcher = remote_watcher(&dir, &server, ShutdownState::new(), fast_config());

        let err = watcher.handle_file_change("s1").await.unwrap_err();
        assert!(matches!(err, WatcherError::Hq(HqError::Rejected { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_start_reports_new_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ControlDir::new(tmp.path().join("control"));
        let watcher = ControlDirWatcher::with_config(
            dir.clone(),
            WatcherMode::Standalone,
            ShutdownState::new(),
            fast_config(),
        )
        .with_pty_manager(Arc::new(dir.clone()));
        let mut changes = watcher.subscribe();
        watcher.start().await.unwrap();
        assert!(dir.path().is_dir());

        std::fs::create_dir_all(dir.session_dir("live").unwrap()).unwrap();
        std::fs::write(dir.metadata_path("live").unwrap(), r#"{"id":"live"}"#).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, SessionChange::Created("live".to_string()));
        watcher.stop();
    }
}
