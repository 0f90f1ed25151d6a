//! Terminal manager: one headless terminal per session.
//!
//! Each terminal is driven by its own actor task that tails the transcript,
//! moves records through flow control into the emulator and publishes
//! debounced snapshots on a `watch` channel. Subscribers only ever see the
//! newest snapshot, so there is at most one pending notification per
//! session no matter how fast the transcript grows.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use termhub_core::{ControlDir, SessionId, control_dir::validate_session_id};
use thiserror::Error;
use tokio::{
    sync::{OnceCell, mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep_until},
};

use crate::{
    emulator::Emulator,
    flow::{FlowControl, FlowControlConfig, FlowStats},
    snapshot::BufferSnapshot,
    stream::{TranscriptRecord, TranscriptTail, parse_line},
};

/// Buffer engine error.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(SessionId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer engine tuning.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Scrollback lines kept by each emulator.
    pub scrollback_lines: usize,
    /// Window opened by the first change; everything inside it is coalesced.
    pub debounce: Duration,
    /// Fallback poll for transcript growth when file events are missed.
    pub poll_interval: Duration,
    /// Records applied to the emulator before yielding.
    pub drain_batch: usize,
    pub flow: FlowControlConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: 10_000,
            debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
            drain_batch: 500,
            flow: FlowControlConfig::default(),
        }
    }
}

/// Point-in-time statistics for one terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub session_id: SessionId,
    pub cols: u16,
    pub rows: u16,
    pub total_rows: usize,
    pub scrollback_lines: usize,
    pub viewport_y: i32,
    pub cursor_x: i32,
    pub cursor_y: i32,
    pub paused: bool,
    pub pending_lines: usize,
    pub utilization_percent: f64,
    pub max_buffer_lines: usize,
    pub exited: bool,
    pub flow: FlowStats,
    pub idle_ms: u64,
}

type ListenerFn = dyn Fn(&str, Arc<BufferSnapshot>) + Send + Sync;

/// Handle returned by [`TerminalManager::subscribe_to_buffer_changes`].
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct BufferSubscription {
    session_id: SessionId,
    task: Option<JoinHandle<()>>,
}

impl BufferSubscription {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop receiving notifications. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(session_id = %self.session_id, "Buffer subscription cancelled");
        }
    }
}

impl Drop for BufferSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct TerminalState {
    emulator: Emulator,
    flow: FlowControl<TranscriptRecord>,
    exited: bool,
    malformed_lines: u64,
    last_activity: Instant,
}

/// A live session terminal.
pub struct SessionTerminal {
    session_id: SessionId,
    state: Mutex<TerminalState>,
    snapshots: watch::Sender<Option<Arc<BufferSnapshot>>>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTerminal {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn lock(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Capture the current screen.
    #[must_use]
    pub fn snapshot(&self) -> BufferSnapshot {
        self.lock().emulator.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        let snapshot = state.emulator.snapshot();
        let scrollback = state.emulator.scrollback_len();
        BufferStats {
            session_id: self.session_id.clone(),
            cols: snapshot.cols,
            rows: snapshot.rows,
            total_rows: scrollback + usize::from(snapshot.rows),
            scrollback_lines: scrollback,
            viewport_y: snapshot.viewport_y,
            cursor_x: snapshot.cursor_x,
            cursor_y: snapshot.cursor_y,
            paused: state.flow.is_paused(),
            pending_lines: state.flow.len(),
            utilization_percent: state.flow.utilization() * 100.0,
            max_buffer_lines: state.flow.config().max_lines,
            exited: state.exited,
            flow: state.flow.stats(),
            idle_ms: u64::try_from(state.last_activity.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }

    fn has_subscribers(&self) -> bool {
        self.snapshots.receiver_count() > 0
    }

    fn stop(&self) {
        let task = self
            .actor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Pull as many transcript lines as flow control allows into the queue.
    async fn ingest(&self, tail: &mut TranscriptTail) -> std::io::Result<usize> {
        let capacity = {
            let state = self.lock();
            if state.exited { 0 } else { state.flow.capacity() }
        };
        if capacity == 0 {
            return Ok(0);
        }

        let lines = tail.read_lines(capacity).await?;
        if lines.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let mut state = self.lock();
        state.last_activity = now;
        for line in &lines {
            match parse_line(line) {
                Ok(Some(TranscriptRecord::Exit(code))) => {
                    tracing::info!(session_id = %self.session_id, code, "Session exited, transcript tailing stopped");
                    state.exited = true;
                    break;
                }
                Ok(Some(record)) => {
                    state.flow.push(record, now);
                }
                Ok(None) => {}
                Err(e) => {
                    state.malformed_lines += 1;
                    let count = state.malformed_lines;
                    if count == 1 || count % 100 == 0 {
                        tracing::warn!(session_id = %self.session_id, count, "Skipping malformed transcript line: {e}");
                    }
                }
            }
        }
        Ok(lines.len())
    }

    /// Apply up to `limit` queued records. Returns whether the screen may
    /// have changed.
    fn drain(&self, limit: usize) -> bool {
        let mut state = self.lock();
        let mut changed = false;
        for _ in 0..limit {
            let Some(record) = state.flow.pop() else { break };
            changed |= record.affects_screen();
            match record {
                TranscriptRecord::Header {
                    width: Some(cols),
                    height: Some(rows),
                }
                | TranscriptRecord::Resize { cols, rows } => state.emulator.resize(cols, rows),
                TranscriptRecord::Output(data) => state.emulator.write(data.as_bytes()),
                TranscriptRecord::Marker => state.emulator.clear_scrollback(),
                TranscriptRecord::Header { .. }
                | TranscriptRecord::Input
                | TranscriptRecord::Exit(_) => {}
            }
        }
        changed
    }

    fn pending(&self) -> bool {
        !self.lock().flow.is_empty()
    }

    fn check_flow_timeout(&self) {
        let mut state = self.lock();
        if let Some(dropped) = state.flow.check_timeout(Instant::now()) {
            tracing::warn!(session_id = %self.session_id, dropped, "Flow control pause timed out, force-drained queue");
        }
    }

    /// Snapshot and send under the state lock so publishes are totally
    /// ordered with [`Self::snapshot_since`].
    fn publish(&self) {
        if !self.has_subscribers() {
            return;
        }
        let state = self.lock();
        let snapshot = Arc::new(state.emulator.snapshot());
        self.snapshots.send_replace(Some(snapshot));
    }

    /// Current screen, with every publish up to this point marked seen on
    /// `rx`. Later changes on `rx` are newer than the returned screen.
    fn snapshot_since(&self, rx: &mut watch::Receiver<Option<Arc<BufferSnapshot>>>) -> BufferSnapshot {
        let state = self.lock();
        rx.mark_unchanged();
        state.emulator.snapshot()
    }

    fn is_finished(&self) -> bool {
        let state = self.lock();
        state.exited && state.flow.is_empty()
    }
}

/// Per-session actor loop. Holds only a weak reference so closing the
/// terminal ends it.
async fn run_terminal(
    terminal: Weak<SessionTerminal>,
    mut tail: TranscriptTail,
    mut file_events: mpsc::UnboundedReceiver<()>,
    _watcher: Option<RecommendedWatcher>,
    config: BufferConfig,
) {
    let mut tick = interval(config.poll_interval.min(config.flow.check_interval));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let Some(term) = terminal.upgrade() else { break };

        if let Err(e) = term.ingest(&mut tail).await {
            // the transcript may be mid-rotation; retry on the next tick
            tracing::debug!(session_id = %term.session_id, "Transcript read failed: {e}");
        }
        if term.drain(config.drain_batch) && deadline.is_none() {
            deadline = Some(tokio::time::Instant::now() + config.debounce);
        }
        let more = term.pending();
        if term.is_finished() && deadline.is_none() {
            term.publish();
            break;
        }
        drop(term);

        let wake = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            () = sleep_until(wake), if deadline.is_some() => {
                deadline = None;
                if let Some(term) = terminal.upgrade() {
                    term.publish();
                }
            }
            _ = tick.tick() => {
                if let Some(term) = terminal.upgrade() {
                    term.check_flow_timeout();
                }
            }
            Some(()) = file_events.recv() => {}
            () = tokio::task::yield_now(), if more => {}
        }
    }
}

/// Owns every session terminal in the process.
pub struct TerminalManager {
    control_dir: ControlDir,
    config: BufferConfig,
    terminals: Mutex<HashMap<SessionId, Arc<OnceCell<Arc<SessionTerminal>>>>>,
}

impl TerminalManager {
    #[must_use]
    pub fn new(control_dir: ControlDir) -> Self {
        Self::with_config(control_dir, BufferConfig::default())
    }

    #[must_use]
    pub fn with_config(control_dir: ControlDir, config: BufferConfig) -> Self {
        Self {
            control_dir,
            config,
            terminals: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn control_dir(&self) -> &ControlDir {
        &self.control_dir
    }

    fn terminals(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<OnceCell<Arc<SessionTerminal>>>>> {
        self.terminals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Get or lazily create the terminal for a session.
    ///
    /// A new terminal replays the transcript written so far before this
    /// returns, then keeps tailing it in the background.
    ///
    /// # Errors
    /// Returns `InvalidSessionId` for ids that do not name a directory inside
    /// the control root, `SessionNotFound` if the session has no transcript.
    pub async fn get_terminal(&self, session_id: &str) -> Result<Arc<SessionTerminal>, BufferError> {
        validate_session_id(session_id)
            .map_err(|_| BufferError::InvalidSessionId(session_id.to_string()))?;
        let cell = Arc::clone(self.terminals().entry(session_id.to_string()).or_default());

        match cell.get_or_try_init(|| self.create_terminal(session_id)).await {
            Ok(terminal) => {
                terminal.touch();
                Ok(Arc::clone(terminal))
            }
            Err(e) => {
                let mut terminals = self.terminals();
                if terminals
                    .get(session_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell) && current.get().is_none())
                {
                    terminals.remove(session_id);
                }
                Err(e)
            }
        }
    }

    async fn create_terminal(&self, session_id: &str) -> Result<Arc<SessionTerminal>, BufferError> {
        let path = self
            .control_dir
            .transcript_path(session_id)
            .map_err(|_| BufferError::InvalidSessionId(session_id.to_string()))?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(BufferError::SessionNotFound(session_id.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BufferError::SessionNotFound(session_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let (cols, rows) = self
            .control_dir
            .read_metadata(session_id)
            .await
            .map(|m| m.dimensions())
            .unwrap_or((80, 24));

        let terminal = Arc::new(SessionTerminal {
            session_id: session_id.to_string(),
            state: Mutex::new(TerminalState {
                emulator: Emulator::new(cols, rows, self.config.scrollback_lines),
                flow: FlowControl::new(self.config.flow.clone()),
                exited: false,
                malformed_lines: 0,
                last_activity: Instant::now(),
            }),
            snapshots: watch::Sender::new(None),
            actor: Mutex::new(None),
        });

        let mut tail = TranscriptTail::new(&path);
        loop {
            let read = terminal.ingest(&mut tail).await?;
            while terminal.pending() {
                terminal.drain(self.config.drain_batch);
            }
            if read == 0 {
                break;
            }
        }
        terminal.snapshots.send_replace(Some(Arc::new(terminal.snapshot())));

        let offset = tail.offset();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watcher = watch_transcript(&path, events_tx);
        let task = tokio::spawn(run_terminal(
            Arc::downgrade(&terminal),
            tail,
            events_rx,
            watcher,
            self.config.clone(),
        ));
        *terminal
            .actor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);

        tracing::info!(session_id, cols, rows, offset, "Created terminal");
        Ok(terminal)
    }

    /// Current full screen of a session.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session has no transcript.
    pub async fn get_buffer_snapshot(&self, session_id: &str) -> Result<BufferSnapshot, BufferError> {
        Ok(self.get_terminal(session_id).await?.snapshot())
    }

    /// # Errors
    /// Returns `SessionNotFound` if the session has no transcript.
    pub async fn get_buffer_stats(&self, session_id: &str) -> Result<BufferStats, BufferError> {
        Ok(self.get_terminal(session_id).await?.stats())
    }

    /// Register a listener for debounced snapshot updates.
    ///
    /// The listener runs on its own task and is called with the latest
    /// snapshot after each debounce window; intermediate states may be
    /// skipped. The current screen is not replayed, use
    /// [`Self::subscribe_with_snapshot`] for that.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session has no transcript.
    pub async fn subscribe_to_buffer_changes<F>(
        &self,
        session_id: &str,
        listener: F,
    ) -> Result<BufferSubscription, BufferError>
    where
        F: Fn(&str, Arc<BufferSnapshot>) + Send + Sync + 'static,
    {
        let terminal = self.get_terminal(session_id).await?;
        let mut rx = terminal.snapshots.subscribe();
        rx.mark_unchanged();
        Ok(spawn_listener(session_id, rx, Box::new(listener)))
    }

    /// Like [`Self::subscribe_to_buffer_changes`], but the listener is first
    /// called with the current screen, before this returns. Every later call
    /// carries a screen newer than that one.
    ///
    /// # Errors
    /// Returns `SessionNotFound` if the session has no transcript.
    pub async fn subscribe_with_snapshot<F>(
        &self,
        session_id: &str,
        listener: F,
    ) -> Result<BufferSubscription, BufferError>
    where
        F: Fn(&str, Arc<BufferSnapshot>) + Send + Sync + 'static,
    {
        let terminal = self.get_terminal(session_id).await?;
        let mut rx = terminal.snapshots.subscribe();
        let initial = terminal.snapshot_since(&mut rx);
        listener(session_id, Arc::new(initial));
        Ok(spawn_listener(session_id, rx, Box::new(listener)))
    }

    /// Close one terminal. Returns whether it existed.
    pub fn close_terminal(&self, session_id: &str) -> bool {
        let removed = self.terminals().remove(session_id);
        let Some(terminal) = removed.as_ref().and_then(|cell| cell.get()) else {
            return removed.is_some();
        };
        terminal.stop();
        tracing::info!(session_id, "Closed terminal");
        true
    }

    /// Ids of terminals that are fully initialised.
    #[must_use]
    pub fn active_terminals(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .terminals()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close terminals that nobody watches and that saw no activity for
    /// `max_age`. Returns how many were closed.
    pub fn cleanup_inactive_terminals(&self, max_age: Duration) -> usize {
        let stale: Vec<SessionId> = self
            .terminals()
            .iter()
            .filter_map(|(id, cell)| {
                let terminal = cell.get()?;
                (!terminal.has_subscribers() && terminal.idle_for() >= max_age).then(|| id.clone())
            })
            .collect();

        let closed = stale.iter().filter(|id| self.close_terminal(id)).count();
        if closed > 0 {
            tracing::info!(closed, "Cleaned up inactive terminals");
        }
        closed
    }

    /// Close every terminal.
    pub fn destroy(&self) {
        let all: Vec<_> = self.terminals().drain().collect();
        for (_, cell) in all {
            if let Some(terminal) = cell.get() {
                terminal.stop();
            }
        }
    }
}

fn spawn_listener(
    session_id: &str,
    mut rx: watch::Receiver<Option<Arc<BufferSnapshot>>>,
    listener: Box<ListenerFn>,
) -> BufferSubscription {
    let id = session_id.to_string();
    let task = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let latest = rx.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                listener(&id, snapshot);
            }
        }
    });
    BufferSubscription {
        session_id: session_id.to_string(),
        task: Some(task),
    }
}

/// File watcher nudging the actor whenever the transcript changes. Polling
/// still covers platforms where this fails.
fn watch_transcript(
    path: &std::path::Path,
    events: mpsc::UnboundedSender<()>,
) -> Option<RecommendedWatcher> {
    let handler = move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                let _ = events.send(());
            }
        }
    };

    let watcher = notify::recommended_watcher(handler).and_then(|mut watcher| {
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    });
    match watcher {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Falling back to polling transcript: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use pretty_assertions::assert_eq;
    use termhub_core::control_dir::TRANSCRIPT_FILE;

    use super::*;

    struct Fixture {
        _tmp: tempfile::TempDir,
        dir: ControlDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let dir = ControlDir::new(tmp.path());
            Self { _tmp: tmp, dir }
        }

        fn session(&self, id: &str, transcript: &str) {
            std::fs::create_dir_all(self.dir.session_dir(id).unwrap()).unwrap();
            std::fs::write(self.dir.transcript_path(id).unwrap(), transcript).unwrap();
        }

        fn append(&self, id: &str, text: &str) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(self.dir.transcript_path(id).unwrap())
                .unwrap();
            file.write_all(text.as_bytes()).unwrap();
        }
    }

    fn fast_config() -> BufferConfig {
        BufferConfig {
            poll_interval: Duration::from_millis(20),
            ..BufferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_hello_snapshot() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":80,\"height\":24}\n[\"0.1\",\"o\",\"hello\"]\n");
        let manager = TerminalManager::new(fx.dir.clone());

        let snapshot = manager.get_buffer_snapshot("s1").await.unwrap();
        let first: Vec<_> = snapshot.cells[0][0..5].iter().map(|c| c.ch.as_str()).collect();
        assert_eq!(first, vec!["h", "e", "l", "l", "o"]);
        assert_eq!((snapshot.cursor_x, snapshot.cursor_y), (5, 0));
        assert_eq!((snapshot.cols, snapshot.rows), (80, 24));
        assert!(snapshot.is_full_frame());
        manager.destroy();
    }

    #[tokio::test]
    async fn test_missing_transcript_is_session_not_found() {
        let fx = Fixture::new();
        let manager = TerminalManager::new(fx.dir.clone());
        let err = manager.get_terminal("nope").await.err().unwrap();
        assert!(matches!(err, BufferError::SessionNotFound(id) if id == "nope"));
        assert!(manager.active_terminals().is_empty());
    }

    #[tokio::test]
    async fn test_session_ids_cannot_leave_control_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("control");
        std::fs::create_dir_all(&root).unwrap();
        let outside = tmp.path().join("secret");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join(TRANSCRIPT_FILE), "[\"0.1\",\"o\",\"TOPSECRET\"]\n").unwrap();

        let manager = TerminalManager::new(ControlDir::new(&root));
        let absolute = outside.to_string_lossy().into_owned();
        for id in ["../secret", absolute.as_str(), "", "..", "a/b"] {
            let err = manager.get_buffer_snapshot(id).await.err().unwrap();
            assert!(
                matches!(err, BufferError::InvalidSessionId(ref bad) if bad == id),
                "{id:?} gave {err:?}"
            );
        }
        assert!(manager.active_terminals().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_sizes_terminal_and_records_apply() {
        let fx = Fixture::new();
        fx.session(
            "s1",
            concat!(
                "[\"0.1\",\"o\",\"a\"]\n",
                "garbage line\n",
                "[\"0.2\",\"r\",\"100x30\"]\n",
                "[\"0.3\",\"i\",\"ignored\"]\n",
                "[\"0.4\",\"o\",\"b\"]\n",
            ),
        );
        std::fs::write(fx.dir.metadata_path("s1").unwrap(), r#"{"id":"s1","initialCols":40,"initialRows":10}"#)
            .unwrap();
        let manager = TerminalManager::new(fx.dir.clone());

        let stats = manager.get_buffer_stats("s1").await.unwrap();
        assert_eq!((stats.cols, stats.rows), (100, 30));
        assert_eq!(manager.get_buffer_snapshot("s1").await.unwrap().row_text(0), "ab");
        assert!(!stats.paused);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_concurrent_get_terminal_shares_instance() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":10,\"height\":2}\n");
        let manager = TerminalManager::new(fx.dir.clone());

        let (a, b) = tokio::join!(manager.get_terminal("s1"), manager.get_terminal("s1"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(manager.active_terminals(), vec!["s1".to_string()]);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_tails_new_output() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":20,\"height\":3}\n");
        let manager = TerminalManager::with_config(fx.dir.clone(), fast_config());
        manager.get_terminal("s1").await.unwrap();

        fx.append("s1", "[0.5,\"o\",\"later\"]\n");
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.get_buffer_snapshot("s1").await.unwrap().row_text(0) != "later" {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        manager.destroy();
    }

    #[tokio::test]
    async fn test_burst_yields_single_notification() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":20,\"height\":3}\n");
        let manager = TerminalManager::with_config(
            fx.dir.clone(),
            BufferConfig {
                debounce: Duration::from_millis(200),
                ..fast_config()
            },
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(None::<Arc<BufferSnapshot>>));
        let mut subscription = {
            let calls = Arc::clone(&calls);
            let last = Arc::clone(&last);
            manager
                .subscribe_to_buffer_changes("s1", move |_, snapshot| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *last.lock().unwrap() = Some(snapshot);
                })
                .await
                .unwrap()
        };

        for word in ["one ", "two ", "three"] {
            fx.append("s1", &format!("[0.1,\"o\",\"{word}\"]\n"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snapshot = last.lock().unwrap().clone().unwrap();
        assert_eq!(snapshot.row_text(0), "one two three");

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(!subscription.is_active());
        manager.destroy();
    }

    #[tokio::test]
    async fn test_subscribe_with_snapshot_replays_screen_first() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":40,\"height\":3}\n[0.1,\"o\",\"a\"]\n");
        let manager = TerminalManager::with_config(fx.dir.clone(), fast_config());
        let _watcher = manager.subscribe_to_buffer_changes("s1", |_, _| {}).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let subscription = {
            let seen = Arc::clone(&seen);
            manager
                .subscribe_with_snapshot("s1", move |_, snapshot| {
                    seen.lock().unwrap().push(snapshot.row_text(0));
                })
                .await
                .unwrap()
        };
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);

        for letter in ["b", "c", "d"] {
            fx.append("s1", &format!("[0.1,\"o\",\"{letter}\"]\n"));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.last().map(String::as_str), Some("abcd"));
        for pair in seen.windows(2) {
            assert!(
                pair[1].starts_with(&pair[0]),
                "screen went backwards: {seen:?}"
            );
        }
        drop(subscription);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_is_not_called() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":20,\"height\":3}\n");
        let manager = TerminalManager::with_config(fx.dir.clone(), fast_config());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = manager
            .subscribe_to_buffer_changes("s1", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        drop(subscription);

        fx.append("s1", "[0.1,\"o\",\"x\"]\n");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        manager.destroy();
    }

    #[tokio::test]
    async fn test_exit_record_stops_tailing() {
        let fx = Fixture::new();
        fx.session("s1", "{\"width\":20,\"height\":3}\n[0.1,\"o\",\"done\"]\n[\"exit\",0,\"s1\"]\n");
        let manager = TerminalManager::with_config(fx.dir.clone(), fast_config());
        manager.get_terminal("s1").await.unwrap();

        fx.append("s1", "[0.2,\"o\",\" more\"]\n");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let stats = manager.get_buffer_stats("s1").await.unwrap();
        assert!(stats.exited);
        assert_eq!(manager.get_buffer_snapshot("s1").await.unwrap().row_text(0), "done");
        manager.destroy();
    }

    #[tokio::test]
    async fn test_cleanup_and_close() {
        let fx = Fixture::new();
        fx.session("idle", "{\"width\":10,\"height\":2}\n");
        fx.session("watched", "{\"width\":10,\"height\":2}\n");
        let manager = TerminalManager::new(fx.dir.clone());

        manager.get_terminal("idle").await.unwrap();
        let _subscription = manager
            .subscribe_to_buffer_changes("watched", |_, _| {})
            .await
            .unwrap();

        assert_eq!(manager.cleanup_inactive_terminals(Duration::from_secs(3600)), 0);
        assert_eq!(manager.cleanup_inactive_terminals(Duration::ZERO), 1);
        assert_eq!(manager.active_terminals(), vec!["watched".to_string()]);

        assert!(manager.close_terminal("watched"));
        assert!(!manager.close_terminal("watched"));
        assert!(manager.active_terminals().is_empty());
    }
}
