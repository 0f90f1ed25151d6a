//! HQ-side registry of remote servers and the sessions they own.
//!
//! All state sits behind a single lock, which is never held across an
//! `.await`. Health checks run outside the lock and their results are
//! applied afterwards in one critical section.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use termhub_core::SessionId;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Remote already registered: {0}")]
    AlreadyRegistered(String),
    #[error("Remote not found: {0}")]
    NotFound(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Remote {remote} answered with status {status}")]
    RemoteStatus { remote: String, status: u16 },
}

/// A registered remote server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServer {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Bearer token HQ presents when calling back into this remote.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub session_ids: BTreeSet<SessionId>,
}

/// Body of a registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegistration {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
}

/// Registry lifecycle notifications.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(RemoteServer),
    Unregistered(RemoteServer),
}

/// Health-check tuning.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    /// Per-request timeout, independent of the interval.
    pub timeout: Duration,
    /// Consecutive failed checks before a remote is dropped.
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    remotes: HashMap<String, RemoteServer>,
    by_url: HashMap<String, String>,
    session_owner: HashMap<SessionId, String>,
    failures: HashMap<String, u32>,
}

impl RegistryState {
    fn remove(&mut self, remote_id: &str) -> Option<RemoteServer> {
        let remote = self.remotes.remove(remote_id)?;
        self.by_url.remove(&remote.url);
        self.failures.remove(remote_id);
        for session_id in &remote.session_ids {
            self.session_owner.remove(session_id);
        }
        Some(remote)
    }

    /// Give `session_id` to `remote_id`, taking it away from any previous
    /// owner in the same step.
    fn claim(&mut self, remote_id: &str, session_id: &str) {
        let previous = self
            .session_owner
            .insert(session_id.to_string(), remote_id.to_string());
        if let Some(previous) = previous.filter(|p| p != remote_id) {
            if let Some(old) = self.remotes.get_mut(&previous) {
                old.session_ids.remove(session_id);
            }
            tracing::debug!(session_id, from = %previous, to = %remote_id, "Session moved between remotes");
        }
        if let Some(remote) = self.remotes.get_mut(remote_id) {
            remote.session_ids.insert(session_id.to_string());
        }
    }
}

/// Authoritative map of remotes.
pub struct RemoteRegistry {
    state: Mutex<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    http: reqwest::Client,
    config: HealthCheckConfig,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthCheckConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HealthCheckConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(RegistryState::default()),
            events,
            http: reqwest::Client::new(),
            config,
            health_task: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Subscribe to registration and unregistration events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a remote.
    ///
    /// A remote re-registering from a URL that is already known replaces the
    /// stale entry.
    ///
    /// # Errors
    /// Returns `AlreadyRegistered` if the id is taken.
    pub fn register(&self, registration: RemoteRegistration) -> Result<RemoteServer, RegistryError> {
        let url = registration.url.trim_end_matches('/').to_string();
        let now = Utc::now();
        let remote = RemoteServer {
            id: registration.id,
            name: registration.name,
            url,
            token: registration.token,
            registered_at: now,
            last_heartbeat: now,
            session_ids: BTreeSet::new(),
        };

        let evicted = {
            let mut state = self.state();
            if state.remotes.contains_key(&remote.id) {
                return Err(RegistryError::AlreadyRegistered(remote.id));
            }
            let stale = state.by_url.get(&remote.url).cloned();
            let evicted = stale.and_then(|id| state.remove(&id));
            state.by_url.insert(remote.url.clone(), remote.id.clone());
            state.remotes.insert(remote.id.clone(), remote.clone());
            evicted
        };

        if let Some(old) = evicted {
            tracing::info!(remote_id = %old.id, url = %old.url, "Replaced stale remote registered from the same URL");
            let _ = self.events.send(RegistryEvent::Unregistered(old));
        }
        tracing::info!(remote_id = %remote.id, name = %remote.name, url = %remote.url, "Remote registered");
        let _ = self.events.send(RegistryEvent::Registered(remote.clone()));
        Ok(remote)
    }

    /// Remove a remote and every session it owned.
    pub fn unregister(&self, remote_id: &str) -> Option<RemoteServer> {
        let removed = self.state().remove(remote_id)?;
        tracing::info!(remote_id, sessions = removed.session_ids.len(), "Remote unregistered");
        let _ = self.events.send(RegistryEvent::Unregistered(removed.clone()));
        Some(removed)
    }

    /// Record that `remote_id` owns `session_id`. Returns `false` for an
    /// unknown remote.
    pub fn add_session_to_remote(&self, remote_id: &str, session_id: &str) -> bool {
        let mut state = self.state();
        if !state.remotes.contains_key(remote_id) {
            return false;
        }
        state.claim(remote_id, session_id);
        true
    }

    /// Forget a session. Returns the id of the remote that owned it.
    pub fn remove_session_from_remote(&self, session_id: &str) -> Option<String> {
        let mut state = self.state();
        let owner = state.session_owner.remove(session_id)?;
        if let Some(remote) = state.remotes.get_mut(&owner) {
            remote.session_ids.remove(session_id);
        }
        Some(owner)
    }

    /// Replace a remote's session set wholesale. Returns `false` for an
    /// unknown remote.
    pub fn update_remote_sessions<I>(&self, remote_id: &str, session_ids: I) -> bool
    where
        I: IntoIterator<Item = SessionId>,
    {
        let mut state = self.state();
        let Some(remote) = state.remotes.get_mut(remote_id) else {
            return false;
        };
        let previous = std::mem::take(&mut remote.session_ids);
        for session_id in previous {
            state.session_owner.remove(&session_id);
        }
        for session_id in session_ids {
            state.claim(remote_id, &session_id);
        }
        true
    }

    #[must_use]
    pub fn get_remote(&self, remote_id: &str) -> Option<RemoteServer> {
        self.state().remotes.get(remote_id).cloned()
    }

    #[must_use]
    pub fn get_remote_by_url(&self, url: &str) -> Option<RemoteServer> {
        let state = self.state();
        let id = state.by_url.get(url.trim_end_matches('/'))?;
        state.remotes.get(id).cloned()
    }

    #[must_use]
    pub fn get_remote_by_name(&self, name: &str) -> Option<RemoteServer> {
        self.state().remotes.values().find(|r| r.name == name).cloned()
    }

    #[must_use]
    pub fn get_remote_by_session_id(&self, session_id: &str) -> Option<RemoteServer> {
        let state = self.state();
        let owner = state.session_owner.get(session_id)?;
        state.remotes.get(owner).cloned()
    }

    /// All remotes, ordered by name.
    #[must_use]
    pub fn get_remotes(&self) -> Vec<RemoteServer> {
        let mut remotes: Vec<_> = self.state().remotes.values().cloned().collect();
        remotes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        remotes
    }

    /// Pull the session list from a remote and make it authoritative.
    ///
    /// Returns the number of sessions the remote reported.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown name, or an HTTP error if the remote
    /// could not be queried.
    pub async fn refresh_remote_sessions(&self, name: &str) -> Result<usize, RegistryError> {
        let remote = self
            .get_remote_by_name(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.sync_remote_sessions(&remote).await
    }

    /// Pull the session list from every remote whose last health check
    /// succeeded. Failures are logged and leave that remote's sessions as
    /// they were.
    pub async fn refresh_all_sessions(&self) {
        let healthy: Vec<RemoteServer> = {
            let state = self.state();
            state
                .remotes
                .values()
                .filter(|r| !state.failures.contains_key(&r.id))
                .cloned()
                .collect()
        };
        let pulls = healthy.iter().map(|remote| async move {
            if let Err(e) = self.sync_remote_sessions(remote).await {
                tracing::warn!(remote_id = %remote.id, "Failed to fetch remote sessions: {e}");
            }
        });
        futures::future::join_all(pulls).await;
    }

    /// Fetch `remote`'s `/api/sessions` with its bearer token and replace its
    /// session set with the result.
    ///
    /// # Errors
    /// Returns an HTTP error, or `RemoteStatus` for a non-success answer.
    pub async fn sync_remote_sessions(&self, remote: &RemoteServer) -> Result<usize, RegistryError> {
        let response = self
            .http
            .get(format!("{}/api/sessions", remote.url))
            .bearer_auth(&remote.token)
            .timeout(self.config.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::RemoteStatus {
                remote: remote.id.clone(),
                status: response.status().as_u16(),
            });
        }

        let body: Value = response.json().await?;
        let ids: Vec<SessionId> = body
            .as_array()
            .map(|items| items.iter().filter_map(session_id_of).collect())
            .unwrap_or_default();
        let count = ids.len();
        if self.update_remote_sessions(&remote.id, ids) {
            tracing::debug!(remote_id = %remote.id, count, "Refreshed remote sessions");
        } else {
            tracing::debug!(remote_id = %remote.id, "Remote unregistered while fetching its sessions");
        }
        Ok(count)
    }

    /// Check every remote once and evict those that keep failing.
    pub async fn check_remote_health(&self) {
        let targets: Vec<(String, String, String)> = self
            .state()
            .remotes
            .values()
            .map(|r| (r.id.clone(), r.url.clone(), r.token.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let checks = targets.into_iter().map(|(id, url, token)| async move {
            let result = self
                .http
                .get(format!("{url}/api/health"))
                .bearer_auth(token)
                .timeout(self.config.timeout)
                .send()
                .await;
            let healthy = match result {
                Ok(response) if response.status().is_success() => true,
                Ok(response) => {
                    tracing::warn!(remote_id = %id, status = %response.status(), "Remote health check failed");
                    false
                }
                Err(e) => {
                    tracing::warn!(remote_id = %id, "Remote health check failed: {e}");
                    false
                }
            };
            (id, healthy)
        });
        let results = futures::future::join_all(checks).await;

        let mut evicted = Vec::new();
        {
            let mut state = self.state();
            let now = Utc::now();
            for (id, healthy) in results {
                if !state.remotes.contains_key(&id) {
                    state.failures.remove(&id);
                    continue;
                }
                if healthy {
                    state.failures.remove(&id);
                    if let Some(remote) = state.remotes.get_mut(&id) {
                        remote.last_heartbeat = now;
                    }
                    continue;
                }
                let failures = {
                    let count = state.failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                if failures >= self.config.failure_threshold {
                    evicted.extend(state.remove(&id));
                }
            }
        }

        for remote in evicted {
            tracing::warn!(
                remote_id = %remote.id,
                name = %remote.name,
                "Remote failed {} consecutive health checks, unregistering",
                self.config.failure_threshold
            );
            let _ = self.events.send(RegistryEvent::Unregistered(remote));
        }
    }

    /// Spawn the periodic health checker. Calling it again restarts it.
    pub fn start_health_checker(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else { break };
                registry.check_remote_health().await;
            }
        });
        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the health checker.
    pub fn destroy(&self) {
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn session_id_of(item: &Value) -> Option<SessionId> {
    match item {
        Value::String(id) => Some(id.clone()),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("session_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    use super::*;

    fn registration(id: &str, url: &str) -> RemoteRegistration {
        RemoteRegistration {
            id: id.to_string(),
            name: format!("{id}-name"),
            url: url.to_string(),
            token: format!("{id}-token"),
        }
    }

    fn assert_unique_ownership(registry: &RemoteRegistry) {
        let mut seen = BTreeSet::new();
        for remote in registry.get_remotes() {
            for session_id in &remote.session_ids {
                assert!(seen.insert(session_id.clone()), "{session_id} owned twice");
                assert_eq!(
                    registry.get_remote_by_session_id(session_id).map(|r| r.id),
                    Some(remote.id.clone())
                );
            }
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = RemoteRegistry::new();
        let remote = registry.register(registration("r1", "http://a:4020/")).unwrap();

        assert_eq!(remote.url, "http://a:4020");
        assert!(remote.session_ids.is_empty());
        assert_eq!(remote.registered_at, remote.last_heartbeat);
        assert_eq!(registry.get_remote_by_url("http://a:4020").unwrap().id, "r1");
        assert_eq!(registry.get_remote_by_name("r1-name").unwrap().id, "r1");
        assert!(matches!(
            registry.register(registration("r1", "http://b:4020")),
            Err(RegistryError::AlreadyRegistered(id)) if id == "r1"
        ));
    }

    #[test]
    fn test_same_url_replaces_stale_remote() {
        let registry = RemoteRegistry::new();
        let mut events = registry.subscribe();
        registry.register(registration("old", "http://a:4020")).unwrap();
        registry.add_session_to_remote("old", "s1");

        registry.register(registration("new", "http://a:4020")).unwrap();
        assert!(registry.get_remote("old").is_none());
        assert!(registry.get_remote_by_session_id("s1").is_none());
        assert_eq!(registry.get_remote_by_url("http://a:4020").unwrap().id, "new");

        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Registered(r)) if r.id == "old"));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Unregistered(r)) if r.id == "old"));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Registered(r)) if r.id == "new"));
    }

    #[test]
    fn test_session_moves_between_owners() {
        let registry = RemoteRegistry::new();
        registry.register(registration("r1", "http://a")).unwrap();
        registry.register(registration("r2", "http://b")).unwrap();

        assert!(registry.add_session_to_remote("r1", "s1"));
        assert!(registry.add_session_to_remote("r1", "s2"));
        assert_unique_ownership(&registry);

        assert!(registry.add_session_to_remote("r2", "s1"));
        assert_unique_ownership(&registry);
        assert_eq!(registry.get_remote_by_session_id("s1").unwrap().id, "r2");
        assert!(!registry.get_remote("r1").unwrap().session_ids.contains("s1"));

        assert!(registry.update_remote_sessions("r1", vec!["s1".to_string(), "s3".to_string()]));
        assert_unique_ownership(&registry);
        assert_eq!(registry.get_remote_by_session_id("s1").unwrap().id, "r1");
        assert!(registry.get_remote_by_session_id("s2").is_none());
        assert!(registry.get_remote("r2").unwrap().session_ids.is_empty());

        assert!(!registry.add_session_to_remote("ghost", "s9"));
    }

    #[test]
    fn test_unregister_frees_sessions() {
        let registry = RemoteRegistry::new();
        registry.register(registration("r1", "http://a")).unwrap();
        registry.update_remote_sessions("r1", vec!["s1".to_string(), "s2".to_string()]);

        assert_eq!(registry.remove_session_from_remote("s2"), Some("r1".to_string()));
        assert_eq!(registry.remove_session_from_remote("s2"), None);

        let removed = registry.unregister("r1").unwrap();
        assert_eq!(removed.session_ids.len(), 1);
        assert!(registry.get_remote_by_session_id("s1").is_none());
        assert!(registry.unregister("r1").is_none());
    }

    #[test]
    fn test_serialization_hides_token() {
        let registry = RemoteRegistry::new();
        let remote = registry.register(registration("r1", "http://a")).unwrap();
        let json = serde_json::to_value(&remote).unwrap();
        assert!(json.get("token").is_none());
        assert_eq!(json["sessionIds"], serde_json::json!([]));
        assert!(json.get("registeredAt").is_some());
    }

    #[tokio::test]
    async fn test_health_check_evicts_after_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .and(header("authorization", "Bearer up-token"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_url = format!("http://{}", dead.local_addr().unwrap());
        drop(dead);

        let registry = RemoteRegistry::with_config(HealthCheckConfig {
            failure_threshold: 2,
            timeout: Duration::from_secs(2),
            ..HealthCheckConfig::default()
        });
        registry.register(registration("up", &server.uri())).unwrap();
        registry.register(registration("down", &dead_url)).unwrap();
        registry.add_session_to_remote("down", "s1");
        let before = registry.get_remote("up").unwrap().last_heartbeat;

        registry.check_remote_health().await;
        assert!(registry.get_remote("down").is_some());

        registry.check_remote_health().await;
        assert!(registry.get_remote("down").is_none());
        assert!(registry.get_remote_by_session_id("s1").is_none());
        assert!(registry.get_remote("up").unwrap().last_heartbeat >= before);
    }

    #[tokio::test]
    async fn test_refresh_remote_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header("authorization", "Bearer r1-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "s1", "name": "one"},
                {"id": "s2"},
                {"name": "no id"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let registry = RemoteRegistry::new();
        registry.register(registration("r1", &server.uri())).unwrap();
        assert_eq!(registry.refresh_remote_sessions("r1-name").await.unwrap(), 2);
        assert_eq!(registry.get_remote_by_session_id("s2").unwrap().id, "r1");

        assert!(matches!(
            registry.refresh_remote_sessions("missing").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_sessions_skips_failing_remotes() {
        let up = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header("authorization", "Bearer up-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": "pre"}])))
            .expect(1)
            .mount(&up)
            .await;
        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&failing)
            .await;

        let registry = RemoteRegistry::new();
        registry.register(registration("up", &up.uri())).unwrap();
        registry.register(registration("sick", &failing.uri())).unwrap();
        registry.add_session_to_remote("sick", "kept");
        registry.state().failures.insert("sick".to_string(), 1);

        registry.refresh_all_sessions().await;
        assert_eq!(registry.get_remote_by_session_id("pre").unwrap().id, "up");
        assert_eq!(registry.get_remote_by_session_id("kept").unwrap().id, "sick");
    }

    #[tokio::test]
    async fn test_unregister_during_health_check_leaves_no_counter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let registry = Arc::new(RemoteRegistry::new());
        registry.register(registration("r1", &server.uri())).unwrap();

        let checking = Arc::clone(&registry);
        let check = tokio::spawn(async move { checking.check_remote_health().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.unregister("r1").is_some());
        check.await.unwrap();

        assert!(registry.get_remote("r1").is_none());
        assert!(registry.state().failures.is_empty());
    }
}
