//! Session management for connected clients.
//!
//! The manager is the composition point of the daemon: it owns the session
//! table, routes requests to the driver registry, the change watcher and the
//! task scheduler, and fans server events out to per-session queues. It holds
//! no business logic of its own.

use crate::navigation::NavigationHistory;
use crate::outbound::OutboundQueue;
use crate::scheduler::{SchedulerError, TaskScheduler};
use crate::{optional_obj_param, optional_str_param, require_str_param, require_u64_param};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use filebro_drivers::DriverRegistry;
use filebro_protocol::{
    methods, Outbound, Reason, Request, Response, ServerEvent, SessionId, TaskId, TaskState,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
use filebro_watch::ChangeWatcher;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport fault; the session is torn down and the client may reconnect.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed or out-of-contract message; the session is torn down.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::ConnectionLost(_) => Reason::ConnectionLost,
            Self::ProtocolViolation(_) => Reason::ProtocolViolation,
        }
    }
}

/// What the connection handler does after a request.
#[derive(Debug)]
pub enum Dispatch {
    Reply(Response),
    /// Write the response, then tear the session down.
    Close(Response),
}

impl Dispatch {
    pub fn response(&self) -> &Response {
        match self {
            Self::Reply(response) | Self::Close(response) => response,
        }
    }
}

struct SessionEntry {
    queue: Arc<OutboundQueue>,
    connected_at: DateTime<Utc>,
}

pub struct SessionManager {
    sessions: DashMap<SessionId, SessionEntry>,
    registry: Arc<DriverRegistry>,
    watcher: Arc<ChangeWatcher>,
    scheduler: TaskScheduler,
    navigation: Arc<NavigationHistory>,
    queue_capacity: usize,
    started_at: DateTime<Utc>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<DriverRegistry>,
        watcher: Arc<ChangeWatcher>,
        scheduler: TaskScheduler,
        navigation: Arc<NavigationHistory>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            watcher,
            scheduler,
            navigation,
            queue_capacity,
            started_at: Utc::now(),
        }
    }

    /// Register a new session and return its outbound queue.
    pub fn connect(&self) -> (SessionId, Arc<OutboundQueue>) {
        let id = SessionId::new();
        let queue = Arc::new(OutboundQueue::new(self.queue_capacity));
        self.sessions.insert(
            id,
            SessionEntry {
                queue: queue.clone(),
                connected_at: Utc::now(),
            },
        );
        info!(session_id = %id, sessions = self.sessions.len(), "Client connected");
        (id, queue)
    }

    /// Tear a session down. Explicit disconnects and transport failures
    /// both end here; calling it twice is harmless.
    ///
    /// Subscriptions are released and event delivery stops. Owned tasks keep
    /// running.
    pub fn disconnect(&self, session: SessionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(&session) else {
            return false;
        };
        entry.queue.close();
        let released = self.watcher.remove_session(session);
        let running = self
            .scheduler
            .list(session)
            .iter()
            .filter(|t| !t.state.is_terminal())
            .count();
        let connected_for = Utc::now() - entry.connected_at;
        info!(
            session_id = %session,
            released_watches = released,
            active_tasks = running,
            dropped_events = entry.queue.dropped(),
            connected_secs = connected_for.num_seconds(),
            "Client disconnected"
        );
        true
    }

    pub fn is_connected(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue `event` for each connected recipient. Returns how many were
    /// reached.
    pub fn send(&self, recipients: &[SessionId], event: &ServerEvent) -> usize {
        recipients
            .iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .is_some_and(|entry| entry.queue.push(event.clone()))
            })
            .count()
    }

    /// Deliver events from the watcher and the scheduler until every
    /// producer is gone.
    pub async fn run_multiplexer(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(outbound) = events.recv().await {
            let reached = self.send(&outbound.recipients, &outbound.event);
            if reached < outbound.recipients.len() {
                debug!(
                    missing = outbound.recipients.len() - reached,
                    "Skipped recipients that are no longer connected"
                );
            }
        }
        debug!("Outbound multiplexer stopped");
    }

    /// Parse and handle one framed request line.
    pub async fn handle_line(&self, session: SessionId, line: &str) -> Dispatch {
        match serde_json::from_str::<Request>(line) {
            Ok(req) => self.handle_request(session, req).await,
            Err(e) => {
                warn!(session_id = %session, error = %e, "Malformed request");
                Dispatch::Close(Response::failure(
                    None,
                    PARSE_ERROR,
                    Reason::ProtocolViolation,
                    e.to_string(),
                ))
            }
        }
    }

    pub async fn handle_request(&self, session: SessionId, req: Request) -> Dispatch {
        if !self.is_connected(session) {
            return Dispatch::Close(Response::for_reason(
                req.id,
                Reason::ConnectionLost,
                "Session is closed",
            ));
        }
        if req.jsonrpc != "2.0" {
            warn!(session_id = %session, version = %req.jsonrpc, "Unsupported JSON-RPC version");
            return Dispatch::Close(Response::failure(
                req.id,
                INVALID_REQUEST,
                Reason::ProtocolViolation,
                "Expected jsonrpc \"2.0\"",
            ));
        }

        debug!(session_id = %session, method = %req.method, "Handling request");
        let response = match req.method.as_str() {
            methods::NAVIGATE => self.navigate(&req).await,
            methods::NAVIGATE_HISTORY => self.navigate_history(&req),
            methods::STAT => self.stat(&req).await,
            methods::SUBSCRIBE => self.subscribe(session, &req).await,
            methods::UNSUBSCRIBE => self.unsubscribe(session, &req),
            methods::TASK_START => self.task_start(session, &req).await,
            methods::TASK_CANCEL => self.task_cancel(&req).await,
            methods::TASK_STATUS => self.task_status(&req),
            methods::TASK_LIST => self.task_list(session, &req),
            methods::DRIVERS_LIST => Response::success(
                req.id.clone(),
                json!({ "drivers": self.registry.descriptors() }),
            ),
            methods::DAEMON_STATUS => self.daemon_status(&req).await,
            methods::DISCONNECT => {
                return Dispatch::Close(Response::success(
                    req.id,
                    json!({ "disconnected": true }),
                ));
            }
            other => {
                warn!(session_id = %session, method = %other, "Unknown method");
                return Dispatch::Close(Response::failure(
                    req.id.clone(),
                    METHOD_NOT_FOUND,
                    Reason::ProtocolViolation,
                    format!("Unknown method: {other}"),
                ));
            }
        };
        Dispatch::Reply(response)
    }

    async fn navigate(&self, req: &Request) -> Response {
        let raw = match optional_str_param!(req, "path") {
            Some(path) => path.to_string(),
            None => self.navigation.start_up_directory(),
        };

        let handle = match self.registry.resolve(&raw) {
            Ok(handle) => handle,
            Err(e) => return Response::for_reason(req.id.clone(), e.reason(), e.to_string()),
        };
        match self.registry.list(&handle).await {
            Ok(entries) => {
                self.navigation.record(&handle.path).await;
                Response::success(
                    req.id.clone(),
                    json!({
                        "path": handle.path,
                        "scheme": handle.scheme,
                        "entries": entries,
                    }),
                )
            }
            Err(e) => {
                debug!(path = %handle, error = %e, "Navigation failed");
                Response::for_reason(req.id.clone(), e.reason(), e.to_string())
            }
        }
    }

    fn navigate_history(&self, req: &Request) -> Response {
        Response::success(
            req.id.clone(),
            json!({
                "entries": self.navigation.entries(),
                "last_directory": self.navigation.last_directory(),
            }),
        )
    }

    async fn stat(&self, req: &Request) -> Response {
        let raw = require_str_param!(req, "path");
        let result = match self.registry.resolve(raw) {
            Ok(handle) => self.registry.stat(&handle).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(entry) => Response::success(req.id.clone(), json!(entry)),
            Err(e) => Response::for_reason(req.id.clone(), e.reason(), e.to_string()),
        }
    }

    async fn subscribe(&self, session: SessionId, req: &Request) -> Response {
        let raw = require_str_param!(req, "path");
        match self.watcher.subscribe(session, raw).await {
            Ok(path) => {
                // The session may have gone away while the watch was opening.
                if !self.is_connected(session) {
                    let _ = self.watcher.unsubscribe(session, &path);
                    return Response::for_reason(
                        req.id.clone(),
                        Reason::ConnectionLost,
                        "Session closed during subscribe",
                    );
                }
                Response::success(req.id.clone(), json!({ "path": path }))
            }
            Err(e) => Response::for_reason(req.id.clone(), e.reason(), e.to_string()),
        }
    }

    fn unsubscribe(&self, session: SessionId, req: &Request) -> Response {
        let raw = require_str_param!(req, "path");
        match self.watcher.unsubscribe(session, raw) {
            Ok(()) => Response::success(req.id.clone(), json!({ "path": raw })),
            Err(e) => Response::for_reason(req.id.clone(), e.reason(), e.to_string()),
        }
    }

    async fn task_start(&self, session: SessionId, req: &Request) -> Response {
        let task_type = require_str_param!(req, "type");
        let params = optional_obj_param!(req, "params");
        match self.scheduler.submit(session, task_type, params).await {
            Ok(task_id) => Response::success(
                req.id.clone(),
                json!({ "task_id": task_id, "state": TaskState::Queued }),
            ),
            Err(e) => {
                debug!(session_id = %session, task_type, error = %e, "Task rejected");
                scheduler_failure(req, e)
            }
        }
    }

    async fn task_cancel(&self, req: &Request) -> Response {
        let task_id = TaskId(require_u64_param!(req, "task_id"));
        match self.scheduler.cancel(task_id).await {
            Ok(state) => Response::success(
                req.id.clone(),
                json!({ "task_id": task_id, "state": state }),
            ),
            Err(e) => scheduler_failure(req, e),
        }
    }

    fn task_status(&self, req: &Request) -> Response {
        let task_id = TaskId(require_u64_param!(req, "task_id"));
        match self.scheduler.status(task_id) {
            Some(info) => Response::success(req.id.clone(), json!(info)),
            None => scheduler_failure(req, SchedulerError::TaskNotFound(task_id)),
        }
    }

    fn task_list(&self, session: SessionId, req: &Request) -> Response {
        Response::success(
            req.id.clone(),
            json!({ "tasks": self.scheduler.list(session) }),
        )
    }

    async fn daemon_status(&self, req: &Request) -> Response {
        let stats = match self.scheduler.stats().await {
            Ok(stats) => stats,
            Err(e) => return scheduler_failure(req, e),
        };
        let uptime = Utc::now() - self.started_at;
        Response::success(
            req.id.clone(),
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_secs": uptime.num_seconds(),
                "sessions": self.session_count(),
                "watches": self.watcher.active_count(),
                "pool": stats.pool,
                "queued": stats.queued,
                "running": stats.running,
            }),
        )
    }
}

fn scheduler_failure(req: &Request, err: SchedulerError) -> Response {
    Response::for_reason(req.id.clone(), err.reason(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerSettings;
    use crate::worker_pool::PoolSettings;
    use async_trait::async_trait;
    use filebro_config::NavigationConfig;
    use filebro_drivers::{Capability, CapabilitySet, DriverDescriptor, StorageDriver};
    use filebro_protocol::{RequestId, INVALID_PARAMS, NOT_SUPPORTED, TASK_REJECTED};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Declares stat only; records every call that reaches it.
    struct StatOnlyDriver {
        descriptor: DriverDescriptor,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StorageDriver for StatOnlyDriver {
        fn descriptor(&self) -> &DriverDescriptor {
            &self.descriptor
        }

        async fn list(&self, path: &str) -> filebro_drivers::Result<Vec<filebro_protocol::Entry>> {
            self.calls.lock().push(format!("list {path}"));
            Ok(Vec::new())
        }
    }

    struct Fixture {
        manager: Arc<SessionManager>,
        driver_calls: Arc<Mutex<Vec<String>>>,
        dir: TempDir,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let driver_calls = Arc::new(Mutex::new(Vec::new()));
            let mut registry = DriverRegistry::with_local();
            registry
                .register(Arc::new(StatOnlyDriver {
                    descriptor: DriverDescriptor::new(
                        "stub",
                        CapabilitySet::empty().with(Capability::Stat),
                    ),
                    calls: driver_calls.clone(),
                }))
                .unwrap();
            let registry = Arc::new(registry);

            let (tx, rx) = mpsc::unbounded_channel();
            let watcher = Arc::new(ChangeWatcher::new(
                registry.clone(),
                tx.clone(),
                Duration::from_millis(50),
            ));
            let (scheduler, _) = TaskScheduler::start(
                SchedulerSettings {
                    pool: PoolSettings {
                        size: 1,
                        program: PathBuf::from("/bin/sh"),
                        args: vec!["-c".into(), "while read line; do :; done".into()],
                        restart_budget: 1,
                    },
                    queue_capacity: 4,
                    cancel_grace: Duration::from_millis(100),
                },
                tx,
            );
            let navigation = Arc::new(
                NavigationHistory::load(&NavigationConfig {
                    state_dir: Some(dir.path().join("state")),
                    ..Default::default()
                })
                .await,
            );
            let manager = Arc::new(SessionManager::new(
                registry, watcher, scheduler, navigation, 8,
            ));
            tokio::spawn(manager.clone().run_multiplexer(rx));
            Self {
                manager,
                driver_calls,
                dir,
            }
        }

        async fn call(&self, session: SessionId, method: &str, params: serde_json::Value) -> Dispatch {
            self.manager
                .handle_request(session, Request::new(1, method, params))
                .await
        }

        fn path(&self) -> String {
            self.dir.path().to_string_lossy().into_owned()
        }
    }

    fn reply(dispatch: Dispatch) -> Response {
        match dispatch {
            Dispatch::Reply(response) => response,
            Dispatch::Close(response) => panic!("unexpected close: {response:?}"),
        }
    }

    #[tokio::test]
    async fn test_navigate_lists_sorted_entries() {
        let f = Fixture::new().await;
        std::fs::write(f.dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(f.dir.path().join("a.txt"), "a").unwrap();
        let (session, _) = f.manager.connect();

        let resp = reply(f.call(session, "navigate", json!({"path": f.path()})).await);
        let result = resp.result.unwrap();
        let names: Vec<&str> = result["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .filter(|n| n.ends_with(".txt"))
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        let history = reply(f.call(session, "navigate.history", json!({})).await);
        assert_eq!(history.result.unwrap()["last_directory"], json!(f.path()));

        // Without a path the last directory is the start-up directory.
        let again = reply(f.call(session, "navigate", json!({})).await);
        assert_eq!(again.result.unwrap()["path"], json!(f.path()));
    }

    #[tokio::test]
    async fn test_missing_capability_is_not_supported_without_driver_call() {
        let f = Fixture::new().await;
        let (session, _) = f.manager.connect();

        let resp = reply(f.call(session, "navigate", json!({"path": "stub://host/dir"})).await);
        let error = resp.error.unwrap();
        assert_eq!(error.code, NOT_SUPPORTED);
        assert_eq!(error.reason(), Some(Reason::NotSupported));
        assert!(f.driver_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_navigate_errors_carry_reasons() {
        let f = Fixture::new().await;
        let (session, _) = f.manager.connect();

        let missing = reply(f.call(session, "navigate", json!({"path": "/no/such/dir/here"})).await);
        assert_eq!(missing.error.unwrap().reason(), Some(Reason::NotFound));

        let relative = reply(f.call(session, "navigate", json!({"path": "relative/dir"})).await);
        assert_eq!(relative.error.unwrap().reason(), Some(Reason::InvalidPath));

        let bad_params = reply(f.call(session, "stat", json!({})).await);
        assert_eq!(bad_params.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_protocol_violations_close_the_session() {
        let f = Fixture::new().await;
        let (session, _) = f.manager.connect();

        let unknown = f.call(session, "format.disk", json!({})).await;
        assert!(matches!(unknown, Dispatch::Close(_)));
        assert_eq!(
            unknown.response().error.as_ref().unwrap().reason(),
            Some(Reason::ProtocolViolation)
        );

        let garbage = f.manager.handle_line(session, "{oops").await;
        assert!(matches!(garbage, Dispatch::Close(_)));
        assert_eq!(garbage.response().error.as_ref().unwrap().code, PARSE_ERROR);

        let bye = f.call(session, "disconnect", json!({})).await;
        assert!(matches!(bye, Dispatch::Close(ref r) if r.is_success()));
    }

    #[tokio::test]
    async fn test_disconnect_releases_subscriptions_and_stops_delivery() {
        let f = Fixture::new().await;
        let (a, queue_a) = f.manager.connect();
        let (b, _) = f.manager.connect();

        for session in [a, b] {
            let resp = reply(f.call(session, "subscribe", json!({"path": f.path()})).await);
            assert!(resp.is_success());
        }
        assert_eq!(f.manager.watcher.clients_of(&f.path()).len(), 2);

        assert!(f.manager.disconnect(a));
        assert!(!f.manager.disconnect(a));
        assert!(!f.manager.is_connected(a));
        assert!(queue_a.is_closed());
        assert_eq!(f.manager.watcher.clients_of(&f.path()), vec![b]);

        let event = ServerEvent::WatchEnded {
            path: f.path(),
            reason: "test".into(),
        };
        assert_eq!(f.manager.send(&[a, b], &event), 1);

        let closed = f.call(a, "drivers.list", json!({})).await;
        assert!(matches!(closed, Dispatch::Close(_)));

        f.manager.disconnect(b);
        assert_eq!(f.manager.watcher.active_count(), 0);
    }

    #[tokio::test]
    async fn test_task_start_and_rejection() {
        let f = Fixture::new().await;
        let (session, queue) = f.manager.connect();

        let accepted = reply(
            f.call(
                session,
                "task.start",
                json!({"type": "scan", "params": {"path": f.path()}}),
            )
            .await,
        );
        let result = accepted.result.unwrap();
        let task_id = result["task_id"].as_u64().unwrap();
        assert_eq!(result["state"], "queued");

        let rejected = reply(f.call(session, "task.start", json!({"type": "compress"})).await);
        let error = rejected.error.unwrap();
        assert_eq!(error.code, TASK_REJECTED);
        assert_eq!(error.reason(), Some(Reason::UnknownTaskType));

        // The first task event reaches the owner's queue.
        let first = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.task_id(), Some(TaskId(task_id)));

        let listed = reply(f.call(session, "task.list", json!({})).await);
        assert_eq!(listed.result.unwrap()["tasks"].as_array().unwrap().len(), 1);

        let status = reply(f.call(session, "task.status", json!({"task_id": task_id})).await);
        assert_eq!(status.result.unwrap()["owner"], json!(session));

        let unknown = reply(f.call(session, "task.status", json!({"task_id": 999_999})).await);
        assert_eq!(unknown.error.unwrap().reason(), Some(Reason::TaskNotFound));
    }

    #[tokio::test]
    async fn test_daemon_status_and_drivers() {
        let f = Fixture::new().await;
        let (session, _) = f.manager.connect();

        let drivers = reply(f.call(session, "drivers.list", json!({})).await);
        let schemes: Vec<String> = drivers.result.unwrap()["drivers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["scheme"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(schemes, vec!["local", "stub"]);

        let status = reply(f.call(session, "daemon.status", json!({})).await);
        let result = status.result.unwrap();
        assert_eq!(result["sessions"], 1);
        assert_eq!(result["pool"]["size"], 1);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let f = Fixture::new().await;
        let (session, _) = f.manager.connect();
        let resp = reply(
            f.manager
                .handle_line(
                    session,
                    r#"{"jsonrpc":"2.0","id":"abc","method":"navigate.history"}"#,
                )
                .await,
        );
        assert_eq!(resp.id, Some(RequestId::String("abc".into())));
    }
}
