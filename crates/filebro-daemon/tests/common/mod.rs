//! Shared harness: a daemon on a temporary socket and a line-oriented client.

#![allow(dead_code)]

use filebro_config::DaemonConfig;
use filebro_daemon::Server;
use filebro_drivers::DriverRegistry;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

pub const TIMEOUT: Duration = Duration::from_secs(20);

pub fn real_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_filebro-worker"))
}

/// Configuration rooted in `dir` with `workers` slots running `program`.
pub fn config(dir: &Path, workers: usize, program: PathBuf, args: Vec<String>) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.server.socket_path = Some(dir.join("filebro.sock"));
    config.watch.debounce_ms = 150;
    config.scheduler.workers = Some(workers);
    config.scheduler.worker_program = Some(program);
    config.scheduler.worker_args = args;
    config.scheduler.cancel_grace_ms = 300;
    config.navigation.state_dir = Some(dir.join("state"));
    config
}

/// Worker that runs `script` under `/bin/sh`.
pub fn script_config(dir: &Path, workers: usize, script: &str) -> DaemonConfig {
    config(
        dir,
        workers,
        PathBuf::from("/bin/sh"),
        vec!["-c".into(), script.into()],
    )
}

pub struct TestDaemon {
    pub dir: TempDir,
    pub socket: PathBuf,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    pub async fn start(dir: TempDir, config: DaemonConfig) -> Self {
        Self::start_with(dir, config, DriverRegistry::with_local()).await
    }

    pub async fn start_with(dir: TempDir, config: DaemonConfig, registry: DriverRegistry) -> Self {
        let server = Server::bind(&config, registry).await.unwrap();
        let socket = server.socket_path().to_path_buf();
        let shutdown = server.shutdown_handle();
        let handle = tokio::spawn(server.run());
        Self {
            dir,
            socket,
            shutdown,
            handle,
        }
    }

    pub async fn connect(&self) -> Client<UnixStream> {
        Client::new(UnixStream::connect(&self.socket).await.unwrap())
    }

    /// A directory inside the daemon's temp dir.
    pub fn data_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
        assert!(!self.socket.exists());
    }
}

pub struct Client<S> {
    lines: Lines<BufReader<ReadHalf<S>>>,
    writer: WriteHalf<S>,
    next_id: u64,
    events: VecDeque<Value>,
}

impl<S: AsyncRead + AsyncWrite> Client<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next line from the daemon, `None` on EOF.
    pub async fn read_message(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for the daemon")
            .ok()??;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Send a request and wait for its response; events seen meanwhile are kept.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send_raw(&request.to_string()).await;

        loop {
            let message = self.read_message().await.expect("connection closed");
            if message["type"] == "event" {
                self.events.push_back(message);
            } else if message["id"] == id {
                return message;
            }
        }
    }

    pub async fn result(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        assert!(response["error"].is_null(), "{method} failed: {response}");
        response["result"].clone()
    }

    pub async fn next_event(&mut self) -> Value {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            let message = self.read_message().await.expect("connection closed");
            if message["type"] == "event" {
                return message;
            }
        }
    }

    /// Skip events until one matches.
    pub async fn event_where(&mut self, predicate: impl Fn(&Value) -> bool) -> Value {
        loop {
            let event = self.next_event().await;
            if predicate(&event) {
                return event;
            }
        }
    }

    pub async fn wait_for_state(&mut self, task_id: u64, state: &str) -> Value {
        self.event_where(|e| {
            e["event"] == "task_state" && e["task_id"] == task_id && e["state"] == state
        })
        .await
    }

    /// Every event for `task_id` up to and including its terminal state.
    pub async fn task_events(&mut self, task_id: u64) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let event = self.next_event().await;
            if event["task_id"] != task_id {
                continue;
            }
            let terminal = event["event"] == "task_state"
                && matches!(
                    event["state"].as_str(),
                    Some("completed" | "failed" | "cancelled")
                );
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    /// Events already received or arriving within `wait`.
    pub async fn drain_events(&mut self, wait: Duration) -> Vec<Value> {
        let mut events: Vec<Value> = self.events.drain(..).collect();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout_at(deadline, self.lines.next_line()).await
        {
            let message: Value = serde_json::from_str(&line).unwrap();
            if message["type"] == "event" {
                events.push(message);
            }
        }
        events
    }
}
