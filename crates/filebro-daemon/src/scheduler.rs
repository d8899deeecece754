//! Task scheduler.
//!
//! A single actor task owns the worker pool, the FIFO queue and all task
//! state transitions. Clients talk to it through the cloneable
//! [`TaskScheduler`] handle; status reads go straight to a shared snapshot
//! table that only the actor writes.

use crate::worker_pool::{PoolEvent, PoolSettings, PoolStatus, WorkerPool};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use filebro_config::SchedulerConfig;
use filebro_protocol::{
    AdmissionError, Outbound, Progress, Reason, ServerEvent, SessionId, TaskDescriptor, TaskId,
    TaskSpec, TaskState, WorkerRecord,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Scheduler is not running")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn reason(&self) -> Reason {
        match self {
            Self::Admission(e) => e.reason(),
            Self::TaskNotFound(_) => Reason::TaskNotFound,
            Self::Stopped => Reason::Internal,
        }
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub owner: SessionId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pool: PoolStatus,
    pub queued: usize,
    pub running: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pool: PoolSettings,
    pub queue_capacity: usize,
    pub cancel_grace: Duration,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            pool: PoolSettings::from(config),
            queue_capacity: config.queue_capacity,
            cancel_grace: config.cancel_grace(),
        }
    }
}

enum Command {
    Start {
        owner: SessionId,
        spec: TaskSpec,
        reply: oneshot::Sender<Result<TaskId>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<TaskState>>,
    },
    GraceExpired {
        task_id: TaskId,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

type TaskTable = Arc<DashMap<TaskId, TaskInfo>>;

/// Handle to the scheduler actor.
#[derive(Clone)]
pub struct TaskScheduler {
    commands: mpsc::UnboundedSender<Command>,
    tasks: TaskTable,
}

impl TaskScheduler {
    /// Start the pool and the actor. Task events are addressed to the
    /// owning session and sent on `outbound`.
    pub fn start(
        settings: SchedulerSettings,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let tasks: TaskTable = Arc::new(DashMap::new());

        let actor = Actor {
            pool: WorkerPool::start(settings.pool, pool_tx),
            queue: VecDeque::new(),
            specs: HashMap::new(),
            tasks: tasks.clone(),
            next_id: 1,
            queue_capacity: settings.queue_capacity,
            cancel_grace: settings.cancel_grace,
            outbound,
            timers: commands_tx.downgrade(),
        };
        let handle = tokio::spawn(actor.run(commands_rx, pool_rx));

        (
            Self {
                commands: commands_tx,
                tasks,
            },
            handle,
        )
    }

    /// Admit a task. Parameters are validated before the task gets an id.
    pub async fn submit(&self, owner: SessionId, task_type: &str, params: Value) -> Result<TaskId> {
        let spec = TaskSpec::parse(task_type, params)?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { owner, spec, reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Request cancellation. Returns the task's state after the request was
    /// processed: `Cancelled` for queued tasks, `Running` while a running
    /// task is winding down, or the unchanged terminal state.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel { task_id, reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&task_id).map(|t| t.clone())
    }

    /// Tasks owned by `owner`, oldest first.
    pub fn list(&self, owner: SessionId) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .tasks
            .iter()
            .filter(|t| t.owner == owner)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply })?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Stop the actor and the worker pool.
    pub async fn shutdown(&self, grace: Duration) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { grace, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }
}

struct Actor {
    pool: WorkerPool,
    queue: VecDeque<TaskId>,
    /// Specs of tasks still waiting for a slot.
    specs: HashMap<TaskId, TaskSpec>,
    tasks: TaskTable,
    next_id: u64,
    queue_capacity: usize,
    cancel_grace: Duration,
    outbound: mpsc::UnboundedSender<Outbound>,
    timers: mpsc::WeakUnboundedSender<Command>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut pool_events: mpsc::UnboundedReceiver<PoolEvent>,
    ) {
        info!(
            workers = self.pool.size(),
            queue_capacity = self.queue_capacity,
            "Task scheduler started"
        );
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { grace, reply }) => {
                        self.pool.shutdown(grace).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.pool.shutdown(self.cancel_grace).await;
                        break;
                    }
                },
                Some(event) = pool_events.recv() => self.handle_pool_event(event).await,
            }
            self.dispatch_ready().await;
        }
        info!("Task scheduler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { owner, spec, reply } => {
                let _ = reply.send(self.admit(owner, spec));
            }
            Command::Cancel { task_id, reply } => {
                let result = self.cancel(task_id).await;
                let _ = reply.send(result);
            }
            Command::GraceExpired { task_id } => self.grace_expired(task_id),
            Command::Stats { reply } => {
                let running = self
                    .tasks
                    .iter()
                    .filter(|t| t.state == TaskState::Running)
                    .count();
                let _ = reply.send(SchedulerStats {
                    pool: self.pool.status(),
                    queued: self.queue.len(),
                    running,
                });
            }
            // Handled by the run loop.
            Command::Shutdown { .. } => {}
        }
    }

    fn admit(&mut self, owner: SessionId, spec: TaskSpec) -> Result<TaskId> {
        if self.queue.len() >= self.queue_capacity {
            warn!(owner = %owner, capacity = self.queue_capacity, "Task queue full");
            return Err(AdmissionError::SchedulerOverload {
                capacity: self.queue_capacity,
            }
            .into());
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        let now = Utc::now();
        self.tasks.insert(
            id,
            TaskInfo {
                id,
                task_type: spec.task_type().to_string(),
                owner,
                state: TaskState::Queued,
                last_sequence: None,
                slot: None,
                cancel_requested: false,
                created_at: now,
                updated_at: now,
            },
        );
        info!(task_id = %id, owner = %owner, task_type = spec.task_type(), "Task queued");
        self.specs.insert(id, spec);
        self.queue.push_back(id);
        self.emit(
            owner,
            ServerEvent::TaskState {
                task_id: id,
                state: TaskState::Queued,
            },
        );
        Ok(id)
    }

    async fn cancel(&mut self, task_id: TaskId) -> Result<TaskState> {
        let (state, slot, already_requested) = {
            let mut info = self
                .tasks
                .get_mut(&task_id)
                .ok_or(SchedulerError::TaskNotFound(task_id))?;
            let snapshot = (info.state, info.slot, info.cancel_requested);
            if info.state == TaskState::Running {
                info.cancel_requested = true;
                info.updated_at = Utc::now();
            }
            snapshot
        };

        match state {
            TaskState::Queued => {
                self.queue.retain(|id| *id != task_id);
                self.specs.remove(&task_id);
                self.finish(task_id, TaskState::Cancelled);
                Ok(TaskState::Cancelled)
            }
            TaskState::Running => {
                if !already_requested {
                    info!(task_id = %task_id, "Cancelling running task");
                    if let Some(slot) = slot {
                        if let Err(e) = self.pool.cancel(slot, task_id).await {
                            warn!(task_id = %task_id, error = %e, "Could not deliver cancel");
                        }
                    }
                    self.start_grace_timer(task_id);
                }
                Ok(TaskState::Running)
            }
            terminal => Ok(terminal),
        }
    }

    fn start_grace_timer(&self, task_id: TaskId) {
        let timers = self.timers.clone();
        let grace = self.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = timers.upgrade() {
                let _ = tx.send(Command::GraceExpired { task_id });
            }
        });
    }

    fn grace_expired(&mut self, task_id: TaskId) {
        let Some((state, slot, requested)) = self
            .tasks
            .get(&task_id)
            .map(|t| (t.state, t.slot, t.cancel_requested))
        else {
            return;
        };
        if state != TaskState::Running || !requested {
            return;
        }

        warn!(task_id = %task_id, "Worker ignored cancel; terminating it");
        if let Some(slot) = slot {
            self.pool.kill(slot);
        }
        self.finish(task_id, TaskState::Cancelled);
    }

    async fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Record {
                slot,
                generation,
                record,
            } => {
                let Some(task_id) = self.pool.bound_task(slot, generation) else {
                    debug!(slot, "Dropping record from unbound worker");
                    return;
                };
                if record.task_id() != task_id {
                    warn!(slot, task_id = %task_id, record_task = %record.task_id(), "Record for a foreign task");
                    return;
                }
                self.handle_record(slot, task_id, record);
            }
            PoolEvent::Exited {
                slot,
                generation,
                code,
            } => {
                let Some(exit) = self.pool.handle_exit(slot, generation, code) else {
                    return;
                };
                if let Some(task_id) = exit.crashed_task {
                    if self.cancel_requested(task_id) {
                        self.finish(task_id, TaskState::Cancelled);
                    } else {
                        let message = match code {
                            Some(code) => format!("worker exited with status {code}"),
                            None => "worker was terminated".to_string(),
                        };
                        self.fail(task_id, Reason::WorkerCrash, message);
                    }
                }
                if exit.degraded {
                    warn!(slot, "Worker slot excluded from dispatch");
                }
            }
        }
    }

    fn handle_record(&mut self, slot: usize, task_id: TaskId, record: WorkerRecord) {
        match record {
            WorkerRecord::Progress {
                sequence,
                percent,
                message,
                ..
            } => self.relay(task_id, sequence, Progress::Percent { percent, message }),
            WorkerRecord::Log {
                sequence, message, ..
            } => self.relay(task_id, sequence, Progress::Log(message)),
            WorkerRecord::Result { payload, .. } => {
                self.pool.complete(slot);
                if self.cancel_requested(task_id) {
                    self.finish(task_id, TaskState::Cancelled);
                } else {
                    self.emit_for(task_id, ServerEvent::TaskResult { task_id, payload });
                    self.finish(task_id, TaskState::Completed);
                }
            }
            WorkerRecord::Error { reason, .. } => {
                self.pool.complete(slot);
                if self.cancel_requested(task_id) {
                    self.finish(task_id, TaskState::Cancelled);
                } else {
                    self.fail(task_id, Reason::TaskFailed, reason);
                }
            }
            WorkerRecord::Cancelled { .. } => {
                self.pool.complete(slot);
                self.finish(task_id, TaskState::Cancelled);
            }
        }
    }

    /// Forward a streaming record unless it is stale.
    fn relay(&mut self, task_id: TaskId, sequence: u64, progress: Progress) {
        let owner = {
            let Some(mut info) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if info.state.is_terminal() || info.last_sequence.is_some_and(|last| sequence <= last)
            {
                debug!(task_id = %task_id, sequence, "Dropping stale progress");
                return;
            }
            info.last_sequence = Some(sequence);
            info.owner
        };
        self.emit(
            owner,
            ServerEvent::TaskProgress {
                task_id,
                sequence,
                progress,
            },
        );
    }

    fn cancel_requested(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .map(|t| t.cancel_requested)
            .unwrap_or(false)
    }

    fn fail(&mut self, task_id: TaskId, reason: Reason, message: String) {
        if self.is_terminal(task_id) {
            return;
        }
        warn!(task_id = %task_id, reason = %reason, message = %message, "Task failed");
        self.emit_for(
            task_id,
            ServerEvent::TaskError {
                task_id,
                reason,
                message,
            },
        );
        self.finish(task_id, TaskState::Failed);
    }

    fn is_terminal(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .map(|t| t.state.is_terminal())
            .unwrap_or(true)
    }

    /// Move a task into a terminal state. Terminal states are final.
    fn finish(&mut self, task_id: TaskId, state: TaskState) {
        let owner = {
            let Some(mut info) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if info.state.is_terminal() {
                return;
            }
            info.state = state;
            info.slot = None;
            info.updated_at = Utc::now();
            info.owner
        };
        info!(task_id = %task_id, state = %state, "Task finished");
        self.emit(owner, ServerEvent::TaskState { task_id, state });
    }

    /// Assign queued tasks to idle slots, oldest first.
    async fn dispatch_ready(&mut self) {
        while let Some(slot) = self.pool.idle_slot() {
            let Some(task_id) = self.queue.pop_front() else {
                break;
            };
            let Some(spec) = self.specs.remove(&task_id) else {
                continue;
            };

            let owner = {
                let Some(mut info) = self.tasks.get_mut(&task_id) else {
                    continue;
                };
                info.state = TaskState::Running;
                info.slot = Some(slot);
                info.updated_at = Utc::now();
                info.owner
            };
            self.emit(
                owner,
                ServerEvent::TaskState {
                    task_id,
                    state: TaskState::Running,
                },
            );

            if let Err(e) = self
                .pool
                .dispatch(slot, TaskDescriptor { id: task_id, spec })
                .await
            {
                warn!(task_id = %task_id, slot, error = %e, "Dispatch failed");
            }
        }
    }

    fn emit_for(&self, task_id: TaskId, event: ServerEvent) {
        if let Some(owner) = self.tasks.get(&task_id).map(|t| t.owner) {
            self.emit(owner, event);
        }
    }

    fn emit(&self, owner: SessionId, event: ServerEvent) {
        if self.outbound.send(Outbound::to_session(owner, event)).is_err() {
            debug!("Outbound channel closed");
        }
    }
}
