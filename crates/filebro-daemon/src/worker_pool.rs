//! Fixed-size pool of long-lived worker processes.
//!
//! Each slot owns at most one worker process and is bound to at most one
//! task. A monitor task per process forwards parsed stdout records and the
//! final exit as [`PoolEvent`]s. The pool itself is owned by the scheduler
//! actor and never shared.

use filebro_config::SchedulerConfig;
use filebro_protocol::{TaskDescriptor, TaskId, WorkerInstruction, WorkerRecord};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Worker I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode instruction: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Worker slot {0} is not available")]
    SlotUnavailable(usize),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Consecutive crashes a slot survives before it is marked degraded.
    pub restart_budget: u32,
}

impl From<&SchedulerConfig> for PoolSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            size: config.worker_count(),
            program: config.worker_program(),
            args: config.worker_args.clone(),
            restart_budget: config.restart_budget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Busy { task_id: TaskId },
    /// Killed on purpose; a fresh worker is started once the exit is observed.
    Restarting,
    /// Restart budget exhausted; excluded from dispatch.
    Degraded,
}

#[derive(Debug)]
pub enum PoolEvent {
    Record {
        slot: usize,
        generation: u64,
        record: WorkerRecord,
    },
    Exited {
        slot: usize,
        generation: u64,
        code: Option<i32>,
    },
}

/// What happened to a slot after its worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotExit {
    /// Task that was bound when the worker died unexpectedly.
    pub crashed_task: Option<TaskId>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub restarting: usize,
    pub degraded: usize,
}

struct Worker {
    generation: u64,
    stdin: Option<ChildStdin>,
    kill: CancellationToken,
    monitor: JoinHandle<()>,
}

struct Slot {
    state: SlotState,
    worker: Option<Worker>,
    consecutive_crashes: u32,
}

pub struct WorkerPool {
    settings: PoolSettings,
    slots: Vec<Slot>,
    events: mpsc::UnboundedSender<PoolEvent>,
    next_generation: u64,
    shutting_down: bool,
}

impl WorkerPool {
    /// Start one worker per slot. Slots whose worker cannot be started
    /// within the restart budget begin degraded.
    pub fn start(settings: PoolSettings, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        let slots = (0..settings.size)
            .map(|_| Slot {
                state: SlotState::Restarting,
                worker: None,
                consecutive_crashes: 0,
            })
            .collect();
        let mut pool = Self {
            settings,
            slots,
            events,
            next_generation: 1,
            shutting_down: false,
        };
        for slot in 0..pool.slots.len() {
            pool.restart(slot);
        }
        info!(
            size = pool.slots.len(),
            program = %pool.settings.program.display(),
            "Worker pool started"
        );
        pool
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Lowest-numbered idle slot.
    pub fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Idle)
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn slot_of(&self, task_id: TaskId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state == SlotState::Busy { task_id })
    }

    /// Task bound to `slot` if `generation` is its live worker.
    pub fn bound_task(&self, slot: usize, generation: u64) -> Option<TaskId> {
        let s = self.slots.get(slot)?;
        match (s.state, &s.worker) {
            (SlotState::Busy { task_id }, Some(w)) if w.generation == generation => Some(task_id),
            _ => None,
        }
    }

    pub fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            size: self.slots.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Idle => status.idle += 1,
                SlotState::Busy { .. } => status.busy += 1,
                SlotState::Restarting => status.restarting += 1,
                SlotState::Degraded => status.degraded += 1,
            }
        }
        status
    }

    /// Bind `task` to an idle slot and send it to the worker.
    ///
    /// On a write failure the slot stays bound and the worker is killed, so
    /// the task is resolved through the normal exit path.
    pub async fn dispatch(&mut self, slot: usize, task: TaskDescriptor) -> Result<()> {
        let task_id = task.id;
        let s = self
            .slots
            .get_mut(slot)
            .filter(|s| s.state == SlotState::Idle)
            .ok_or(WorkerError::SlotUnavailable(slot))?;
        s.state = SlotState::Busy { task_id };

        let line = WorkerInstruction::Run { task }.to_json_line()?;
        if let Err(e) = write_line(s.worker.as_mut(), &line).await {
            warn!(slot, task_id = %task_id, error = %e, "Dispatch write failed; killing worker");
            if let Some(worker) = &s.worker {
                worker.kill.cancel();
            }
            return Err(e);
        }
        debug!(slot, task_id = %task_id, "Dispatched task");
        Ok(())
    }

    /// Ask the worker bound to `task_id` to stop.
    pub async fn cancel(&mut self, slot: usize, task_id: TaskId) -> Result<()> {
        let s = self
            .slots
            .get_mut(slot)
            .filter(|s| s.state == SlotState::Busy { task_id })
            .ok_or(WorkerError::SlotUnavailable(slot))?;
        let line = WorkerInstruction::Cancel { task_id }.to_json_line()?;
        write_line(s.worker.as_mut(), &line).await
    }

    /// Forcibly terminate the worker in `slot`. The slot restarts once the
    /// exit is observed; the kill does not count against the budget.
    pub fn kill(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            if let Some(worker) = &s.worker {
                info!(slot, generation = worker.generation, "Killing worker");
                worker.kill.cancel();
            }
            if s.state != SlotState::Degraded {
                s.state = SlotState::Restarting;
            }
        }
    }

    /// The bound task reached a terminal record; the slot is free again.
    pub fn complete(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            if matches!(s.state, SlotState::Busy { .. }) {
                s.state = SlotState::Idle;
                s.consecutive_crashes = 0;
            }
        }
    }

    /// React to a worker exit. Returns `None` for exits of workers that
    /// were already replaced.
    pub fn handle_exit(&mut self, slot: usize, generation: u64, code: Option<i32>) -> Option<SlotExit> {
        let budget = self.settings.restart_budget;
        let shutting_down = self.shutting_down;
        let s = self.slots.get_mut(slot)?;
        if s.worker.as_ref().map(|w| w.generation) != Some(generation) {
            return None;
        }
        s.worker = None;

        let crashed_task = match s.state {
            SlotState::Busy { task_id } => Some(task_id),
            _ => None,
        };
        if shutting_down {
            return Some(SlotExit {
                crashed_task,
                degraded: false,
            });
        }

        if s.state != SlotState::Restarting {
            s.consecutive_crashes += 1;
            warn!(
                slot,
                code = ?code,
                task_id = ?crashed_task,
                crashes = s.consecutive_crashes,
                "Worker exited unexpectedly"
            );
        }
        s.state = if s.consecutive_crashes > budget {
            SlotState::Degraded
        } else {
            SlotState::Restarting
        };

        if s.state == SlotState::Restarting {
            self.restart(slot);
        } else {
            error!(slot, "Worker slot degraded after repeated crashes");
        }

        Some(SlotExit {
            crashed_task,
            degraded: self.slots[slot].state == SlotState::Degraded,
        })
    }

    /// Spawn a worker into `slot`, retrying spawn failures within the budget.
    fn restart(&mut self, slot: usize) {
        let budget = self.settings.restart_budget;
        loop {
            match self.spawn_worker(slot) {
                Ok(worker) => {
                    let s = &mut self.slots[slot];
                    debug!(slot, generation = worker.generation, "Worker started");
                    s.worker = Some(worker);
                    s.state = SlotState::Idle;
                    return;
                }
                Err(e) => {
                    let s = &mut self.slots[slot];
                    s.consecutive_crashes += 1;
                    error!(slot, error = %e, "Failed to start worker");
                    if s.consecutive_crashes > budget {
                        s.state = SlotState::Degraded;
                        return;
                    }
                }
            }
        }
    }

    fn spawn_worker(&mut self, slot: usize) -> Result<Worker> {
        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.settings.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
        let stderr = child.stderr.take();

        let generation = self.next_generation;
        self.next_generation += 1;
        let kill = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            slot,
            generation,
            child,
            stdout,
            stderr,
            kill.clone(),
            self.events.clone(),
        ));

        Ok(Worker {
            generation,
            stdin,
            kill,
            monitor,
        })
    }

    /// Close every worker's stdin, wait up to `grace` for them to exit and
    /// kill whatever is left.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.shutting_down = true;
        let mut monitors = Vec::new();
        let mut kills = Vec::new();
        for slot in &mut self.slots {
            if let Some(mut worker) = slot.worker.take() {
                worker.stdin.take();
                kills.push(worker.kill.clone());
                monitors.push(worker.monitor);
            }
        }

        let graceful = tokio::time::timeout(
            grace,
            futures::future::join_all(monitors.iter_mut()),
        )
        .await;
        if graceful.is_err() {
            warn!("Workers did not exit in time; killing");
            for kill in &kills {
                kill.cancel();
            }
            futures::future::join_all(monitors).await;
        }
        info!("Worker pool stopped");
    }
}

async fn write_line(worker: Option<&mut Worker>, line: &str) -> Result<()> {
    let stdin = worker
        .and_then(|w| w.stdin.as_mut())
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed"))?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Forward records until stdout closes or a kill is requested, then report
/// the exit.
async fn monitor(
    slot: usize,
    generation: u64,
    mut child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    kill: CancellationToken,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(slot, "worker: {}", line);
            }
        });
    }

    let mut lines = BufReader::new(stdout).lines();
    let mut killed = false;
    loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => {
                killed = true;
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<WorkerRecord>(&line) {
                    Ok(record) => {
                        let _ = events.send(PoolEvent::Record { slot, generation, record });
                    }
                    Err(e) => warn!(slot, error = %e, "Ignoring unparseable worker output"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(slot, error = %e, "Worker stdout failed");
                    break;
                }
            },
        }
    }

    if !killed {
        // Stdout closed; the process may still be alive.
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill.cancelled() => None,
        };
        if let Some(status) = exited {
            let code = status.ok().and_then(|s| s.code());
            let _ = events.send(PoolEvent::Exited { slot, generation, code });
            return;
        }
    }

    if let Err(e) = child.kill().await {
        debug!(slot, error = %e, "Kill failed");
    }
    let code = child.wait().await.ok().and_then(|s| s.code());
    let _ = events.send(PoolEvent::Exited { slot, generation, code });
}
