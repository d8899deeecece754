//! Task implementations executed inside worker processes.
//!
//! Each task reports through a [`TaskContext`], checks its cancellation
//! token between units of work and returns its result payload. The worker
//! loop turns the returned [`TaskOutcome`] into exactly one terminal record.

mod copy;
mod delete;
mod hash;
mod scan;

use filebro_protocol::{TaskDescriptor, TaskId, TaskSpec, WorkerRecord};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read/write buffer size and cancellation granularity for byte-oriented tasks.
pub(crate) const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum TaskFailure {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl TaskFailure {
    pub(crate) fn io(err: io::Error, path: &str) -> Self {
        Self::Failed(format!("{path}: {err}"))
    }
}

pub type TaskOutcome = Result<Value, TaskFailure>;

/// Reporting handle given to a running task.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    records: mpsc::UnboundedSender<WorkerRecord>,
    cancel: CancellationToken,
    sequence: Arc<AtomicU64>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        records: mpsc::UnboundedSender<WorkerRecord>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            records,
            cancel,
            sequence: Default::default(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn progress(&self, percent: f32, message: Option<String>) {
        let _ = self.records.send(WorkerRecord::Progress {
            task_id: self.task_id,
            sequence: self.next_sequence(),
            percent: percent.clamp(0.0, 100.0),
            message,
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        let _ = self.records.send(WorkerRecord::Log {
            task_id: self.task_id,
            sequence: self.next_sequence(),
            message: message.into(),
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskFailure> {
        if self.is_cancelled() {
            Err(TaskFailure::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run one task to completion.
pub async fn execute(descriptor: TaskDescriptor, ctx: TaskContext) -> TaskOutcome {
    match descriptor.spec {
        TaskSpec::Hash { path, algorithm } => hash::run(&path, algorithm, &ctx).await,
        TaskSpec::Copy {
            sources,
            destination,
        } => copy::run(&sources, &destination, &ctx).await,
        TaskSpec::Delete { paths } => delete::run(&paths, &ctx).await,
        TaskSpec::Scan { path } => scan::run(&path, &ctx).await,
    }
}

/// Percentage of `done` out of `total`, 100 when there is nothing to do.
pub(crate) fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64 * 100.0) as f32
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_sequences_increase_across_record_kinds() {
        let (ctx, mut rx, _) = context();
        ctx.progress(10.0, None);
        ctx.log("step");
        ctx.progress(150.0, Some("done".into()));

        let records = drain(&mut rx);
        let sequences: Vec<_> = records.iter().filter_map(|r| r.sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(matches!(
            records[2],
            WorkerRecord::Progress { percent, .. } if percent == 100.0
        ));
    }

    #[test]
    fn test_checkpoint_reports_cancellation() {
        let (ctx, _rx, cancel) = context();
        assert!(ctx.checkpoint().is_ok());
        cancel.cancel();
        assert!(matches!(ctx.checkpoint(), Err(TaskFailure::Cancelled)));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
