//! Worker process main loop.
//!
//! Reads [`WorkerInstruction`]s line by line, runs one task at a time and
//! writes [`WorkerRecord`]s. Every `run` ends with exactly one terminal
//! record. End of input cancels the current task and exits cleanly.

use crate::tasks::{self, TaskContext, TaskFailure};
use anyhow::{Context, Result};
use filebro_protocol::{TaskId, WorkerInstruction, WorkerRecord};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Running {
    task_id: TaskId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub async fn run_worker<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (record_tx, record_rx) = mpsc::unbounded_channel::<WorkerRecord>();
    let writer = tokio::spawn(write_records(output, record_rx));

    let mut lines = BufReader::new(input).lines();
    let mut current: Option<Running> = None;

    while let Some(line) = lines.next_line().await.context("reading instructions")? {
        if line.trim().is_empty() {
            continue;
        }
        let instruction = match serde_json::from_str::<WorkerInstruction>(&line) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed instruction");
                continue;
            }
        };

        match instruction {
            WorkerInstruction::Run { task } => {
                if current.as_ref().is_some_and(|r| !r.handle.is_finished()) {
                    let _ = record_tx.send(WorkerRecord::Error {
                        task_id: task.id,
                        reason: "worker is busy".into(),
                    });
                    continue;
                }

                info!(task_id = %task.id, task_type = task.spec.task_type(), "Running task");
                let cancel = CancellationToken::new();
                let ctx = TaskContext::new(task.id, record_tx.clone(), cancel.clone());
                let terminal_tx = record_tx.clone();
                let task_id = task.id;
                let handle = tokio::spawn(async move {
                    let record = match tasks::execute(task, ctx).await {
                        Ok(payload) => WorkerRecord::Result { task_id, payload },
                        Err(TaskFailure::Cancelled) => WorkerRecord::Cancelled { task_id },
                        Err(TaskFailure::Failed(reason)) => WorkerRecord::Error { task_id, reason },
                    };
                    let _ = terminal_tx.send(record);
                });
                current = Some(Running {
                    task_id,
                    cancel,
                    handle,
                });
            }
            WorkerInstruction::Cancel { task_id } => match &current {
                Some(running) if running.task_id == task_id => {
                    debug!(task_id = %task_id, "Cancelling task");
                    running.cancel.cancel();
                }
                _ => debug!(task_id = %task_id, "Cancel for a task that is not running"),
            },
        }
    }

    debug!("Instruction stream closed");
    if let Some(running) = current.take() {
        running.cancel.cancel();
        let _ = running.handle.await;
    }
    drop(record_tx);
    writer.await.context("record writer panicked")?
}

async fn write_records<W>(mut output: W, mut records: mpsc::UnboundedReceiver<WorkerRecord>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(record) = records.recv().await {
        let line = record.to_json_line()?;
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}
