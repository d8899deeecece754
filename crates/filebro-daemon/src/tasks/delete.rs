use super::{percent, TaskContext, TaskFailure, TaskOutcome};
use serde_json::json;
use std::io;

pub(super) async fn run(paths: &[String], ctx: &TaskContext) -> TaskOutcome {
    let total = paths.len() as u64;
    let mut deleted = Vec::with_capacity(paths.len());

    for (i, path) in paths.iter().enumerate() {
        ctx.checkpoint()?;
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| TaskFailure::io(e, path))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => {}
            // Removed concurrently; the goal is reached.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TaskFailure::io(e, path)),
        }

        ctx.log(format!("deleted {path}"));
        deleted.push(path.clone());
        ctx.progress(percent(i as u64 + 1, total), None);
    }

    Ok(json!({ "deleted": deleted }))
}
