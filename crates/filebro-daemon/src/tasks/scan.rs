use super::{TaskContext, TaskFailure, TaskOutcome};
use serde_json::json;
use walkdir::WalkDir;

/// Entries between progress reports. A walk has no known total, so the
/// progress records carry running counts and no percentage movement.
const REPORT_EVERY: u64 = 500;

pub(super) async fn run(path: &str, ctx: &TaskContext) -> TaskOutcome {
    let root = path.to_string();
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || walk(&root, &ctx))
        .await
        .map_err(|e| TaskFailure::Failed(format!("scan aborted: {e}")))?
}

fn walk(root: &str, ctx: &TaskContext) -> TaskOutcome {
    let meta = std::fs::metadata(root).map_err(|e| TaskFailure::io(e, root))?;
    if !meta.is_dir() {
        return Err(TaskFailure::Failed(format!("{root} is not a directory")));
    }

    let mut files = 0u64;
    let mut directories = 0u64;
    let mut bytes = 0u64;
    let mut skipped = 0u64;
    let mut seen = 0u64;

    for entry in WalkDir::new(root).min_depth(1) {
        ctx.checkpoint()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skipped += 1;
                ctx.log(format!("skipped: {e}"));
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            directories += 1;
        } else if file_type.is_file() {
            files += 1;
            bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }

        seen += 1;
        if seen % REPORT_EVERY == 0 {
            ctx.progress(
                0.0,
                Some(format!("{files} files, {directories} directories")),
            );
        }
    }

    ctx.progress(100.0, Some(format!("{files} files, {directories} directories")));
    Ok(json!({
        "path": root,
        "files": files,
        "directories": directories,
        "bytes": bytes,
        "skipped": skipped,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_counts_tree() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), "12345").unwrap();
        std::fs::write(tmp.path().join("a/b/deep.txt"), "123").unwrap();
        let (ctx, _rx, _) = context();

        let payload = run(tmp.path().to_str().unwrap(), &ctx).await.unwrap();
        assert_eq!(payload["files"], 2);
        assert_eq!(payload["directories"], 2);
        assert_eq!(payload["bytes"], 8);
    }

    #[tokio::test]
    async fn test_scan_of_file_fails() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let (ctx, _rx, _) = context();
        assert!(matches!(
            run(file.to_str().unwrap(), &ctx).await,
            Err(TaskFailure::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        let (ctx, _rx, cancel) = context();
        cancel.cancel();
        assert!(matches!(
            run(tmp.path().to_str().unwrap(), &ctx).await,
            Err(TaskFailure::Cancelled)
        ));
    }
}
