use super::{percent, TaskContext, TaskFailure, TaskOutcome, CHUNK_SIZE};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use walkdir::WalkDir;

#[derive(Debug, Default)]
struct CopyPlan {
    directories: Vec<PathBuf>,
    files: Vec<(PathBuf, PathBuf, u64)>,
    total_bytes: u64,
}

fn build_plan(sources: &[String], destination: &Path) -> Result<CopyPlan, TaskFailure> {
    let mut plan = CopyPlan::default();
    for source in sources {
        let src = Path::new(source);
        let name = src
            .file_name()
            .ok_or_else(|| TaskFailure::Failed(format!("{source} has no file name")))?;
        let target_root = destination.join(name);
        if target_root.starts_with(src) {
            return Err(TaskFailure::Failed(format!(
                "cannot copy {source} into itself"
            )));
        }

        for entry in WalkDir::new(src) {
            let entry = entry.map_err(|e| TaskFailure::Failed(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| TaskFailure::Failed(e.to_string()))?;
            let target = target_root.join(rel);
            if entry.file_type().is_dir() {
                plan.directories.push(target);
            } else if entry.file_type().is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                plan.total_bytes += size;
                plan.files.push((entry.into_path(), target, size));
            }
        }
    }
    Ok(plan)
}

pub(super) async fn run(sources: &[String], destination: &str, ctx: &TaskContext) -> TaskOutcome {
    let dest = PathBuf::from(destination);
    let meta = tokio::fs::metadata(&dest)
        .await
        .map_err(|e| TaskFailure::io(e, destination))?;
    if !meta.is_dir() {
        return Err(TaskFailure::Failed(format!(
            "destination {destination} is not a directory"
        )));
    }

    let owned_sources = sources.to_vec();
    let plan_dest = dest.clone();
    let plan = tokio::task::spawn_blocking(move || build_plan(&owned_sources, &plan_dest))
        .await
        .map_err(|e| TaskFailure::Failed(format!("copy planning aborted: {e}")))??;
    ctx.log(format!(
        "copying {} files ({} bytes) to {destination}",
        plan.files.len(),
        plan.total_bytes
    ));

    for dir in &plan.directories {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TaskFailure::io(e, &dir.to_string_lossy()))?;
    }

    let mut copied_bytes = 0u64;
    let mut reported = 0u32;
    let mut buf = vec![0u8; CHUNK_SIZE];
    for (src, dst, _) in &plan.files {
        let src_name = src.to_string_lossy();
        let mut reader = tokio::fs::File::open(src)
            .await
            .map_err(|e| TaskFailure::io(e, &src_name))?;
        let mut writer = tokio::fs::File::create(dst)
            .await
            .map_err(|e| TaskFailure::io(e, &dst.to_string_lossy()))?;

        loop {
            if ctx.is_cancelled() {
                drop(writer);
                // Leave no partially written file behind.
                let _ = tokio::fs::remove_file(dst).await;
                return Err(TaskFailure::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| TaskFailure::io(e, &src_name))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| TaskFailure::io(e, &dst.to_string_lossy()))?;
            copied_bytes += n as u64;

            let pct = percent(copied_bytes, plan.total_bytes);
            if pct as u32 > reported {
                reported = pct as u32;
                ctx.progress(pct, Some(src_name.to_string()));
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| TaskFailure::io(e, &dst.to_string_lossy()))?;
    }

    ctx.progress(100.0, None);
    Ok(json!({
        "copied": plan.files.len(),
        "directories": plan.directories.len(),
        "bytes": copied_bytes,
        "destination": destination,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copies_files_and_directories() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("one.txt"), "one").unwrap();
        std::fs::create_dir_all(src.path().join("tree/sub")).unwrap();
        std::fs::write(src.path().join("tree/sub/two.txt"), "two!").unwrap();
        let (ctx, _rx, _) = context();

        let sources = vec![
            src.path().join("one.txt").to_string_lossy().into_owned(),
            src.path().join("tree").to_string_lossy().into_owned(),
        ];
        let payload = run(&sources, dst.path().to_str().unwrap(), &ctx)
            .await
            .unwrap();

        assert_eq!(payload["copied"], 2);
        assert_eq!(payload["bytes"], 7);
        assert_eq!(
            std::fs::read_to_string(dst.path().join("one.txt")).unwrap(),
            "one"
        );
        assert_eq!(
            std::fs::read_to_string(dst.path().join("tree/sub/two.txt")).unwrap(),
            "two!"
        );
    }

    #[tokio::test]
    async fn test_destination_must_be_directory() {
        let src = TempDir::new().unwrap();
        let file = src.path().join("f");
        std::fs::write(&file, "x").unwrap();
        let (ctx, _rx, _) = context();

        let sources = vec![file.to_string_lossy().into_owned()];
        assert!(matches!(
            run(&sources, file.to_str().unwrap(), &ctx).await,
            Err(TaskFailure::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_refuses_copy_into_itself() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir(src.path().join("d")).unwrap();
        let (ctx, _rx, _) = context();

        let dir = src.path().join("d");
        let sources = vec![dir.to_string_lossy().into_owned()];
        assert!(matches!(
            run(&sources, dir.to_str().unwrap(), &ctx).await,
            Err(TaskFailure::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_copy_leaves_no_partial_file() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("big"), vec![1u8; 1024]).unwrap();
        let (ctx, _rx, cancel) = context();
        cancel.cancel();

        let sources = vec![src.path().join("big").to_string_lossy().into_owned()];
        assert!(matches!(
            run(&sources, dst.path().to_str().unwrap(), &ctx).await,
            Err(TaskFailure::Cancelled)
        ));
        assert!(!dst.path().join("big").exists());
    }
}
