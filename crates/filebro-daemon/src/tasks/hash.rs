use super::{percent, TaskContext, TaskFailure, TaskOutcome, CHUNK_SIZE};
use filebro_protocol::HashAlgorithm;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => h
                .finalize()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect(),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

pub(super) async fn run(path: &str, algorithm: HashAlgorithm, ctx: &TaskContext) -> TaskOutcome {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TaskFailure::io(e, path))?;
    let total = file
        .metadata()
        .await
        .map_err(|e| TaskFailure::io(e, path))?
        .len();
    ctx.log(format!("hashing {path} ({total} bytes)"));

    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done: u64 = 0;
    let mut reported = 0u32;
    loop {
        ctx.checkpoint()?;
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TaskFailure::io(e, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        done += n as u64;

        let pct = percent(done, total);
        if pct as u32 > reported {
            reported = pct as u32;
            ctx.progress(pct, None);
        }
    }

    Ok(json!({
        "path": path,
        "algorithm": algorithm,
        "digest": hasher.finalize_hex(),
        "bytes": done,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use filebro_protocol::WorkerRecord;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sha256_of_known_content() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("abc.txt");
        std::fs::write(&file, "abc").unwrap();
        let (ctx, mut rx, _) = context();

        let payload = run(file.to_str().unwrap(), HashAlgorithm::Sha256, &ctx)
            .await
            .unwrap();
        assert_eq!(
            payload["digest"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(payload["bytes"], 3);
        assert_eq!(payload["algorithm"], "sha256");

        let records = drain(&mut rx);
        assert!(matches!(records[0], WorkerRecord::Log { .. }));
        assert!(matches!(
            records.last(),
            Some(WorkerRecord::Progress { percent, .. }) if *percent == 100.0
        ));
    }

    #[tokio::test]
    async fn test_blake3_matches_reference() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("data.bin");
        let data = vec![7u8; CHUNK_SIZE * 2 + 11];
        std::fs::write(&file, &data).unwrap();
        let (ctx, _rx, _) = context();

        let payload = run(file.to_str().unwrap(), HashAlgorithm::Blake3, &ctx)
            .await
            .unwrap();
        assert_eq!(payload["digest"], blake3::hash(&data).to_hex().to_string());
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let (ctx, _rx, _) = context();
        let err = run("/definitely/not/here", HashAlgorithm::Sha256, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskFailure::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_chunk() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x");
        std::fs::write(&file, "x").unwrap();
        let (ctx, _rx, cancel) = context();
        cancel.cancel();

        let err = run(file.to_str().unwrap(), HashAlgorithm::Sha256, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskFailure::Cancelled));
    }
}
