// src/core/fsutil.rs

//! Crash-safe file helpers. Every durable file in the data directory is
//! written via temp + fsync + atomic rename, and parent directories are
//! fsynced after creation.

use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Writes `bytes` to `path` atomically: a uniquely named temp file in the
/// same directory is written, fsynced, and renamed over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    sync_dir(dir).await
}

/// Synchronous variant for startup paths that run before the runtime does
/// anything interesting.
pub fn write_atomic_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        uuid::Uuid::new_v4().simple()
    ));

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    sync_dir_sync(dir)
}

/// Fsyncs a directory so a preceding rename survives power loss.
pub async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || sync_dir_sync(&dir))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
}

fn sync_dir_sync(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let handle = std::fs::File::open(dir)?;
        handle.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
