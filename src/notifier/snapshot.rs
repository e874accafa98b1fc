//! Best-effort buffer snapshot across restarts.
//!
//! Written once on shutdown and read once on start. Not a write-ahead log:
//! messages still in memory when the process dies are lost.

use crate::error::BrokerResult;
use crate::notifier::message::OutboundMessage;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `messages` to `path` atomically (temp file, then rename)
pub async fn write_snapshot(path: &Path, messages: &[OutboundMessage]) -> BrokerResult<()> {
    let bytes = serde_json::to_vec(messages)?;
    let tmp = temp_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;

    info!(
        path = %path.display(),
        count = messages.len(),
        bytes = bytes.len(),
        "Wrote pending buffer snapshot"
    );
    Ok(())
}

/// Read the snapshot at `path`; a missing file is an empty snapshot
pub async fn read_snapshot(path: &Path) -> BrokerResult<Vec<OutboundMessage>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No pending buffer snapshot");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn remove_snapshot(path: &Path) -> BrokerResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
