//! File movement between server and agent.
//!
//! Naming follows the server's point of view: a download pushes a blob to
//! the agent's disk, an upload reads a file off the agent and ships it back.

use anyhow::{ensure, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;
use waypost_protocol::{FileTransfer, TaskResult};

/// Write a server-supplied blob to `path`. Errors come back as a failed
/// result, never as a crash.
pub async fn download(ft: &FileTransfer) -> TaskResult {
    match write_blob(ft).await {
        Ok(written) => TaskResult {
            stdout: format!("wrote {} bytes to {}", written, ft.path),
            ..Default::default()
        },
        Err(err) => TaskResult {
            stderr: format!("{:#}", err),
            ..Default::default()
        },
    }
}

async fn write_blob(ft: &FileTransfer) -> Result<usize> {
    let parent = std::path::Path::new(&ft.path)
        .parent()
        .with_context(|| format!("{} has no parent directory", ft.path))?;
    ensure!(
        parent.as_os_str().is_empty() || tokio::fs::metadata(parent).await.is_ok(),
        "parent directory {} does not exist",
        parent.display()
    );

    let bytes = BASE64
        .decode(&ft.blob)
        .with_context(|| format!("decoding blob for {}", ft.path))?;
    tokio::fs::write(&ft.path, &bytes)
        .await
        .with_context(|| format!("writing {}", ft.path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&ft.path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("setting permissions on {}", ft.path))?;
    }

    debug!(path = %ft.path, bytes = bytes.len(), "download complete");
    Ok(bytes.len())
}

/// Read `path` and produce the artifact carrying its content back to the
/// server. Failure is an error here; the engine turns it into a result.
pub async fn upload(ft: &FileTransfer) -> Result<FileTransfer> {
    let bytes = tokio::fs::read(&ft.path)
        .await
        .with_context(|| format!("reading {}", ft.path))?;

    let digest = Sha256::digest(&bytes);
    debug!(
        path = %ft.path,
        bytes = bytes.len(),
        sha256 = %format!("{:x}", digest),
        "upload read"
    );

    Ok(FileTransfer {
        path: ft.path.clone(),
        blob: BASE64.encode(&bytes),
        is_download: true,
    })
}
