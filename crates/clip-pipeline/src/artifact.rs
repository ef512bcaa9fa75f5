//! Fetching finished artifacts

use anyhow::{Context, Result};
use log::info;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Download a finished clip to `dest`, returning the number of bytes written
pub async fn download_artifact(client: &reqwest::Client, uri: &str, dest: &Path) -> Result<u64> {
    let mut response = client
        .get(uri)
        .send()
        .await
        .with_context(|| format!("failed to request {uri}"))?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed: {}", response.status());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    info!("Downloaded {} bytes to {}", written, dest.display());
    Ok(written)
}
