//! Utility functions
//!
use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// Written to a `.part` sibling first and renamed once complete.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let resp = client
        .get(url)
        .send()
        .await?
        .error_for_status()
        .with_context(|| format!("failed to download {url}"))?;
    let content = resp.bytes().await?;

    let partial = filepath.with_extension("part");
    tokio::fs::write(&partial, &content).await?;
    tokio::fs::rename(&partial, filepath).await?;
    log::debug!("Downloaded {} bytes to {}", content.len(), filepath.display());

    Ok(())
}
