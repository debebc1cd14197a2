//! Streamed artifact downloads with optional SHA-256 verification.
//!
//! The body is written to a `.tmp` sibling and renamed into place only after
//! the checksum matches, so an interrupted download never leaves a partial
//! file at the destination.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Result of a download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// File fetched; carries its SHA-256
    Fetched { sha256: String },
    /// Destination already present (and matching the checksum, if given)
    AlreadyPresent { sha256: String },
}

impl DownloadOutcome {
    pub fn sha256(&self) -> &str {
        match self {
            Self::Fetched { sha256 } | Self::AlreadyPresent { sha256 } => sha256,
        }
    }
}

/// Download `url` to `dest`. An existing destination is kept unless it fails
/// the expected checksum.
pub async fn download(url: &str, dest: &Path, expected_sha256: Option<&str>) -> Result<DownloadOutcome> {
    let expected = expected_sha256.map(|s| s.trim().to_ascii_lowercase());

    if dest.is_file() {
        let sha256 = hash_file(dest).await?;
        match &expected {
            Some(want) if *want != sha256 => {
                warn!(path = %dest.display(), "Existing file fails checksum, downloading again");
            }
            _ => {
                debug!(path = %dest.display(), "Already downloaded");
                return Ok(DownloadOutcome::AlreadyPresent { sha256 });
            }
        }
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp = tmp_path(dest);
    let result = fetch_to(url, &tmp).await;
    let sha256 = match result {
        Ok(sha256) => sha256,
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
    };

    if let Some(want) = &expected {
        if *want != sha256 {
            let _ = fs::remove_file(&tmp).await;
            anyhow::bail!(
                "Checksum mismatch for {}: expected {}, got {}",
                url,
                want,
                sha256
            );
        }
    }

    fs::rename(&tmp, dest)
        .await
        .with_context(|| format!("Failed to move download into place: {}", dest.display()))?;

    info!(%url, path = %dest.display(), "Downloaded");
    Ok(DownloadOutcome::Fetched { sha256 })
}

async fn fetch_to(url: &str, tmp: &Path) -> Result<String> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("Failed to request {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} for URL: {}", status.as_u16(), url);
    }

    let mut file = fs::File::create(tmp)
        .await
        .with_context(|| format!("Failed to create {}", tmp.display()))?;
    let mut hasher = Sha256::new();

    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed to read body of {}", url))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
    }
    file.flush().await?;

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of a file, hex-encoded
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}
