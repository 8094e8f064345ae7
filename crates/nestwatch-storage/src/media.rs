//! Content-addressed media files and the downloader that fills them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::http::HttpFetcher;

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// Files live under `<root>/<provider>/<listing hash>/<sha256>.<ext>`, so a
/// re-download of identical bytes is a no-op.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path(
        provider_id: &str,
        listing_hash: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(sanitize_segment(provider_id))
            .join(sanitize_segment(listing_hash))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes through a temp file and renames into place.
    pub async fn store_bytes(
        &self,
        provider_id: &str,
        listing_hash: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredMedia> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(provider_id, listing_hash, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating media directory {}", parent.display()))?;

        let stored = |deduplicated| StoredMedia {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path).await.unwrap_or(false) {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.part", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(stored(true));
            }
            return Err(err).with_context(|| format!("moving media into {}", absolute_path.display()));
        }
        Ok(stored(false))
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Extension taken from the last path segment of a URL, `bin` when absent.
pub fn extension_from_url(url: &str, fallback: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => fallback.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaDownload {
    pub image_paths: Vec<String>,
    pub document_paths: Vec<String>,
    pub failed: usize,
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Best effort per item: a failed URL is counted and skipped.
    async fn download(
        &self,
        provider_id: &str,
        listing_hash: &str,
        image_urls: &[String],
        documents: &[String],
    ) -> anyhow::Result<MediaDownload>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMediaDownloader;

#[async_trait]
impl MediaDownloader for NoopMediaDownloader {
    async fn download(
        &self,
        _provider_id: &str,
        _listing_hash: &str,
        _image_urls: &[String],
        _documents: &[String],
    ) -> anyhow::Result<MediaDownload> {
        Ok(MediaDownload::default())
    }
}

#[derive(Debug, Clone)]
pub struct HttpMediaDownloader {
    fetcher: Arc<HttpFetcher>,
    store: MediaStore,
}

impl HttpMediaDownloader {
    pub fn new(fetcher: Arc<HttpFetcher>, store: MediaStore) -> Self {
        Self { fetcher, store }
    }

    async fn fetch_one(
        &self,
        provider_id: &str,
        listing_hash: &str,
        url: &str,
        fallback_ext: &str,
    ) -> anyhow::Result<String> {
        let response = self.fetcher.fetch_bytes(provider_id, url).await?;
        let stored = self
            .store
            .store_bytes(
                provider_id,
                listing_hash,
                &extension_from_url(url, fallback_ext),
                &response.body,
            )
            .await?;
        Ok(stored.relative_path.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl MediaDownloader for HttpMediaDownloader {
    async fn download(
        &self,
        provider_id: &str,
        listing_hash: &str,
        image_urls: &[String],
        documents: &[String],
    ) -> anyhow::Result<MediaDownload> {
        let mut out = MediaDownload::default();
        for url in image_urls {
            match self.fetch_one(provider_id, listing_hash, url, "jpg").await {
                Ok(path) => out.image_paths.push(path),
                Err(err) => {
                    debug!(error = %err, url, "image download failed");
                    out.failed += 1;
                }
            }
        }
        for url in documents {
            match self.fetch_one(provider_id, listing_hash, url, "pdf").await {
                Ok(path) => out.document_paths.push(path),
                Err(err) => {
                    debug!(error = %err, url, "document download failed");
                    out.failed += 1;
                }
            }
        }
        Ok(out)
    }
}
