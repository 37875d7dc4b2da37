//! Verified payload downloads.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::action::{Action, ActionContext, PipeValue, Pipes};
use crate::error::EngineError;
use crate::fetch::Fetcher;
use crate::stats::{self, StatKey, StatsCollection};

/// Base64 (standard alphabet) SHA-256 of a file's contents.
pub async fn digest_file(path: &Path) -> Result<String, EngineError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| EngineError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| EngineError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(hasher.finalize()))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Fetches `url` to `path` and checks size and digest before exposing it.
///
/// A file already at `path` with the expected digest is reused without
/// touching the network. Nothing is deleted on failure: the partial file
/// stays next to the destination for inspection.
pub struct DownloadAction {
    name: String,
    pipes: Pipes,
    url: String,
    size: u64,
    hash: String,
    path: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    stats: Option<Arc<StatsCollection>>,
}

impl DownloadAction {
    pub fn new(
        url: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        path: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let url = url.into();
        Self {
            name: format!("download {url}"),
            pipes: Pipes::default(),
            url,
            size,
            hash: hash.into(),
            path: path.into(),
            fetcher,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Option<Arc<StatsCollection>>) -> Self {
        self.stats = stats;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, stat: &str) {
        if let Some(stats) = &self.stats {
            stats.increment(StatKey::global(stat));
        }
    }

    async fn is_cached(&self) -> bool {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return false;
        }
        match digest_file(&self.path).await {
            Ok(digest) => digest == self.hash,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "cannot digest cached file");
                false
            }
        }
    }

    async fn fetch_and_verify(&self, cx: &ActionContext) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(format!("creating {}", parent.display()), e))?;
        }

        let tmp = partial_path(&self.path);
        let expected = self.size;
        let progress = |written: u64, total: Option<u64>| {
            let total = total.unwrap_or(expected);
            if total > 0 {
                cx.report_progress(written as f32 / total as f32);
            }
        };
        let written = self.fetcher.download(&self.url, &tmp, &progress).await?;

        if written != self.size {
            return Err(EngineError::Validation {
                message: format!("size mismatch: expected {} bytes, got {written}", self.size),
            });
        }
        let digest = digest_file(&tmp).await?;
        if digest != self.hash {
            return Err(EngineError::Validation {
                message: format!("hash mismatch: expected {}, got {digest}", self.hash),
            });
        }

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            EngineError::io(format!("moving download into {}", self.path.display()), e)
        })
    }
}

#[async_trait]
impl Action for DownloadAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    async fn perform(&mut self, cx: &ActionContext) -> bool {
        if self.is_cached().await {
            tracing::info!(path = %self.path.display(), "using cached download");
            self.record(stats::DOWNLOAD_CACHE_HITS);
            self.pipes
                .output
                .set_contents(Some(PipeValue::Path(self.path.clone())));
            return true;
        }

        tracing::info!(url = %self.url, size = self.size, "downloading update");
        self.record(stats::DOWNLOADS);
        match self.fetch_and_verify(cx).await {
            Ok(()) => {
                tracing::info!(path = %self.path.display(), "download verified");
                self.pipes
                    .output
                    .set_contents(Some(PipeValue::Path(self.path.clone())));
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "download failed");
                self.record(stats::FAILED_DOWNLOADS);
                false
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
