//! Network transport used by check and download actions.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::EngineError;

/// A request produced by a server for a batch of tickets. A body turns the
/// request into a POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::get(url)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Called with bytes received so far and the total when known.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, EngineError>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64, EngineError>;
}

/// reqwest-backed fetcher. `file://` URLs are read from the local disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Fetch {
                message: "failed to build HTTP client".into(),
                source: Box::new(e),
            })?;
        Ok(Self { client })
    }
}

fn local_path(url: &str) -> Option<&Path> {
    url.strip_prefix("file://").map(Path::new)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, EngineError> {
        if let Some(path) = local_path(&request.url) {
            let body = tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::io(format!("failed to read {}", path.display()), e))?;
            return Ok(FetchResponse {
                url: request.url.clone(),
                status: 200,
                body,
            });
        }

        let mut builder = match &request.body {
            Some(body) => self.client.post(&request.url).body(body.clone()),
            None => self.client.get(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        tracing::debug!(url = %request.url, "fetching");
        let response = builder.send().await.map_err(|e| EngineError::Fetch {
            message: format!("request to {} failed", request.url),
            source: Box::new(e),
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| EngineError::Fetch {
            message: format!("error reading response from {}", request.url),
            source: Box::new(e),
        })?;
        Ok(FetchResponse {
            url: request.url.clone(),
            status,
            body: body.to_vec(),
        })
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<u64, EngineError> {
        if let Some(path) = local_path(url) {
            let written = tokio::fs::copy(path, dest).await.map_err(|e| {
                EngineError::io(format!("failed to copy {} to {}", path.display(), dest.display()), e)
            })?;
            progress(written, Some(written));
            return Ok(written);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| EngineError::Fetch {
                message: format!("request to {url} failed"),
                source: Box::new(e),
            })?;
        let total = response.content_length();

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| EngineError::io(format!("creating {}", dest.display()), e))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::Fetch {
                message: "error reading response body".into(),
                source: Box::new(e),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| EngineError::io("writing download data", e))?;
            written += chunk.len() as u64;
            progress(written, total);
        }

        file.flush()
            .await
            .map_err(|e| EngineError::io("flushing download", e))?;
        Ok(written)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_urls_are_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.bin");
        std::fs::write(&src, b"payload").unwrap();
        let url = format!("file://{}", src.display());

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let response = fetcher.fetch(&FetchRequest::get(&url)).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, b"payload");

        let dest = dir.path().join("copy.bin");
        let written = fetcher.download(&url, &dest, &|_, _| {}).await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(&FetchRequest::get("file:///definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
