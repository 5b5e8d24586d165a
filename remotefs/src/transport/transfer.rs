use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use md5::Context;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransferError::Request(err) if err.is_connect() || err.is_timeout())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

/// Moves bytes to and from the pre-signed links handed out by the store.
#[derive(Clone)]
pub struct TransferClient {
    http: Client,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferClient {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            http: Client::new(),
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams `href` into `target` through a `.partial` sibling that is renamed on success.
    pub async fn download_to_path_checked(
        &self,
        href: &str,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self
            .http
            .get(Url::parse(href)?)
            .send()
            .await?
            .error_for_status()?;

        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut digest = Context::new();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            digest.consume(&chunk);
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Err(err) = verify(digest, expected_md5) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(partial, target).await?;
        Ok(written)
    }

    /// Fetches `href` into memory.
    pub async fn download_bytes_checked(
        &self,
        href: &str,
        expected_md5: Option<&str>,
    ) -> Result<Bytes, TransferError> {
        let _permit = self
            .download_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self
            .http
            .get(Url::parse(href)?)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut digest = Context::new();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            buffer.extend_from_slice(&chunk);
        }
        verify(digest, expected_md5)?;
        Ok(buffer.freeze())
    }

    pub async fn upload_from_path(&self, href: &str, source: &Path) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.http
            .put(Url::parse(href)?)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn upload_bytes(&self, href: &str, content: Bytes) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .acquire()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        self.http
            .put(Url::parse(href)?)
            .body(content)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

fn verify(digest: Context, expected_md5: Option<&str>) -> Result<(), TransferError> {
    let Some(expected) = expected_md5 else {
        return Ok(());
    };
    let expected = expected.to_ascii_lowercase();
    let actual = format!("{:x}", digest.compute());
    if actual != expected {
        return Err(TransferError::IntegrityMismatch {
            expected_md5: expected,
            actual_md5: actual,
        });
    }
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_file(body: &'static [u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn downloads_into_target_with_matching_md5() {
        let server = serve_file(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");

        let written = TransferClient::default()
            .download_to_path_checked(
                &format!("{}/file", server.uri()),
                &target,
                Some("5D41402ABC4B2A76B9719D911017C592"),
            )
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!dir.path().join("out.txt.partial").exists());
    }

    #[tokio::test]
    async fn mismatched_md5_leaves_nothing_behind() {
        let server = serve_file(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("bad.txt");

        let err = TransferClient::default()
            .download_to_path_checked(&format!("{}/file", server.uri()), &target, Some("deadbeef"))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(!target.exists());
        assert!(!dir.path().join("bad.txt.partial").exists());
    }

    #[tokio::test]
    async fn downloads_bytes_into_memory() {
        let server = serve_file(b"payload").await;
        let bytes = TransferClient::default()
            .download_bytes_checked(&format!("{}/file", server.uri()), None)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn uploads_file_and_buffer_contents() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();
        let client = TransferClient::default();
        let href = format!("{}/upload", server.uri());

        client.upload_from_path(&href, &source).await.unwrap();
        client
            .upload_bytes(&href, Bytes::from_static(b"payload"))
            .await
            .unwrap();
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/a.tar.gz")),
            PathBuf::from("/tmp/a.tar.gz.partial")
        );
    }
}
