use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::DatasetId;
use crate::error::IngestError;

pub const DEFAULT_BASE_URL: &str = "ftp://ftp.ncbi.nlm.nih.gov/geo/series";

pub trait RemoteFetch: Send + Sync {
    /// Downloads `url` to `destination`. On error `destination` may hold a
    /// partial body; callers discard it.
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), IngestError>;
}

impl<T: RemoteFetch + ?Sized> RemoteFetch for Arc<T> {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), IngestError> {
        (**self).fetch(url, destination)
    }
}

/// URL of a series' supplementary `_RAW.tar`.
pub fn raw_archive_url(base_url: &str, id: &DatasetId) -> String {
    format!(
        "{}/{}/{id}/suppl/{id}_RAW.tar",
        base_url.trim_end_matches('/'),
        id.series_bucket()
    )
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    max_retries: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_retries: usize) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("geo-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::Transfer(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| IngestError::Transfer(err.to_string()))?;
        Ok(Self {
            client,
            max_retries,
        })
    }

    /// The NCBI FTP tree is mirrored over HTTPS; reqwest does not speak FTP.
    fn normalize_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("ftp://ftp.ncbi.nlm.nih.gov/") {
            return format!("https://ftp.ncbi.nlm.nih.gov/{}", rest);
        }
        url.to_string()
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, IngestError> {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        tracing::debug!(url, status, attempt, "retrying transfer");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        tracing::debug!(url, attempt, error = %err, "retrying transfer");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::Transfer(err.to_string()));
                }
            }
        }
    }
}

impl RemoteFetch for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), IngestError> {
        let url = Self::normalize_url(url);
        let mut response = self.send_with_retries(&url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "remote request failed".to_string());
            return Err(IngestError::TransferStatus { status, message });
        }

        let mut file = std::fs::File::create(destination)
            .map_err(|err| IngestError::fs(format!("create {}", destination.display()), err))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| IngestError::Transfer(format!("{url}: {err}")))?;
        Ok(())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
