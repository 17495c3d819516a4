use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tracing::debug;

use crate::cache::CacheKey;
use crate::error::FetchError;

/// Produces the bytes for one cache key. Implementations must be safe to
/// call a second time for the same key after a transient failure.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, key: &CacheKey) -> Result<Vec<u8>, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(&CacheKey) -> Result<Vec<u8>, FetchError> + Send + Sync,
{
    fn fetch(&self, key: &CacheKey) -> Result<Vec<u8>, FetchError> {
        self(key)
    }
}

/// Issues HTTP range requests.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("reelfeed/{}", crate::VERSION))
            .build()
            .context("fetch: build http client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, key: &CacheKey) -> Result<Vec<u8>, FetchError> {
        if key.range_length == 0 {
            return Ok(Vec::new());
        }
        debug!(url = %key.url, range = %range_header(key), "http range request");
        let response = self
            .client
            .get(&key.url)
            .header(RANGE, range_header(key))
            .send()
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = format!("request failed: {} for {}", status, key.url);
            return Err(if status.is_server_error() {
                FetchError::transient(message)
            } else {
                FetchError::permanent(message)
            });
        }

        let body = response.bytes().map_err(classify_reqwest)?;
        let mut bytes = body.to_vec();
        // Servers that ignore Range answer 200 with the whole body.
        if status == StatusCode::OK && key.range_start > 0 {
            let start = usize::try_from(key.range_start).unwrap_or(usize::MAX);
            bytes = bytes.get(start..).map(<[u8]>::to_vec).unwrap_or_default();
        }
        let limit = usize::try_from(key.range_length).unwrap_or(usize::MAX);
        bytes.truncate(limit);
        Ok(bytes)
    }
}

fn range_header(key: &CacheKey) -> String {
    let end = key
        .range_start
        .saturating_add(key.range_length)
        .saturating_sub(1);
    format!("bytes={}-{}", key.range_start, end)
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::transient(err.to_string())
    } else {
        FetchError::permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        let key = CacheKey::new("https://cdn.test/v.mp4", 1024, 512);
        assert_eq!(range_header(&key), "bytes=1024-1535");
    }

    #[test]
    fn closures_are_fetchers() {
        let fetcher = |key: &CacheKey| -> Result<Vec<u8>, FetchError> {
            Ok(vec![7u8; key.range_length as usize])
        };
        let key = CacheKey::new("https://cdn.test/v.mp4", 0, 3);
        assert_eq!(Fetcher::fetch(&fetcher, &key).unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn zero_length_range_skips_network() {
        let fetcher = HttpFetcher::new(Duration::from_millis(10)).unwrap();
        let key = CacheKey::new("https://unreachable.invalid/v.mp4", 0, 0);
        assert!(fetcher.fetch(&key).unwrap().is_empty());
    }
}
