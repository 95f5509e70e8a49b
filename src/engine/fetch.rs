//! Single-chunk HTTPS fetcher with retry and error classification
//!
//! One pooled client serves the whole run: many concurrent streams to a
//! single CDN host, HTTP/2 when the server offers it via ALPN, and no
//! response decompression. There is no overall request timeout — body
//! reads are bounded by cancellation, per the run's interruption model.

use super::EngineError;
use crate::config::USER_AGENT;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Transport error fragments that indicate a transient condition.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "stream error",
    "INTERNAL_ERROR",
    "connection reset",
    "broken pipe",
    "timeout",
    "EOF",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status}")]
    Status { status: StatusCode },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status } => status.is_server_error(),
            FetchError::Transport(e) => e.is_timeout() || chain_has_fragment(e),
            FetchError::Cancelled => false,
        }
    }
}

fn chain_has_fragment(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let message = e.to_string();
        if RETRYABLE_FRAGMENTS.iter().any(|f| message.contains(f)) {
            return true;
        }
        current = e.source();
    }
    false
}

pub struct ChunkFetcher {
    client: reqwest::Client,
}

impl ChunkFetcher {
    /// Build the pooled client tuned for `workers` concurrent streams.
    pub fn new(workers: usize) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .pool_max_idle_per_host(workers.max(1) * 2)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// GET a URL once. Only 200 counts as success.
    async fn try_fetch(&self, cancel: &CancellationToken, url: &str) -> Result<Bytes, FetchError> {
        let request = async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::Status { status });
            }
            Ok(resp.bytes().await?)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = request => result,
        }
    }

    /// GET with up to [`MAX_RETRIES`] retries and exponential backoff
    /// (500 ms, 1 s, 2 s). Cancellation interrupts both the request and
    /// the backoff sleep.
    pub async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<Bytes, EngineError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_fetch(cancel, url).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if e.is_retryable() && attempts <= MAX_RETRIES => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempts - 1);
                    warn!("retrying {} in {:?}: {}", url, delay, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(source) => {
                    return Err(EngineError::Fetch {
                        url: url.to_string(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = FetchError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };
        assert!(err.is_retryable());
        let err = FetchError::Status {
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_fatal() {
        let err = FetchError::Status {
            status: StatusCode::NOT_FOUND,
        };
        assert!(!err.is_retryable());
        let err = FetchError::Status {
            status: StatusCode::FORBIDDEN,
        };
        assert!(!err.is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_fragment_matching_walks_source_chain() {
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "request failed")
            }
        }
        impl std::error::Error for Outer {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
        assert!(chain_has_fragment(&Outer(inner)));

        let inner = std::io::Error::other("unrelated");
        assert!(!chain_has_fragment(&Outer(inner)));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_cancelled() {
        let fetcher = ChunkFetcher::new(2).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Port 9 is discard; the select resolves on the already-cancelled
        // token before any connection work matters.
        let err = fetcher
            .fetch(&cancel, "http://127.0.0.1:9/never")
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
