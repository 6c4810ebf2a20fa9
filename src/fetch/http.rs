//! HTTP transport: ranged reads against candidate URLs with a bounded,
//! fixed-sequence retry schedule for transient failures.

use crate::error::FetchError;
use log::{debug, warn};
use reqwest::{Client, StatusCode, header};
use std::time::Duration;
use tokio::time::sleep;

/// Fixed retry delays for transient failures. Not exponential and not
/// unbounded: the sequence is walked once per request, then the failure
/// escalates to the caller.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [1, 2, 6, 15, 36].map(Duration::from_secs).to_vec(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; test configurations.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            delays: vec![Duration::ZERO; attempts],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    retry: RetryPolicy,
}

enum Outcome {
    Done(reqwest::Response),
    Transient(FetchError),
    Fatal(FetchError),
}

impl HttpTransport {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            client: Client::new(),
            retry,
        }
    }

    /// Total object size. HEAD first; servers that reject HEAD get a one-byte
    /// ranged GET whose Content-Range carries the total.
    pub async fn probe_size(&self, url: &str) -> Result<u64, FetchError> {
        match self.with_retry(url, || self.client.head(url).send()).await {
            // The header, not Response::content_length(): a HEAD reply has no
            // body, and the body size is what content_length() may report.
            Ok(resp) => {
                if let Some(len) = header_content_length(&resp) {
                    return Ok(len);
                }
            }
            Err(e @ FetchError::NotFound { .. }) => return Err(e),
            // HEAD rejected (405 and friends): the ranged GET still works.
            Err(FetchError::Status { .. }) => {}
            Err(e) => return Err(e),
        }
        let resp = self
            .with_retry(url, || {
                self.client
                    .get(url)
                    .header(header::RANGE, "bytes=0-0")
                    .send()
            })
            .await?;
        if let Some(total) = content_range_total(&resp) {
            return Ok(total);
        }
        header_content_length(&resp).ok_or_else(|| FetchError::BadUrl {
            url: url.to_string(),
            reason: "no content length".into(),
        })
    }

    /// Read `len` bytes at `offset`. The caller clamps the range to the
    /// object size; a shorter reply than requested is an error here.
    pub async fn read_range(
        &self,
        url: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, FetchError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset + len as u64 - 1;
        let resp = self
            .with_retry(url, || {
                self.client
                    .get(url)
                    .header(header::RANGE, format!("bytes={offset}-{end}"))
                    .send()
            })
            .await?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| FetchError::Exhausted {
            url: url.to_string(),
            attempts: 1,
            source: e,
        })?;
        match status {
            StatusCode::PARTIAL_CONTENT => Ok(body.to_vec()),
            // Range-oblivious server: the full object came back.
            StatusCode::OK => {
                let start = offset as usize;
                if body.len() < start + len {
                    return Err(FetchError::BadUrl {
                        url: url.to_string(),
                        reason: format!("short body: {} bytes", body.len()),
                    });
                }
                Ok(body[start..start + len].to_vec())
            }
            other => Err(FetchError::Status {
                url: url.to_string(),
                status: other,
            }),
        }
    }

    /// Drive one request through the retry schedule.
    async fn with_retry<F, Fut>(&self, url: &str, send: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.classify(url, send().await) {
                Outcome::Done(resp) => return Ok(resp),
                Outcome::Fatal(err) => return Err(err),
                Outcome::Transient(err) => {
                    let Some(delay) = self.retry.delays.get(attempt - 1) else {
                        return Err(match err {
                            FetchError::Exhausted { url, source, .. } => FetchError::Exhausted {
                                url,
                                attempts: attempt,
                                source,
                            },
                            other => other,
                        });
                    };
                    warn!("retrying request to {url} after {delay:?}: {err}");
                    sleep(*delay).await;
                }
            }
        }
    }

    fn classify(&self, url: &str, result: Result<reqwest::Response, reqwest::Error>) -> Outcome {
        match result {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Outcome::Done(resp)
                } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                    debug!("{url}: {status}");
                    Outcome::Fatal(FetchError::NotFound {
                        url: url.to_string(),
                    })
                } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    Outcome::Transient(FetchError::Status {
                        url: url.to_string(),
                        status,
                    })
                } else {
                    Outcome::Fatal(FetchError::Status {
                        url: url.to_string(),
                        status,
                    })
                }
            }
            Err(e) if e.is_builder() => Outcome::Fatal(FetchError::BadUrl {
                url: url.to_string(),
                reason: e.to_string(),
            }),
            // Connect/timeout/body failures are worth the retry schedule.
            Err(e) => Outcome::Transient(FetchError::Exhausted {
                url: url.to_string(),
                attempts: 1,
                source: e,
            }),
        }
    }
}

fn header_content_length(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn content_range_total(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}
