use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use meshline_task::ApiVersion;
use reqwest::{Method, StatusCode, header};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ClientConfig;

const MAX_ERROR_BODY_BYTES: usize = 2 * 1024;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Duration },

    #[error("provider returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("request rejected with {status}: {body}")]
    Client { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("download exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("invalid url {0:?}")]
    InvalidUrl(String),
}

impl ClientError {
    /// Rate limits, 5xx and network timeouts are retried; everything else is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Server { .. } => true,
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn compute_backoff(cfg: &ClientConfig, attempt: u32) -> Duration {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
    cfg.backoff_base.saturating_mul(mult).min(cfg.backoff_max)
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values fall back.
fn parse_retry_after(raw: Option<&str>) -> Option<Duration> {
    let secs = raw?.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER))
}

fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut end = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// A file written by [`ProviderClient::download_file`]. The digest covers
/// exactly the bytes this download streamed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub bytes: u64,
    pub sha256: String,
}

/// HTTP client for the generation provider. Requests are paced to a minimum
/// interval and transient failures are retried with exponential backoff.
#[derive(Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
    config: ClientConfig,
    last_request: Mutex<Option<Instant>>,
}

impl ProviderClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("meshline-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            last_request: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint_url(&self, version: ApiVersion, endpoint: &str) -> String {
        format!(
            "{}/openapi/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            version.as_str(),
            endpoint.trim_start_matches('/')
        )
    }

    pub async fn post(
        &self,
        version: ApiVersion,
        endpoint: &str,
        body: &Value,
    ) -> Result<Value, ClientError> {
        self.request(Method::POST, version, endpoint, Some(body)).await
    }

    pub async fn get(&self, version: ApiVersion, endpoint: &str) -> Result<Value, ClientError> {
        self.request(Method::GET, version, endpoint, None).await
    }

    pub async fn request(
        &self,
        method: Method,
        version: ApiVersion,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = self.endpoint_url(version, endpoint);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.send_once(method.clone(), &url, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                tracing::error!(%url, attempt, error = %err, "provider request failed, retries exhausted");
                return Err(ClientError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = compute_backoff(&self.config, attempt);
            tracing::warn!(
                %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider error, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.config.min_request_interval {
                let wait = self.config.min_request_interval - elapsed;
                tracing::debug!(wait_ms = wait.as_millis() as u64, "pacing provider request");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        self.pace().await;

        let mut req = self.http.request(method, url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                resp.headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            )
            .unwrap_or(self.config.rate_limit_fallback);
            tracing::warn!(
                %url,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limited by provider"
            );
            tokio::time::sleep(retry_after).await;
            return Err(ClientError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            let body = truncate_body(resp.text().await.unwrap_or_default());
            return Err(ClientError::Server {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = truncate_body(resp.text().await.unwrap_or_default());
            return Err(ClientError::Client {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Streams `url` into `path` through a sibling temp file. Parent
    /// directories are created; the body is never held in memory.
    pub async fn download_file(&self, url: &str, path: &Path) -> Result<Download, ClientError> {
        let parsed =
            reqwest::Url::parse(url).map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(url.to_string()));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ClientError::io(parent))?;
        }

        let resp = self.http.get(parsed).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = truncate_body(resp.text().await.unwrap_or_default());
            return Err(if status.is_server_error() {
                ClientError::Server {
                    status: status.as_u16(),
                    body,
                }
            } else {
                ClientError::Client {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        let download = match self.stream_to(resp, &tmp).await {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(ClientError::io(path))?;
        tracing::debug!(%url, path = %path.display(), bytes = download.bytes, "download complete");
        Ok(download)
    }

    async fn stream_to(
        &self,
        resp: reqwest::Response,
        tmp: &Path,
    ) -> Result<Download, ClientError> {
        let limit = self.config.max_download_bytes;
        let mut f = tokio::fs::File::create(tmp)
            .await
            .map_err(ClientError::io(tmp))?;
        let mut total: u64 = 0;
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total = total.saturating_add(chunk.len() as u64);
            if total > limit {
                return Err(ClientError::TooLarge { limit });
            }
            f.write_all(&chunk).await.map_err(ClientError::io(tmp))?;
            hasher.update(&chunk);
        }
        f.flush().await.map_err(ClientError::io(tmp))?;
        f.sync_all().await.map_err(ClientError::io(tmp))?;
        Ok(Download {
            bytes: total,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}
