use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.meshy.ai";
pub const DEFAULT_DATA_ROOT: &str = "client/public/models";
// localhost rather than 0.0.0.0: the provider has to be able to call it back.
pub const DEFAULT_WEBHOOK_BASE_URL: &str = "http://localhost:8000/webhooks/meshy";

const MAX_DOWNLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    pub min_request_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub rate_limit_fallback: Duration,
    pub max_download_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(300),
            min_request_interval: Duration::from_millis(500),
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(30),
            rate_limit_fallback: Duration::from_secs(5),
            max_download_bytes: MAX_DOWNLOAD_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let u64_var = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        let backoff_base_ms = u64_var("MESHLINE_BACKOFF_BASE_MS")
            .map(|v| v.clamp(10, 60_000))
            .unwrap_or(d.backoff_base.as_millis() as u64);
        let backoff_max_ms = u64_var("MESHLINE_BACKOFF_MAX_MS")
            .map(|v| v.clamp(backoff_base_ms, 10 * 60 * 1000))
            .unwrap_or((d.backoff_max.as_millis() as u64).max(backoff_base_ms));

        Self {
            api_key: lookup("MESHY_API_KEY")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            base_url: lookup("MESHLINE_API_BASE_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(d.base_url),
            timeout: u64_var("MESHLINE_HTTP_TIMEOUT_SECS")
                .map(|v| Duration::from_secs(v.clamp(5, 60 * 60)))
                .unwrap_or(d.timeout),
            min_request_interval: u64_var("MESHLINE_MIN_REQUEST_INTERVAL_MS")
                .map(|v| Duration::from_millis(v.clamp(0, 60_000)))
                .unwrap_or(d.min_request_interval),
            max_attempts: u64_var("MESHLINE_MAX_ATTEMPTS")
                .map(|v| v.clamp(1, 20) as u32)
                .unwrap_or(d.max_attempts),
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            rate_limit_fallback: u64_var("MESHLINE_RATE_LIMIT_FALLBACK_MS")
                .map(|v| Duration::from_millis(v.clamp(0, 10 * 60 * 1000)))
                .unwrap_or(d.rate_limit_fallback),
            max_download_bytes: d.max_download_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub client: ClientConfig,
    pub data_root: PathBuf,
    pub webhook_base_url: String,
    pub download_artifacts: bool,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let download_artifacts = match non_empty("MESHLINE_DOWNLOAD_ARTIFACTS")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            Some("0") | Some("false") | Some("no") | Some("off") => false,
            _ => true,
        };

        Self {
            client: ClientConfig::from_lookup(&lookup),
            data_root: non_empty("MESHLINE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT)),
            webhook_base_url: non_empty("MESHLINE_WEBHOOK_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_WEBHOOK_BASE_URL.to_string()),
            download_artifacts,
        }
    }
}
