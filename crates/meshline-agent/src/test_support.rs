use std::time::Duration;

use axum::Router;

use crate::config::ClientConfig;

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn fast_client_config(base_url: &str) -> ClientConfig {
    ClientConfig {
        api_key: Some("test-key".to_string()),
        base_url: base_url.to_string(),
        timeout: Duration::from_secs(10),
        min_request_interval: Duration::ZERO,
        max_attempts: 5,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        rate_limit_fallback: Duration::from_millis(5),
        max_download_bytes: 64 * 1024 * 1024,
    }
}
