use std::net::SocketAddr;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub listen_addr: SocketAddr,
    /// When set, webhooks must carry a valid HMAC-SHA256 signature.
    pub webhook_secret: Option<String>,
}

impl ControlConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default_addr = || {
            DEFAULT_LISTEN_ADDR
                .parse::<SocketAddr>()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
        };
        let listen_addr = match lookup("MESHLINE_LISTEN_ADDR").map(|v| v.trim().to_string()) {
            Some(raw) if !raw.is_empty() => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "invalid MESHLINE_LISTEN_ADDR, using default");
                default_addr()
            }),
            _ => default_addr(),
        };
        Self {
            listen_addr,
            webhook_secret: lookup("MESHLINE_WEBHOOK_SECRET").filter(|v| !v.trim().is_empty()),
        }
    }
}
