use crate::error::{GatewayError, Result};
use crate::webhook::SignatureScheme;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Gateway configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Base URL of the upstream REST API
    pub upstream_base_url: String,
    /// Bearer token attached to every upstream call
    pub upstream_token: String,
    /// Per-request timeout for upstream calls
    pub upstream_timeout: Duration,
    /// Shared secret for webhook HMAC verification
    pub webhook_secret: String,
    /// Digest scheme expected in the webhook signature header
    pub webhook_scheme: SignatureScheme,
    /// Maximum requests per identity within the sliding window
    pub rate_limit_max: u32,
    /// Sliding window duration
    pub rate_limit_window: Duration,
    /// Default TTL for cached upstream responses
    pub cache_ttl: Duration,
    /// Entry bound for the in-memory cache store
    pub cache_max_entries: usize,
    /// Redis connection URL; empty means in-memory cache only
    pub redis_url: Option<String>,
    /// Interval between idle-window garbage collection sweeps
    pub cleanup_interval: Duration,
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let upstream_token = env::var("UPSTREAM_TOKEN")
            .map_err(|_| GatewayError::Config("UPSTREAM_TOKEN is required".to_string()))?;
        let webhook_secret = env::var("WEBHOOK_SECRET")
            .map_err(|_| GatewayError::Config("WEBHOOK_SECRET is required".to_string()))?;

        let webhook_scheme = match env::var("WEBHOOK_SIGNATURE_SCHEME").as_deref() {
            Ok("sha256") => SignatureScheme::Sha256,
            Ok("sha1") | Err(_) => SignatureScheme::Sha1,
            Ok(other) => {
                return Err(GatewayError::Config(format!(
                    "unknown WEBHOOK_SIGNATURE_SCHEME '{other}', expected sha1 or sha256"
                )))
            }
        };

        let rate_limit_max = parse_var("RATE_LIMIT_MAX", 60u32)?;
        if rate_limit_max == 0 {
            return Err(GatewayError::Config(
                "RATE_LIMIT_MAX must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 3000)))?,
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            upstream_token,
            upstream_timeout: Duration::from_secs(parse_var("UPSTREAM_TIMEOUT_SECS", 10u64)?),
            webhook_secret,
            webhook_scheme,
            rate_limit_max,
            rate_limit_window: Duration::from_secs(parse_var("RATE_LIMIT_WINDOW_SECS", 60u64)?),
            cache_ttl: Duration::from_secs(parse_var("CACHE_TTL_SECS", 300u64)?),
            cache_max_entries: parse_var("CACHE_MAX_ENTRIES", 1024usize)?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            cleanup_interval: Duration::from_secs(parse_var("CLEANUP_INTERVAL_SECS", 300u64)?),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(default),
    }
}
