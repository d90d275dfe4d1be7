//! Client configuration.
//!
//! A [`Config`] is an immutable value handed to [`crate::Session`] at
//! construction; there is no process-wide state. Unset options fall back to
//! the defaults MEGA's own clients use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default API gateway.
pub const DEFAULT_GATEWAY: &str = "https://g.api.mega.co.nz/";

/// Proxy configuration. Credentials are folded into the proxy URL.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy:8080` or `socks5://proxy:1080`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// TLS configuration.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Verify server certificates. Disabling also disables hostname checks.
    pub verify: bool,
    /// Verify that the certificate matches the requested hostname.
    pub check_hostname: bool,
    /// PEM client certificate (with `key_file` forming the identity).
    pub cert_file: Option<PathBuf>,
    /// PEM client key.
    pub key_file: Option<PathBuf>,
    /// Extra PEM root certificate bundle.
    pub ca_file: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            check_hostname: true,
            cert_file: None,
            key_file: None,
            ca_file: None,
        }
    }
}

/// Request timeout configuration, in seconds granularity like the wire
/// protocol documents them.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Whole-request deadline.
    pub total: Duration,
    /// Connection establishment deadline.
    pub connect: Duration,
    /// Socket read inactivity deadline.
    pub sock_read: Duration,
    /// Socket-level connect deadline (folded into `connect` by reqwest).
    pub sock_connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            total: Duration::from_secs(300),
            connect: Duration::from_secs(30),
            sock_read: Duration::from_secs(60),
            sock_connect: Duration::from_secs(30),
        }
    }
}

/// Retry policy for transient protocol errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(16),
            exponential_base: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay for the given attempt (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Upload behavior.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Chunks in flight per upload.
    pub max_concurrent_uploads: usize,
    /// Attach caller-supplied thumbnails automatically.
    pub auto_thumbnail: bool,
    /// Attach caller-supplied previews automatically.
    pub auto_preview: bool,
    /// Frame time (seconds) an external probe should use for video stills.
    pub video_frame_time: f64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 4,
            auto_thumbnail: true,
            auto_preview: true,
            video_frame_time: 1.0,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API gateway base URL.
    pub gateway: String,
    pub user_agent: String,
    pub keepalive: bool,
    /// Total connection pool size.
    pub limit: usize,
    /// Idle connections kept per host.
    pub limit_per_host: usize,
    pub proxy: Option<ProxyConfig>,
    pub tls: TlsConfig,
    pub timeout: TimeoutConfig,
    pub retry: RetryConfig,
    pub upload: UploadConfig,
    /// Extra headers applied to every request.
    pub extra_headers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: DEFAULT_GATEWAY.to_string(),
            user_agent: concat!("megakit/", env!("CARGO_PKG_VERSION")).to_string(),
            keepalive: true,
            limit: 100,
            limit_per_host: 10,
            proxy: None,
            tls: TlsConfig::default(),
            timeout: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            upload: UploadConfig::default(),
            extra_headers: HashMap::new(),
        }
    }
}

impl Config {
    /// Configuration pointing at a different gateway (useful for tests).
    pub fn with_gateway(gateway: impl Into<String>) -> Self {
        Self {
            gateway: gateway.into(),
            ..Default::default()
        }
    }

    /// Configuration routed through a proxy.
    pub fn with_proxy(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy: Some(ProxyConfig {
                url: proxy_url.into(),
                username: None,
                password: None,
            }),
            ..Default::default()
        }
    }

    /// Gateway with a guaranteed trailing slash.
    pub(crate) fn gateway_base(&self) -> String {
        if self.gateway.ends_with('/') {
            self.gateway.clone()
        } else {
            format!("{}/", self.gateway)
        }
    }
}
