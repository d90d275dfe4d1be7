//! HTTP transport construction.
//!
//! Builds the single shared `reqwest::Client` from a [`Config`] and wraps
//! the request shapes the protocol needs. Both the command pipeline and the
//! transfer engines share this client so pooling and proxy settings apply
//! uniformly.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Proxy};

use crate::config::Config;
use crate::error::{MegaError, Result};

/// Shared HTTP client for MEGA endpoints.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Build a client from the configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.extra_headers {
            let name: HeaderName = name
                .parse()
                .map_err(|_| MegaError::Argument(format!("invalid header name: {name}")))?;
            let value: HeaderValue = value
                .parse()
                .map_err(|_| MegaError::Argument(format!("invalid header value for {name}")))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.timeout.connect)
            .timeout(config.timeout.total)
            .read_timeout(config.timeout.sock_read)
            .pool_max_idle_per_host(config.limit_per_host);

        if !config.keepalive {
            builder = builder.pool_max_idle_per_host(0);
        }

        if let Some(proxy_cfg) = &config.proxy {
            let mut proxy = Proxy::all(&proxy_cfg.url)
                .map_err(|e| MegaError::Argument(format!("invalid proxy URL: {e}")))?;
            if let Some(username) = &proxy_cfg.username {
                proxy = proxy.basic_auth(username, proxy_cfg.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(proxy);
        }

        if !config.tls.verify {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        } else if !config.tls.check_hostname {
            builder = builder.danger_accept_invalid_hostnames(true);
        }

        if let Some(ca_file) = &config.tls.ca_file {
            let pem = std::fs::read(ca_file)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| MegaError::Argument(format!("invalid CA file: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(cert_file) = &config.tls.cert_file {
            let key_file = config.tls.key_file.as_ref().ok_or_else(|| {
                MegaError::Argument("tls.cert_file requires tls.key_file".to_string())
            })?;
            let cert = std::fs::read(cert_file)?;
            let key = std::fs::read(key_file)?;
            let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key)
                .map_err(|e| MegaError::Argument(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| MegaError::Argument(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Access the underlying reqwest client for streaming transfers.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// POST a JSON body and return the response text along with any
    /// `X-Hashcash` challenge header.
    pub async fn post_json(
        &self,
        url: &str,
        body: String,
        hashcash_token: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(token) = hashcash_token {
            request = request.header("X-MEGA-Hashcash", token);
        }

        let response = request.send().await?;
        let challenge = response
            .headers()
            .get("X-Hashcash")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        // A hashcash challenge arrives on a rejection status; the caller
        // re-submits with the solution, so the status is not an error here.
        if challenge.is_some() {
            return Ok((String::new(), challenge));
        }

        let status = response.status();
        if !status.is_success() {
            return Err(MegaError::Transient(format!(
                "API POST failed with HTTP {status}"
            )));
        }

        Ok((response.text().await?, None))
    }

    /// POST raw bytes (upload chunks) and return the body as text.
    pub async fn post_bytes(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<String> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MegaError::Transient(format!(
                "upload POST failed with HTTP {status}"
            )));
        }

        Ok(response.text().await?)
    }

    /// POST raw bytes and return the raw response body (file-attribute
    /// uploads answer with an 8-byte binary handle).
    pub async fn post_octets(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/octet-stream")
            .timeout(timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MegaError::Transient(format!(
                "attribute POST failed with HTTP {status}"
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// GET a byte range `[start, end)` of a download URL.
    pub async fn get_range(&self, url: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={}-{}", start, end - 1))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(MegaError::Transient(format!(
                "range GET failed with HTTP {status}"
            )));
        }

        let bytes = response.bytes().await?.to_vec();
        if bytes.len() as u64 > end - start {
            return Err(MegaError::Protocol(
                "server returned more data than requested".to_string(),
            ));
        }
        Ok(bytes)
    }
}
