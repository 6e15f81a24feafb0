//! HTTP forwarder backed by a pooled `reqwest` client

use super::{
    ForwardError, Forwarder, ForwarderConfig, LocalRequest, LocalResponse, RESPONSE_HOP_HEADERS,
};
use crate::tunnel::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, warn};

/// Forwards requests to a local HTTP/1.1 service
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
    config: ForwarderConfig,
}

impl HttpForwarder {
    /// Create a forwarder for the configured local address
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ForwardError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url(&config.local_addr),
            config,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One `GET /` against the local service; any HTTP answer counts as
    /// reachable
    pub async fn check_reachable(&self, timeout: Duration) -> Result<u16, ForwardError> {
        let url = format!("{}/", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ForwardError::Timeout(timeout)
                } else {
                    self.classify(e)
                }
            })?;
        Ok(response.status().as_u16())
    }

    fn request_headers(&self, headers: &Headers) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if self.config.strips(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => warn!("Dropping unrepresentable request header {:?}", name),
            }
        }
        map
    }

    fn classify(&self, err: reqwest::Error) -> ForwardError {
        if err.is_timeout() {
            ForwardError::Timeout(self.config.timeout)
        } else if err.is_connect() {
            ForwardError::ConnectionRefused(error_chain(&err))
        } else {
            ForwardError::Protocol(error_chain(&err))
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: LocalRequest) -> Result<LocalResponse, ForwardError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::Protocol(format!("invalid method {:?}", request.method)))?;

        let url = if request.path.starts_with('/') {
            format!("{}{}", self.base_url, request.path)
        } else {
            format!("{}/{}", self.base_url, request.path)
        };

        debug!("Forwarding {} {}", method, url);

        let response = self
            .client
            .request(method, &url)
            .headers(self.request_headers(&request.headers))
            .body(request.body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| {
                !RESPONSE_HOP_HEADERS
                    .iter()
                    .any(|hop| name.as_str().eq_ignore_ascii_case(hop))
            })
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    Bytes::copy_from_slice(value.as_bytes()),
                )
            })
            .collect();

        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(LocalResponse {
            status,
            headers,
            body,
        })
    }
}

/// Normalise `host:port` or a URL into a base URL without a trailing slash
fn base_url(local_addr: &str) -> String {
    let url = if local_addr.contains("://") {
        local_addr.to_string()
    } else {
        format!("http://{}", local_addr)
    };
    url.trim_end_matches('/').to_string()
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}
