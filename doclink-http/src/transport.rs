use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use doclink_core::{
    error::{AccessError, AccessResult},
    transport::{HttpRequest, HttpResponse, Method, Transport, TransportError},
};

/// Request timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// [`Transport`] over a `reqwest` client.
///
/// Every failure to obtain a response (connect errors, timeouts, broken bodies) is reported as
/// a [`TransportError`]; any response the service sends, whatever its status, is returned as is.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        debug!(method = %request.method, url = %request.url, status, "response received");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct ReqwestTransportBuilder {
    timeout: Duration,
    connect_timeout: Option<Duration>,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: None,
        }
    }
}

impl ReqwestTransportBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> AccessResult<ReqwestTransport> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        builder
            .build()
            .map(ReqwestTransport::new)
            .map_err(|e| AccessError::NotConfigured(format!("http client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_a_transport_error() {
        let transport = ReqwestTransport::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        let result = transport
            .send(HttpRequest {
                method: Method::Get,
                url: "http://127.0.0.1:1/dbs".into(),
                headers: Vec::new(),
                body: None,
            })
            .await;

        assert!(result.is_err());
        assert!(AccessError::from(result.unwrap_err()).is_transport());
    }
}
