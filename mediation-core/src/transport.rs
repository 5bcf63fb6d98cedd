//! Transport seam: the engine submits requests and gets back a response or an error.
//! TLS, pooling and retries belong to the implementation, not to the engine.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Content type of the mediation protocol.
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Vec<u8>>,
    /// Content type of `body`, or of the expected response for body-less requests.
    pub content_type: Option<String>,
}

impl TransportRequest {
    /// Waterfall fetch: GET, JSON expected back.
    pub fn ad_request(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: None,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        }
    }

    /// Tracking pixel: GET, response ignored.
    pub fn tracking(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: None,
            content_type: None,
        }
    }

    /// POST with a JSON body.
    pub fn json_post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: Method::Post,
            body: Some(body),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".to_string(), JSON_CONTENT_TYPE.to_string())],
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().starts_with(JSON_CONTENT_TYPE))
            .unwrap_or(false)
    }
}

/// Network-level failure, before any body reached the parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no connection: {0}")]
    NoConnection(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {0}")]
    Status(u16),
    #[error("request cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one request. Implementations should stop work and return
    /// `TransportError::Cancelled` once `cancel` fires.
    async fn submit(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ad_request_expects_json() {
        let r = TransportRequest::ad_request("https://ads.example.com/m/ad?id=u1");
        assert_eq!(r.method, Method::Get);
        assert!(r.body.is_none());
        assert_eq!(r.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
    }

    #[test]
    fn header_lookup_ignores_case() {
        let resp = TransportResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json; charset=utf-8".into())],
            body: vec![],
        };
        assert_eq!(
            resp.header("content-type"),
            Some("application/json; charset=utf-8")
        );
        assert!(resp.is_json());
    }

    #[test]
    fn success_range() {
        let mut resp = TransportResponse::ok("{}");
        assert!(resp.is_success());
        resp.status = 204;
        assert!(resp.is_success());
        resp.status = 302;
        assert!(!resp.is_success());
        resp.status = 500;
        assert!(!resp.is_success());
    }
}
