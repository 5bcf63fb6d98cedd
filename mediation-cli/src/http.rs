//! reqwest-backed `Transport`.

use std::time::Duration;

use async_trait::async_trait;
use mediation_core::{Method, Transport, TransportError, TransportRequest, TransportResponse};
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if let Some(ct) = &request.content_type {
            builder = builder.header(CONTENT_TYPE, ct.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_error)?.to_vec();
        trace!(url = %request.url, status, bytes = body.len(), "http response");
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn submit(
        &self,
        request: TransportRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = self.send(request) => r,
        }
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::NoConnection(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Status(status.as_u16())
    } else {
        TransportError::Other(e.to_string())
    }
}
