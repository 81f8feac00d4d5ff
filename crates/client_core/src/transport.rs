//! Request/response seam to the chat server.
//!
//! Stores only see [`ApiTransport`]; the production implementation is
//! [`HttpTransport`], which keeps the session cookie between calls.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::error::ApiError;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response at all (DNS, refused connection, timeout).
    #[error("request failed: {0}")]
    Network(String),
    /// The server answered with a non-success status.
    #[error("server returned status {status}")]
    Server { status: u16, message: Option<String> },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Issues one credential-bearing request. `path` is relative to the API base,
    /// e.g. `/auth/check`. An empty success body decodes as `Value::Null`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError>;
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    api: &dyn ApiTransport,
    path: &str,
) -> Result<T, TransportError> {
    let value = api.request(Method::Get, path, None).await?;
    decode(value)
}

pub(crate) async fn send_json<B: Serialize, T: DeserializeOwned>(
    api: &dyn ApiTransport,
    method: Method,
    path: &str,
    body: Option<&B>,
) -> Result<T, TransportError> {
    let body = body
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| TransportError::Decode(err.to_string()))?;
    let value = api.request(method, path, body).await?;
    decode(value)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|err| TransportError::Decode(err.to_string()))
}

pub struct HttpTransport {
    http: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let url = format!("{}{path}", self.base_url);
        let builder = match method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
        };
        let builder = match &body {
            Some(body) => builder.json(body),
            None => builder,
        };

        let res = builder
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        debug!(?method, path, status = status.as_u16(), "api response");

        if !status.is_success() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                message: ApiError::from_body(&bytes).map(|err| err.message),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| TransportError::Decode(err.to_string()))
    }
}
