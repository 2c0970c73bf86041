//! Raw Engine API requests for the swarm, node and task endpoints, which
//! the pinned bollard release does not wrap.

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::errors::classify_status;
use crate::domain::BackendError;

/// Base URL of the Engine API at `address`. Docker's `tcp://` scheme
/// becomes HTTPS when the node is reached over TLS.
pub(crate) fn base_url(address: &str, tls: bool) -> String {
    let address = address.trim_end_matches('/');
    match address.strip_prefix("tcp://") {
        Some(rest) if tls => format!("https://{rest}"),
        Some(rest) => format!("http://{rest}"),
        None => address.to_string(),
    }
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Api(e.into())
}

/// HTTP client bound to one engine.
pub(crate) struct EngineHttp {
    client: reqwest::Client,
    base: String,
}

impl EngineHttp {
    pub(crate) fn new(client: reqwest::Client, base: String) -> Self {
        Self { client, base }
    }

    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{path}", self.base))
    }

    /// Send `req`, classifying any non-2xx answer.
    pub(crate) async fn send(req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    /// Send `req` and decode a JSON answer.
    pub(crate) async fn json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, BackendError> {
        Self::send(req).await?.json().await.map_err(transport)
    }

    /// Send `req`, discarding the answer body.
    pub(crate) async fn call(req: RequestBuilder) -> Result<(), BackendError> {
        Self::send(req).await.map(drop)
    }
}
