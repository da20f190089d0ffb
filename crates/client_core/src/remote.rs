use std::sync::Arc;

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use shared::{
    error::{ApiError, ErrorCode, ValidationError},
    protocol::{CallMethod, Endpoint},
};
use url::Url;

use crate::error::FetchError;

/// Raw outcome of a remote compute call. Only status 200 is success.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn error(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        let body = serde_json::to_value(ApiError::new(code, message)).unwrap_or(Value::Null);
        Self { status, body }
    }
}

/// The remote compute layer. Implementations return `Err` only for transport
/// failures; every answered call comes back as a [`RemoteResponse`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_resource(
        &self,
        endpoint: &str,
        method: CallMethod,
        body: Value,
    ) -> Result<RemoteResponse, FetchError>;
}

/// Maps a non-200 answer onto the error taxonomy.
pub fn classify(resource: &str, response: RemoteResponse) -> Result<Value, FetchError> {
    if response.status == 200 {
        return Ok(response.body);
    }

    let api_error = serde_json::from_value::<ApiError>(response.body.clone()).ok();
    let message = api_error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| format!("status {}", response.status));
    let code = api_error.map(|e| e.code);

    match (response.status, code) {
        (404 | 410 | 501, _) | (_, Some(ErrorCode::NotFound | ErrorCode::Unsupported)) => {
            Err(FetchError::InvalidResource {
                resource: resource.to_string(),
                reason: message,
            })
        }
        (429, _) | (_, Some(ErrorCode::RateLimited)) => Err(FetchError::RateLimited {
            resource: resource.to_string(),
            retry_after_ms: 0,
        }),
        (400 | 422, _) | (_, Some(ErrorCode::Validation)) => {
            Err(FetchError::Validation(ValidationError::MalformedPayload {
                schema: "request",
                reason: message,
            }))
        }
        (status, _) => Err(FetchError::Remote { status, message }),
    }
}

/// One call: serialize, send, classify.
pub async fn invoke<B: Serialize>(
    remote: &dyn RemoteSource,
    endpoint: Endpoint,
    resource: &str,
    body: &B,
) -> Result<Value, FetchError> {
    let body = serde_json::to_value(body).map_err(|err| ValidationError::MalformedPayload {
        schema: endpoint.as_str(),
        reason: err.to_string(),
    })?;
    let response = remote
        .fetch_resource(endpoint.as_str(), endpoint.method(), body)
        .await?;
    classify(resource, response)
}

/// Repeatable fetch closure for [`crate::fetch::FetchCoordinator::request`].
pub fn remote_call<B>(
    remote: Arc<dyn RemoteSource>,
    endpoint: Endpoint,
    resource: String,
    body: B,
) -> impl FnMut() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static
where
    B: Serialize + Clone + Send + Sync + 'static,
{
    move || {
        let remote = remote.clone();
        let resource = resource.clone();
        let body = body.clone();
        async move { invoke(remote.as_ref(), endpoint, &resource, &body).await }.boxed()
    }
}

/// JSON-over-HTTP gateway: `POST {base}/{query|update}/{endpoint}`.
#[derive(Clone)]
pub struct HttpRemoteSource {
    http: Client,
    base_url: Url,
}

impl HttpRemoteSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: &str) -> anyhow::Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("unsupported remote scheme: {}", base_url.scheme());
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint_url(&self, endpoint: &str, method: CallMethod) -> Result<Url, FetchError> {
        self.base_url
            .join(&format!("{}/{endpoint}", method.as_str()))
            .map_err(|err| FetchError::Network(format!("invalid endpoint url: {err}")))
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_resource(
        &self,
        endpoint: &str,
        method: CallMethod,
        body: Value,
    ) -> Result<RemoteResponse, FetchError> {
        let url = self.endpoint_url(endpoint, method)?;
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok(RemoteResponse { status, body })
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
