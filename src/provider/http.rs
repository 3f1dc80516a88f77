//! Generic JSON-over-HTTP provider.
//!
//! Talks to any backend exposing:
//!
//! - `POST   {endpoint}/resources/{kind}` with `{"attributes": {...}}`,
//!   answering `{"id": "...", "attributes": {...}}`;
//! - `PATCH  {endpoint}/resources/{kind}/{id}` with `{"attributes": {...}}`,
//!   answering `{"attributes": {...}}`;
//! - `DELETE {endpoint}/resources/{kind}/{id}`.
//!
//! Rate limits and network errors are retried a few times before the error
//! is reported to the engine. Creates are retried only when the request
//! never reached the backend, and carry an `Idempotency-Key` header.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::Attributes;
use crate::context::RunContext;
use crate::error::{HalldyllError, ProviderError, Result};

use super::{Created, Provider};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of attempts for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Header carrying the per-create deduplication key.
const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<String>,
    /// Base delay between retries.
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct AttributesBody<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "error")]
    message: String,
}

impl HttpProvider {
    /// Creates a new HTTP provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                HalldyllError::Provider(ProviderError::network(format!(
                    "Failed to create HTTP client: {e}"
                )))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn url(&self, kind: &str, id: Option<&str>) -> String {
        id.map_or_else(
            || format!("{}/resources/{kind}", self.endpoint),
            |id| format!("{}/resources/{kind}/{id}", self.endpoint),
        )
    }

    fn request(&self, ctx: &RunContext, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-halldyll-run", ctx.run_id().to_string());
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
    }

    /// Sends a request, retrying transient failures.
    ///
    /// A create is only retried when the backend cannot have acted on it:
    /// the connection was never established or the call was rate limited.
    async fn send(
        &self,
        ctx: &RunContext,
        call: &Call<'_>,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let mut last_error = None;
        let method = &call.method;
        let url = &call.url;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {method} {url}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            let mut builder = self.request(ctx, method.clone(), url);
            if let Some(key) = &call.idempotency_key {
                builder = builder.header(IDEMPOTENCY_KEY, key);
            }
            if let Some(attributes) = call.body {
                builder = builder.json(&AttributesBody { attributes });
            }

            match Self::send_once(builder, call.kind, call.id).await {
                Ok(response) => return Ok(response),
                Err(failure) if failure.may_retry(method) => {
                    warn!("Transient provider error on {method} {url}: {}", failure.error);
                    last_error = Some(failure.error);
                }
                Err(failure) => return Err(failure.error),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded")))
    }

    async fn send_once(
        builder: RequestBuilder,
        kind: &str,
        id: Option<&str>,
    ) -> std::result::Result<reqwest::Response, Failure> {
        let response = builder.send().await.map_err(|e| Failure {
            unsent: e.is_connect(),
            error: ProviderError::network(format!("Request failed: {e}")),
        })?;

        let status = response.status();
        trace!("Provider answered {status}");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map_or(body, |e| e.message);

        let error = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::Authentication { message }
            }
            StatusCode::TOO_MANY_REQUESTS => ProviderError::Quota { message },
            StatusCode::CONFLICT => ProviderError::Conflict { message },
            StatusCode::NOT_FOUND => match id {
                Some(id) => ProviderError::NotFound {
                    kind: kind.to_string(),
                    provider_id: id.to_string(),
                },
                None => ProviderError::rejected(status.as_u16(), message),
            },
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                ProviderError::network(format!("{status}: {message}"))
            }
            _ => ProviderError::rejected(status.as_u16(), message),
        };
        Err(Failure {
            unsent: status == StatusCode::TOO_MANY_REQUESTS,
            error,
        })
    }
}

/// One logical provider call, possibly sent several times.
struct Call<'a> {
    method: Method,
    url: String,
    body: Option<&'a Attributes>,
    kind: &'a str,
    id: Option<&'a str>,
    /// Stable across attempts so the backend can drop duplicates.
    idempotency_key: Option<String>,
}

/// A failed attempt.
struct Failure {
    error: ProviderError,
    /// The backend did not act on the request.
    unsent: bool,
}

impl Failure {
    fn may_retry(&self, method: &Method) -> bool {
        if *method == Method::POST {
            self.unsent
        } else {
            self.error.is_retryable()
        }
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> std::result::Result<T, ProviderError> {
    response.json().await.map_err(|e| ProviderError::InvalidResponse {
        message: format!("Failed to parse response: {e}"),
    })
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(
        &self,
        ctx: &RunContext,
        kind: &str,
        attributes: &Attributes,
    ) -> std::result::Result<Created, ProviderError> {
        let call = Call {
            method: Method::POST,
            url: self.url(kind, None),
            body: Some(attributes),
            kind,
            id: None,
            idempotency_key: Some(Uuid::new_v4().to_string()),
        };
        let response = self.send(ctx, &call).await?;
        let created: CreateResponse = decode(response).await?;

        if created.id.is_empty() {
            return Err(ProviderError::InvalidResponse {
                message: String::from("Empty id in create response"),
            });
        }
        debug!("Created {kind}/{}", created.id);

        Ok(Created {
            provider_id: created.id,
            attributes: created.attributes,
        })
    }

    async fn update(
        &self,
        ctx: &RunContext,
        kind: &str,
        provider_id: &str,
        changes: &Attributes,
    ) -> std::result::Result<Attributes, ProviderError> {
        let call = Call {
            method: Method::PATCH,
            url: self.url(kind, Some(provider_id)),
            body: Some(changes),
            kind,
            id: Some(provider_id),
            idempotency_key: None,
        };
        let response = self.send(ctx, &call).await?;
        let updated: UpdateResponse = decode(response).await?;
        debug!("Updated {kind}/{provider_id}");
        Ok(updated.attributes)
    }

    async fn delete(
        &self,
        ctx: &RunContext,
        kind: &str,
        provider_id: &str,
    ) -> std::result::Result<(), ProviderError> {
        let call = Call {
            method: Method::DELETE,
            url: self.url(kind, Some(provider_id)),
            body: None,
            kind,
            id: Some(provider_id),
            idempotency_key: None,
        };
        self.send(ctx, &call).await?;
        debug!("Deleted {kind}/{provider_id}");
        Ok(())
    }
}
