//! HTTP transport for the fixdesk REST API.
//!
//! `HttpTransport` implements `AuthTransport` and exposes generic
//! `get`/`post` helpers for domain data. Every request carries the
//! persisted session token as a bearer token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::{TokenStorage, TOKEN_KEY};
use crate::config::Config;
use crate::models::{AuthPayload, ChangePasswordRequest, LoginRequest, ProfileUpdate, RegisterRequest, User};

use super::{ApiError, ApiResponse, AuthTransport};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the fixdesk server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    storage: Arc<dyn TokenStorage>,
}

impl HttpTransport {
    /// Create a new transport reading its bearer token from `storage`
    pub fn new(config: &Config, storage: Arc<dyn TokenStorage>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            storage,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        let token = match self.storage.get_item(TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to read session token, sending request without it");
                None
            }
        };
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ApiError::InvalidResponse(format!("Invalid token header: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Self::error_from_body(status, &body))
        }
    }

    /// Error for a non-2xx response. An envelope body carries the server's
    /// own message; anything else falls back to the status mapping.
    fn error_from_body(status: reqwest::StatusCode, body: &str) -> ApiError {
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return ApiError::Unauthorized;
        }
        match serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
            Ok(envelope) if !envelope.is_success() && !envelope.message.is_empty() => {
                ApiError::from_envelope(envelope.code, envelope.message)
            }
            _ => ApiError::from_status(status, body),
        }
    }

    async fn send<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(self.auth_headers()?);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    debug!(method = %method, url = %url, "Response received");
                    return response.json().await.map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse JSON from {}: {}", url, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    /// GET `path` and unwrap the envelope payload
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<T, ()>(Method::GET, path, None).await?.into_data()
    }

    /// POST `body` as JSON to `path` and unwrap the envelope payload
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::POST, path, Some(body)).await?.into_data()
    }

    /// PUT `body` as JSON to `path` and unwrap the envelope payload
    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(Method::PUT, path, Some(body)).await?.into_data()
    }

    async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<(), ApiError> {
        self.send::<serde_json::Value, B>(Method::POST, path, body)
            .await?
            .into_unit()
    }

    /// Build a request function for the managed-request executor that GETs `path`.
    pub fn get_fn<T>(
        &self,
        path: impl Into<String>,
    ) -> impl Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync + 'static
    where
        T: DeserializeOwned + Send + 'static,
    {
        let transport = self.clone();
        let path = path.into();
        move || {
            let transport = transport.clone();
            let path = path.clone();
            Box::pin(async move { transport.get(&path).await })
        }
    }
}

#[async_trait]
impl AuthTransport for HttpTransport {
    async fn login(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.post("/auth/login", &body).await
    }

    async fn register(&self, request: &RegisterRequest) -> Result<AuthPayload, ApiError> {
        self.post("/auth/register", request).await
    }

    async fn current_user(&self) -> Result<User, ApiError> {
        self.get("/auth/current-user").await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.post_unit::<()>("/auth/logout", None).await
    }

    async fn forgot_password(&self, email: &str) -> Result<(), ApiError> {
        self.post_unit("/auth/forgot-password", Some(&json!({ "email": email })))
            .await
    }

    async fn reset_password(&self, token: &str, password: &str) -> Result<(), ApiError> {
        self.post_unit(
            "/auth/reset-password",
            Some(&json!({ "token": token, "password": password })),
        )
        .await
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError> {
        self.put("/auth/profile", update).await
    }

    async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), ApiError> {
        let body = ChangePasswordRequest {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
        };
        self.post_unit("/auth/change-password", Some(&body)).await
    }
}
