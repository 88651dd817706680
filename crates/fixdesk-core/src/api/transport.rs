use async_trait::async_trait;
use serde::Deserialize;

use crate::models::{AuthPayload, ProfileUpdate, RegisterRequest, User};

use super::ApiError;

/// Envelope code the server uses for a successful call
pub const SUCCESS_CODE: i32 = 200;

/// Response envelope wrapping every API payload.
/// Only `data` is consumed; `message` becomes the error text on failure.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Unwrap the payload of a successful envelope
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.is_success() {
            return Err(ApiError::from_envelope(self.code, self.message));
        }
        self.data
            .ok_or_else(|| ApiError::InvalidResponse("Response envelope has no data".to_string()))
    }

    /// Check a successful envelope whose payload is ignored
    pub fn into_unit(self) -> Result<(), ApiError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ApiError::from_envelope(self.code, self.message))
        }
    }
}

/// Authentication endpoints the session store depends on.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<AuthPayload, ApiError>;

    async fn register(&self, request: &RegisterRequest) -> Result<AuthPayload, ApiError>;

    async fn current_user(&self) -> Result<User, ApiError>;

    async fn logout(&self) -> Result<(), ApiError>;

    async fn forgot_password(&self, email: &str) -> Result<(), ApiError>;

    async fn reset_password(&self, token: &str, password: &str) -> Result<(), ApiError>;

    /// Returns the user as stored after the update
    async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, ApiError>;

    async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), ApiError>;
}
