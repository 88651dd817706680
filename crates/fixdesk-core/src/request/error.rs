use thiserror::Error;

use crate::api::ApiError;

/// Failure recorded in a `RequestState`. Cloneable so every subscriber
/// and callback sees the same value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The transport call failed
    #[error("{message}")]
    Network { message: String },

    /// The server no longer accepts the session token
    #[error("{message}")]
    SessionExpired { message: String },

    /// The response could not be stored as, or restored from, JSON
    #[error("{message}")]
    Decode { message: String },

    /// A network failure that outlived the retry budget.
    /// Displays the last failure's message.
    #[error("{message}")]
    RetryExhausted { attempts: u32, message: String },
}

impl RequestError {
    pub fn message(&self) -> &str {
        match self {
            RequestError::Network { message }
            | RequestError::SessionExpired { message }
            | RequestError::Decode { message }
            | RequestError::RetryExhausted { message, .. } => message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::Network { .. })
    }

    /// Final form of an error after `attempts` invocations
    pub(crate) fn exhausted(self, attempts: u32) -> Self {
        match self {
            RequestError::Network { message } => RequestError::RetryExhausted { attempts, message },
            other => other,
        }
    }

    pub(crate) fn decode(err: serde_json::Error) -> Self {
        RequestError::Decode {
            message: err.to_string(),
        }
    }
}

impl From<ApiError> for RequestError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        if err.is_unauthorized() {
            RequestError::SessionExpired { message }
        } else {
            RequestError::Network { message }
        }
    }
}
