//! Transport capability for the fixdesk REST API.
//!
//! This module provides the `AuthTransport` trait consumed by the session
//! store, the `{code, message, data}` response envelope, and
//! `HttpTransport`, the reqwest-backed implementation.
//!
//! Requests carry the persisted session token as a bearer token.

pub mod client;
pub mod error;
pub mod transport;

pub use client::HttpTransport;
pub use error::ApiError;
pub use transport::{ApiResponse, AuthTransport, SUCCESS_CODE};
