//! Client-side data access for the fixdesk campus repair service.
//!
//! - `request`: managed requests with TTL caching, fixed-delay retries and
//!   observable state
//! - `cache`: the response cache shared by managed requests
//! - `auth`: session state machine and durable token storage
//! - `api`: the transport capability and its HTTP implementation
//!
//! Stores are plain values: construct them once, share them with `Arc`,
//! and build isolated copies in tests.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod request;

pub use api::{ApiError, AuthTransport, HttpTransport};
pub use auth::{Session, SessionError, SessionStore, TokenStorage};
pub use cache::{RequestCache, RequestSignature};
pub use config::Config;
pub use request::{ManagedRequestExecutor, RequestError, RequestHandle, RequestOptions, RequestState};
