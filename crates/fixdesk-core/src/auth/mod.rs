//! Authentication module for managing the user session and its token.
//!
//! This module provides:
//! - `SessionStore`: the login/register/logout/check-auth state machine
//! - `TokenStorage`: durable storage for the session token, with file,
//!   OS keychain and in-memory backends
//!
//! The token survives restarts; the user does not and is re-derived with
//! `SessionStore::check_auth`.

pub mod credentials;
pub mod session;
pub mod storage;

pub use credentials::KeyringTokenStorage;
pub use session::{Session, SessionError, SessionStore};
pub use storage::{
    open_storage, FileTokenStorage, MemoryTokenStorage, StorageError, TokenStorage, TOKEN_KEY,
};
