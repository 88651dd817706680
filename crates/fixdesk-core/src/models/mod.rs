//! Data models shared by the transport and the session store.
//!
//! - `User`: the authenticated account as returned by the server
//! - `LoginRequest`, `RegisterRequest`: credential payloads
//! - `ProfileUpdate`, `ChangePasswordRequest`: account maintenance payloads
//! - `AuthPayload`: the `{token, user}` pair returned by login/register

pub mod user;

pub use user::{AuthPayload, ChangePasswordRequest, LoginRequest, ProfileUpdate, RegisterRequest, User};
