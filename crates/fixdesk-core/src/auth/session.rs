use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthTransport};
use crate::models::{AuthPayload, ProfileUpdate, RegisterRequest, User};

use super::storage::{TokenStorage, TOKEN_KEY};

pub const LOGIN_FAILED_MESSAGE: &str = "Login failed, please check your username and password";
pub const REGISTER_FAILED_MESSAGE: &str = "Registration failed, please try again later";
pub const LOGOUT_FAILED_MESSAGE: &str = "Failed to log out";
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please log in again";
pub const FORGOT_PASSWORD_FAILED_MESSAGE: &str = "Failed to send password reset email";
pub const RESET_PASSWORD_FAILED_MESSAGE: &str = "Failed to reset password";
pub const UPDATE_PROFILE_FAILED_MESSAGE: &str = "Failed to update profile";
pub const CHANGE_PASSWORD_FAILED_MESSAGE: &str = "Failed to change password, please check your current password";

/// Session failures. The Display text is the fixed message recorded in
/// `Session::error`; transport detail is only logged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("{}", LOGIN_FAILED_MESSAGE)]
    LoginFailed,

    #[error("{}", REGISTER_FAILED_MESSAGE)]
    RegisterFailed,

    #[error("{}", LOGOUT_FAILED_MESSAGE)]
    LogoutFailed,

    #[error("{}", SESSION_EXPIRED_MESSAGE)]
    SessionExpired,

    #[error("{}", FORGOT_PASSWORD_FAILED_MESSAGE)]
    ForgotPasswordFailed,

    #[error("{}", RESET_PASSWORD_FAILED_MESSAGE)]
    ResetPasswordFailed,

    #[error("{}", UPDATE_PROFILE_FAILED_MESSAGE)]
    UpdateProfileFailed,

    #[error("{}", CHANGE_PASSWORD_FAILED_MESSAGE)]
    ChangePasswordFailed,
}

/// Authentication state. `is_authenticated` implies both `user` and
/// `token` are present; the constructors keep it that way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    user: Option<User>,
    token: Option<String>,
    is_authenticated: bool,
    is_loading: bool,
    error: Option<String>,
}

impl Session {
    /// State at startup: a persisted token may exist, identity is unknown
    /// until `check_auth` resolves.
    fn initial(token: Option<String>) -> Self {
        Self {
            user: None,
            token,
            is_authenticated: false,
            is_loading: true,
            error: None,
        }
    }

    fn authenticated(user: User, token: String) -> Self {
        Self {
            user: Some(user),
            token: Some(token),
            is_authenticated: true,
            is_loading: false,
            error: None,
        }
    }

    fn signed_out(error: Option<String>) -> Self {
        Self {
            user: None,
            token: None,
            is_authenticated: false,
            is_loading: false,
            error,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Owns the authentication state machine for one client process.
///
/// Every operation replaces the published `Session` as a whole; nothing
/// spans a network call except the `is_loading` flag.
pub struct SessionStore {
    transport: Arc<dyn AuthTransport>,
    storage: Arc<dyn TokenStorage>,
    state: watch::Sender<Session>,
}

impl SessionStore {
    /// Create the store, picking up any token persisted by an earlier run
    pub fn new(transport: Arc<dyn AuthTransport>, storage: Arc<dyn TokenStorage>) -> Self {
        let token = read_token(storage.as_ref());
        let (state, _) = watch::channel(Session::initial(token));
        Self {
            transport,
            storage,
            state,
        }
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    fn begin(&self, clear_error: bool) {
        self.state.send_modify(|s| {
            s.is_loading = true;
            if clear_error {
                s.error = None;
            }
        });
    }

    /// Record a failure message on whatever configuration is current
    fn fail(&self, err: SessionError) -> SessionError {
        self.state.send_modify(|s| {
            s.error = Some(err.to_string());
            s.is_loading = false;
        });
        err
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<User, SessionError> {
        self.begin(true);
        let result = self.transport.login(username, password).await;
        self.establish(result, SessionError::LoginFailed)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<User, SessionError> {
        self.begin(true);
        let result = self.transport.register(request).await;
        self.establish(result, SessionError::RegisterFailed)
    }

    /// Persist the token from a login/register response and become authenticated
    fn establish(
        &self,
        result: Result<AuthPayload, ApiError>,
        failure: SessionError,
    ) -> Result<User, SessionError> {
        let AuthPayload { token, user } = match result {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Authentication request failed");
                return Err(self.fail(failure));
            }
        };

        if let Err(e) = self.storage.set_item(TOKEN_KEY, &token) {
            warn!(error = %e, "Failed to persist session token");
            return Err(self.fail(failure));
        }

        info!(user_id = user.id, username = %user.username, "Signed in");
        self.state.send_replace(Session::authenticated(user.clone(), token));
        Ok(user)
    }

    /// Log out remotely, then forget the token.
    ///
    /// If the server call fails the local session is left as it was,
    /// token included, and only the error is recorded.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.begin(false);

        if let Err(e) = self.transport.logout().await {
            warn!(error = %e, "Logout request failed, keeping local session");
            return Err(self.fail(SessionError::LogoutFailed));
        }

        if let Err(e) = self.storage.remove_item(TOKEN_KEY) {
            warn!(error = %e, "Failed to remove persisted session token");
            return Err(self.fail(SessionError::LogoutFailed));
        }

        info!("Signed out");
        self.state.send_replace(Session::signed_out(None));
        Ok(())
    }

    /// Re-derive the user from the persisted token.
    ///
    /// No token means the session is expired without asking the server.
    /// A rejected token is removed from storage.
    pub async fn check_auth(&self) -> Result<User, SessionError> {
        self.begin(false);

        let Some(token) = read_token(self.storage.as_ref()) else {
            debug!("No persisted token");
            return Err(self.expire());
        };

        match self.transport.current_user().await {
            Ok(user) => {
                debug!(user_id = user.id, "Session is valid");
                self.state.send_replace(Session::authenticated(user.clone(), token));
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Session check failed");
                if let Err(e) = self.storage.remove_item(TOKEN_KEY) {
                    warn!(error = %e, "Failed to remove persisted session token");
                }
                Err(self.expire())
            }
        }
    }

    fn expire(&self) -> SessionError {
        let err = SessionError::SessionExpired;
        self.state.send_replace(Session::signed_out(Some(err.to_string())));
        err
    }

    pub async fn forgot_password(&self, email: &str) -> Result<(), SessionError> {
        self.begin(true);
        match self.transport.forgot_password(email).await {
            Ok(()) => {
                self.state.send_modify(|s| s.is_loading = false);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Forgot-password request failed");
                Err(self.fail(SessionError::ForgotPasswordFailed))
            }
        }
    }

    pub async fn reset_password(&self, token: &str, password: &str) -> Result<(), SessionError> {
        self.begin(true);
        match self.transport.reset_password(token, password).await {
            Ok(()) => {
                self.state.send_modify(|s| s.is_loading = false);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Reset-password request failed");
                Err(self.fail(SessionError::ResetPasswordFailed))
            }
        }
    }

    /// Update the signed-in user's profile. On success the published
    /// session carries the user the server returned.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User, SessionError> {
        self.begin(true);
        match self.transport.update_profile(update).await {
            Ok(user) => {
                info!(user_id = user.id, "Profile updated");
                self.state.send_modify(|s| {
                    s.user = Some(user.clone());
                    s.is_loading = false;
                });
                Ok(user)
            }
            Err(e) => {
                warn!(error = %e, "Profile update failed");
                Err(self.fail(SessionError::UpdateProfileFailed))
            }
        }
    }

    /// Change the password of the signed-in user. The session and token
    /// stay as they are.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<(), SessionError> {
        self.begin(true);
        match self.transport.change_password(old_password, new_password).await {
            Ok(()) => {
                self.state.send_modify(|s| s.is_loading = false);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Change-password request failed");
                Err(self.fail(SessionError::ChangePasswordFailed))
            }
        }
    }
}

/// Read the persisted token; an unreadable store counts as no token
fn read_token(storage: &dyn TokenStorage) -> Option<String> {
    match storage.get_item(TOKEN_KEY) {
        Ok(token) => token.filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(error = %e, "Failed to read persisted session token");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
