use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, RwLock,
};

use shared::{
    domain::AuthUser,
    protocol::{LoginRequest, SignupRequest, UpdateProfileRequest},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    error::ClientError,
    read_lock,
    InFlight,
    realtime::ConnectionManager,
    transport::{get_json, send_json, ApiTransport, Method},
    write_lock, ClientEvent, Notice,
};

const SIGNUP_FAILED: &str = "Error creating account";
const LOGIN_FAILED: &str = "Login failed";
const LOGOUT_FAILED: &str = "Logout failed";
const UPDATE_PROFILE_FAILED: &str = "Failed to update profile";

/// What the UI should render before anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionGate {
    Checking,
    SignedOut,
    SignedIn(AuthUser),
}

/// Owns the authenticated identity and is the only component that opens or
/// closes the realtime connection.
pub struct SessionStore {
    api: Arc<dyn ApiTransport>,
    connection: Arc<ConnectionManager>,
    events: broadcast::Sender<ClientEvent>,
    auth_user: RwLock<Option<AuthUser>>,
    is_checking_auth: AtomicBool,
    is_signing_up: AtomicBool,
    is_logging_in: AtomicBool,
    is_updating_profile: AtomicBool,
    auth_checks_completed: AtomicU64,
}

impl SessionStore {
    pub fn new(
        api: Arc<dyn ApiTransport>,
        connection: Arc<ConnectionManager>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            api,
            connection,
            events,
            auth_user: RwLock::new(None),
            // Nothing is known until the first check resolves.
            is_checking_auth: AtomicBool::new(true),
            is_signing_up: AtomicBool::new(false),
            is_logging_in: AtomicBool::new(false),
            is_updating_profile: AtomicBool::new(false),
            auth_checks_completed: AtomicU64::new(0),
        }
    }

    pub fn auth_user(&self) -> Option<AuthUser> {
        read_lock(&self.auth_user).clone()
    }

    pub fn is_checking_auth(&self) -> bool {
        self.is_checking_auth.load(Ordering::Acquire)
    }

    pub fn is_signing_up(&self) -> bool {
        self.is_signing_up.load(Ordering::Acquire)
    }

    pub fn is_logging_in(&self) -> bool {
        self.is_logging_in.load(Ordering::Acquire)
    }

    pub fn is_updating_profile(&self) -> bool {
        self.is_updating_profile.load(Ordering::Acquire)
    }

    /// Number of session checks that have run to completion.
    pub fn auth_checks_completed(&self) -> u64 {
        self.auth_checks_completed.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> SessionGate {
        match self.auth_user() {
            Some(user) => SessionGate::SignedIn(user),
            None if self.is_checking_auth() => SessionGate::Checking,
            None => SessionGate::SignedOut,
        }
    }

    /// Asks the server who we are. Any failure, including a network error, signs out.
    pub async fn check_session(&self) -> Option<AuthUser> {
        let _check =
            InFlight::raise(&self.is_checking_auth).counting(&self.auth_checks_completed);

        match get_json::<AuthUser>(self.api.as_ref(), "/auth/check").await {
            Ok(user) => {
                self.establish(user.clone()).await;
                Some(user)
            }
            Err(err) => {
                debug!(error = %err, "session check failed");
                self.clear();
                None
            }
        }
    }

    pub async fn signup(&self, request: SignupRequest) -> Result<AuthUser, ClientError> {
        let field_errors = request.validate();
        if !field_errors.is_empty() {
            let err = ClientError::InvalidSignup(field_errors);
            self.notify_error(&err, SIGNUP_FAILED);
            return Err(err);
        }

        let _busy = InFlight::raise(&self.is_signing_up);
        match send_json::<_, AuthUser>(self.api.as_ref(), Method::Post, "/auth/signup", Some(&request))
            .await
        {
            Ok(user) => {
                self.notify(Notice::success("Account created successfully"));
                self.establish(user.clone()).await;
                Ok(user)
            }
            Err(err) => {
                let err = ClientError::from(err);
                self.notify_error(&err, SIGNUP_FAILED);
                Err(err)
            }
        }
    }

    pub async fn login(&self, request: LoginRequest) -> Result<AuthUser, ClientError> {
        let _busy = InFlight::raise(&self.is_logging_in);
        match send_json::<_, AuthUser>(self.api.as_ref(), Method::Post, "/auth/login", Some(&request))
            .await
        {
            Ok(user) => {
                self.notify(Notice::success("Logged in successfully"));
                self.establish(user.clone()).await;
                Ok(user)
            }
            Err(err) => {
                let err = ClientError::from(err);
                self.notify_error(&err, LOGIN_FAILED);
                Err(err)
            }
        }
    }

    /// Signs out locally whatever the server says; a failed call is still reported.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let result = self
            .api
            .request(Method::Post, "/auth/logout", None)
            .await
            .map(|_| ())
            .map_err(ClientError::from);

        self.clear();

        match result {
            Ok(()) => {
                self.notify(Notice::success("Logged out successfully"));
                Ok(())
            }
            Err(err) => {
                self.notify_error(&err, LOGOUT_FAILED);
                Err(err)
            }
        }
    }

    pub async fn update_profile(
        &self,
        request: UpdateProfileRequest,
    ) -> Result<AuthUser, ClientError> {
        let _busy = InFlight::raise(&self.is_updating_profile);
        match send_json::<_, AuthUser>(
            self.api.as_ref(),
            Method::Put,
            "/auth/update-profile",
            Some(&request),
        )
        .await
        {
            Ok(user) => {
                *write_lock(&self.auth_user) = Some(user.clone());
                let _ = self.events.send(ClientEvent::SessionChanged(Some(user.clone())));
                self.notify(Notice::success("Profile updated successfully"));
                Ok(user)
            }
            Err(err) => {
                let err = ClientError::from(err);
                self.notify_error(&err, UPDATE_PROFILE_FAILED);
                Err(err)
            }
        }
    }

    async fn establish(&self, user: AuthUser) {
        *write_lock(&self.auth_user) = Some(user.clone());
        let _ = self.events.send(ClientEvent::SessionChanged(Some(user.clone())));

        if user.has_valid_id() {
            self.connection.connect(&user.id).await;
        } else {
            warn!("identity snapshot has no id; realtime channel not opened");
        }
    }

    // Disconnect before the identity goes away.
    fn clear(&self) {
        self.connection.disconnect();
        let had_user = write_lock(&self.auth_user).take().is_some();
        if had_user {
            info!("session cleared");
            let _ = self.events.send(ClientEvent::SessionChanged(None));
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.events.send(ClientEvent::Notice(notice));
    }

    fn notify_error(&self, err: &ClientError, fallback: &str) {
        warn!(error = %err, notice = fallback, "session operation failed");
        self.notify(Notice::error(err.notice_text(fallback)));
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
