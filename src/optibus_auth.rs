// Identity session provider backed by the Firebase Identity Toolkit REST API
//
// API Endpoints:
// - Sign in:   https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword
// - Sign up:   https://identitytoolkit.googleapis.com/v1/accounts:signUp
// - OAuth:     https://identitytoolkit.googleapis.com/v1/accounts:signInWithIdp
// - Refresh:   https://securetoken.googleapis.com/v1/token
use crate::optibus_models::{OptiBusError, Result};
use poll_promise::Promise;
use reqwest::blocking;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl User {
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.uid.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    GitHub,
}

impl OAuthProvider {
    pub fn provider_id(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google.com",
            OAuthProvider::GitHub => "github.com",
        }
    }
}

/// The external identity service, reduced to what the client needs.
pub trait IdentityService: Send + Sync {
    fn sign_in(&self, email: &str, password: &str) -> Result<User>;
    fn sign_up(&self, email: &str, password: &str) -> Result<User>;
    fn sign_in_with_oauth(&self, provider: OAuthProvider, id_token: &str) -> Result<User>;
    fn sign_out(&self) -> Result<()>;
    fn current_user(&self) -> Option<User>;
    /// A bearer token for the signed-in user, refreshed when close to expiry
    /// or when `force_refresh` is set. `None` when nobody is signed in.
    fn id_token(&self, force_refresh: bool) -> Result<Option<String>>;
}

// ============================================================================
// Persisted session
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub user: User,
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
}

impl StoredSession {
    pub fn needs_refresh(&self, now: u64) -> bool {
        now + REFRESH_MARGIN_SECS >= self.expires_at
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| OptiBusError::FileError(format!("Failed to create session directory: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| OptiBusError::FileError(format!("Failed to serialize session: {}", e)))?;
        fs::write(path, json)
            .map_err(|e| OptiBusError::FileError(format!("Failed to write session: {}", e)))?;
        log::debug!("Session saved to {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<StoredSession>(&contents) {
                Ok(session) => Some(session),
                Err(e) => {
                    log::warn!("Ignoring unreadable session file ({})", e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read session file ({})", e);
                None
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Firebase implementation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
}

pub struct FirebaseIdentity {
    api_key: String,
    identity_base: String,
    token_base: String,
    session_path: PathBuf,
    client: blocking::Client,
    session: Mutex<Option<StoredSession>>,
}

impl FirebaseIdentity {
    const IDENTITY_BASE: &'static str = "https://identitytoolkit.googleapis.com/v1";
    const TOKEN_BASE: &'static str = "https://securetoken.googleapis.com/v1";

    pub fn new(api_key: &str, session_path: PathBuf, timeout: Duration) -> Result<Self> {
        Self::with_endpoints(api_key, Self::IDENTITY_BASE, Self::TOKEN_BASE, session_path, timeout)
    }

    pub fn with_endpoints(
        api_key: &str,
        identity_base: &str,
        token_base: &str,
        session_path: PathBuf,
        timeout: Duration,
    ) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(OptiBusError::ConfigError(
                "An identity API key is required (set OPTIBUS_AUTH_API_KEY)".to_string(),
            ));
        }

        let client = blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let session = StoredSession::load(&session_path);
        if let Some(s) = &session {
            log::info!("Restored session for {}", s.user.label());
        }

        Ok(FirebaseIdentity {
            api_key: api_key.trim().to_string(),
            identity_base: identity_base.trim_end_matches('/').to_string(),
            token_base: token_base.trim_end_matches('/').to_string(),
            session_path,
            client,
            session: Mutex::new(session),
        })
    }

    fn account_call(&self, method: &str, body: Value) -> Result<User> {
        let url = format!("{}/accounts:{}?key={}", self.identity_base, method, self.api_key);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to reach identity service: {}", e)))?;

        let account: AccountResponse = Self::decode(response)?;
        let session = StoredSession {
            user: User {
                uid: account.local_id,
                email: account.email,
                display_name: account.display_name.filter(|n| !n.is_empty()),
            },
            id_token: account.id_token,
            refresh_token: account.refresh_token,
            expires_at: now_secs() + parse_expires_in(&account.expires_in),
        };
        let user = session.user.clone();
        self.store(Some(session));
        log::info!("Signed in as {}", user.label());
        Ok(user)
    }

    fn refresh(&self, session: &StoredSession) -> Result<StoredSession> {
        let url = format!("{}/token?key={}", self.token_base, self.api_key);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", session.refresh_token.as_str()),
            ])
            .send()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to refresh token: {}", e)))?;

        let refreshed: RefreshResponse = Self::decode(response)?;
        Ok(StoredSession {
            user: session.user.clone(),
            id_token: refreshed.id_token,
            refresh_token: refreshed.refresh_token,
            expires_at: now_secs() + parse_expires_in(&refreshed.expires_in),
        })
    }

    fn decode<T: serde::de::DeserializeOwned>(response: blocking::Response) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to read identity response: {}", e)))?;

        if !status.is_success() {
            return Err(OptiBusError::AuthError(auth_error_message(&body, status.as_u16())));
        }

        serde_json::from_str(&body)
            .map_err(|e| OptiBusError::ParseError(format!("Invalid identity response: {}", e)))
    }

    fn store(&self, session: Option<StoredSession>) {
        match &session {
            Some(s) => {
                if let Err(e) = s.save(&self.session_path) {
                    log::warn!("Could not persist session: {}", e);
                }
            }
            None => {
                if self.session_path.exists() {
                    if let Err(e) = fs::remove_file(&self.session_path) {
                        log::warn!("Could not remove session file: {}", e);
                    }
                }
            }
        }
        *self.session.lock().unwrap_or_else(|p| p.into_inner()) = session;
    }

    fn snapshot(&self) -> Option<StoredSession> {
        self.session.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl IdentityService for FirebaseIdentity {
    fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        self.account_call(
            "signInWithPassword",
            json!({ "email": email.trim(), "password": password, "returnSecureToken": true }),
        )
    }

    fn sign_up(&self, email: &str, password: &str) -> Result<User> {
        self.account_call(
            "signUp",
            json!({ "email": email.trim(), "password": password, "returnSecureToken": true }),
        )
    }

    fn sign_in_with_oauth(&self, provider: OAuthProvider, id_token: &str) -> Result<User> {
        self.account_call(
            "signInWithIdp",
            json!({
                "postBody": format!("id_token={}&providerId={}", id_token, provider.provider_id()),
                "requestUri": "http://localhost",
                "returnSecureToken": true,
                "returnIdpCredential": true
            }),
        )
    }

    fn sign_out(&self) -> Result<()> {
        if let Some(session) = self.snapshot() {
            log::info!("Signed out {}", session.user.label());
        }
        self.store(None);
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        self.snapshot().map(|s| s.user)
    }

    fn id_token(&self, force_refresh: bool) -> Result<Option<String>> {
        let Some(session) = self.snapshot() else {
            return Ok(None);
        };

        if !force_refresh && !session.needs_refresh(now_secs()) {
            return Ok(Some(session.id_token));
        }

        match self.refresh(&session) {
            Ok(fresh) => {
                let token = fresh.id_token.clone();
                self.store(Some(fresh));
                Ok(Some(token))
            }
            Err(OptiBusError::AuthError(msg)) => {
                // Revoked or expired refresh token: the session is gone.
                log::warn!("Session for {} is no longer valid: {}", session.user.label(), msg);
                self.store(None);
                Err(OptiBusError::AuthError(msg))
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_expires_in(value: &str) -> u64 {
    value.trim().parse().unwrap_or(3600)
}

/// Maps identity-service error codes to readable messages.
fn auth_error_message(body: &str, status: u16) -> String {
    let code = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .and_then(Value::as_str)
            .map(String::from)
    });

    match code.as_deref() {
        Some("EMAIL_NOT_FOUND") | Some("INVALID_PASSWORD") | Some("INVALID_LOGIN_CREDENTIALS") => {
            "Invalid email or password".to_string()
        }
        Some("EMAIL_EXISTS") => "An account with this email already exists".to_string(),
        Some("USER_DISABLED") => "This account has been disabled".to_string(),
        Some("TOKEN_EXPIRED") | Some("INVALID_REFRESH_TOKEN") => {
            "Session expired, please sign in again".to_string()
        }
        Some(code) if code.starts_with("WEAK_PASSWORD") => {
            "Password should be at least 6 characters".to_string()
        }
        Some(code) if code.starts_with("TOO_MANY_ATTEMPTS_TRY_LATER") => {
            "Too many attempts, try again later".to_string()
        }
        Some(code) => code.to_string(),
        None => format!("Identity service returned status {}", status),
    }
}

// ============================================================================
// Session provider
// ============================================================================

/// Keeps the UI's view of the identity service: the signed-in user, a
/// loading flag while a sign-in or the startup session check is running,
/// and the last failure message.
pub struct SessionProvider {
    identity: Arc<dyn IdentityService>,
    user: Option<User>,
    pending: Option<Promise<Result<Option<User>>>>,
    last_error: Option<String>,
}

impl SessionProvider {
    /// Starts by validating any restored session (refreshing its token).
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        let mut provider = SessionProvider {
            identity,
            user: None,
            pending: None,
            last_error: None,
        };
        provider.spawn("session-restore", |identity| {
            identity.id_token(false)?;
            Ok(identity.current_user())
        });
        provider
    }

    pub fn identity(&self) -> Arc<dyn IdentityService> {
        Arc::clone(&self.identity)
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn sign_in(&mut self, email: &str, password: &str) {
        let (email, password) = (email.to_string(), password.to_string());
        self.spawn("sign-in", move |identity| identity.sign_in(&email, &password).map(Some));
    }

    pub fn sign_up(&mut self, email: &str, password: &str) {
        let (email, password) = (email.to_string(), password.to_string());
        self.spawn("sign-up", move |identity| identity.sign_up(&email, &password).map(Some));
    }

    pub fn sign_in_with_oauth(&mut self, provider: OAuthProvider, id_token: &str) {
        let id_token = id_token.to_string();
        self.spawn("oauth", move |identity| {
            identity.sign_in_with_oauth(provider, &id_token).map(Some)
        });
    }

    pub fn sign_out(&mut self) {
        self.spawn("sign-out", |identity| identity.sign_out().map(|_| None));
    }

    /// Applies a finished background call. Returns true when state changed.
    pub fn poll(&mut self) -> bool {
        let Some(promise) = self.pending.take() else {
            return false;
        };
        match promise.try_take() {
            Ok(Ok(user)) => {
                self.user = user;
                self.last_error = None;
                true
            }
            Ok(Err(e)) => {
                log::warn!("Identity call failed: {}", e);
                self.user = self.identity.current_user();
                self.last_error = Some(e.to_string());
                true
            }
            Err(promise) => {
                self.pending = Some(promise);
                false
            }
        }
    }

    fn spawn<F>(&mut self, name: &str, call: F)
    where
        F: FnOnce(&dyn IdentityService) -> Result<Option<User>> + Send + 'static,
    {
        let identity = Arc::clone(&self.identity);
        self.last_error = None;
        self.pending = Some(Promise::spawn_thread(name, move || call(identity.as_ref())));
    }
}

#[cfg(test)]
impl SessionProvider {
    pub fn settle(&mut self) {
        if let Some(promise) = &self.pending {
            promise.block_until_ready();
        }
        self.poll();
    }
}

/// Identity service used when no API key is configured. Nobody can sign in.
pub struct AnonymousIdentity;

impl IdentityService for AnonymousIdentity {
    fn sign_in(&self, _email: &str, _password: &str) -> Result<User> {
        Err(not_configured())
    }

    fn sign_up(&self, _email: &str, _password: &str) -> Result<User> {
        Err(not_configured())
    }

    fn sign_in_with_oauth(&self, _provider: OAuthProvider, _id_token: &str) -> Result<User> {
        Err(not_configured())
    }

    fn sign_out(&self) -> Result<()> {
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        None
    }

    fn id_token(&self, _force_refresh: bool) -> Result<Option<String>> {
        Ok(None)
    }
}

fn not_configured() -> OptiBusError {
    OptiBusError::ConfigError("Sign-in is not configured (set OPTIBUS_AUTH_API_KEY)".to_string())
}
