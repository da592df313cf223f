//! MFA plug-in registry.
//!
//! Four methods exist, fixed at compile time: `totp`, `webauthn`, `oidc`,
//! and `pam`. A method is a tagged variant with one capability set; the
//! registry owns enablement behind a reader-writer lock and mounts every
//! method's handlers under `/register_mfa/<method>/` and
//! `/authorise/<method>/`. Handlers of disabled methods answer 404, the
//! same as unknown paths, so probing reveals nothing.
//!
//! The registry drives the session state machine: a method only verifies
//! the challenge, the wrapper here records failures and flips the session
//! on success.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::session::{AuthError, Sessions};
use crate::store::{Device, Store, User};

pub mod oidc;
pub mod pam;
pub mod totp;
pub mod webauthn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    Totp,
    Webauthn,
    Oidc,
    Pam,
}

impl MethodKind {
    pub const ALL: [Self; 4] = [Self::Totp, Self::Webauthn, Self::Oidc, Self::Pam];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Webauthn => "webauthn",
            Self::Oidc => "oidc",
            Self::Pam => "pam",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "totp" => Some(Self::Totp),
            "webauthn" => Some(Self::Webauthn),
            "oidc" => Some(Self::Oidc),
            "pam" => Some(Self::Pam),
            _ => None,
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a GET on an authorise endpoint produced: either data the UI needs
/// to render the challenge, or (for redirect-based methods whose provider
/// calls back into the same path) a completed authorization.
pub enum PromptOutcome {
    Ui(Value),
    Authorized,
}

/// The capability set every method implements.
pub enum Method {
    Totp(totp::Totp),
    Webauthn(webauthn::WebauthnMethod),
    Oidc(oidc::Oidc),
    Pam(pam::Pam),
}

impl Method {
    fn new(kind: MethodKind) -> Self {
        match kind {
            MethodKind::Totp => Self::Totp(totp::Totp::default()),
            MethodKind::Webauthn => Self::Webauthn(webauthn::WebauthnMethod::default()),
            MethodKind::Oidc => Self::Oidc(oidc::Oidc::default()),
            MethodKind::Pam => Self::Pam(pam::Pam::default()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> MethodKind {
        match self {
            Self::Totp(_) => MethodKind::Totp,
            Self::Webauthn(_) => MethodKind::Webauthn,
            Self::Oidc(_) => MethodKind::Oidc,
            Self::Pam(_) => MethodKind::Pam,
        }
    }

    #[must_use]
    pub fn friendly_name(&self) -> &'static str {
        match self {
            Self::Totp(_) => "Time based code",
            Self::Webauthn(_) => "Security key",
            Self::Oidc(_) => "Single sign-on",
            Self::Pam(_) => "System password",
        }
    }

    /// Path that ends the method's own session, if it keeps one.
    #[must_use]
    pub fn logout_path(&self) -> &'static str {
        match self {
            Self::Oidc(_) => "/authorise/oidc/logout",
            _ => "/",
        }
    }

    /// Rebuild per-method state from the replicated settings. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings are missing or unusable.
    pub async fn init(&self, store: &Store) -> Result<()> {
        match self {
            Self::Totp(method) => method.init(store).await,
            Self::Webauthn(method) => method.init(store).await,
            Self::Oidc(method) => method.init(store).await,
            Self::Pam(method) => method.init(store).await,
        }
    }

    async fn prompt(
        &self,
        store: &Store,
        user: &User,
        device: &Device,
        query: &HashMap<String, String>,
    ) -> Result<PromptOutcome, AuthError> {
        match self {
            Self::Totp(method) => method.prompt(user).await,
            Self::Webauthn(method) => method.prompt(user).await,
            Self::Oidc(method) => method.prompt(store, user, device, query).await,
            Self::Pam(method) => method.prompt(user).await,
        }
    }

    async fn authorize(
        &self,
        store: &Store,
        user: &User,
        _device: &Device,
        body: &Value,
    ) -> Result<(), AuthError> {
        match self {
            Self::Totp(method) => method.authorize(user, body).await,
            Self::Webauthn(method) => method.authorize(user, body).await,
            Self::Oidc(method) => method.authorize(user, body).await,
            Self::Pam(method) => method.authorize(store, user, body).await,
        }
    }

    async fn registration_prompt(&self, user: &User, device: &Device) -> Result<Value, AuthError> {
        match self {
            Self::Totp(method) => method.registration_prompt(user).await,
            Self::Webauthn(method) => method.registration_prompt(user).await,
            Self::Oidc(method) => method.registration_prompt(user, device).await,
            Self::Pam(method) => method.registration_prompt(user).await,
        }
    }

    /// Returns the secret blob to persist on success.
    async fn register(
        &self,
        store: &Store,
        user: &User,
        body: &Value,
    ) -> Result<String, AuthError> {
        match self {
            Self::Totp(method) => method.register(user, body).await,
            Self::Webauthn(method) => method.register(user, body).await,
            Self::Oidc(method) => method.register(store, user, body).await,
            Self::Pam(method) => method.register(store, user, body).await,
        }
    }
}

struct Entry {
    method: Arc<Method>,
    enabled: bool,
}

/// Enablement-gated method registry.
pub struct Registry {
    methods: RwLock<HashMap<MethodKind, Entry>>,
    store: Store,
}

impl Registry {
    #[must_use]
    pub fn new(store: Store) -> Self {
        let mut methods = HashMap::new();
        for kind in MethodKind::ALL {
            methods.insert(
                kind,
                Entry {
                    method: Arc::new(Method::new(kind)),
                    enabled: false,
                },
            );
        }

        Self {
            methods: RwLock::new(methods),
            store,
        }
    }

    /// Initialise and enable the replicated method set.
    ///
    /// # Errors
    ///
    /// Returns an error when the enablement list cannot be read; a method
    /// that fails to init is logged and left disabled.
    pub async fn init_from_store(&self) -> Result<()> {
        let enabled = self.store.enabled_methods().await?;
        self.sync_enabled(&enabled).await
    }

    /// Make enablement match `methods`: init+enable the listed ones,
    /// disable the rest. `init` may be expensive, so the writer lock is
    /// held across it on purpose (handlers must not observe a half
    /// initialised enabled method).
    ///
    /// # Errors
    ///
    /// Never fails outright; init failures are logged and the method left
    /// disabled. The signature stays fallible for the event-handler
    /// contract.
    pub async fn sync_enabled(&self, methods: &[String]) -> Result<()> {
        let wanted: Vec<MethodKind> = methods.iter().filter_map(|m| MethodKind::parse(m)).collect();

        for unknown in methods
            .iter()
            .filter(|name| MethodKind::parse(name).is_none())
        {
            warn!("ignoring unknown MFA method {unknown}");
        }

        let mut entries = self.methods.write().await;
        for (kind, entry) in entries.iter_mut() {
            if wanted.contains(kind) {
                match entry.method.init(&self.store).await {
                    Ok(()) => {
                        if !entry.enabled {
                            info!("enabled MFA method {kind}");
                        }
                        entry.enabled = true;
                    }
                    Err(err) => {
                        warn!("failed to initialise method {kind}: {err:#}");
                        entry.enabled = false;
                    }
                }
            } else if entry.enabled {
                info!("disabled MFA method {kind}");
                entry.enabled = false;
            }
        }
        Ok(())
    }

    /// Re-run a method's init after its replicated settings changed.
    ///
    /// # Errors
    ///
    /// Returns the init error so it is persisted as an event error.
    pub async fn reinitialize(&self, method: &str) -> Result<()> {
        let Some(kind) = MethodKind::parse(method) else {
            return Err(anyhow!("unknown MFA method {method}"));
        };

        let mut entries = self.methods.write().await;
        if let Some(entry) = entries.get_mut(&kind) {
            if entry.enabled {
                entry.method.init(&self.store).await?;
            }
        }
        Ok(())
    }

    /// Fetch a method only when it is enabled; disabled and unknown are
    /// indistinguishable to the caller.
    pub async fn get(&self, name: &str) -> Option<Arc<Method>> {
        let kind = MethodKind::parse(name)?;
        let entries = self.methods.read().await;
        entries
            .get(&kind)
            .filter(|entry| entry.enabled)
            .map(|entry| Arc::clone(&entry.method))
    }

    pub async fn enabled_kinds(&self) -> Vec<MethodKind> {
        let entries = self.methods.read().await;
        let mut kinds: Vec<MethodKind> = entries
            .iter()
            .filter(|(_, entry)| entry.enabled)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

/// Shared state of the tunnel-side MFA endpoint.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: Arc<Sessions>,
    pub registry: Arc<Registry>,
}

/// Build the tunnel-side router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the peer's
/// tunnel address is its identity.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/authorise/{method}/",
            get(authorize_prompt).post(authorize_submit),
        )
        .route(
            "/register_mfa/{method}/",
            get(register_prompt).post(register_submit),
        )
        .route("/status/", get(status))
        .with_state(state)
}

#[derive(Serialize)]
struct StatusBody {
    address: String,
    username: String,
    state: crate::session::SessionState,
    methods: Vec<&'static str>,
}

struct HttpError(StatusCode, String);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "status": self.1 }))).into_response()
    }
}

fn not_found() -> HttpError {
    HttpError(StatusCode::NOT_FOUND, "404 page not found".to_string())
}

async fn help_mail(store: &Store) -> String {
    match store.get_settings().await {
        Ok(Some(settings)) => settings.help_mail,
        _ => String::new(),
    }
}

async fn auth_failure(state: &AppState, err: &AuthError) -> HttpError {
    HttpError(
        StatusCode::BAD_REQUEST,
        err.user_message(&help_mail(&state.store).await),
    )
}

/// Resolve the caller from its tunnel source address.
async fn identify(state: &AppState, peer: SocketAddr) -> Result<(User, Device), HttpError> {
    let IpAddr::V4(address) = peer.ip() else {
        return Err(not_found());
    };

    let device = state
        .store
        .get_device(address)
        .await
        .ok()
        .flatten()
        .ok_or_else(not_found)?;
    let user = state
        .store
        .get_user(&device.username)
        .await
        .ok()
        .flatten()
        .ok_or_else(not_found)?;

    Ok((user, device))
}

async fn method_for(state: &AppState, name: &str) -> Result<Arc<Method>, HttpError> {
    state.registry.get(name).await.ok_or_else(not_found)
}

async fn authorize_prompt(
    State(state): State<AppState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, HttpError> {
    let method = method_for(&state, &method).await?;
    let (user, device) = identify(&state, peer).await?;

    match method.prompt(&state.store, &user, &device, &query).await {
        Ok(PromptOutcome::Ui(value)) => Ok(Json(value)),
        Ok(PromptOutcome::Authorized) => {
            finish_authorization(&state, &user, &device).await?;
            Ok(Json(serde_json::json!({ "status": "OK" })))
        }
        Err(err) => Err(auth_failure(&state, &err).await),
    }
}

async fn authorize_submit(
    State(state): State<AppState>,
    Path(method): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let method = method_for(&state, &method).await?;
    let (user, device) = identify(&state, peer).await?;

    match method.authorize(&state.store, &user, &device, &body).await {
        Ok(()) => {
            finish_authorization(&state, &user, &device).await?;
            Ok(Json(serde_json::json!({ "status": "OK" })))
        }
        Err(err) => {
            if let Err(record) = state.sessions.record_failure(device.address).await {
                warn!(address = %device.address, "unable to record failed attempt: {record:#}");
            }
            Err(auth_failure(&state, &err).await)
        }
    }
}

async fn finish_authorization(
    state: &AppState,
    user: &User,
    device: &Device,
) -> Result<(), HttpError> {
    // The method must have been registered by this user before it can
    // authorize them.
    if user.mfa_secret.is_empty() {
        return Err(auth_failure(
            state,
            &AuthError::Validation(anyhow!("user has not completed registration")),
        )
        .await);
    }

    match state.sessions.authorize(device.address).await {
        Ok(()) => {
            info!(user = %user.username, address = %device.address, "authorized");
            Ok(())
        }
        Err(err) => Err(auth_failure(state, &err).await),
    }
}

async fn register_prompt(
    State(state): State<AppState>,
    Path(method): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<Value>, HttpError> {
    let method = method_for(&state, &method).await?;
    let (user, device) = identify(&state, peer).await?;

    if user.enforcing {
        return Err(auth_failure(
            &state,
            &AuthError::Validation(anyhow!("user is already enforcing MFA")),
        )
        .await);
    }

    match method.registration_prompt(&user, &device).await {
        Ok(value) => Ok(Json(value)),
        Err(err) => Err(auth_failure(&state, &err).await),
    }
}

async fn register_submit(
    State(state): State<AppState>,
    Path(method): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let method = method_for(&state, &method).await?;
    let (user, device) = identify(&state, peer).await?;

    if user.enforcing {
        return Err(auth_failure(
            &state,
            &AuthError::Validation(anyhow!("user is already enforcing MFA")),
        )
        .await);
    }

    match method.register(&state.store, &user, &body).await {
        Ok(secret) => {
            state
                .sessions
                .complete_registration(&user.username, method.kind().as_str(), &secret)
                .await
                .map_err(|err| {
                    HttpError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
                })?;
            info!(user = %user.username, method = %method.kind(), "MFA registration complete");
            Ok(Json(serde_json::json!({ "status": "OK" })))
        }
        Err(err) => Err(auth_failure(&state, &err).await),
    }
}

async fn status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<StatusBody>, HttpError> {
    let (user, device) = identify(&state, peer).await?;

    let methods = state
        .registry
        .enabled_kinds()
        .await
        .into_iter()
        .map(MethodKind::as_str)
        .collect();

    Ok(Json(StatusBody {
        address: device.address.to_string(),
        username: user.username.clone(),
        state: state.sessions.state_of(&user, &device),
        methods,
    }))
}
