//! Local admin API on a UNIX socket.
//!
//! Every administrative operation the CLI exposes goes through this
//! HTTP/JSON surface. The socket is mode 0600; whoever can open it is
//! root on this box already, authentication happens at the filesystem.
//!
//! Error mapping: validation failures are 400, missing records 404
//! (except delete paths, which treat missing as success), everything
//! else 500 with the operator-facing message.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cluster::Cluster;
use crate::router::DataPlane;
use crate::session::Sessions;
use crate::store::Store;

pub mod client;

pub use client::ControlClient;

#[derive(Clone)]
pub struct ControlState {
    pub store: Store,
    pub sessions: Arc<Sessions>,
    pub cluster: Cluster,
    pub data_plane: Arc<DataPlane>,
    pub config: crate::config::Config,
}

pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, message.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn ok() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

#[must_use]
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/device/list", get(device_list))
        .route("/device/sessions", get(device_sessions))
        .route("/device/lock", post(device_lock))
        .route("/device/unlock", post(device_unlock))
        .route("/device", delete(device_delete))
        .route("/user/lock", post(user_lock))
        .route("/user/unlock", post(user_unlock))
        .route("/user", delete(user_delete))
        .route(
            "/registration",
            get(registration_list)
                .post(registration_create)
                .delete(registration_delete),
        )
        .route("/firewall/rules", get(firewall_rules))
        .route("/firewall/digest", get(firewall_digest))
        .route("/wg/peers", get(wg_peers))
        .route("/version", get(version))
        .route("/admin_user/add", post(admin_add))
        .route("/admin_user/del", post(admin_del))
        .route("/admin_user/lock", post(admin_lock))
        .route("/admin_user/unlock", post(admin_unlock))
        .route("/admin_user/list", get(admin_list))
        .route("/cluster/members", get(cluster_members))
        .route("/cluster/add", post(cluster_add))
        .route("/cluster/drain", post(cluster_drain))
        .route("/cluster/promote", post(cluster_promote))
        .route("/cluster/remove", post(cluster_remove))
        .route("/cluster/step_down", post(cluster_step_down))
        .route("/cluster/errors", get(cluster_errors))
        .route("/cluster/errors/resolve", post(cluster_errors_resolve))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Bind the socket (replacing a stale one), clamp it to 0600, and serve
/// until the shutdown signal.
///
/// # Errors
///
/// Returns an error when the socket cannot be bound or the server fails.
pub async fn serve(
    socket_path: &Path,
    state: ControlState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding control socket {}", socket_path.display()))?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .context("restricting control socket permissions")?;
    }

    info!(socket = %socket_path.display(), "control socket listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("control socket server failed")
}

// ── devices ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub address: Ipv4Addr,
    pub username: String,
    pub public_key: String,
    pub endpoint: Option<std::net::SocketAddr>,
    pub attempts: u32,
    pub state: crate::session::SessionState,
}

#[derive(Debug, Deserialize)]
struct DeviceRef {
    address: Ipv4Addr,
}

async fn device_list(State(state): State<ControlState>) -> ApiResult<Vec<DeviceSummary>> {
    let mut out = Vec::new();
    for device in state.store.all_devices().await? {
        let user = state
            .store
            .get_user(&device.username)
            .await?
            .unwrap_or_default();

        out.push(DeviceSummary {
            address: device.address,
            username: device.username.clone(),
            public_key: device.public_key.clone(),
            endpoint: device.endpoint,
            attempts: device.attempts,
            state: state.sessions.state_of(&user, &device),
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub address: Ipv4Addr,
    pub endpoint: Option<std::net::SocketAddr>,
}

async fn device_sessions(State(state): State<ControlState>) -> ApiResult<Vec<SessionSummary>> {
    let authorised = state
        .data_plane
        .firewall
        .authorised_devices()
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;

    let mut out = Vec::new();
    for address in authorised {
        let endpoint = state
            .store
            .get_device(address)
            .await?
            .and_then(|device| device.endpoint);
        out.push(SessionSummary { address, endpoint });
    }
    Ok(Json(out))
}

async fn device_lock(
    State(state): State<ControlState>,
    Json(body): Json<DeviceRef>,
) -> ApiResult<Value> {
    state.sessions.lock_device(body.address).await?;
    Ok(ok())
}

async fn device_unlock(
    State(state): State<ControlState>,
    Json(body): Json<DeviceRef>,
) -> ApiResult<Value> {
    state.sessions.reset_device(body.address).await?;
    Ok(ok())
}

async fn device_delete(
    State(state): State<ControlState>,
    Json(body): Json<DeviceRef>,
) -> ApiResult<Value> {
    state
        .data_plane
        .delete_device(&state.store, body.address)
        .await?;
    Ok(ok())
}

// ── users ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UserRef {
    username: String,
}

async fn user_lock(
    State(state): State<ControlState>,
    Json(body): Json<UserRef>,
) -> ApiResult<Value> {
    state.sessions.lock_account(&body.username).await?;
    Ok(ok())
}

async fn user_unlock(
    State(state): State<ControlState>,
    Json(body): Json<UserRef>,
) -> ApiResult<Value> {
    state.sessions.unlock_account(&body.username).await?;
    Ok(ok())
}

/// Deleting a user cascades to every device the user owns: peers, table
/// entries, and store records all go.
async fn user_delete(
    State(state): State<ControlState>,
    Json(body): Json<UserRef>,
) -> ApiResult<Value> {
    for device in state.store.devices_for_user(&body.username).await? {
        state
            .data_plane
            .delete_device(&state.store, device.address)
            .await?;
    }

    state
        .data_plane
        .firewall
        .remove_user(&body.username)
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;
    state.store.delete_user(&body.username).await?;
    Ok(ok())
}

// ── registration tokens ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NewRegistration {
    username: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    overwrite: Option<String>,
    #[serde(default = "default_uses")]
    uses: u32,
}

const fn default_uses() -> u32 {
    1
}

async fn registration_list(
    State(state): State<ControlState>,
) -> ApiResult<Vec<crate::store::RegistrationToken>> {
    Ok(Json(state.store.registration_tokens().await?))
}

async fn registration_create(
    State(state): State<ControlState>,
    Json(body): Json<NewRegistration>,
) -> ApiResult<crate::store::RegistrationToken> {
    let token = state
        .store
        .add_registration_token(
            &body.token,
            &body.username,
            body.overwrite,
            body.groups,
            body.uses,
        )
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;

    info!(username = %token.username, "registration token created");
    Ok(Json(token))
}

#[derive(Debug, Deserialize)]
struct TokenRef {
    id: String,
}

async fn registration_delete(
    State(state): State<ControlState>,
    Json(body): Json<TokenRef>,
) -> ApiResult<Value> {
    state.store.delete_registration_token(&body.id).await?;
    info!("registration token deleted");
    Ok(ok())
}

// ── firewall & wireguard ────────────────────────────────────────────

async fn firewall_rules(
    State(state): State<ControlState>,
) -> ApiResult<Vec<crate::firewall::RuleSnapshot>> {
    state
        .data_plane
        .firewall
        .get_rules()
        .map(Json)
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))
}

async fn firewall_digest(State(state): State<ControlState>) -> ApiResult<Value> {
    Ok(Json(json!({
        "digest": state.data_plane.firewall.object_digest()
    })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerSummary {
    pub public_key: String,
    pub address: Option<Ipv4Addr>,
    pub endpoint: Option<std::net::SocketAddr>,
}

async fn wg_peers(State(state): State<ControlState>) -> ApiResult<Vec<PeerSummary>> {
    let peers = state.data_plane.wg.peers()?;
    Ok(Json(
        peers
            .into_iter()
            .map(|peer| PeerSummary {
                public_key: peer.public_key,
                address: peer.address,
                endpoint: peer.endpoint,
            })
            .collect(),
    ))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// ── admin users ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AdminRef {
    username: String,
    #[serde(default)]
    password: String,
}

async fn admin_add(
    State(state): State<ControlState>,
    Json(body): Json<AdminRef>,
) -> ApiResult<Value> {
    state
        .store
        .add_admin(&body.username, &body.password)
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;
    Ok(ok())
}

async fn admin_del(
    State(state): State<ControlState>,
    Json(body): Json<AdminRef>,
) -> ApiResult<Value> {
    state.store.delete_admin(&body.username).await?;
    Ok(ok())
}

async fn admin_lock(
    State(state): State<ControlState>,
    Json(body): Json<AdminRef>,
) -> ApiResult<Value> {
    state
        .store
        .set_admin_lock(&body.username, true)
        .await
        .map_err(|err| ApiError::not_found(format!("{err:#}")))?;
    Ok(ok())
}

async fn admin_unlock(
    State(state): State<ControlState>,
    Json(body): Json<AdminRef>,
) -> ApiResult<Value> {
    state
        .store
        .set_admin_lock(&body.username, false)
        .await
        .map_err(|err| ApiError::not_found(format!("{err:#}")))?;
    Ok(ok())
}

#[derive(Debug, Serialize)]
struct AdminSummary {
    username: String,
    locked: bool,
    added: chrono::DateTime<chrono::Utc>,
}

async fn admin_list(State(state): State<ControlState>) -> ApiResult<Vec<AdminSummary>> {
    Ok(Json(
        state
            .store
            .list_admins()
            .await?
            .into_iter()
            .map(|admin| AdminSummary {
                username: admin.username,
                locked: admin.locked,
                added: admin.added,
            })
            .collect(),
    ))
}

// ── cluster ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NodeRef {
    node: String,
    #[serde(default)]
    drained: Option<bool>,
}

async fn cluster_members(
    State(state): State<ControlState>,
) -> ApiResult<Vec<crate::cluster::NodeInfo>> {
    Ok(Json(state.cluster.members().await?))
}

async fn cluster_add(
    State(state): State<ControlState>,
    Json(body): Json<crate::cluster::join::NewNodeRequest>,
) -> ApiResult<crate::cluster::join::NewNodeResponse> {
    let token = state
        .cluster
        .add_member(
            &body.node_name,
            &body.connection_url,
            &body.manager_url,
            &state.config,
        )
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;
    Ok(Json(crate::cluster::join::NewNodeResponse {
        join_token: token,
    }))
}

async fn cluster_drain(
    State(state): State<ControlState>,
    Json(body): Json<NodeRef>,
) -> ApiResult<Value> {
    let drained = body.drained.unwrap_or(true);
    state
        .cluster
        .set_drained(&body.node, drained)
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;

    if body.node == state.cluster.node_id() {
        state.sessions.set_drained(drained);
    }
    Ok(ok())
}

async fn cluster_promote(
    State(state): State<ControlState>,
    Json(body): Json<NodeRef>,
) -> ApiResult<Value> {
    state
        .cluster
        .promote(&body.node)
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;
    Ok(ok())
}

async fn cluster_remove(
    State(state): State<ControlState>,
    Json(body): Json<NodeRef>,
) -> ApiResult<Value> {
    state
        .cluster
        .remove(&body.node)
        .await
        .map_err(|err| ApiError::bad_request(format!("{err:#}")))?;
    Ok(ok())
}

async fn cluster_step_down(State(state): State<ControlState>) -> ApiResult<Value> {
    state.cluster.step_down().await?;
    Ok(ok())
}

async fn cluster_errors(
    State(state): State<ControlState>,
) -> ApiResult<Vec<crate::store::EventError>> {
    Ok(Json(state.store.all_errors().await?))
}

#[derive(Debug, Deserialize)]
struct ErrorRef {
    error_id: String,
}

async fn cluster_errors_resolve(
    State(state): State<ControlState>,
    Json(body): Json<ErrorRef>,
) -> ApiResult<Value> {
    state.store.resolve_error(&body.error_id).await?;
    Ok(ok())
}
