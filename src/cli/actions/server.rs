//! The `start` action: bring the whole gateway up, run until a signal or
//! a fatal data-plane error, then tear down.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::clock::{BootClock, Clock};
use crate::cluster::health::HealthMonitor;
use crate::cluster::Cluster;
use crate::config::Config;
use crate::control::{self, ControlState};
use crate::mfa::{self, Registry};
use crate::router::DataPlane;
use crate::session::Sessions;
use crate::store::Store;

pub struct Args {
    pub config_path: PathBuf,
}

/// Run the daemon.
///
/// # Errors
///
/// Returns an error when startup fails or a fatal runtime error forces
/// the process down; either way the data plane is torn down first.
pub async fn execute(args: Args) -> Result<()> {
    let config = Config::load(&args.config_path)?;
    info!(
        config = %args.config_path.display(),
        interface = %config.wireguard.dev_name,
        "starting gateway"
    );

    // 1. Coordination store first; everything else replays from it.
    let store = Store::connect(&config.clustering.client_endpoints).await?;
    store
        .bootstrap(&config)
        .await
        .context("seeding replicated configuration")?;

    // 2. Data plane: decision table, WireGuard device, host firewall.
    let clock: Arc<dyn Clock> = Arc::new(BootClock);
    let data_plane = Arc::new(DataPlane::setup(&config, &store, clock).await?);

    let sessions = Arc::new(Sessions::new(
        store.clone(),
        Arc::clone(&data_plane.firewall),
    ));

    // 3. MFA methods from replicated settings.
    let registry = Arc::new(Registry::new(store.clone()));
    if let Err(err) = registry.init_from_store().await {
        warn!("unable to initialise MFA methods: {err:#}");
    }

    // 4. Watchers and replicated-event listeners.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(16);
    data_plane
        .start_watcher(store.clone(), fatal_tx.clone())
        .await?;
    data_plane.register_events(&store, &registry).await?;

    // 5. Cluster health and drain state.
    let cluster = Cluster::new(store.clone(), &config);
    let node_id = cluster.node_id();
    sessions.set_drained(cluster.is_drained(&node_id).await.unwrap_or(false));
    watch_drain_flag(&store, &sessions, &node_id).await;

    let health = HealthMonitor::spawn(
        cluster.clone(),
        Duration::from_millis(config.clustering.election_timeout_ms),
    );
    spawn_health_logger(&health);

    // 6. HTTP surfaces: tunnel MFA, public enrollment, control socket.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    serve_tunnel_endpoint(
        &config,
        mfa::AppState {
            store: store.clone(),
            sessions: Arc::clone(&sessions),
            registry: Arc::clone(&registry),
        },
        fatal_tx.clone(),
        shutdown_rx.clone(),
    )
    .await?;

    serve_enrollment_endpoint(
        &config,
        EnrollState {
            store: store.clone(),
            data_plane: Arc::clone(&data_plane),
            config: config.clone(),
        },
        fatal_tx.clone(),
        shutdown_rx.clone(),
    )
    .await?;

    let control_state = ControlState {
        store: store.clone(),
        sessions: Arc::clone(&sessions),
        cluster,
        data_plane: Arc::clone(&data_plane),
        config: config.clone(),
    };
    {
        let socket_path = config.control_socket_path.clone();
        let fatal = fatal_tx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = control::serve(&socket_path, control_state, shutdown).await {
                let _ = fatal.send(err).await;
            }
        });
    }

    info!(node = %node_id, "gateway ready");

    // 7. Run until told otherwise.
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        Some(err) = fatal_rx.recv() => {
            error!("fatal: {err:#}");
            Err(err)
        }
    };

    let _ = shutdown_tx.send(true);
    health.shutdown().await;
    data_plane.tear_down(outcome.is_err()).await;

    outcome
}

fn spawn_health_logger(health: &HealthMonitor) {
    let mut receiver = health.subscribe();
    tokio::spawn(async move {
        let mut last = None;
        while let Ok(status) = receiver.recv().await {
            if last != Some(status) {
                info!(%status, "cluster health changed");
                last = Some(status);
            }
        }
    });
}

/// Keep the node's drain flag live; the control API toggles it anywhere
/// in the cluster, the refusal has to happen here.
async fn watch_drain_flag(store: &Store, sessions: &Arc<Sessions>, node_id: &str) {
    let sessions = Arc::clone(sessions);
    let key = format!("{}{}/drain", crate::store::NODE_PREFIX, node_id);

    let registered = store
        .register_event_listener::<bool, _, _>(key, false, move |_key, _value, _previous, event| {
            let sessions = Arc::clone(&sessions);
            async move {
                sessions.set_drained(event != crate::store::EventType::Deleted);
                Ok(())
            }
        })
        .await;

    if let Err(err) = registered {
        warn!("unable to watch drain flag: {err:#}");
    }
}

async fn serve_tunnel_endpoint(
    config: &Config,
    state: mfa::AppState,
    fatal: mpsc::Sender<anyhow::Error>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let address = SocketAddr::new(
        IpAddr::V4(config.server_address()?),
        config.webserver.tunnel_port,
    );
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding tunnel MFA endpoint {address}"))?;
    info!(%address, "tunnel MFA endpoint listening");

    let app = mfa::router(state);
    tokio::spawn(async move {
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });

        if let Err(err) = serve.await {
            let _ = fatal
                .send(anyhow::Error::from(err).context("tunnel MFA endpoint failed"))
                .await;
        }
    });

    Ok(())
}

// ── public enrollment ───────────────────────────────────────────────

#[derive(Clone)]
struct EnrollState {
    store: Store,
    data_plane: Arc<DataPlane>,
    config: Config,
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    token: String,
    public_key: String,
}

async fn register_device(
    State(state): State<EnrollState>,
    Json(body): Json<EnrollRequest>,
) -> impl IntoResponse {
    match state
        .data_plane
        .enroll_device(&state.store, &body.token, &body.public_key)
        .await
    {
        Ok(device) => {
            let details = state.data_plane.wg.server_details();
            let (server_key, port) = details.unwrap_or_default();
            let network = state
                .config
                .tunnel_network()
                .map(|network| network.to_string())
                .unwrap_or_default();

            (
                StatusCode::OK,
                Json(json!({
                    "address": device.address,
                    "server_public_key": server_key,
                    "server_port": port,
                    "tunnel_network": network,
                })),
            )
        }
        Err(err) => {
            warn!("enrollment failed: {err:#}");
            // Token validity is not disclosed beyond pass/fail.
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "Validation failed" })),
            )
        }
    }
}

async fn serve_enrollment_endpoint(
    config: &Config,
    state: EnrollState,
    fatal: mpsc::Sender<anyhow::Error>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], config.webserver.registration_port));
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding enrollment endpoint {address}"))?;
    info!(%address, "enrollment endpoint listening");

    let app = Router::new()
        .route("/register_device", post(register_device))
        .with_state(state);

    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });

        if let Err(err) = serve.await {
            let _ = fatal
                .send(anyhow::Error::from(err).context("enrollment endpoint failed"))
                .await;
        }
    });

    Ok(())
}
