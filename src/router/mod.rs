//! Data-plane ownership.
//!
//! [`DataPlane::setup`] acquires the process singletons in order: decision
//! table (kernel or in-process), WireGuard interface, host-firewall
//! scaffolding; then replays the replicated state into them. Teardown
//! releases them in reverse. A failed setup tears down whatever was
//! already acquired, forced, before returning the error.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{minutes_to_ns, Config};
use crate::firewall::{Firewall, FirewallError, MemoryTables, Settings, Tables};
use crate::mfa::Registry;
use crate::store::{Device, RuntimeSettings, Store};

pub mod events;
pub mod nat;
pub mod watcher;
pub mod wireguard;

pub use wireguard::{next_address, AllocError, PeerView, WgDevice};

pub struct DataPlane {
    pub firewall: Arc<Firewall>,
    pub wg: Arc<WgDevice>,
    config: Config,
    watcher_stop: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Option<events::Handles>>,
    nat_installed: AtomicBool,
}

impl DataPlane {
    /// Bring up the data path and replay the replicated state into it.
    ///
    /// # Errors
    ///
    /// Returns the failing step's error after force-tearing-down whatever
    /// was already acquired.
    pub async fn setup(config: &Config, store: &Store, clock: Arc<dyn Clock>) -> Result<Self> {
        match Self::build(config, store, clock).await {
            Ok(plane) => Ok(plane),
            Err(err) => {
                // Partial acquisitions must not outlive a failed setup.
                nat::teardown(config);
                Err(err)
            }
        }
    }

    async fn build(config: &Config, store: &Store, clock: Arc<dyn Clock>) -> Result<Self> {
        let settings = store
            .get_settings()
            .await?
            .unwrap_or_else(|| RuntimeSettings::from_config(config));

        let tables: Box<dyn Tables> = match &config.xdp_object_path {
            Some(path) => Box::new(crate::firewall::xdp::XdpTables::load(
                path,
                &config.wireguard.dev_name,
            )?),
            None => {
                warn!("no XDP object configured; kernel enforcement is disabled");
                Box::new(MemoryTables::new())
            }
        };

        let firewall = Arc::new(Firewall::new(
            tables,
            clock,
            Settings {
                inactivity_ns: minutes_to_ns(settings.session_inactivity_timeout_minutes),
                session_lifetime_ns: minutes_to_ns(settings.max_session_lifetime_minutes),
                lockout: settings.lockout,
            },
        )?);

        // Users first: a device without its user is a table corruption.
        let users = store.all_users().await.context("loading initial users")?;
        for user in &users {
            let acl = store.effective_acl(&user.username).await?;
            firewall
                .add_user(&user.username, &acl)
                .with_context(|| format!("installing user {}", user.username))?;
            if user.locked {
                firewall.set_user_lock(&user.username, true)?;
            }
        }

        let devices = store
            .all_devices()
            .await
            .context("loading initial devices")?;
        for device in &devices {
            firewall
                .add_device(&device.username, device.address)
                .with_context(|| format!("installing device {}", device.address))?;
        }

        let wg = Arc::new(WgDevice::setup(config, &devices)?);

        if let Err(err) = nat::setup(config) {
            // Half a data plane is worse than none; drop the interface
            // before reporting.
            if !config.wireguard.external {
                if let Err(cleanup) = wg.remove() {
                    warn!("unable to remove interface after failed setup: {cleanup:#}");
                }
            }
            return Err(err);
        }

        info!(
            users = users.len(),
            devices = devices.len(),
            "data plane ready"
        );

        let (watcher_stop, _) = watch::channel(false);
        Ok(Self {
            firewall,
            wg,
            config: config.clone(),
            watcher_stop,
            watcher: Mutex::new(None),
            listeners: Mutex::new(None),
            nat_installed: AtomicBool::new(true),
        })
    }

    /// Start the endpoint watcher, seeding its cache with the endpoints
    /// the store already knows so startup does not read as a mass roam.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial device list cannot be read.
    pub async fn start_watcher(
        &self,
        store: Store,
        errors: mpsc::Sender<anyhow::Error>,
    ) -> Result<()> {
        let initial = store
            .all_devices()
            .await?
            .into_iter()
            .map(|device| (device.address, device.endpoint))
            .collect();

        let handle = watcher::spawn(
            Arc::clone(&self.wg),
            Arc::clone(&self.firewall),
            store,
            initial,
            errors,
            self.watcher_stop.subscribe(),
        );
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Subscribe to replicated events; kept until teardown.
    ///
    /// # Errors
    ///
    /// Returns an error when a watch cannot be established.
    pub async fn register_events(&self, store: &Store, registry: &Arc<Registry>) -> Result<()> {
        let handles = events::register(store, &self.firewall, &self.wg, registry).await?;
        *self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handles);
        Ok(())
    }

    /// Redeem a registration token: create or update the user, allocate a
    /// tunnel address (or overwrite an existing device's key), and bring
    /// kernel, WireGuard, and store into agreement.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid tokens, exhausted networks, or any
    /// failing step; partially applied steps are rolled back.
    pub async fn enroll_device(
        &self,
        store: &Store,
        token: &str,
        public_key: &str,
    ) -> Result<Device> {
        let token = store.redeem_registration_token(token).await?;
        let username = token.username.clone();

        if store.get_user(&username).await?.is_none() {
            store
                .put_user(&crate::store::User {
                    username: username.clone(),
                    groups: token.groups.clone(),
                    ..Default::default()
                })
                .await?;
        }
        for group in &token.groups {
            store.add_group_member(group, &username).await?;
        }

        let acl = store.effective_acl(&username).await?;
        match self.firewall.add_user(&username, &acl) {
            Ok(()) | Err(FirewallError::UserExists) => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(overwrites) = &token.overwrites {
            return self
                .overwrite_device(store, overwrites, &username, public_key)
                .await;
        }

        let network = self.config.tunnel_network()?;
        let server = self.config.server_address()?;
        let existing: Vec<Ipv4Addr> = store
            .all_devices()
            .await?
            .iter()
            .map(|device| device.address)
            .collect();
        let address = next_address(&existing, network, server)?;

        let device = Device {
            address,
            public_key: public_key.to_string(),
            username,
            endpoint: None,
            attempts: 0,
            active: true,
        };

        self.wg.add_peer(&device)?;

        if let Err(err) = self.firewall.add_device(&device.username, address) {
            if let Err(cleanup) = self.wg.remove_peer_by_address(address) {
                warn!(%address, "unable to roll back peer: {cleanup:#}");
            }
            return Err(err.into());
        }

        if let Err(err) = store.create_device(&device).await {
            // The table and kernel must not keep a device the cluster
            // never learned about.
            if let Err(cleanup) = self.firewall.remove_device(address) {
                warn!(%address, "unable to roll back table entry: {cleanup:#}");
            }
            if let Err(cleanup) = self.wg.remove_peer_by_address(address) {
                warn!(%address, "unable to roll back peer: {cleanup:#}");
            }
            return Err(err);
        }

        info!(address = %device.address, user = %device.username, "device enrolled");
        Ok(device)
    }

    async fn overwrite_device(
        &self,
        store: &Store,
        address: &str,
        username: &str,
        public_key: &str,
    ) -> Result<Device> {
        let address: Ipv4Addr = address
            .parse()
            .with_context(|| format!("overwrite target {address} is not an IPv4 address"))?;

        let mut device = store
            .get_device(address)
            .await?
            .ok_or_else(|| anyhow!("overwrite target {address} is not registered"))?;

        if device.username != username {
            return Err(anyhow!("overwrite target belongs to a different user"));
        }

        if let Err(err) = self.wg.remove_peer_by_address(address) {
            warn!(%address, "previous peer missing during overwrite: {err:#}");
        }

        device.public_key = public_key.to_string();
        device.endpoint = None;
        self.wg.add_peer(&device)?;

        store
            .put_json(crate::store::devices::device_key(address), &device)
            .await?;
        Ok(device)
    }

    /// Remove a device everywhere: WireGuard peer, kernel entry, store
    /// record. Partial failures report the intent and the failing step.
    ///
    /// # Errors
    ///
    /// Returns an error naming each failing step.
    pub async fn delete_device(&self, store: &Store, address: Ipv4Addr) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(err) = self.wg.remove_peer_by_address(address) {
            failures.push(format!("wireguard peer: {err:#}"));
        }
        if let Err(err) = self.firewall.remove_device(address) {
            failures.push(format!("decision table: {err}"));
        }
        match store.delete_device(address).await {
            Ok(_) => {}
            Err(err) => failures.push(format!("store record: {err:#}")),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "removing device {address} partially failed: {}",
                failures.join("; ")
            ))
        }
    }

    /// Release the data plane. An unforced teardown signals the watcher
    /// and waits for it; a forced one skips the signal because the task
    /// may already be gone.
    pub async fn tear_down(&self, force: bool) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = watcher {
            if force {
                handle.abort();
            } else {
                let _ = self.watcher_stop.send(true);
                if let Err(err) = handle.await {
                    warn!("endpoint watcher did not stop cleanly: {err}");
                }
            }
        }

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listeners) = listeners {
            listeners.deregister();
        }

        if self.nat_installed.swap(false, Ordering::SeqCst) {
            nat::teardown(&self.config);
        }

        if !self.config.wireguard.external {
            info!("removing wireguard device");
            if let Err(err) = self.wg.remove() {
                error!("unable to remove wireguard device: {err:#}");
            }
        }
    }
}
