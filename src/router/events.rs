//! Replicated-event wiring for the data plane.
//!
//! Every node applies device, user, ACL, group, and configuration events
//! from the coordination store to its own kernel table and WireGuard
//! device, so any node can answer for any peer. Handlers are idempotent:
//! the node that originated a mutation already applied it locally and will
//! see its own event again.

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use crate::firewall::{Firewall, FirewallError};
use crate::mfa::Registry;
use crate::store::settings::{METHODS_KEY, SETTINGS_KEY};
use crate::store::{
    AclRule, Device, EventType, RuntimeSettings, Store, User, ACLS_PREFIX,
    AUTHENTICATION_PREFIX, DEVICES_PREFIX, GROUPS_PREFIX, USERS_PREFIX,
};
use std::sync::Arc;

/// Listener registrations held for the lifetime of the data plane.
pub struct Handles {
    store: Store,
    keys: Vec<String>,
}

impl Handles {
    pub fn deregister(self) {
        for key in &self.keys {
            self.store.deregister_event_listener(key);
        }
    }
}

/// Subscribe to every namespace the data plane cares about.
///
/// # Errors
///
/// Returns an error when a watch cannot be established.
pub async fn register(
    store: &Store,
    firewall: &Arc<Firewall>,
    wg: &Arc<super::wireguard::WgDevice>,
    registry: &Arc<Registry>,
) -> Result<Handles> {
    let mut keys = Vec::new();

    keys.push(device_listener(store, firewall, wg).await?);
    keys.push(user_listener(store, firewall).await?);
    keys.push(acl_listener(store, firewall).await?);
    keys.push(group_listener(store, firewall).await?);
    keys.push(settings_listener(store, firewall).await?);
    keys.push(methods_listener(store, registry).await?);
    keys.push(method_settings_listener(store, registry).await?);

    Ok(Handles {
        store: store.clone(),
        keys,
    })
}

async fn device_listener(
    store: &Store,
    firewall: &Arc<Firewall>,
    wg: &Arc<super::wireguard::WgDevice>,
) -> Result<String> {
    let firewall = Arc::clone(firewall);
    let wg = Arc::clone(wg);
    let store_handle = store.clone();

    store
        .register_event_listener::<Device, _, _>(DEVICES_PREFIX, true, move |_key, device, _previous, event| {
            let firewall = Arc::clone(&firewall);
            let wg = Arc::clone(&wg);
            let store = store_handle.clone();

            async move {
                match event {
                    EventType::Created => {
                        ensure_user(&store, &firewall, &device.username).await?;

                        match firewall.add_device(&device.username, device.address) {
                            Ok(()) | Err(FirewallError::DeviceExists(_)) => {}
                            Err(err) => return Err(err.into()),
                        }
                        wg.add_peer(&device)?;
                    }
                    EventType::Modified => {
                        // A counter pushed past the threshold anywhere in
                        // the cluster ends the session here too.
                        if device.attempts >= firewall.settings().lockout {
                            match firewall.deauthenticate(device.address) {
                                Ok(()) | Err(FirewallError::UnknownDevice(_)) => {}
                                Err(err) => return Err(err.into()),
                            }
                        }
                    }
                    EventType::Deleted => {
                        if let Err(err) = wg.remove_peer_by_address(device.address) {
                            debug!(address = %device.address, "peer already gone: {err:#}");
                        }
                        firewall.remove_device(device.address)?;
                    }
                }
                Ok(())
            }
        })
        .await
}

async fn user_listener(store: &Store, firewall: &Arc<Firewall>) -> Result<String> {
    let firewall = Arc::clone(firewall);
    let store_handle = store.clone();

    store
        .register_event_listener::<User, _, _>(USERS_PREFIX, true, move |_key, user, previous, event| {
            let firewall = Arc::clone(&firewall);
            let store = store_handle.clone();

            async move {
                match event {
                    EventType::Created => {
                        ensure_user(&store, &firewall, &user.username).await?;
                        firewall.set_user_lock(&user.username, user.locked)?;
                    }
                    EventType::Modified => {
                        let previous = previous.unwrap_or_default();

                        if user.locked != previous.locked {
                            firewall.set_user_lock(&user.username, user.locked)?;
                        }
                        if user.groups != previous.groups {
                            refresh_users(&store, &firewall, [user.username.clone()]).await?;
                        }
                    }
                    EventType::Deleted => {
                        firewall.remove_user(&user.username)?;
                    }
                }
                Ok(())
            }
        })
        .await
}

async fn acl_listener(store: &Store, firewall: &Arc<Firewall>) -> Result<String> {
    let firewall = Arc::clone(firewall);
    let store_handle = store.clone();

    store
        .register_event_listener::<AclRule, _, _>(ACLS_PREFIX, true, move |key, _rule, _previous, _event| {
            let firewall = Arc::clone(&firewall);
            let store = store_handle.clone();

            async move {
                let policy = key.trim_start_matches(ACLS_PREFIX).to_string();
                let affected = affected_users(&store, &policy).await?;
                refresh_users(&store, &firewall, affected).await
            }
        })
        .await
}

async fn group_listener(store: &Store, firewall: &Arc<Firewall>) -> Result<String> {
    let firewall = Arc::clone(firewall);
    let store_handle = store.clone();

    store
        .register_event_listener::<Vec<String>, _, _>(
            GROUPS_PREFIX,
            true,
            move |_key, members, previous, _event| {
                let firewall = Arc::clone(&firewall);
                let store = store_handle.clone();

                async move {
                    // Users leaving the group need their ACLs rebuilt just
                    // as much as the ones joining it.
                    let mut affected = members;
                    affected.extend(previous.unwrap_or_default());
                    affected.sort();
                    affected.dedup();

                    refresh_users(&store, &firewall, affected).await
                }
            },
        )
        .await
}

async fn settings_listener(store: &Store, firewall: &Arc<Firewall>) -> Result<String> {
    let firewall = Arc::clone(firewall);
    let store_handle = store.clone();

    store
        .register_event_listener::<RuntimeSettings, _, _>(
            SETTINGS_KEY,
            false,
            move |_key, settings, _previous, _event| {
                let firewall = Arc::clone(&firewall);
                let store = store_handle.clone();

                async move {
                    let new_settings = crate::firewall::Settings {
                        inactivity_ns: crate::config::minutes_to_ns(
                            settings.session_inactivity_timeout_minutes,
                        ),
                        session_lifetime_ns: crate::config::minutes_to_ns(
                            settings.max_session_lifetime_minutes,
                        ),
                        lockout: settings.lockout,
                    };

                    let mut acls = Vec::new();
                    for user in store.all_users().await? {
                        let acl = store.effective_acl(&user.username).await?;
                        acls.push((user.username, acl));
                    }

                    let errors = firewall.refresh_configuration(new_settings, &acls);
                    if errors.is_empty() {
                        Ok(())
                    } else {
                        let details: Vec<String> = errors
                            .iter()
                            .map(|(user, err)| format!("{user}: {err}"))
                            .collect();
                        Err(anyhow!(
                            "refreshing configuration: {}",
                            details.join("; ")
                        ))
                    }
                }
            },
        )
        .await
}

async fn methods_listener(store: &Store, registry: &Arc<Registry>) -> Result<String> {
    let registry = Arc::clone(registry);

    store
        .register_event_listener::<Vec<String>, _, _>(
            METHODS_KEY,
            false,
            move |_key, methods, _previous, _event| {
                let registry = Arc::clone(&registry);
                async move { registry.sync_enabled(&methods).await }
            },
        )
        .await
}

async fn method_settings_listener(store: &Store, registry: &Arc<Registry>) -> Result<String> {
    let registry = Arc::clone(registry);

    store
        .register_event_listener::<serde_json::Value, _, _>(
            AUTHENTICATION_PREFIX,
            true,
            move |key, _settings, _previous, _event| {
                let registry = Arc::clone(&registry);
                async move {
                    // The enablement list shares this namespace and has its
                    // own listener.
                    if key == METHODS_KEY {
                        return Ok(());
                    }
                    let method = key.trim_start_matches(AUTHENTICATION_PREFIX);
                    registry.reinitialize(method).await
                }
            },
        )
        .await
}

/// Make sure the firewall knows the user before a device event references
/// it; replays and cross-node ordering make this racy by nature.
async fn ensure_user(store: &Store, firewall: &Arc<Firewall>, username: &str) -> Result<()> {
    let acl = store.effective_acl(username).await?;
    match firewall.add_user(username, &acl) {
        Ok(()) | Err(FirewallError::UserExists) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn affected_users(store: &Store, policy: &str) -> Result<Vec<String>> {
    if policy == "*" {
        return Ok(store
            .all_users()
            .await?
            .into_iter()
            .map(|user| user.username)
            .collect());
    }

    if policy.starts_with("group:") {
        return Ok(store.get_group(policy).await?.unwrap_or_default());
    }

    Ok(vec![policy.to_string()])
}

async fn refresh_users(
    store: &Store,
    firewall: &Arc<Firewall>,
    users: impl IntoIterator<Item = String>,
) -> Result<()> {
    let mut failures = Vec::new();

    for username in users {
        let acl = match store.effective_acl(&username).await {
            Ok(acl) => acl,
            Err(err) => {
                failures.push(format!("{username}: {err:#}"));
                continue;
            }
        };

        match firewall.refresh_user_acls(&username, &acl) {
            Ok(()) => {}
            // Not active on this node yet; the user event will install it.
            Err(FirewallError::UnknownUser) => {
                warn!(%username, "skipping ACL refresh for inactive user");
            }
            Err(err) => failures.push(format!("{username}: {err}")),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("refreshing ACLs: {}", failures.join("; ")))
    }
}
