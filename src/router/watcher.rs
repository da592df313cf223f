//! Endpoint watcher.
//!
//! Polls the kernel peer list every 100 ms and compares each peer's
//! observed UDP endpoint with a cache keyed by tunnel address. A changed
//! endpoint means the peer roamed, and roaming forces re-authentication:
//! the device is deauthenticated *before* the new endpoint is persisted,
//! so a crash between the two steps leaves the device unauthenticated
//! rather than silently trusting the new network.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::firewall::{Firewall, FirewallError};

use super::wireguard::{PeerView, WgDevice};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where observed endpoint changes are persisted (the coordination store
/// in production, a recorder in tests).
pub trait EndpointSink: Send + Sync + 'static {
    fn persist(
        &self,
        address: Ipv4Addr,
        endpoint: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl EndpointSink for crate::store::Store {
    async fn persist(&self, address: Ipv4Addr, endpoint: SocketAddr) -> anyhow::Result<()> {
        self.update_device_endpoint(address, endpoint).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointChange {
    pub address: Ipv4Addr,
    pub previous: Option<SocketAddr>,
    pub endpoint: Option<SocketAddr>,
}

/// Compare the kernel peer list against the cache. Peers without exactly
/// one allowed-IP are a configuration error and are skipped with a
/// warning.
#[must_use]
pub fn plan(
    cache: &HashMap<Ipv4Addr, Option<SocketAddr>>,
    peers: &[PeerView],
) -> Vec<EndpointChange> {
    let mut changes = Vec::new();

    for peer in peers {
        if peer.allowed_ips != 1 {
            warn!(
                public_key = %peer.public_key,
                allowed_ips = peer.allowed_ips,
                "peer does not have exactly one allowed ip, skipping"
            );
            continue;
        }
        let Some(address) = peer.address else {
            continue;
        };

        let previous = cache.get(&address).copied().flatten();
        if previous != peer.endpoint {
            changes.push(EndpointChange {
                address,
                previous,
                endpoint: peer.endpoint,
            });
        }
    }

    changes
}

/// Apply planned changes: deauthenticate (outside the warm-up scan),
/// persist, then update the cache. The order is load-bearing; see the
/// module docs.
pub async fn apply<S: EndpointSink>(
    firewall: &Firewall,
    sink: &S,
    cache: &mut HashMap<Ipv4Addr, Option<SocketAddr>>,
    changes: Vec<EndpointChange>,
    warmup: bool,
) {
    for change in changes {
        if !warmup {
            info!(
                address = %change.address,
                previous = ?change.previous,
                endpoint = ?change.endpoint,
                "endpoint changed, forcing re-authentication"
            );
            match firewall.deauthenticate(change.address) {
                Ok(()) | Err(FirewallError::UnknownDevice(_)) => {}
                Err(err) => {
                    warn!(address = %change.address, "unable to deauthenticate roaming device: {err}");
                }
            }
        }

        if let Some(endpoint) = change.endpoint {
            if let Err(err) = sink.persist(change.address, endpoint).await {
                warn!(address = %change.address, "unable to persist endpoint: {err:#}");
            }
        }

        cache.insert(change.address, change.endpoint);
    }
}

/// Run the watcher until the shutdown signal fires. A failed peer read is
/// fatal and is pushed onto the daemon error channel, matching the rest of
/// the data plane's fail-fast behaviour.
pub fn spawn<S: EndpointSink>(
    wg: Arc<WgDevice>,
    firewall: Arc<Firewall>,
    sink: S,
    initial: HashMap<Ipv4Addr, Option<SocketAddr>>,
    errors: mpsc::Sender<anyhow::Error>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut cache = initial;
        let mut warmup = true;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let peers = match wg.peers() {
                        Ok(peers) => peers,
                        Err(err) => {
                            let _ = errors.send(anyhow!("endpoint watcher: {err:#}")).await;
                            break;
                        }
                    };

                    let changes = plan(&cache, &peers);
                    apply(&firewall, &sink, &mut cache, changes, warmup).await;
                    warmup = false;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn peer(address: &str, endpoint: Option<&str>) -> PeerView {
        PeerView {
            public_key: "k".to_string(),
            address: Some(address.parse().unwrap()),
            endpoint: endpoint.map(|e| e.parse().unwrap()),
            allowed_ips: 1,
        }
    }

    #[test]
    fn unchanged_endpoints_plan_nothing() {
        let mut cache = HashMap::new();
        cache.insert(
            "192.0.2.5".parse().unwrap(),
            Some("198.51.100.1:51820".parse().unwrap()),
        );

        let changes = plan(&cache, &[peer("192.0.2.5", Some("198.51.100.1:51820"))]);
        assert!(changes.is_empty());
    }

    #[test]
    fn roaming_is_detected() {
        let mut cache = HashMap::new();
        cache.insert(
            "192.0.2.5".parse().unwrap(),
            Some("198.51.100.1:51820".parse().unwrap()),
        );

        let changes = plan(&cache, &[peer("192.0.2.5", Some("198.51.100.2:51820"))]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].address, "192.0.2.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            changes[0].endpoint,
            Some("198.51.100.2:51820".parse().unwrap())
        );
    }

    #[test]
    fn misconfigured_peers_are_skipped() {
        let mut broken = peer("192.0.2.5", Some("198.51.100.1:51820"));
        broken.allowed_ips = 2;
        assert!(plan(&HashMap::new(), &[broken]).is_empty());
    }

    #[test]
    fn first_observation_of_a_new_peer_is_a_change() {
        let changes = plan(&HashMap::new(), &[peer("192.0.2.5", Some("198.51.100.1:51820"))]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous, None);
    }
}
