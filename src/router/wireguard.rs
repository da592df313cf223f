//! Kernel WireGuard device management.
//!
//! Creates or adopts the tunnel interface, keeps its peer list in step
//! with the replicated device set (one `/32` allowed-IP per peer), and
//! reads back the kernel's view for the endpoint watcher. Tunnel
//! addresses are allocated monotonically: highest allocated plus one,
//! within the tunnel CIDR, never the network, server, or broadcast
//! address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use defguard_wireguard_rs::peer::Peer;
use defguard_wireguard_rs::key::Key;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, WGApi, WireguardInterfaceApi};
use ipnet::Ipv4Net;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::Config;
use crate::store::Device;

/// One peer as read back from the kernel, trimmed to what the control
/// plane needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    /// Base64 public key.
    pub public_key: String,
    /// Tunnel address, when the peer has exactly one `/32` allowed-IP.
    pub address: Option<Ipv4Addr>,
    /// Last observed remote UDP endpoint.
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("tunnel network {0} has no addresses left")]
    Exhausted(Ipv4Net),
}

/// Highest allocated address plus one, starting from the server address
/// when nothing is allocated yet.
///
/// # Errors
///
/// [`AllocError::Exhausted`] once the increment leaves the usable range.
pub fn next_address(
    existing: &[Ipv4Addr],
    network: Ipv4Net,
    server: Ipv4Addr,
) -> Result<Ipv4Addr, AllocError> {
    let highest = existing.iter().copied().max().unwrap_or(server);

    let candidate = u32::from(highest)
        .checked_add(1)
        .map(Ipv4Addr::from)
        .ok_or(AllocError::Exhausted(network))?;

    if !network.contains(&candidate) || candidate == network.broadcast() {
        return Err(AllocError::Exhausted(network));
    }

    Ok(candidate)
}

fn parse_key(key: &str) -> Result<Key> {
    Key::try_from(key).map_err(|err| anyhow!("parsing wireguard key: {err}"))
}

pub struct WgDevice {
    api: WGApi,
    name: String,
    keepalive: u16,
}

impl WgDevice {
    /// Create or adopt the interface and replace its peer list with
    /// exactly the replicated device set.
    ///
    /// # Errors
    ///
    /// Returns an error when the interface cannot be configured or a
    /// device record carries an unparsable key.
    pub fn setup(config: &Config, devices: &[Device]) -> Result<Self> {
        let name = config.wireguard.dev_name.clone();
        let api = WGApi::new(name.clone())
            .map_err(|err| anyhow!("opening wireguard api for {name}: {err}"))?;

        let device = Self {
            api,
            name: name.clone(),
            keepalive: config.wireguard.persistent_keep_alive,
        };

        let peers: Vec<Peer> = devices
            .iter()
            .map(|record| device.peer_for(record))
            .collect::<Result<_>>()?;

        if config.wireguard.external {
            // The interface belongs to someone else; only reconcile peers.
            for peer in &peers {
                device
                    .api
                    .configure_peer(peer)
                    .map_err(|err| anyhow!("configuring peer on external {name}: {err}"))?;
            }
        } else {
            if let Err(err) = device.api.create_interface() {
                // Already present after a fast restart; adopt it.
                info!("adopting existing wireguard interface {name}: {err}");
            }

            let interface = InterfaceConfiguration {
                name: name.clone(),
                prvkey: config.wireguard.private_key.expose_secret().clone(),
                addresses: vec![config
                    .wireguard
                    .address
                    .parse()
                    .with_context(|| format!("parsing tunnel address {}", config.wireguard.address))?],
                port: config.wireguard.listen_port,
                peers,
                mtu: None,
                fwmark: None,
            };
            device
                .api
                .configure_interface(&interface)
                .map_err(|err| anyhow!("configuring wireguard interface {name}: {err}"))?;
        }

        info!(
            interface = %name,
            peers = devices.len(),
            "wireguard device ready"
        );

        Ok(device)
    }

    fn peer_for(&self, device: &Device) -> Result<Peer> {
        let mut peer = Peer::new(
            parse_key(&device.public_key)
                .with_context(|| format!("device {}", device.address))?,
        );
        peer.allowed_ips
            .push(IpAddrMask::new(IpAddr::V4(device.address), 32));
        peer.persistent_keepalive_interval = Some(self.keepalive);
        Ok(peer)
    }

    /// Apply a single-peer diff adding one device.
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel rejects the peer.
    pub fn add_peer(&self, device: &Device) -> Result<()> {
        let peer = self.peer_for(device)?;
        self.api
            .configure_peer(&peer)
            .map_err(|err| anyhow!("adding peer {}: {err}", device.address))
    }

    /// Remove the peer owning `address`, returning its public key.
    ///
    /// # Errors
    ///
    /// Returns an error when no single-`/32` peer owns the address.
    pub fn remove_peer_by_address(&self, address: Ipv4Addr) -> Result<String> {
        for peer in self.peers()? {
            if peer.allowed_ips == 1 && peer.address == Some(address) {
                let key = parse_key(&peer.public_key)?;
                self.api
                    .remove_peer(&key)
                    .map_err(|err| anyhow!("removing peer {address}: {err}"))?;
                return Ok(peer.public_key);
            }
        }
        bail!("wireguard peer not found for {address}")
    }

    /// The kernel's current peer list.
    ///
    /// # Errors
    ///
    /// Returns an error when the interface cannot be read.
    pub fn peers(&self) -> Result<Vec<PeerView>> {
        let host = self
            .api
            .read_interface_data()
            .map_err(|err| anyhow!("reading interface {}: {err}", self.name))?;

        Ok(host
            .peers
            .values()
            .map(|peer| {
                let address = match peer.allowed_ips.as_slice() {
                    [only] => match only.address {
                        IpAddr::V4(v4) => Some(v4),
                        IpAddr::V6(_) => None,
                    },
                    _ => None,
                };
                PeerView {
                    public_key: peer.public_key.to_string(),
                    address,
                    endpoint: peer.endpoint,
                    allowed_ips: peer.allowed_ips.len(),
                }
            })
            .collect())
    }

    /// Public key and listen port, for enrollment responses.
    ///
    /// # Errors
    ///
    /// Returns an error when the interface cannot be read or has no key.
    pub fn server_details(&self) -> Result<(String, u16)> {
        let host = self
            .api
            .read_interface_data()
            .map_err(|err| anyhow!("reading interface {}: {err}", self.name))?;

        let private = host
            .private_key
            .ok_or_else(|| anyhow!("interface {} has no private key", self.name))?;

        let secret = BASE64
            .decode(private.to_string())
            .context("decoding interface private key")?;
        let secret_bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("interface {} key has unexpected length", self.name))?;
        let public = PublicKey::from(&StaticSecret::from(secret_bytes));

        Ok((BASE64.encode(public.as_bytes()), host.listen_port))
    }

    /// Delete the interface; called on teardown of non-external devices.
    ///
    /// # Errors
    ///
    /// Returns an error when the kernel refuses the delete.
    pub fn remove(&self) -> Result<()> {
        self.api
            .remove_interface()
            .map_err(|err| anyhow!("removing interface {}: {err}", self.name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn first_allocation_follows_the_server() {
        let got = next_address(&[], net("192.0.2.0/24"), ip("192.0.2.1")).unwrap();
        assert_eq!(got, ip("192.0.2.2"));
    }

    #[test]
    fn allocations_are_strictly_increasing() {
        let network = net("192.0.2.0/29");
        let server = ip("192.0.2.1");
        let mut existing = Vec::new();

        let mut last = server;
        // Usable peers: .2 through .6 (.7 is broadcast).
        for _ in 0..5 {
            let next = next_address(&existing, network, server).unwrap();
            assert!(next > last);
            last = next;
            existing.push(next);
        }

        assert_eq!(
            next_address(&existing, network, server),
            Err(AllocError::Exhausted(network))
        );
    }

    #[test]
    fn gaps_are_not_reused() {
        // The allocator is monotonic on purpose; released addresses stay
        // unused until wraparound is implemented by an operator action.
        let got = next_address(
            &[ip("192.0.2.9"), ip("192.0.2.3")],
            net("192.0.2.0/24"),
            ip("192.0.2.1"),
        )
        .unwrap();
        assert_eq!(got, ip("192.0.2.10"));
    }

    #[test]
    fn overflow_outside_the_network_fails() {
        let network = net("192.0.2.0/24");
        assert_eq!(
            next_address(&[ip("192.0.2.254")], network, ip("192.0.2.1")),
            Err(AllocError::Exhausted(network))
        );
    }
}
