//! Startup configuration.
//!
//! A single JSON file is read once at boot; everything that must agree
//! across the cluster (ACL seeds, authentication settings, timeouts) is
//! pushed into the coordination store on first start and replicated from
//! there onwards. Negative minute values disable the corresponding
//! timeout, mirroring the kernel table's `u64::MAX` sentinel.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::Ipv4Net;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pordisto/config.json";
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/pordisto/control.sock";

const NANOS_PER_MINUTE: u64 = 60_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Mail address disclosed to users whose account or device is locked.
    pub help_mail: String,
    /// Failed authorization attempts before a device locks.
    pub lockout: u32,
    /// Negative disables session expiry.
    pub max_session_lifetime_minutes: i64,
    /// Negative disables the inactivity check.
    pub session_inactivity_timeout_minutes: i64,
    /// MASQUERADE traffic leaving the tunnel network.
    pub nat: bool,
    /// Extra host ports reachable from the tunnel, e.g. "53/udp", "80-90/tcp".
    pub expose_ports: Vec<String>,
    pub control_socket_path: PathBuf,
    /// Compiled XDP object; when unset the daemon keeps the decision table
    /// in process only (no kernel enforcement, useful for integration rigs).
    pub xdp_object_path: Option<PathBuf>,
    pub wireguard: WireguardConfig,
    pub webserver: WebserverConfig,
    pub clustering: ClusteringConfig,
    pub management_ui: ManagementUiConfig,
    pub acls: AclsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            help_mail: String::new(),
            lockout: 5,
            max_session_lifetime_minutes: 180,
            session_inactivity_timeout_minutes: 15,
            nat: true,
            expose_ports: Vec::new(),
            control_socket_path: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            xdp_object_path: None,
            wireguard: WireguardConfig::default(),
            webserver: WebserverConfig::default(),
            clustering: ClusteringConfig::default(),
            management_ui: ManagementUiConfig::default(),
            acls: AclsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    pub dev_name: String,
    pub listen_port: u16,
    /// Base64 X25519 private key. The tunnel identity is shared by every
    /// node behind the balancer, so serialisation (for the join-token
    /// config) is the one place it is deliberately exposed.
    #[serde(serialize_with = "expose_private_key")]
    pub private_key: SecretString,
    /// Server tunnel address with the tunnel prefix, e.g. "192.0.2.1/24".
    pub address: String,
    pub mtu: u32,
    pub persistent_keep_alive: u16,
    /// The interface is managed outside the daemon; adopt, never create.
    pub external: bool,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            dev_name: "wg0".to_string(),
            listen_port: 51820,
            private_key: SecretString::default(),
            address: String::new(),
            mtu: 1420,
            persistent_keep_alive: 25,
            external: false,
        }
    }
}

fn expose_private_key<S: Serializer>(
    key: &SecretString,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(key.expose_secret())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebserverConfig {
    /// Port of the MFA endpoint served on the tunnel address.
    pub tunnel_port: u16,
    /// Port of the public enrollment endpoint (reachable before any
    /// tunnel exists).
    pub registration_port: u16,
    /// Externally reachable URL of the tunnel endpoint, shown to users.
    pub public_url: String,
}

impl Default for WebserverConfig {
    fn default() -> Self {
        Self {
            tunnel_port: 8080,
            registration_port: 8081,
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// This node's name inside the cluster.
    pub name: String,
    /// "new" bootstraps a cluster, "existing" joins one.
    pub cluster_state: String,
    /// Peer URLs this node's store member listens on.
    pub listen_addresses: Vec<String>,
    /// Client endpoints of the coordination store.
    pub client_endpoints: Vec<String>,
    /// Known peer URLs by node name.
    pub peers: BTreeMap<String, Vec<String>>,
    /// Default peer port applied to member URLs without one.
    pub peer_port: u16,
    pub election_timeout_ms: u64,
    /// Where the TLS manager serves join material for new members.
    pub tls_manager_listen_url: String,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_state: "new".to_string(),
            listen_addresses: Vec::new(),
            client_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            peers: BTreeMap::new(),
            peer_port: 2380,
            election_timeout_ms: 1000,
            tls_manager_listen_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementUiConfig {
    pub enabled: bool,
    pub listen_address: String,
    pub cert_path: String,
    pub key_path: String,
    pub debug: bool,
}

/// ACL seeds pushed to the coordination store on first start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclsConfig {
    /// Group name ("group:ops") to member usernames.
    pub groups: BTreeMap<String, Vec<String>>,
    /// Policy name ("*", "group:ops" or a username) to rule lists.
    pub policies: BTreeMap<String, AclPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclPolicy {
    /// CIDRs reachable without MFA.
    pub allow: Vec<String>,
    /// CIDRs reachable only while authenticated.
    pub mfa: Vec<String>,
}

impl Config {
    /// Read and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or when a
    /// field fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing configuration from {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn validate(&self) -> Result<()> {
        if self.lockout == 0 {
            bail!("lockout threshold must be at least 1");
        }

        if self.wireguard.dev_name.is_empty() {
            bail!("wireguard.dev_name must be set");
        }

        self.tunnel_network()
            .context("wireguard.address must be an IPv4 address with prefix")?;

        if !self.wireguard.external {
            let key = BASE64
                .decode(self.wireguard.private_key.expose_secret())
                .context("wireguard.private_key is not valid base64")?;
            if key.len() != 32 {
                bail!("wireguard.private_key must decode to 32 bytes");
            }
            if self.wireguard.listen_port == 0 {
                bail!("wireguard.listen_port must be set");
            }
        }

        if self.clustering.client_endpoints.is_empty() {
            bail!("clustering.client_endpoints must not be empty");
        }

        for port in &self.expose_ports {
            let (_, proto) = port
                .split_once('/')
                .with_context(|| format!("expose port {port} is not in <port>/<proto> form"))?;
            if proto != "tcp" && proto != "udp" {
                bail!("expose port {port} protocol must be tcp or udp");
            }
        }

        for group in self.acls.groups.keys() {
            if !group.starts_with("group:") {
                bail!("group {group} does not have the 'group:' prefix");
            }
        }

        Ok(())
    }

    /// The tunnel CIDR, e.g. 192.0.2.0/24 for an address of 192.0.2.1/24.
    ///
    /// # Errors
    ///
    /// Returns an error when `wireguard.address` does not parse.
    pub fn tunnel_network(&self) -> Result<Ipv4Net> {
        let net: Ipv4Net = self
            .wireguard
            .address
            .parse()
            .with_context(|| format!("parsing tunnel address {}", self.wireguard.address))?;
        Ok(net)
    }

    /// The server's own address inside the tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error when `wireguard.address` does not parse.
    pub fn server_address(&self) -> Result<Ipv4Addr> {
        Ok(self.tunnel_network()?.addr())
    }

    #[must_use]
    pub fn inactivity_ns(&self) -> u64 {
        minutes_to_ns(self.session_inactivity_timeout_minutes)
    }

    #[must_use]
    pub fn session_lifetime_ns(&self) -> u64 {
        minutes_to_ns(self.max_session_lifetime_minutes)
    }
}

/// Negative minutes mean "disabled", which the decision table spells `u64::MAX`.
#[must_use]
pub fn minutes_to_ns(minutes: i64) -> u64 {
    if minutes < 0 {
        u64::MAX
    } else {
        minutes as u64 * NANOS_PER_MINUTE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.wireguard.address = "192.0.2.1/24".to_string();
        // Any 32 bytes of base64 will do for validation.
        config.wireguard.private_key = SecretString::new(BASE64.encode([7u8; 32]));
        config
    }

    #[test]
    fn accepts_valid_config() {
        valid().validate().unwrap();
    }

    #[test]
    fn rejects_bad_private_key() {
        let mut config = valid();
        config.wireguard.private_key = SecretString::new("not base64!".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unprefixed_group() {
        let mut config = valid();
        config
            .acls
            .groups
            .insert("ops".to_string(), vec!["alice".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_malformed_expose_port() {
        let mut config = valid();
        config.expose_ports.push("80".to_string());
        assert!(config.validate().is_err());

        config.expose_ports[0] = "80/icmp".to_string();
        assert!(config.validate().is_err());

        config.expose_ports[0] = "80-90/tcp".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn timeout_sentinels() {
        let mut config = valid();
        config.session_inactivity_timeout_minutes = -1;
        assert_eq!(config.inactivity_ns(), u64::MAX);

        config.max_session_lifetime_minutes = 2;
        assert_eq!(config.session_lifetime_ns(), 120_000_000_000);
    }

    #[test]
    fn tunnel_network_derivation() {
        let config = valid();
        assert_eq!(config.server_address().unwrap(), "192.0.2.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            config.tunnel_network().unwrap().network(),
            "192.0.2.0".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn load_roundtrips_through_a_file() {
        let config = valid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.wireguard.address, config.wireguard.address);
        assert_eq!(loaded.lockout, config.lockout);

        // The private key survives the roundtrip; serialisation is the one
        // deliberate expose point (the join-token config ships it).
        assert_eq!(
            loaded.wireguard.private_key.expose_secret(),
            config.wireguard.private_key.expose_secret()
        );

        // Unknown fields are a config error, not silently dropped.
        std::fs::write(&path, r#"{"no_such_field": 1}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
