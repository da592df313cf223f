//! Join-token contract with the TLS manager.
//!
//! The TLS manager (a separate service on every node) hands out
//! short-lived join tokens that let a new node download certificates and
//! its starting configuration. This module only speaks the contract: the
//! configuration attached to a token is the local one with cluster fields
//! rewritten for the joining node and the management-UI settings stripped.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::{AclsConfig, Config, ManagementUiConfig};

/// Body of the control API's add-member operation.
#[derive(Debug, Serialize, Deserialize)]
pub struct NewNodeRequest {
    #[serde(default)]
    pub node_name: String,
    /// Peer URL the new node's store member will listen on.
    pub connection_url: String,
    #[serde(default)]
    pub manager_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewNodeResponse {
    pub join_token: String,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    /// Where the joining node's TLS manager will listen.
    address: &'a str,
    /// Files attached to the token; the joining node fetches these after
    /// redeeming it.
    additional: BTreeMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// The configuration a joining node starts from.
#[must_use]
pub fn config_for_join(
    base: &Config,
    name: &str,
    listen_url: &str,
    manager_url: &str,
    peers: BTreeMap<String, Vec<String>>,
) -> Config {
    let mut config = base.clone();

    config.clustering.cluster_state = "existing".to_string();
    config.clustering.name = name.to_string();
    config.clustering.listen_addresses = vec![listen_url.to_string()];
    config.clustering.peers = peers;
    config.clustering.tls_manager_listen_url = manager_url.to_string();

    // ACL seeds are already replicated; shipping them again would shadow
    // the store on the new node's first boot.
    config.acls = AclsConfig::default();

    // The management UI stays wherever the operator runs it.
    config.management_ui = ManagementUiConfig::default();

    config
}

/// Ask the local TLS manager for a join token carrying the given
/// configuration.
///
/// # Errors
///
/// Returns an error when the manager is unreachable, answers non-2xx, or
/// the configuration cannot be serialised.
pub async fn create_token(
    tls_manager_url: &str,
    joining_manager_url: &str,
    config: &Config,
) -> Result<String> {
    if tls_manager_url.is_empty() {
        return Err(anyhow!("no TLS manager listen url configured"));
    }

    let mut additional = BTreeMap::new();
    additional.insert(
        "config.json",
        serde_json::to_string(config).context("serialising joining configuration")?,
    );

    let request = TokenRequest {
        address: joining_manager_url,
        additional,
    };

    let client = reqwest::Client::builder()
        .user_agent(crate::APP_USER_AGENT)
        .timeout(Duration::from_secs(2))
        .build()
        .context("building TLS manager client")?;

    let response = client
        .post(format!("{}/create/token", tls_manager_url.trim_end_matches('/')))
        .json(&request)
        .send()
        .await
        .context("requesting join token")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "TLS manager refused the token request: {}",
            response.status()
        ));
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("decoding join token response")?;
    Ok(token.token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn join_config_is_rewritten_and_stripped() {
        let mut base = Config::default();
        base.wireguard.address = "192.0.2.1/24".to_string();
        base.management_ui.enabled = true;
        base.management_ui.listen_address = "127.0.0.1:4433".to_string();
        base.acls
            .groups
            .insert("group:ops".to_string(), vec!["alice".to_string()]);

        let mut peers = BTreeMap::new();
        peers.insert(
            "seed".to_string(),
            vec!["https://192.0.2.10:2380".to_string()],
        );

        let joined = config_for_join(
            &base,
            "node-b",
            "https://192.0.2.11:2380",
            "https://192.0.2.11:4545",
            peers.clone(),
        );

        assert_eq!(joined.clustering.cluster_state, "existing");
        assert_eq!(joined.clustering.name, "node-b");
        assert_eq!(
            joined.clustering.listen_addresses,
            vec!["https://192.0.2.11:2380".to_string()]
        );
        assert_eq!(joined.clustering.peers, peers);
        assert!(!joined.management_ui.enabled);
        assert!(joined.management_ui.listen_address.is_empty());
        assert!(joined.acls.groups.is_empty());
        // The tunnel identity is shared by every node behind the balancer.
        assert_eq!(joined.wireguard.address, base.wireguard.address);
    }
}
