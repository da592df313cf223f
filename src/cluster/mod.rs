//! Cluster membership and node state.
//!
//! Gateways form one coordination-store cluster. A joining node starts as
//! a non-voting learner, catches up, and is promoted by an operator;
//! removal clears the node's scoped keys before the member leaves.
//! Drain is an advisory flag: a drained node keeps serving established
//! tunnels but refuses new MFA redemptions, letting load balancers bleed
//! it dry.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use etcd_client::MemberAddOptions;
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;
use url::Url;

use crate::config::Config;
use crate::store::{Store, NODE_PREFIX};

pub mod health;
pub mod join;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
    Learner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Hex-encoded 64-bit member id.
    pub id: String,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub role: NodeRole,
    pub drained: bool,
}

fn parse_member_id(id_hex: &str) -> Result<u64> {
    u64::from_str_radix(id_hex, 16)
        .with_context(|| format!("bad member ID arg ({id_hex}), expecting ID in hex"))
}

fn drain_key(id_hex: &str) -> String {
    format!("{NODE_PREFIX}{id_hex}/drain")
}

fn ping_key(id_hex: &str) -> String {
    format!("{NODE_PREFIX}{id_hex}/ping")
}

#[derive(Clone)]
pub struct Cluster {
    store: Store,
    peer_port: u16,
    tls_manager_url: String,
}

impl Cluster {
    #[must_use]
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            store,
            peer_port: config.clustering.peer_port,
            tls_manager_url: config.clustering.tls_manager_listen_url.clone(),
        }
    }

    /// Hex id of this node.
    #[must_use]
    pub fn node_id(&self) -> String {
        self.store.node_id().to_string()
    }

    /// # Errors
    /// Returns an error when the store is unreachable.
    pub async fn leader_id(&self) -> Result<u64> {
        let mut client = self.store_client();
        let status = client.status().await.context("reading cluster status")?;
        Ok(status.leader())
    }

    /// # Errors
    /// Returns an error when the store is unreachable.
    pub async fn has_leader(&self) -> Result<bool> {
        Ok(self.leader_id().await? != 0)
    }

    /// # Errors
    /// Returns an error when the store is unreachable.
    pub async fn is_learner(&self) -> Result<bool> {
        let mut client = self.store_client();
        let status = client.status().await.context("reading cluster status")?;
        Ok(status.is_learner())
    }

    /// # Errors
    /// Returns an error when the store is unreachable.
    pub async fn is_leader(&self) -> Result<bool> {
        let mut client = self.store_client();
        let status = client.status().await.context("reading cluster status")?;
        let own = status
            .header()
            .map(|header| header.member_id())
            .unwrap_or_default();
        Ok(own != 0 && status.leader() == own)
    }

    /// Hand leadership to another voting member.
    ///
    /// # Errors
    /// Returns an error when this node does not lead or no candidate
    /// exists.
    pub async fn step_down(&self) -> Result<()> {
        if !self.is_leader().await? {
            bail!("this node is not the leader");
        }

        let own = parse_member_id(self.store.node_id())?;
        let mut client = self.store_client();
        let members = client.member_list().await.context("listing members")?;

        let target = members
            .members()
            .iter()
            .find(|member| member.id() != own && !member.is_learner())
            .map(etcd_client::Member::id);

        match target {
            Some(target) => {
                client
                    .move_leader(target)
                    .await
                    .context("transferring leadership")?;
                Ok(())
            }
            None => bail!("no voting member available to take over"),
        }
    }

    /// Every member with role and drain state resolved.
    ///
    /// # Errors
    /// Returns an error when the store is unreachable.
    pub async fn members(&self) -> Result<Vec<NodeInfo>> {
        let mut client = self.store_client();
        let leader = self.leader_id().await?;
        let members = client.member_list().await.context("listing members")?;

        let mut out = Vec::new();
        for member in members.members() {
            let id = format!("{:x}", member.id());
            let role = if member.is_learner() {
                NodeRole::Learner
            } else if member.id() == leader {
                NodeRole::Leader
            } else {
                NodeRole::Follower
            };

            out.push(NodeInfo {
                drained: self.is_drained(&id).await?,
                id,
                name: member.name().to_string(),
                peer_urls: member.peer_urls().to_vec(),
                role,
            });
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error for malformed ids or failed writes.
    pub async fn set_drained(&self, id_hex: &str, drained: bool) -> Result<()> {
        parse_member_id(id_hex)?;

        if drained {
            self.store
                .put_raw(drain_key(id_hex), b"true".to_vec())
                .await
        } else {
            self.store.delete(drain_key(id_hex)).await.map(|_| ())
        }
    }

    /// # Errors
    /// Returns an error for malformed ids or failed reads.
    pub async fn is_drained(&self, id_hex: &str) -> Result<bool> {
        parse_member_id(id_hex)?;
        self.store.key_exists(drain_key(id_hex)).await
    }

    /// Add a node to the cluster as a learner and mint its join token.
    ///
    /// The peer URL must be https; hostnames are resolved here so the
    /// member record carries a concrete address, and a missing port gets
    /// the cluster peer port.
    ///
    /// # Errors
    /// Returns an error on validation failures, resolution failures, or a
    /// rejected member add.
    pub async fn add_member(
        &self,
        name: &str,
        peer_url: &str,
        manager_url: &str,
        config: &Config,
    ) -> Result<String> {
        if !peer_url.starts_with("https://") {
            bail!("url must be https://");
        }

        let url = Url::parse(peer_url).context("parsing peer url")?;
        let host = url
            .host_str()
            .context("peer url has no host")?
            .to_string();

        let name = if name.is_empty() { host.clone() } else { name.to_string() };

        let manager_url = if manager_url.is_empty() {
            format!("https://{host}:4545")
        } else {
            manager_url.to_string()
        };

        let port = url.port().unwrap_or(self.peer_port);

        let member_host = if host.parse::<std::net::IpAddr>().is_ok() {
            host.clone()
        } else {
            let mut addresses = lookup_host((host.as_str(), port))
                .await
                .with_context(|| format!("unable to lookup new listen address hostname {host}"))?;
            let resolved = addresses
                .next()
                .with_context(|| format!("no addresses found for hostname {host}"))?;
            resolved.ip().to_string()
        };

        // From here on the address is concrete: resolved host, explicit port.
        let peer_address = format!("https://{member_host}:{port}");

        let mut peers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut client = self.store_client();
        for member in client
            .member_list()
            .await
            .context("listing members")?
            .members()
        {
            if member.is_learner() {
                continue;
            }
            peers.insert(member.name().to_string(), member.peer_urls().to_vec());
        }
        peers.remove(&name);

        let joining_config =
            join::config_for_join(config, &name, &peer_address, &manager_url, peers);
        let token =
            join::create_token(&self.tls_manager_url, &manager_url, &joining_config).await?;

        client
            .member_add([peer_address], Some(MemberAddOptions::new().with_is_learner()))
            .await
            .context("adding member as learner")?;

        Ok(token)
    }

    /// Promote a caught-up learner to a voting member.
    ///
    /// # Errors
    /// Returns an error for malformed ids or a rejected promotion.
    pub async fn promote(&self, id_hex: &str) -> Result<()> {
        let id = parse_member_id(id_hex)?;
        let mut client = self.store_client();
        client
            .member_promote(id)
            .await
            .with_context(|| format!("promoting member {id_hex}"))?;
        Ok(())
    }

    /// Remove a member, clearing its node-scoped keys first.
    ///
    /// # Errors
    /// Returns an error for malformed ids or a rejected removal.
    pub async fn remove(&self, id_hex: &str) -> Result<()> {
        let id = parse_member_id(id_hex)?;

        self.store
            .delete_prefix(format!("{NODE_PREFIX}{id_hex}"))
            .await
            .context("clearing node metadata")?;

        let mut client = self.store_client();
        client
            .member_remove(id)
            .await
            .with_context(|| format!("removing member {id_hex}"))?;
        Ok(())
    }

    /// Liveness heartbeat write; carries its own 2 s timeout via the
    /// store.
    ///
    /// # Errors
    /// Returns an error when the write fails or times out.
    pub async fn ping(&self) -> Result<()> {
        self.store
            .put_raw(
                ping_key(self.store.node_id()),
                Utc::now().to_rfc3339().into_bytes(),
            )
            .await
    }

    // A cloned handle; etcd clients multiplex over one channel.
    fn store_client(&self) -> etcd_client::Client {
        self.store.client()
    }
}
