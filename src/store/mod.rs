//! Coordination store client.
//!
//! Device, user, ACL, token, and configuration state is shared across
//! gateway nodes through an etcd v3 cluster. Writes are linearized by the
//! store's leader; each node treats replicated updates as authoritative
//! and applies them to its own kernel table through the event listeners in
//! [`events`].
//!
//! All writes carry a 2 second timeout so a wedged quorum degrades health
//! instead of hanging the control plane.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use etcd_client::{Client, ConnectOptions, DeleteOptions, GetOptions, SortOrder, SortTarget};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

pub mod acls;
pub mod admin;
pub mod devices;
pub mod events;
pub mod registration;
pub mod settings;
pub mod users;

pub use acls::AclRule;
pub use admin::AdminUser;
pub use devices::Device;
pub use events::{EventError, EventType};
pub use registration::RegistrationToken;
pub use settings::RuntimeSettings;
pub use users::User;

pub const DEVICES_PREFIX: &str = "devices-";
pub const USERS_PREFIX: &str = "users-";
pub const TOKENS_PREFIX: &str = "tokens-";
pub const GROUPS_PREFIX: &str = "wag-groups-";
pub const ACLS_PREFIX: &str = "wag-acls-";
pub const CONFIG_PREFIX: &str = "wag-config-";
pub const AUTHENTICATION_PREFIX: &str = "wag-config-authentication-";
pub const ADMIN_USERS_PREFIX: &str = "admin-users-";
pub const NODE_PREFIX: &str = "wag/node/";
pub const NODE_ERRORS_PREFIX: &str = "wag/node/errors/";

pub(crate) const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Cheap-to-clone handle over the store connection.
///
/// Clones share the underlying channel and the listener registry.
#[derive(Clone)]
pub struct Store {
    client: Client,
    /// Hex member id of the node this client is attached to.
    node_id: String,
    listeners: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl Store {
    /// Connect to the coordination store and capture the local member id.
    ///
    /// # Errors
    ///
    /// Returns an error when no endpoint is reachable.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(OP_TIMEOUT)
            .with_timeout(OP_TIMEOUT);

        let mut client = Client::connect(endpoints, Some(options))
            .await
            .context("connecting to coordination store")?;

        let status = client
            .status()
            .await
            .context("reading coordination store status")?;
        let node_id = status
            .header()
            .map(|header| format!("{:x}", header.member_id()))
            .unwrap_or_default();

        Ok(Self {
            client,
            node_id,
            listeners: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Hex id of the store member this node talks to.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn listeners(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, watch::Sender<bool>>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn put_json<T: Serialize>(&self, key: String, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value).context("encoding store record")?;
        self.put_raw(key, payload).await
    }

    pub(crate) async fn put_raw(&self, key: String, payload: Vec<u8>) -> Result<()> {
        let mut client = self.client();
        let write = tokio::time::timeout(OP_TIMEOUT, client.put(key, payload, None))
            .await
            .context("coordination store write timed out")?;
        write.context("coordination store write failed")?;
        Ok(())
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        let mut client = self.client();
        let response = client
            .get(key.clone(), None)
            .await
            .context("coordination store read failed")?;

        match response.kvs().first() {
            Some(kv) => {
                let value: T = serde_json::from_slice(kv.value())
                    .with_context(|| format!("decoding store record {key}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Sorted ascending range read of a whole namespace.
    pub(crate) async fn get_prefix_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>> {
        let mut client = self.client();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let response = client
            .get(prefix, Some(options))
            .await
            .context("coordination store range read failed")?;

        let mut out = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv.key_str().context("store key is not UTF-8")?.to_string();
            let value: T = serde_json::from_slice(kv.value())
                .with_context(|| format!("decoding store record {key}"))?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Delete a single key, reporting whether it existed.
    pub(crate) async fn delete(&self, key: String) -> Result<bool> {
        let mut client = self.client();
        let delete = tokio::time::timeout(OP_TIMEOUT, client.delete(key, None))
            .await
            .context("coordination store delete timed out")?;
        Ok(delete.context("coordination store delete failed")?.deleted() > 0)
    }

    pub(crate) async fn delete_prefix(&self, prefix: String) -> Result<i64> {
        let mut client = self.client();
        let options = DeleteOptions::new().with_prefix();
        let delete = tokio::time::timeout(OP_TIMEOUT, client.delete(prefix, Some(options)))
            .await
            .context("coordination store delete timed out")?;
        Ok(delete.context("coordination store delete failed")?.deleted())
    }

    pub(crate) async fn key_exists(&self, key: String) -> Result<bool> {
        let mut client = self.client();
        let options = GetOptions::new().with_count_only();
        let response = client
            .get(key, Some(options))
            .await
            .context("coordination store read failed")?;
        Ok(response.count() > 0)
    }
}
