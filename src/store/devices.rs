//! Replicated device records.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::{Store, DEVICES_PREFIX};

/// A device as replicated across the cluster. Session timestamps live only
/// in each node's kernel table; the record carries the slow-moving state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Internal tunnel address, unique across the cluster.
    pub address: Ipv4Addr,
    /// WireGuard public key, base64.
    pub public_key: String,
    pub username: String,
    /// Last observed UDP endpoint.
    pub endpoint: Option<SocketAddr>,
    /// Failed authorization attempts since the last success.
    pub attempts: u32,
    pub active: bool,
}

#[must_use]
pub fn device_key(address: Ipv4Addr) -> String {
    format!("{DEVICES_PREFIX}{address}")
}

impl Store {
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn get_device(&self, address: Ipv4Addr) -> Result<Option<Device>> {
        self.get_json(device_key(address)).await
    }

    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn all_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .get_prefix_json::<Device>(DEVICES_PREFIX)
            .await?
            .into_iter()
            .map(|(_, device)| device)
            .collect())
    }

    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn devices_for_user(&self, username: &str) -> Result<Vec<Device>> {
        Ok(self
            .all_devices()
            .await?
            .into_iter()
            .filter(|device| device.username == username)
            .collect())
    }

    /// Create a device record; the address must be unused.
    ///
    /// # Errors
    /// Returns an error when the address is already taken or the write
    /// fails.
    pub async fn create_device(&self, device: &Device) -> Result<()> {
        if self.get_device(device.address).await?.is_some() {
            return Err(anyhow!("device {} already exists", device.address));
        }
        self.put_json(device_key(device.address), device).await
    }

    /// # Errors
    /// Returns an error when the device is missing or the write fails.
    pub async fn update_device_endpoint(
        &self,
        address: Ipv4Addr,
        endpoint: SocketAddr,
    ) -> Result<()> {
        let mut device = self
            .get_device(address)
            .await?
            .ok_or_else(|| anyhow!("device {address} is not registered"))?;
        device.endpoint = Some(endpoint);
        self.put_json(device_key(address), &device).await
    }

    /// # Errors
    /// Returns an error when the device is missing or the write fails.
    pub async fn set_device_attempts(&self, address: Ipv4Addr, attempts: u32) -> Result<()> {
        let mut device = self
            .get_device(address)
            .await?
            .ok_or_else(|| anyhow!("device {address} is not registered"))?;
        device.attempts = attempts;
        self.put_json(device_key(address), &device).await
    }

    /// Bump the failed-attempt counter, returning the new value.
    ///
    /// # Errors
    /// Returns an error when the device is missing or the write fails.
    pub async fn increment_device_attempts(&self, address: Ipv4Addr) -> Result<u32> {
        let mut device = self
            .get_device(address)
            .await?
            .ok_or_else(|| anyhow!("device {address} is not registered"))?;
        device.attempts = device.attempts.saturating_add(1);
        let attempts = device.attempts;
        self.put_json(device_key(address), &device).await?;
        Ok(attempts)
    }

    /// Delete a device record, reporting whether it existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub async fn delete_device(&self, address: Ipv4Addr) -> Result<bool> {
        self.delete(device_key(address)).await
    }
}
