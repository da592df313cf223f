//! Replicated user records.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::{Store, USERS_PREFIX};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub locked: bool,
    /// The user has completed MFA registration at least once and may no
    /// longer re-register without admin intervention.
    pub enforcing: bool,
    /// Name of the MFA method the secret belongs to; empty until
    /// registration.
    pub mfa_method: String,
    /// Method-specific secret blob.
    pub mfa_secret: String,
    pub groups: Vec<String>,
}

#[must_use]
pub fn user_key(username: &str) -> String {
    format!("{USERS_PREFIX}{username}")
}

impl Store {
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.get_json(user_key(username)).await
    }

    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn all_users(&self) -> Result<Vec<User>> {
        Ok(self
            .get_prefix_json::<User>(USERS_PREFIX)
            .await?
            .into_iter()
            .map(|(_, user)| user)
            .collect())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn put_user(&self, user: &User) -> Result<()> {
        self.put_json(user_key(&user.username), user).await
    }

    /// # Errors
    /// Returns an error when the user is missing or the write fails.
    pub async fn set_user_lock(&self, username: &str, locked: bool) -> Result<()> {
        let mut user = self.require_user(username).await?;
        user.locked = locked;
        self.put_user(&user).await
    }

    /// Record the outcome of an MFA registration.
    ///
    /// # Errors
    /// Returns an error when the user is missing or the write fails.
    pub async fn set_user_mfa(&self, username: &str, method: &str, secret: &str) -> Result<()> {
        let mut user = self.require_user(username).await?;
        user.mfa_method = method.to_string();
        user.mfa_secret = secret.to_string();
        self.put_user(&user).await
    }

    /// Flip the enforcing flag after the first successful use of a freshly
    /// registered method.
    ///
    /// # Errors
    /// Returns an error when the user is missing or the write fails.
    pub async fn set_user_enforcing(&self, username: &str) -> Result<()> {
        let mut user = self.require_user(username).await?;
        if !user.enforcing {
            user.enforcing = true;
            self.put_user(&user).await?;
        }
        Ok(())
    }

    /// Delete a user and every device the user owns.
    ///
    /// # Errors
    /// Returns an error when any of the deletes fail.
    pub async fn delete_user(&self, username: &str) -> Result<()> {
        for device in self.devices_for_user(username).await? {
            self.delete_device(device.address).await?;
        }
        self.delete(user_key(username)).await?;
        Ok(())
    }

    async fn require_user(&self, username: &str) -> Result<User> {
        self.get_user(username)
            .await?
            .ok_or_else(|| anyhow!("user {username} is not registered"))
    }
}
