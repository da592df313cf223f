//! Management-UI admin accounts.
//!
//! The UI itself lives elsewhere; the gateway only stores the accounts and
//! answers the control-socket admin operations.

use anyhow::{anyhow, bail, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Store, ADMIN_USERS_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUser {
    pub username: String,
    pub password_hash: String,
    pub locked: bool,
    pub added: DateTime<Utc>,
}

#[must_use]
pub fn admin_key(username: &str) -> String {
    format!("{ADMIN_USERS_PREFIX}{username}")
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("hashing admin password: {err}"))
}

impl Store {
    /// # Errors
    /// Returns an error on duplicates, empty arguments, or failed writes.
    pub async fn add_admin(&self, username: &str, password: &str) -> Result<AdminUser> {
        if username.is_empty() || password.is_empty() {
            bail!("admin username and password must both be supplied");
        }
        if self
            .get_json::<AdminUser>(admin_key(username))
            .await?
            .is_some()
        {
            bail!("admin {username} already exists");
        }

        let admin = AdminUser {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            locked: false,
            added: Utc::now(),
        };
        self.put_json(admin_key(username), &admin).await?;
        Ok(admin)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub async fn delete_admin(&self, username: &str) -> Result<bool> {
        self.delete(admin_key(username)).await
    }

    /// # Errors
    /// Returns an error when the admin is missing or the write fails.
    pub async fn set_admin_lock(&self, username: &str, locked: bool) -> Result<()> {
        let mut admin: AdminUser = self
            .get_json(admin_key(username))
            .await?
            .ok_or_else(|| anyhow!("admin {username} is not registered"))?;
        admin.locked = locked;
        self.put_json(admin_key(username), &admin).await
    }

    /// # Errors
    /// Returns an error when the range read fails.
    pub async fn list_admins(&self) -> Result<Vec<AdminUser>> {
        Ok(self
            .get_prefix_json::<AdminUser>(ADMIN_USERS_PREFIX)
            .await?
            .into_iter()
            .map(|(_, admin)| admin)
            .collect())
    }
}
