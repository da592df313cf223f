//! Replicated runtime settings.
//!
//! The startup file seeds these on first boot; from then on the replicated
//! copy wins and a change anywhere in the cluster reaches every node
//! through the config event listener.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Config;

use super::{Store, AUTHENTICATION_PREFIX};

pub const SETTINGS_KEY: &str = "wag-config-settings";
pub const METHODS_KEY: &str = "wag-config-authentication-methods";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub help_mail: String,
    pub lockout: u32,
    pub max_session_lifetime_minutes: i64,
    pub session_inactivity_timeout_minutes: i64,
    /// Externally reachable URL of the tunnel MFA endpoint.
    pub public_url: String,
}

impl RuntimeSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            help_mail: config.help_mail.clone(),
            lockout: config.lockout,
            max_session_lifetime_minutes: config.max_session_lifetime_minutes,
            session_inactivity_timeout_minutes: config.session_inactivity_timeout_minutes,
            public_url: config.webserver.public_url.clone(),
        }
    }
}

impl Store {
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn get_settings(&self) -> Result<Option<RuntimeSettings>> {
        self.get_json(SETTINGS_KEY.to_string()).await
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn put_settings(&self, settings: &RuntimeSettings) -> Result<()> {
        self.put_json(SETTINGS_KEY.to_string(), settings).await
    }

    /// Names of the MFA methods currently enabled cluster-wide.
    ///
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn enabled_methods(&self) -> Result<Vec<String>> {
        Ok(self
            .get_json::<Vec<String>>(METHODS_KEY.to_string())
            .await?
            .unwrap_or_default())
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn set_enabled_methods(&self, methods: &[String]) -> Result<()> {
        self.put_json(METHODS_KEY.to_string(), &methods.to_vec())
            .await
    }

    /// Method-specific settings blob under
    /// `wag-config-authentication-<method>`.
    ///
    /// # Errors
    /// Returns an error when the read fails or the record is corrupt.
    pub async fn method_settings<T: DeserializeOwned>(&self, method: &str) -> Result<Option<T>> {
        self.get_json(format!("{AUTHENTICATION_PREFIX}{method}"))
            .await
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub async fn set_method_settings<T: Serialize>(&self, method: &str, value: &T) -> Result<()> {
        self.put_json(format!("{AUTHENTICATION_PREFIX}{method}"), value)
            .await
    }

    /// Push the startup file's replicable state into the store, without
    /// overwriting anything that already exists there.
    ///
    /// # Errors
    /// Returns an error when a read or write fails.
    pub async fn bootstrap(&self, config: &Config) -> Result<()> {
        if self.get_settings().await?.is_none() {
            self.put_settings(&RuntimeSettings::from_config(config))
                .await?;
        }

        for (group, members) in &config.acls.groups {
            if self.get_group(group).await?.is_none() {
                self.set_group(group, members).await?;
            }
        }

        for (policy, rule) in &config.acls.policies {
            if self.get_acl(policy).await?.is_none() {
                self.set_acl(
                    policy,
                    &super::AclRule {
                        allow: rule.allow.clone(),
                        mfa: rule.mfa.clone(),
                    },
                )
                .await?;
            }
        }

        Ok(())
    }
}
