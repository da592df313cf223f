//! Device session state machine.
//!
//! A device is always in exactly one of four states:
//!
//! 1. **Unregistered** - the owner has no MFA secret on record.
//! 2. **Registered** - enrolled but unauthenticated (`session_expiry == 0`).
//! 3. **Authenticated** - the kernel session check passes.
//! 4. **Locked** - the account lock is set or the device burned through its
//!    authorization attempts.
//!
//! MFA outcomes, inactivity, session lifetime, endpoint roaming, and admin
//! commands drive the transitions. The WireGuard handshake is not itself
//! authentication: a fresh device starts Registered, never Authenticated.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::firewall::Firewall;
use crate::store::{Device, Store, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unregistered,
    Registered,
    Authenticated,
    Locked,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Authenticated => "authenticated",
            Self::Locked => "locked",
        };
        f.write_str(name)
    }
}

/// Authentication failures shown to users collapse to a generic message;
/// only the two lock states disclose anything more, and then only the
/// configured help mail.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("account is locked")]
    AccountLocked,
    #[error("device is locked")]
    DeviceLocked,
    #[error("node is draining")]
    Draining,
    /// The underlying cause stays server-side; users only ever see the
    /// generic message.
    #[error("validation failed")]
    Validation(anyhow::Error),
}

impl AuthError {
    #[must_use]
    pub fn user_message(&self, help_mail: &str) -> String {
        match self {
            Self::AccountLocked => format!("Account is locked contact: {help_mail}"),
            Self::DeviceLocked => format!("Device is locked contact: {help_mail}"),
            Self::Draining | Self::Validation(_) => "Validation failed".to_string(),
        }
    }
}

/// Pure transition-input evaluation, kept separate so the ordering of the
/// checks is testable without a store.
#[must_use]
pub fn derive_state(
    has_mfa_secret: bool,
    account_locked: bool,
    attempts: u32,
    lockout: u32,
    authed: bool,
) -> SessionState {
    if account_locked || attempts >= lockout {
        return SessionState::Locked;
    }
    if !has_mfa_secret {
        return SessionState::Unregistered;
    }
    if authed {
        SessionState::Authenticated
    } else {
        SessionState::Registered
    }
}

pub struct Sessions {
    store: Store,
    firewall: Arc<Firewall>,
    /// Set while this node is drained; drained nodes keep serving existing
    /// tunnels but refuse new MFA redemptions.
    drained: Arc<AtomicBool>,
}

impl Sessions {
    #[must_use]
    pub fn new(store: Store, firewall: Arc<Firewall>) -> Self {
        Self {
            store,
            firewall,
            drained: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn set_drained(&self, drained: bool) {
        self.drained.store(drained, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn state_of(&self, user: &User, device: &Device) -> SessionState {
        derive_state(
            !user.mfa_secret.is_empty(),
            user.locked,
            device.attempts,
            self.firewall.settings().lockout,
            self.firewall.is_authed(device.address),
        )
    }

    /// Registered to Authenticated, after an MFA method accepted the
    /// challenge. Guards run first; the kernel table flips last.
    ///
    /// # Errors
    ///
    /// Returns the user-collapsible [`AuthError`].
    pub async fn authorize(&self, address: Ipv4Addr) -> Result<(), AuthError> {
        if self.is_drained() {
            return Err(AuthError::Draining);
        }

        let device = self
            .device(address)
            .await
            .map_err(AuthError::Validation)?;
        let user = self
            .user(&device.username)
            .await
            .map_err(AuthError::Validation)?;

        if user.locked {
            return Err(AuthError::AccountLocked);
        }
        if device.attempts >= self.firewall.settings().lockout {
            return Err(AuthError::DeviceLocked);
        }

        self.firewall
            .set_authorized(address, &device.username)
            .map_err(|err| AuthError::Validation(err.into()))?;

        // The attempt counter is bookkeeping; the session is already live.
        if let Err(err) = self.store.set_device_attempts(address, 0).await {
            warn!(%address, "unable to reset attempt counter: {err:#}");
        }

        Ok(())
    }

    /// Count a failed challenge; hitting the lockout threshold leaves the
    /// device Locked until an admin resets it.
    ///
    /// # Errors
    ///
    /// Returns an error when the store rejects the update.
    pub async fn record_failure(&self, address: Ipv4Addr) -> anyhow::Result<u32> {
        self.store
            .increment_device_attempts(address)
            .await
            .context("recording failed authorization attempt")
    }

    /// Authenticated back to Registered.
    ///
    /// # Errors
    ///
    /// Returns an error when the device is unknown to the firewall.
    pub fn deauthenticate(&self, address: Ipv4Addr) -> anyhow::Result<()> {
        self.firewall
            .deauthenticate(address)
            .with_context(|| format!("deauthenticating {address}"))
    }

    /// Unregistered to Registered: persist the method secret; the first
    /// completed registration makes the user enforcing.
    ///
    /// # Errors
    ///
    /// Returns an error when the user is unknown, is already enforcing, or
    /// the store write fails.
    pub async fn complete_registration(
        &self,
        username: &str,
        method: &str,
        secret: &str,
    ) -> anyhow::Result<()> {
        let user = self.user(username).await?;
        if user.enforcing {
            return Err(anyhow!("user {username} is already enforcing MFA"));
        }

        self.store.set_user_mfa(username, method, secret).await?;
        self.store.set_user_enforcing(username).await
    }

    /// Admin lock: every device of the user drops out of the data path.
    ///
    /// # Errors
    ///
    /// Returns an error when either the store or the local table rejects
    /// the update.
    pub async fn lock_account(&self, username: &str) -> anyhow::Result<()> {
        self.store.set_user_lock(username, true).await?;
        self.firewall
            .set_user_lock(username, true)
            .context("applying account lock to the local table")
    }

    /// # Errors
    ///
    /// Returns an error when either the store or the local table rejects
    /// the update.
    pub async fn unlock_account(&self, username: &str) -> anyhow::Result<()> {
        self.store.set_user_lock(username, false).await?;
        self.firewall
            .set_user_lock(username, false)
            .context("clearing account lock on the local table")
    }

    /// Admin lock of a single device: the counter jumps past the
    /// threshold.
    ///
    /// # Errors
    ///
    /// Returns an error when the store rejects the update.
    pub async fn lock_device(&self, address: Ipv4Addr) -> anyhow::Result<()> {
        let lockout = self.firewall.settings().lockout;
        self.store
            .set_device_attempts(address, lockout.saturating_add(1))
            .await?;

        // The device may be enforced on another node only; the replicated
        // attempt counter already locks it everywhere.
        match self.firewall.deauthenticate(address) {
            Ok(()) | Err(crate::firewall::FirewallError::UnknownDevice(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Admin reset: zero the counter and clear the owner's account lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the store rejects the update.
    pub async fn reset_device(&self, address: Ipv4Addr) -> anyhow::Result<()> {
        let device = self.device(address).await?;
        self.store.set_device_attempts(address, 0).await?;
        self.store.set_user_lock(&device.username, false).await?;
        self.firewall
            .set_user_lock(&device.username, false)
            .context("clearing account lock on the local table")
    }

    async fn device(&self, address: Ipv4Addr) -> anyhow::Result<Device> {
        self.store
            .get_device(address)
            .await?
            .ok_or_else(|| anyhow!("device {address} is not registered"))
    }

    async fn user(&self, username: &str) -> anyhow::Result<User> {
        self.store
            .get_user(username)
            .await?
            .ok_or_else(|| anyhow!("user {username} is not registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_wins_over_everything() {
        assert_eq!(derive_state(true, true, 0, 5, true), SessionState::Locked);
        assert_eq!(derive_state(false, true, 0, 5, false), SessionState::Locked);
        assert_eq!(derive_state(true, false, 5, 5, true), SessionState::Locked);
        assert_eq!(derive_state(true, false, 6, 5, false), SessionState::Locked);
    }

    #[test]
    fn registration_gates_authentication() {
        assert_eq!(
            derive_state(false, false, 0, 5, false),
            SessionState::Unregistered
        );
        assert_eq!(
            derive_state(true, false, 0, 5, false),
            SessionState::Registered
        );
        assert_eq!(
            derive_state(true, false, 4, 5, true),
            SessionState::Authenticated
        );
    }

    #[test]
    fn lock_messages_disclose_only_help_mail() {
        let mail = "help@example.org";
        assert_eq!(
            AuthError::AccountLocked.user_message(mail),
            "Account is locked contact: help@example.org"
        );
        assert_eq!(
            AuthError::DeviceLocked.user_message(mail),
            "Device is locked contact: help@example.org"
        );
        assert_eq!(
            AuthError::Validation(anyhow!("secret detail")).user_message(mail),
            "Validation failed"
        );
        assert_eq!(AuthError::Draining.user_message(mail), "Validation failed");
    }
}
