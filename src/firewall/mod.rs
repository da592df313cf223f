//! Firewall controller.
//!
//! Single owner of the packet-path decision table. Every other component
//! mutates kernel state through this controller; the XDP program itself
//! never takes part in the lock and reads the maps lock-free.
//!
//! Locking discipline: one process-wide reader-writer lock. Mutators hold
//! the writer side, `is_authed`/`get_rules`/`would_forward` hold the
//! reader side, and nothing suspends while holding either (kernel-map
//! syscalls are the only blocking work done under the lock).

use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub mod sys;
pub mod tables;
pub mod xdp;

pub use tables::{
    DeviceEntry, MemoryTables, RouteTable, Tables, TrieKey, UserId, INACTIVITY_DISABLED,
    SESSION_NEVER_EXPIRES,
};

use crate::clock::Clock;

/// The opaque kernel-side user key: SHA-1 of the username.
///
/// Used purely as a 20-byte identifier, not as a security primitive; a
/// collision between two configured usernames is a configuration error and
/// is rejected by [`Firewall::add_user`].
#[must_use]
pub fn user_id(username: &str) -> UserId {
    Sha1::digest(username.as_bytes()).into()
}

/// A user's derived route sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Reachable without MFA.
    pub allow: Vec<Ipv4Net>,
    /// Reachable only while authenticated.
    pub mfa: Vec<Ipv4Net>,
}

impl Acl {
    /// Parse rule strings; bare addresses become `/32` networks.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first rule that is neither a CIDR nor an
    /// IPv4 address.
    pub fn parse(allow: &[String], mfa: &[String]) -> anyhow::Result<Self> {
        Ok(Self {
            allow: parse_destinations(allow)?,
            mfa: parse_destinations(mfa)?,
        })
    }
}

fn parse_destinations(rules: &[String]) -> anyhow::Result<Vec<Ipv4Net>> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        let rule = rule.trim();
        let net = rule
            .parse::<Ipv4Net>()
            .or_else(|_| rule.parse::<Ipv4Addr>().map(Ipv4Net::from));
        match net {
            Ok(net) => out.push(net),
            Err(_) => anyhow::bail!("could not parse destination from {rule}"),
        }
    }
    Ok(out)
}

/// Timeouts and thresholds the controller enforces; refreshed with the
/// replicated configuration.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// [`INACTIVITY_DISABLED`] disables the inactivity check.
    pub inactivity_ns: u64,
    /// [`SESSION_NEVER_EXPIRES`] disables session expiry.
    pub session_lifetime_ns: u64,
    /// Failed authorization attempts before a device locks.
    pub lockout: u32,
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("user already exists in the firewall")]
    UserExists,
    #[error("device {0} already exists")]
    DeviceExists(Ipv4Addr),
    #[error("user is not present in the firewall")]
    UnknownUser,
    #[error("device {0} is not present in the firewall")]
    UnknownDevice(Ipv4Addr),
    #[error("device {0} does not belong to the given user")]
    UserMismatch(Ipv4Addr),
    #[error("user removal touched only part of the table: lock={lock} allow={allow} mfa={mfa}")]
    PartialRemoval { lock: bool, allow: bool, mfa: bool },
    #[error("removing user state failed: {details}")]
    RemovalFailed { details: String },
    #[error("route replacement failed: {details}")]
    AclReplace { details: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// One device's row in a [`Firewall::get_rules`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub address: Ipv4Addr,
    pub user_id: String,
    pub last_packet_time: u64,
    pub session_expiry: u64,
    pub authorized: bool,
    pub allow: Vec<Ipv4Net>,
    pub mfa: Vec<Ipv4Net>,
}

struct Inner {
    tables: Box<dyn Tables>,
    settings: Settings,
}

pub struct Firewall {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl Firewall {
    /// Wrap a decision-table backend.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial inactivity write fails.
    pub fn new(
        mut tables: Box<dyn Tables>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        tables
            .set_inactivity_timeout(settings.inactivity_ns)
            .context("seeding inactivity timeout")?;

        Ok(Self {
            inner: RwLock::new(Inner { tables, settings }),
            clock,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a user and install both route tables.
    ///
    /// # Errors
    ///
    /// [`FirewallError::UserExists`] when the user key is already present
    /// (including a digest collision with another username).
    pub fn add_user(&self, username: &str, acl: &Acl) -> Result<(), FirewallError> {
        let uid = user_id(username);
        let mut inner = self.write();

        if inner.tables.lock_get(&uid)?.is_some() {
            return Err(FirewallError::UserExists);
        }

        inner.tables.lock_set(&uid, 0)?;
        replace_both(&mut *inner.tables, &uid, acl)?;

        Ok(())
    }

    /// Remove a user's lock word and both route tables.
    ///
    /// A fully absent user is treated as an idempotent delete; removing
    /// only part of the state is reported so the operator can reconcile.
    ///
    /// # Errors
    ///
    /// [`FirewallError::RemovalFailed`] carries each failing side's own
    /// error; [`FirewallError::PartialRemoval`] reports a half-present
    /// user.
    pub fn remove_user(&self, username: &str) -> Result<(), FirewallError> {
        let uid = user_id(username);
        let mut inner = self.write();

        let lock = inner.tables.lock_remove(&uid);
        let allow = inner.tables.routes_remove(&uid, RouteTable::Allow);
        let mfa = inner.tables.routes_remove(&uid, RouteTable::Mfa);

        let mut failures = Vec::new();
        for (side, result) in [("account lock", &lock), ("allow", &allow), ("mfa", &mfa)] {
            if let Err(err) = result {
                failures.push(format!("{side}: {err:#}"));
            }
        }
        if !failures.is_empty() {
            return Err(FirewallError::RemovalFailed {
                details: failures.join("; "),
            });
        }

        // All three are Ok here.
        let lock = lock.unwrap_or_default();
        let allow = allow.unwrap_or_default();
        let mfa = mfa.unwrap_or_default();

        if lock != allow || allow != mfa {
            return Err(FirewallError::PartialRemoval { lock, allow, mfa });
        }

        Ok(())
    }

    /// Add a device in the unauthenticated state.
    ///
    /// # Errors
    ///
    /// [`FirewallError::DeviceExists`] on duplicate address,
    /// [`FirewallError::UnknownUser`] when the owner was never added.
    pub fn add_device(&self, username: &str, address: Ipv4Addr) -> Result<(), FirewallError> {
        let uid = user_id(username);
        let mut inner = self.write();

        if inner.tables.device_get(address)?.is_some() {
            return Err(FirewallError::DeviceExists(address));
        }
        if inner.tables.lock_get(&uid)?.is_none() {
            return Err(FirewallError::UnknownUser);
        }

        inner
            .tables
            .device_insert(address, DeviceEntry::unauthenticated(uid))?;
        Ok(())
    }

    /// Remove a device record; missing devices are an idempotent success.
    ///
    /// # Errors
    ///
    /// Returns backend failures only.
    pub fn remove_device(&self, address: Ipv4Addr) -> Result<(), FirewallError> {
        let mut inner = self.write();
        inner.tables.device_remove(address)?;
        Ok(())
    }

    /// Mark a device authenticated: stamp the activity clock and set the
    /// session deadline from the configured lifetime.
    ///
    /// # Errors
    ///
    /// [`FirewallError::UnknownDevice`] when the address is absent,
    /// [`FirewallError::UserMismatch`] when the record belongs to a
    /// different user.
    pub fn set_authorized(&self, address: Ipv4Addr, username: &str) -> Result<(), FirewallError> {
        let mut inner = self.write();

        let mut entry = inner
            .tables
            .device_get(address)?
            .ok_or(FirewallError::UnknownDevice(address))?;

        if entry.user_id != user_id(username) {
            return Err(FirewallError::UserMismatch(address));
        }

        let now = self.clock.now_ns();
        entry.last_packet_time = now;
        entry.session_expiry = if inner.settings.session_lifetime_ns == SESSION_NEVER_EXPIRES {
            SESSION_NEVER_EXPIRES
        } else {
            now + inner.settings.session_lifetime_ns
        };

        inner.tables.device_update(address, entry)?;
        Ok(())
    }

    /// Zero both timestamps, returning the device to the registered,
    /// unauthenticated state.
    ///
    /// # Errors
    ///
    /// [`FirewallError::UnknownDevice`] when the address is absent.
    pub fn deauthenticate(&self, address: Ipv4Addr) -> Result<(), FirewallError> {
        let mut inner = self.write();

        let mut entry = inner
            .tables
            .device_get(address)?
            .ok_or(FirewallError::UnknownDevice(address))?;

        entry.last_packet_time = 0;
        entry.session_expiry = 0;

        inner.tables.device_update(address, entry)?;
        Ok(())
    }

    /// Write the account-lock word for an existing user.
    ///
    /// # Errors
    ///
    /// [`FirewallError::UnknownUser`] when the user was never added.
    pub fn set_user_lock(&self, username: &str, locked: bool) -> Result<(), FirewallError> {
        let uid = user_id(username);
        let mut inner = self.write();

        if inner.tables.lock_get(&uid)?.is_none() {
            return Err(FirewallError::UnknownUser);
        }

        inner.tables.lock_set(&uid, u32::from(locked))?;
        Ok(())
    }

    /// Swap in freshly built route tables for one user.
    ///
    /// Partial replacement is forbidden: both sides are attempted and any
    /// failure is reported naming the side, while the untouched side keeps
    /// its previous table.
    ///
    /// # Errors
    ///
    /// [`FirewallError::AclReplace`] listing each failing side.
    pub fn refresh_user_acls(&self, username: &str, acl: &Acl) -> Result<(), FirewallError> {
        let uid = user_id(username);
        let mut inner = self.write();

        if inner.tables.lock_get(&uid)?.is_none() {
            return Err(FirewallError::UnknownUser);
        }

        replace_both(&mut *inner.tables, &uid, acl)
    }

    /// Apply new settings and rebuild every user's route tables.
    ///
    /// Returns one error per user that failed; the rest are refreshed
    /// regardless.
    pub fn refresh_configuration(
        &self,
        settings: Settings,
        acls: &[(String, Acl)],
    ) -> Vec<(String, FirewallError)> {
        let mut inner = self.write();
        inner.settings = settings;

        if let Err(err) = inner.tables.set_inactivity_timeout(settings.inactivity_ns) {
            return vec![(String::from("<inactivity>"), FirewallError::Backend(err))];
        }

        let mut errors = Vec::new();
        for (username, acl) in acls {
            let uid = user_id(username);
            if let Err(err) = replace_both(&mut *inner.tables, &uid, acl) {
                errors.push((username.clone(), err));
            }
        }
        errors
    }

    /// The packet-path session check, §-for-§ what the XDP program
    /// computes before consulting the MFA route table.
    #[must_use]
    pub fn is_authed(&self, address: Ipv4Addr) -> bool {
        let inner = self.read();
        self.is_authed_locked(&inner, address)
    }

    fn is_authed_locked(&self, inner: &Inner, address: Ipv4Addr) -> bool {
        let Ok(Some(entry)) = inner.tables.device_get(address) else {
            return false;
        };
        let Ok(Some(locked)) = inner.tables.lock_get(&{ entry.user_id }) else {
            return false;
        };
        if locked != 0 {
            return false;
        }

        let now = self.clock.now_ns();
        let expiry = entry.session_expiry;
        let last = entry.last_packet_time;

        let session_valid = expiry == SESSION_NEVER_EXPIRES || expiry > now;
        let session_active = inner.settings.inactivity_ns == INACTIVITY_DISABLED
            || now.saturating_sub(last) < inner.settings.inactivity_ns;

        session_valid && session_active
    }

    /// Read-only emulation of the full XDP verdict for a packet from
    /// `source` to `destination`. Diagnostics only; the kernel path also
    /// refreshes the activity stamp, this does not.
    ///
    /// # Errors
    ///
    /// Returns backend failures only.
    pub fn would_forward(
        &self,
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<bool, FirewallError> {
        let inner = self.read();

        let Some(entry) = inner.tables.device_get(source)? else {
            return Ok(false);
        };
        let uid = entry.user_id;

        match inner.tables.lock_get(&uid)? {
            None => return Ok(false),
            Some(locked) if locked != 0 => return Ok(false),
            Some(_) => {}
        }

        if inner.tables.routes_contain(&uid, RouteTable::Allow, destination)? {
            return Ok(true);
        }

        if self.is_authed_locked(&inner, source) {
            return Ok(inner.tables.routes_contain(&uid, RouteTable::Mfa, destination)?);
        }

        Ok(false)
    }

    /// Addresses of every device that currently passes the session check.
    ///
    /// # Errors
    ///
    /// Returns backend failures only.
    pub fn authorised_devices(&self) -> Result<Vec<Ipv4Addr>, FirewallError> {
        let inner = self.read();
        let mut out = Vec::new();
        for (address, _) in inner.tables.devices()? {
            if self.is_authed_locked(&inner, address) {
                out.push(address);
            }
        }
        Ok(out)
    }

    /// Snapshot every device with its user's route lists and the result of
    /// the session check.
    ///
    /// # Errors
    ///
    /// Returns backend failures only.
    pub fn get_rules(&self) -> Result<Vec<RuleSnapshot>, FirewallError> {
        let inner = self.read();
        let mut out = Vec::new();

        for (address, entry) in inner.tables.devices()? {
            let uid = entry.user_id;
            out.push(RuleSnapshot {
                address,
                user_id: hex::encode(uid),
                last_packet_time: entry.last_packet_time,
                session_expiry: entry.session_expiry,
                authorized: self.is_authed_locked(&inner, address),
                allow: inner
                    .tables
                    .routes_get(&uid, RouteTable::Allow)?
                    .unwrap_or_default(),
                mfa: inner
                    .tables
                    .routes_get(&uid, RouteTable::Mfa)?
                    .unwrap_or_default(),
            });
        }

        Ok(out)
    }

    #[must_use]
    pub fn settings(&self) -> Settings {
        self.read().settings
    }

    #[must_use]
    pub fn object_digest(&self) -> String {
        self.read().tables.object_digest().to_string()
    }
}

fn replace_both(tables: &mut dyn Tables, uid: &UserId, acl: &Acl) -> Result<(), FirewallError> {
    let allow = tables.routes_replace(uid, RouteTable::Allow, &acl.allow);
    let mfa = tables.routes_replace(uid, RouteTable::Mfa, &acl.mfa);

    let mut failures = Vec::new();
    for (side, result) in [("allow", allow), ("mfa", mfa)] {
        if let Err(err) = result {
            failures.push(format!("{side}: {err:#}"));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(FirewallError::AclReplace {
            details: failures.join("; "),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    const MINUTE_NS: u64 = 60_000_000_000;

    fn firewall(clock: Arc<ManualClock>, settings: Settings) -> Firewall {
        Firewall::new(Box::new(MemoryTables::new()), clock, settings).unwrap()
    }

    fn default_settings() -> Settings {
        Settings {
            inactivity_ns: INACTIVITY_DISABLED,
            session_lifetime_ns: 3 * MINUTE_NS,
            lockout: 5,
        }
    }

    fn alice_acl() -> Acl {
        Acl::parse(
            &["10.0.0.0/24".to_string()],
            &["10.1.0.0/16".to_string()],
        )
        .unwrap()
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn user_id_is_stable_and_distinct() {
        assert_eq!(user_id("alice"), user_id("alice"));
        assert_ne!(user_id("alice"), user_id("bob"));
    }

    #[test]
    fn acl_parse_promotes_bare_addresses() {
        let acl = Acl::parse(&["10.0.0.1".to_string()], &[]).unwrap();
        assert_eq!(acl.allow, vec!["10.0.0.1/32".parse::<Ipv4Net>().unwrap()]);
        assert!(Acl::parse(&["not an ip".to_string()], &[]).is_err());
    }

    #[test]
    fn add_user_rejects_duplicates() {
        let fw = firewall(Arc::new(ManualClock::default()), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        assert!(matches!(
            fw.add_user("alice", &alice_acl()),
            Err(FirewallError::UserExists)
        ));
    }

    #[test]
    fn add_device_requires_user() {
        let fw = firewall(Arc::new(ManualClock::default()), default_settings());
        assert!(matches!(
            fw.add_device("ghost", addr("192.0.2.5")),
            Err(FirewallError::UnknownUser)
        ));
    }

    #[test]
    fn fresh_device_is_unauthenticated() {
        // Scenario: cold start with one device.
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();

        assert!(!fw.is_authed(addr("192.0.2.5")));
        // The allow route passes without MFA, the MFA route does not.
        assert!(fw.would_forward(addr("192.0.2.5"), addr("10.0.0.7")).unwrap());
        assert!(!fw.would_forward(addr("192.0.2.5"), addr("10.1.2.3")).unwrap());
        // Unknown source addresses are dropped outright.
        assert!(!fw.would_forward(addr("192.0.2.99"), addr("10.0.0.7")).unwrap());
    }

    #[test]
    fn authorize_then_expire() {
        let clock = Arc::new(ManualClock::new(MINUTE_NS));
        let mut settings = default_settings();
        settings.session_lifetime_ns = MINUTE_NS;
        let fw = firewall(clock.clone(), settings);

        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();
        fw.set_authorized(addr("192.0.2.5"), "alice").unwrap();

        assert!(fw.is_authed(addr("192.0.2.5")));
        assert!(fw.would_forward(addr("192.0.2.5"), addr("10.1.2.3")).unwrap());

        clock.advance(Duration::from_secs(61));
        assert!(!fw.is_authed(addr("192.0.2.5")));
        assert!(!fw.would_forward(addr("192.0.2.5"), addr("10.1.2.3")).unwrap());
    }

    #[test]
    fn inactivity_expires_sessions() {
        let clock = Arc::new(ManualClock::new(MINUTE_NS));
        let mut settings = default_settings();
        settings.inactivity_ns = MINUTE_NS;
        let fw = firewall(clock.clone(), settings);

        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();
        fw.set_authorized(addr("192.0.2.5"), "alice").unwrap();

        assert!(fw.is_authed(addr("192.0.2.5")));
        clock.advance(Duration::from_secs(61));
        assert!(!fw.is_authed(addr("192.0.2.5")));
    }

    #[test]
    fn negative_lifetime_never_expires() {
        let clock = Arc::new(ManualClock::new(MINUTE_NS));
        let mut settings = default_settings();
        settings.session_lifetime_ns = SESSION_NEVER_EXPIRES;
        let fw = firewall(clock.clone(), settings);

        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();
        fw.set_authorized(addr("192.0.2.5"), "alice").unwrap();

        clock.advance(Duration::from_secs(3600 * 24 * 365));
        assert!(fw.is_authed(addr("192.0.2.5")));
    }

    #[test]
    fn deauthenticate_clears_session() {
        // P4: deauthenticate then is_authed is false.
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();
        fw.set_authorized(addr("192.0.2.5"), "alice").unwrap();
        assert!(fw.is_authed(addr("192.0.2.5")));

        fw.deauthenticate(addr("192.0.2.5")).unwrap();
        assert!(!fw.is_authed(addr("192.0.2.5")));
    }

    #[test]
    fn account_lock_cascades_to_every_device() {
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();
        fw.add_device("alice", addr("192.0.2.6")).unwrap();
        fw.set_authorized(addr("192.0.2.5"), "alice").unwrap();
        fw.set_authorized(addr("192.0.2.6"), "alice").unwrap();

        fw.set_user_lock("alice", true).unwrap();
        assert!(!fw.is_authed(addr("192.0.2.5")));
        assert!(!fw.is_authed(addr("192.0.2.6")));
        assert!(!fw.would_forward(addr("192.0.2.5"), addr("10.0.0.7")).unwrap());

        fw.set_user_lock("alice", false).unwrap();
        assert!(fw.is_authed(addr("192.0.2.5")));
    }

    #[test]
    fn set_authorized_verifies_ownership() {
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_user("bob", &Acl::default()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();

        assert!(matches!(
            fw.set_authorized(addr("192.0.2.5"), "bob"),
            Err(FirewallError::UserMismatch(_))
        ));
        assert!(matches!(
            fw.set_authorized(addr("192.0.2.9"), "alice"),
            Err(FirewallError::UnknownDevice(_))
        ));
    }

    #[test]
    fn remove_user_tolerates_only_full_absence() {
        let fw = firewall(Arc::new(ManualClock::default()), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();

        fw.remove_user("alice").unwrap();
        // A second removal finds nothing anywhere, which is fine.
        fw.remove_user("alice").unwrap();
    }

    #[test]
    fn refresh_swaps_acls_atomically_per_side() {
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();
        fw.add_device("alice", addr("192.0.2.5")).unwrap();

        let replacement = Acl::parse(&["172.16.0.0/12".to_string()], &[]).unwrap();
        fw.refresh_user_acls("alice", &replacement).unwrap();

        assert!(fw.would_forward(addr("192.0.2.5"), addr("172.16.1.1")).unwrap());
        assert!(!fw.would_forward(addr("192.0.2.5"), addr("10.0.0.7")).unwrap());

        let rules = fw.get_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].allow, replacement.allow);
        assert!(rules[0].mfa.is_empty());
    }

    #[test]
    fn refresh_configuration_collects_per_user_errors() {
        let fw = firewall(Arc::new(ManualClock::new(MINUTE_NS)), default_settings());
        fw.add_user("alice", &alice_acl()).unwrap();

        let mut settings = default_settings();
        settings.inactivity_ns = 7;
        let errors =
            fw.refresh_configuration(settings, &[("alice".to_string(), alice_acl())]);
        assert!(errors.is_empty());
        assert_eq!(fw.settings().inactivity_ns, 7);
    }
}
