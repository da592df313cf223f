//! Decision-table layouts and backends.
//!
//! The kernel program and the controller share four tables: `devices`
//! (tunnel IPv4 to authorization record), `account_locked` (user key to
//! lock word), and the `public`/`mfa` route tables (user key to an LPM trie
//! of destination CIDRs). A single-cell array carries the inactivity
//! timeout. [`Tables`] abstracts over the two owners of that state: the
//! real kernel maps ([`super::xdp::XdpTables`]) and an in-process
//! implementation used by tests and kernel-less deployments.
//!
//! Layout types are `#[repr(C)]` and byte-compatible with the XDP object;
//! the tests at the bottom pin their sizes.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use ipnet::Ipv4Net;

/// Opaque 20-byte user key (digest of the username).
pub type UserId = [u8; 20];

/// `session_expiry` value meaning the session never expires.
pub const SESSION_NEVER_EXPIRES: u64 = u64::MAX;

/// Inactivity-cell value disabling the inactivity check.
pub const INACTIVITY_DISABLED: u64 = u64::MAX;

/// Value of a `devices` entry.
///
/// Packed to 36 bytes, little-endian host order, exactly as the XDP
/// program reads it.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEntry {
    pub user_id: UserId,
    /// Boot-time nanoseconds of the last forwarded packet; the XDP program
    /// refreshes this on every pass.
    pub last_packet_time: u64,
    /// Boot-time nanoseconds at which the session lapses;
    /// [`SESSION_NEVER_EXPIRES`] disables expiry, zero means
    /// unauthenticated.
    pub session_expiry: u64,
}

impl DeviceEntry {
    /// A freshly added, unauthenticated device.
    #[must_use]
    pub fn unauthenticated(user_id: UserId) -> Self {
        Self {
            user_id,
            last_packet_time: 0,
            session_expiry: 0,
        }
    }
}

/// LPM-trie key: prefix length in host order, address in network order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieKey {
    pub prefix_len: u32,
    pub addr: [u8; 4],
}

impl From<Ipv4Net> for TrieKey {
    fn from(net: Ipv4Net) -> Self {
        Self {
            prefix_len: u32::from(net.prefix_len()),
            addr: net.network().octets(),
        }
    }
}

/// Which of the two per-user route tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTable {
    /// Reachable without MFA.
    Allow,
    /// Reachable only while the session is valid and active.
    Mfa,
}

impl RouteTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Mfa => "mfa",
        }
    }
}

/// Backend contract for the decision table.
///
/// Mutations are called under the controller's writer lock and must apply
/// each record atomically; readers (and the XDP program) may observe the
/// table before or after a mutation, never a torn record.
pub trait Tables: Send + Sync {
    /// # Errors
    /// Returns an error when the backend lookup fails.
    fn device_get(&self, address: Ipv4Addr) -> Result<Option<DeviceEntry>>;

    /// Insert a device record; the caller has already checked for
    /// duplicates under the writer lock.
    ///
    /// # Errors
    /// Returns an error when the backend write fails.
    fn device_insert(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()>;

    /// Overwrite an existing device record.
    ///
    /// # Errors
    /// Returns an error when the device is absent or the write fails.
    fn device_update(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()>;

    /// Remove a device record, reporting whether it existed.
    ///
    /// # Errors
    /// Returns an error when the backend delete fails for another reason.
    fn device_remove(&mut self, address: Ipv4Addr) -> Result<bool>;

    /// Snapshot of every device record.
    ///
    /// # Errors
    /// Returns an error when iteration fails.
    fn devices(&self) -> Result<Vec<(Ipv4Addr, DeviceEntry)>>;

    /// # Errors
    /// Returns an error when the backend lookup fails.
    fn lock_get(&self, user: &UserId) -> Result<Option<u32>>;

    /// # Errors
    /// Returns an error when the backend write fails.
    fn lock_set(&mut self, user: &UserId, value: u32) -> Result<()>;

    /// # Errors
    /// Returns an error when the backend delete fails for another reason.
    fn lock_remove(&mut self, user: &UserId) -> Result<bool>;

    /// Atomically replace a user's route list with a freshly built one.
    ///
    /// # Errors
    /// Returns an error when building or installing the new list fails; the
    /// previous list stays in place in that case.
    fn routes_replace(&mut self, user: &UserId, table: RouteTable, routes: &[Ipv4Net])
        -> Result<()>;

    /// # Errors
    /// Returns an error when the backend delete fails for another reason.
    fn routes_remove(&mut self, user: &UserId, table: RouteTable) -> Result<bool>;

    /// # Errors
    /// Returns an error when the backend lookup fails.
    fn routes_get(&self, user: &UserId, table: RouteTable) -> Result<Option<Vec<Ipv4Net>>>;

    /// Longest-prefix-match membership test for a destination address.
    ///
    /// # Errors
    /// Returns an error when the backend lookup fails.
    fn routes_contain(
        &self,
        user: &UserId,
        table: RouteTable,
        destination: Ipv4Addr,
    ) -> Result<bool>;

    /// # Errors
    /// Returns an error when the backend write fails.
    fn set_inactivity_timeout(&mut self, ns: u64) -> Result<()>;

    /// # Errors
    /// Returns an error when the backend lookup fails.
    fn inactivity_timeout(&self) -> Result<u64>;

    /// Hex digest of the loaded enforcement object, for diagnostics.
    fn object_digest(&self) -> &str;
}

/// Complete in-process implementation of the decision table.
pub struct MemoryTables {
    devices: BTreeMap<[u8; 4], DeviceEntry>,
    locks: HashMap<UserId, u32>,
    allow_routes: HashMap<UserId, Vec<Ipv4Net>>,
    mfa_routes: HashMap<UserId, Vec<Ipv4Net>>,
    inactivity_ns: u64,
}

impl MemoryTables {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            locks: HashMap::new(),
            allow_routes: HashMap::new(),
            mfa_routes: HashMap::new(),
            inactivity_ns: INACTIVITY_DISABLED,
        }
    }

    fn routes_for(&self, table: RouteTable) -> &HashMap<UserId, Vec<Ipv4Net>> {
        match table {
            RouteTable::Allow => &self.allow_routes,
            RouteTable::Mfa => &self.mfa_routes,
        }
    }

    fn routes_for_mut(&mut self, table: RouteTable) -> &mut HashMap<UserId, Vec<Ipv4Net>> {
        match table {
            RouteTable::Allow => &mut self.allow_routes,
            RouteTable::Mfa => &mut self.mfa_routes,
        }
    }
}

impl Default for MemoryTables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables for MemoryTables {
    fn device_get(&self, address: Ipv4Addr) -> Result<Option<DeviceEntry>> {
        Ok(self.devices.get(&address.octets()).copied())
    }

    fn device_insert(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()> {
        self.devices.insert(address.octets(), entry);
        Ok(())
    }

    fn device_update(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()> {
        match self.devices.get_mut(&address.octets()) {
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => Err(anyhow!("device {address} is not present in the table")),
        }
    }

    fn device_remove(&mut self, address: Ipv4Addr) -> Result<bool> {
        Ok(self.devices.remove(&address.octets()).is_some())
    }

    fn devices(&self) -> Result<Vec<(Ipv4Addr, DeviceEntry)>> {
        Ok(self
            .devices
            .iter()
            .map(|(octets, entry)| (Ipv4Addr::from(*octets), *entry))
            .collect())
    }

    fn lock_get(&self, user: &UserId) -> Result<Option<u32>> {
        Ok(self.locks.get(user).copied())
    }

    fn lock_set(&mut self, user: &UserId, value: u32) -> Result<()> {
        self.locks.insert(*user, value);
        Ok(())
    }

    fn lock_remove(&mut self, user: &UserId) -> Result<bool> {
        Ok(self.locks.remove(user).is_some())
    }

    fn routes_replace(
        &mut self,
        user: &UserId,
        table: RouteTable,
        routes: &[Ipv4Net],
    ) -> Result<()> {
        self.routes_for_mut(table).insert(*user, routes.to_vec());
        Ok(())
    }

    fn routes_remove(&mut self, user: &UserId, table: RouteTable) -> Result<bool> {
        Ok(self.routes_for_mut(table).remove(user).is_some())
    }

    fn routes_get(&self, user: &UserId, table: RouteTable) -> Result<Option<Vec<Ipv4Net>>> {
        Ok(self.routes_for(table).get(user).cloned())
    }

    fn routes_contain(
        &self,
        user: &UserId,
        table: RouteTable,
        destination: Ipv4Addr,
    ) -> Result<bool> {
        Ok(self
            .routes_for(table)
            .get(user)
            .is_some_and(|routes| routes.iter().any(|net| net.contains(&destination))))
    }

    fn set_inactivity_timeout(&mut self, ns: u64) -> Result<()> {
        self.inactivity_ns = ns;
        Ok(())
    }

    fn inactivity_timeout(&self) -> Result<u64> {
        Ok(self.inactivity_ns)
    }

    fn object_digest(&self) -> &str {
        "in-process"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn device_entry_layout() {
        // The XDP object reads this value packed: 20 + 8 + 8.
        assert_eq!(std::mem::size_of::<DeviceEntry>(), 36);
        assert_eq!(std::mem::align_of::<DeviceEntry>(), 1);
    }

    #[test]
    fn trie_key_layout() {
        assert_eq!(std::mem::size_of::<TrieKey>(), 8);
        assert_eq!(std::mem::offset_of!(TrieKey, prefix_len), 0);
        assert_eq!(std::mem::offset_of!(TrieKey, addr), 4);
    }

    #[test]
    fn trie_key_from_net_masks_host_bits() {
        let key = TrieKey::from("10.1.2.3/16".parse::<Ipv4Net>().unwrap());
        assert_eq!(key.prefix_len, 16);
        assert_eq!(key.addr, [10, 1, 0, 0]);
    }

    #[test]
    fn memory_tables_device_roundtrip() {
        let mut tables = MemoryTables::new();
        let address: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let entry = DeviceEntry::unauthenticated([1; 20]);

        assert!(tables.device_get(address).unwrap().is_none());
        tables.device_insert(address, entry).unwrap();
        assert_eq!(tables.device_get(address).unwrap(), Some(entry));

        assert!(tables.device_remove(address).unwrap());
        assert!(!tables.device_remove(address).unwrap());
    }

    #[test]
    fn memory_tables_update_requires_presence() {
        let mut tables = MemoryTables::new();
        let address: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let entry = DeviceEntry::unauthenticated([1; 20]);
        assert!(tables.device_update(address, entry).is_err());
    }

    #[test]
    fn memory_tables_route_match_is_prefix_based() {
        let mut tables = MemoryTables::new();
        let user = [9u8; 20];
        tables
            .routes_replace(
                &user,
                RouteTable::Allow,
                &["10.0.0.0/24".parse().unwrap()],
            )
            .unwrap();

        assert!(tables
            .routes_contain(&user, RouteTable::Allow, "10.0.0.7".parse().unwrap())
            .unwrap());
        assert!(!tables
            .routes_contain(&user, RouteTable::Allow, "10.0.1.7".parse().unwrap())
            .unwrap());
        assert!(!tables
            .routes_contain(&user, RouteTable::Mfa, "10.0.0.7".parse().unwrap())
            .unwrap());
    }
}
