//! Kernel backend of the decision table.
//!
//! Loads the compiled XDP object, attaches it to the WireGuard interface,
//! and takes ownership of its maps. Inner route tries are created through
//! [`super::sys`] and swapped into the outer hash-of-maps by fd; the
//! kernel replaces the value atomically and frees the orphaned trie once
//! its last reference drops. A userspace shadow of each route list backs
//! snapshots without iterating kernel tries; device records are always
//! read from the kernel so `last_packet_time` updates made by the XDP
//! program stay visible.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use aya::maps::{Array, HashMap as KernelMap, MapData, MapError};
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, Pod};
use ipnet::Ipv4Net;
use sha2::{Digest, Sha256};
use tracing::info;

use super::sys;
use super::tables::{DeviceEntry, RouteTable, Tables, TrieKey, UserId};

// SAFETY: repr(C, packed), Copy, no padding, every bit pattern valid.
unsafe impl Pod for DeviceEntry {}

/// Program symbol inside the XDP object.
const PROGRAM: &str = "xdp_gateway_firewall";

const ATTACH_ATTEMPTS: u32 = 5;

/// `BPF_EXIST` update flag: only overwrite, never create.
const BPF_EXIST: u64 = 2;

pub struct XdpTables {
    devices: KernelMap<MapData, [u8; 4], DeviceEntry>,
    account_locked: KernelMap<MapData, UserId, u32>,
    allow_table: KernelMap<MapData, UserId, u32>,
    mfa_table: KernelMap<MapData, UserId, u32>,
    inactivity: Array<MapData, u64>,
    shadow_allow: HashMap<UserId, Vec<Ipv4Net>>,
    shadow_mfa: HashMap<UserId, Vec<Ipv4Net>>,
    digest: String,
    // Dropping the loader detaches the program, so it lives as long as the
    // table does.
    _ebpf: Ebpf,
}

impl XdpTables {
    /// Load the object at `object_path` and attach it to `interface`.
    ///
    /// # Errors
    ///
    /// Returns an error when the object cannot be read or verified, a map
    /// is missing, or the attach keeps failing.
    pub fn load(object_path: &Path, interface: &str) -> Result<Self> {
        let bytes = std::fs::read(object_path)
            .with_context(|| format!("reading XDP object {}", object_path.display()))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let mut ebpf = Ebpf::load(&bytes).context("loading XDP object")?;

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM)
            .ok_or_else(|| anyhow!("object has no {PROGRAM} program"))?
            .try_into()
            .context("program is not XDP")?;
        program.load().context("verifier rejected the program")?;

        // The previous attachment can linger for a moment when the daemon
        // restarts quickly; retry instead of failing startup.
        let mut attempt = 0;
        loop {
            attempt += 1;
            match program.attach(interface, XdpFlags::default()) {
                Ok(_) => break,
                Err(err) if attempt < ATTACH_ATTEMPTS => {
                    info!(interface, attempt, "XDP attach busy, retrying: {err}");
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("attaching XDP to {interface}"))
                }
            }
        }

        let mut take = |name: &str| {
            ebpf.take_map(name)
                .ok_or_else(|| anyhow!("object has no {name} map"))
        };

        let devices = KernelMap::try_from(take("devices")?)?;
        let account_locked = KernelMap::try_from(take("account_locked")?)?;
        let allow_table = KernelMap::try_from(take("public_table")?)?;
        let mfa_table = KernelMap::try_from(take("mfa_table")?)?;
        let inactivity = Array::try_from(take("inactivity_time")?)?;

        info!(interface, %digest, "XDP firewall attached");

        Ok(Self {
            devices,
            account_locked,
            allow_table,
            mfa_table,
            inactivity,
            shadow_allow: HashMap::new(),
            shadow_mfa: HashMap::new(),
            digest,
            _ebpf: ebpf,
        })
    }

    fn outer_for(&mut self, table: RouteTable) -> &mut KernelMap<MapData, UserId, u32> {
        match table {
            RouteTable::Allow => &mut self.allow_table,
            RouteTable::Mfa => &mut self.mfa_table,
        }
    }

    fn shadow_for(&self, table: RouteTable) -> &HashMap<UserId, Vec<Ipv4Net>> {
        match table {
            RouteTable::Allow => &self.shadow_allow,
            RouteTable::Mfa => &self.shadow_mfa,
        }
    }

    fn shadow_for_mut(&mut self, table: RouteTable) -> &mut HashMap<UserId, Vec<Ipv4Net>> {
        match table {
            RouteTable::Allow => &mut self.shadow_allow,
            RouteTable::Mfa => &mut self.shadow_mfa,
        }
    }
}

fn absent<T>(result: std::result::Result<T, MapError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(MapError::KeyNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl Tables for XdpTables {
    fn device_get(&self, address: Ipv4Addr) -> Result<Option<DeviceEntry>> {
        absent(self.devices.get(&address.octets(), 0))
    }

    fn device_insert(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()> {
        self.devices
            .insert(address.octets(), entry, 0)
            .with_context(|| format!("inserting device {address}"))
    }

    fn device_update(&mut self, address: Ipv4Addr, entry: DeviceEntry) -> Result<()> {
        // BPF_EXIST: the update must not resurrect a removed device.
        self.devices
            .insert(address.octets(), entry, BPF_EXIST)
            .with_context(|| format!("updating device {address}"))
    }

    fn device_remove(&mut self, address: Ipv4Addr) -> Result<bool> {
        match self.devices.remove(&address.octets()) {
            Ok(()) => Ok(true),
            Err(MapError::KeyNotFound) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing device {address}")),
        }
    }

    fn devices(&self) -> Result<Vec<(Ipv4Addr, DeviceEntry)>> {
        let mut out = Vec::new();
        for item in self.devices.iter() {
            let (octets, entry) = item.context("iterating devices map")?;
            out.push((Ipv4Addr::from(octets), entry));
        }
        Ok(out)
    }

    fn lock_get(&self, user: &UserId) -> Result<Option<u32>> {
        absent(self.account_locked.get(user, 0))
    }

    fn lock_set(&mut self, user: &UserId, value: u32) -> Result<()> {
        self.account_locked
            .insert(user, value, 0)
            .context("writing account lock")
    }

    fn lock_remove(&mut self, user: &UserId) -> Result<bool> {
        match self.account_locked.remove(user) {
            Ok(()) => Ok(true),
            Err(MapError::KeyNotFound) => Ok(false),
            Err(err) => Err(err).context("removing account lock"),
        }
    }

    fn routes_replace(
        &mut self,
        user: &UserId,
        table: RouteTable,
        routes: &[Ipv4Net],
    ) -> Result<()> {
        // Build the replacement trie fully before it becomes visible; the
        // outer-map update is the atomic switch-over.
        let trie = sys::create_route_trie().context("creating route trie")?;
        for net in routes {
            sys::trie_insert(&trie, TrieKey::from(*net))
                .with_context(|| format!("inserting route {net}"))?;
        }

        self.outer_for(table)
            .insert(user, trie.as_raw_fd() as u32, 0)
            .with_context(|| format!("installing {} routes", table.as_str()))?;

        // Our fd is no longer needed; the outer map keeps the trie alive.
        drop(trie);

        self.shadow_for_mut(table).insert(*user, routes.to_vec());
        Ok(())
    }

    fn routes_remove(&mut self, user: &UserId, table: RouteTable) -> Result<bool> {
        let existed = match self.outer_for(table).remove(user) {
            Ok(()) => true,
            Err(MapError::KeyNotFound) => false,
            Err(err) => {
                return Err(err).with_context(|| format!("removing {} routes", table.as_str()))
            }
        };
        self.shadow_for_mut(table).remove(user);
        Ok(existed)
    }

    fn routes_get(&self, user: &UserId, table: RouteTable) -> Result<Option<Vec<Ipv4Net>>> {
        Ok(self.shadow_for(table).get(user).cloned())
    }

    fn routes_contain(
        &self,
        user: &UserId,
        table: RouteTable,
        destination: Ipv4Addr,
    ) -> Result<bool> {
        Ok(self
            .shadow_for(table)
            .get(user)
            .is_some_and(|routes| routes.iter().any(|net| net.contains(&destination))))
    }

    fn set_inactivity_timeout(&mut self, ns: u64) -> Result<()> {
        self.inactivity
            .set(0, ns, 0)
            .context("writing inactivity timeout")
    }

    fn inactivity_timeout(&self) -> Result<u64> {
        self.inactivity.get(&0, 0).context("reading inactivity timeout")
    }

    fn object_digest(&self) -> &str {
        &self.digest
    }
}
