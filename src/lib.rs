//! # Pordisto (WireGuard MFA gateway)
//!
//! `pordisto` terminates WireGuard tunnels and refuses to forward anything
//! beyond a per-user allow-list until the peer has cleared an additional MFA
//! challenge over HTTP on the tunnel itself. Enforcement happens in the
//! kernel fast path: an XDP program consults a decision table keyed on the
//! tunnel source address for every forwarded packet, and the control plane
//! only ever mutates that table.
//!
//! ## Data plane
//!
//! The decision table ([`firewall::tables`]) maps tunnel IPv4 address to a
//! device authorization record and holds per-user allow/MFA route sets as
//! nested LPM tries. The [`firewall::Firewall`] controller is the single
//! writer; the XDP program reads lock-free.
//!
//! ## Control plane
//!
//! Device, user, ACL, and configuration state is replicated across gateway
//! nodes through an etcd coordination store ([`store`]). Each node applies
//! replicated events to its own kernel table, so every node enforces the
//! same policy. Cluster membership, drain, and health live in [`cluster`].
//!
//! ## Sessions
//!
//! A device moves between Unregistered, Registered, Authenticated, and
//! Locked ([`session`]); MFA outcomes, inactivity, session lifetime,
//! endpoint roaming, and administrative commands drive the transitions.

pub mod cli;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod control;
pub mod firewall;
pub mod mfa;
pub mod router;
pub mod session;
pub mod store;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
