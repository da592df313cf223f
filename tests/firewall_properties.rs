//! End-to-end properties of the decision table and its surroundings,
//! exercised over the in-process backend with a hand-driven clock.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pordisto::clock::ManualClock;
use pordisto::firewall::{
    Acl, Firewall, MemoryTables, Settings, INACTIVITY_DISABLED, SESSION_NEVER_EXPIRES,
};
use pordisto::router::watcher::{self, EndpointChange, EndpointSink};

const MINUTE_NS: u64 = 60_000_000_000;

fn addr(s: &str) -> Ipv4Addr {
    s.parse().expect("test address")
}

fn firewall(clock: Arc<ManualClock>, settings: Settings) -> Firewall {
    Firewall::new(Box::new(MemoryTables::new()), clock, settings).expect("firewall")
}

fn settings() -> Settings {
    Settings {
        inactivity_ns: INACTIVITY_DISABLED,
        session_lifetime_ns: 3 * MINUTE_NS,
        lockout: 5,
    }
}

fn alice_acl() -> Acl {
    Acl::parse(&["10.0.0.0/24".to_string()], &["10.1.0.0/16".to_string()]).expect("acl")
}

/// Scenario: cold start with one device, then the full authorize /
/// expire / deauthenticate lifecycle.
#[test]
fn session_lifecycle() {
    let clock = Arc::new(ManualClock::new(MINUTE_NS));
    let mut s = settings();
    s.session_lifetime_ns = MINUTE_NS;
    let fw = firewall(clock.clone(), s);

    fw.add_user("alice", &alice_acl()).expect("add user");
    fw.add_device("alice", addr("192.0.2.5")).expect("add device");

    // Fresh device: allow-list passes, MFA list does not.
    assert!(!fw.is_authed(addr("192.0.2.5")));
    assert!(fw.would_forward(addr("192.0.2.5"), addr("10.0.0.7")).expect("verdict"));
    assert!(!fw.would_forward(addr("192.0.2.5"), addr("10.1.2.3")).expect("verdict"));

    // P5: authorize makes the session check pass.
    fw.set_authorized(addr("192.0.2.5"), "alice").expect("authorize");
    assert!(fw.is_authed(addr("192.0.2.5")));
    assert!(fw.would_forward(addr("192.0.2.5"), addr("10.1.2.3")).expect("verdict"));

    // One minute lifetime: 61 simulated seconds later it lapses.
    clock.advance(Duration::from_secs(61));
    assert!(!fw.is_authed(addr("192.0.2.5")));

    // P4: an explicit deauth also ends a fresh session.
    fw.set_authorized(addr("192.0.2.5"), "alice").expect("authorize");
    assert!(fw.is_authed(addr("192.0.2.5")));
    fw.deauthenticate(addr("192.0.2.5")).expect("deauth");
    assert!(!fw.is_authed(addr("192.0.2.5")));
}

/// P3: the session check is exactly device ∧ unlocked ∧ valid ∧ active.
#[test]
fn inactivity_and_lifetime_combine() {
    let clock = Arc::new(ManualClock::new(MINUTE_NS));
    let mut s = settings();
    s.inactivity_ns = MINUTE_NS;
    s.session_lifetime_ns = SESSION_NEVER_EXPIRES;
    let fw = firewall(clock.clone(), s);

    fw.add_user("alice", &alice_acl()).expect("add user");
    fw.add_device("alice", addr("192.0.2.5")).expect("add device");
    fw.set_authorized(addr("192.0.2.5"), "alice").expect("authorize");

    // Lifetime disabled, so only inactivity can end the session.
    clock.advance(Duration::from_secs(59));
    assert!(fw.is_authed(addr("192.0.2.5")));
    clock.advance(Duration::from_secs(2));
    assert!(!fw.is_authed(addr("192.0.2.5")));
}

/// Scenario: locking the account drops every device of the user no
/// matter what the timestamps say.
#[test]
fn account_lock_cascade() {
    let clock = Arc::new(ManualClock::new(MINUTE_NS));
    let fw = firewall(clock, settings());

    fw.add_user("alice", &alice_acl()).expect("add user");
    for address in ["192.0.2.5", "192.0.2.6", "192.0.2.7"] {
        fw.add_device("alice", addr(address)).expect("add device");
        fw.set_authorized(addr(address), "alice").expect("authorize");
    }

    fw.set_user_lock("alice", true).expect("lock");
    for address in ["192.0.2.5", "192.0.2.6", "192.0.2.7"] {
        assert!(!fw.is_authed(addr(address)));
        assert!(!fw.would_forward(addr(address), addr("10.0.0.7")).expect("verdict"));
    }
}

/// P2 / P6 / scenario 5: ACL refresh under load never exposes a user
/// with missing route tables.
#[test]
fn acl_refresh_under_load() {
    let clock = Arc::new(ManualClock::new(MINUTE_NS));
    let fw = Arc::new(firewall(clock, settings()));

    fw.add_user("alice", &alice_acl()).expect("add user");
    fw.add_device("alice", addr("192.0.2.5")).expect("add device");
    fw.set_authorized(addr("192.0.2.5"), "alice").expect("authorize");

    let stop = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let refresher = {
            let fw = Arc::clone(&fw);
            let stop = Arc::clone(&stop);
            scope.spawn(move || {
                let odd = Acl::parse(
                    &["10.0.0.0/24".to_string()],
                    &["10.1.0.0/16".to_string()],
                )
                .expect("acl");
                let even = Acl::parse(
                    &["10.2.0.0/24".to_string()],
                    &["10.1.0.0/16".to_string()],
                )
                .expect("acl");

                let mut flip = false;
                // Bounded so a failing reader cannot leave this spinning.
                for _ in 0..200_000 {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let acl = if flip { &odd } else { &even };
                    fw.refresh_user_acls("alice", acl).expect("refresh");
                    flip = !flip;
                }
            })
        };

        {
            let fw = Arc::clone(&fw);
            let stop = Arc::clone(&stop);
            scope
                .spawn(move || {
                    for _ in 0..10_000 {
                        // The session check must hold throughout; the MFA
                        // route stays in both variants of the ACL.
                        assert!(fw.is_authed(addr("192.0.2.5")));
                        assert!(fw
                            .would_forward(addr("192.0.2.5"), addr("10.1.2.3"))
                            .expect("verdict"));
                    }
                    stop.store(true, Ordering::Relaxed);
                })
                .join()
                .expect("reader thread");
        }

        refresher.join().expect("refresher thread");
    });
}

struct Recorder {
    firewall: Arc<Firewall>,
    address: Ipv4Addr,
    persisted: tokio::sync::Mutex<Vec<SocketAddr>>,
    authed_at_persist: AtomicBool,
}

impl EndpointSink for Arc<Recorder> {
    async fn persist(&self, address: Ipv4Addr, endpoint: SocketAddr) -> anyhow::Result<()> {
        if address == self.address && self.firewall.is_authed(address) {
            self.authed_at_persist.store(true, Ordering::Relaxed);
        }
        self.persisted.lock().await.push(endpoint);
        Ok(())
    }
}

/// P7 / scenario 6: an endpoint roam deauthenticates before the new
/// endpoint is persisted, and the warm-up scan does not count as a roam.
#[tokio::test]
async fn endpoint_roam_forces_reauthentication() {
    let clock = Arc::new(ManualClock::new(MINUTE_NS));
    let fw = Arc::new(firewall(clock, settings()));

    fw.add_user("alice", &alice_acl()).expect("add user");
    fw.add_device("alice", addr("192.0.2.5")).expect("add device");
    fw.set_authorized(addr("192.0.2.5"), "alice").expect("authorize");
    assert!(fw.is_authed(addr("192.0.2.5")));

    let recorder = Arc::new(Recorder {
        firewall: Arc::clone(&fw),
        address: addr("192.0.2.5"),
        persisted: tokio::sync::Mutex::new(Vec::new()),
        authed_at_persist: AtomicBool::new(false),
    });

    let first: SocketAddr = "198.51.100.1:51820".parse().expect("endpoint");
    let second: SocketAddr = "198.51.100.2:51820".parse().expect("endpoint");
    let mut cache: HashMap<Ipv4Addr, Option<SocketAddr>> = HashMap::new();

    // Warm-up scan: learns the endpoint without touching the session.
    watcher::apply(
        &fw,
        &recorder,
        &mut cache,
        vec![EndpointChange {
            address: addr("192.0.2.5"),
            previous: None,
            endpoint: Some(first),
        }],
        true,
    )
    .await;
    assert!(fw.is_authed(addr("192.0.2.5")));
    assert_eq!(cache[&addr("192.0.2.5")], Some(first));

    // The roam: deauth must be observable by the time persist runs.
    watcher::apply(
        &fw,
        &recorder,
        &mut cache,
        vec![EndpointChange {
            address: addr("192.0.2.5"),
            previous: Some(first),
            endpoint: Some(second),
        }],
        false,
    )
    .await;

    assert!(!fw.is_authed(addr("192.0.2.5")));
    assert!(!recorder.authed_at_persist.load(Ordering::Relaxed));
    assert_eq!(*recorder.persisted.lock().await, vec![first, second]);
    assert_eq!(cache[&addr("192.0.2.5")], Some(second));
}
