//! Integration tests against a live coordination store.
//!
//! These need a reachable etcd endpoint; point
//! `PORDISTO_TEST_ETCD_ENDPOINT` at one (e.g. `http://127.0.0.1:2379`)
//! to run them, otherwise they skip the way container-backed suites do.

use std::time::Duration;

use pordisto::store::{AclRule, Device, EventType, Store, User};

async fn test_store() -> Option<Store> {
    let endpoint = match std::env::var("PORDISTO_TEST_ETCD_ENDPOINT") {
        Ok(endpoint) => endpoint,
        Err(_) => {
            eprintln!("Skipping integration test: PORDISTO_TEST_ETCD_ENDPOINT is not set");
            return None;
        }
    };

    match Store::connect(&[endpoint]).await {
        Ok(store) => Some(store),
        Err(err) => {
            eprintln!("Skipping integration test: {err:#}");
            None
        }
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn device_records_roundtrip() {
    let Some(store) = test_store().await else {
        return;
    };

    let username = unique("it-user");
    let device = Device {
        address: "100.127.0.5".parse().expect("address"),
        public_key: "dGVzdA==".to_string(),
        username: username.clone(),
        endpoint: None,
        attempts: 0,
        active: true,
    };

    store.create_device(&device).await.expect("create");
    assert!(store.create_device(&device).await.is_err(), "duplicate address");

    let endpoint = "198.51.100.1:51820".parse().expect("endpoint");
    store
        .update_device_endpoint(device.address, endpoint)
        .await
        .expect("endpoint update");

    let fetched = store
        .get_device(device.address)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(fetched.endpoint, Some(endpoint));
    assert_eq!(fetched.username, username);

    assert_eq!(store.increment_device_attempts(device.address).await.expect("bump"), 1);

    assert!(store.delete_device(device.address).await.expect("delete"));
    assert!(!store.delete_device(device.address).await.expect("idempotent"));
}

#[tokio::test]
async fn registration_tokens_burn_down() {
    let Some(store) = test_store().await else {
        return;
    };

    let username = unique("it-user");
    let token = store
        .add_registration_token("", &username, None, vec![], 2)
        .await
        .expect("mint");

    let first = store
        .redeem_registration_token(&token.token)
        .await
        .expect("first use");
    assert_eq!(first.username, username);

    let second = store
        .redeem_registration_token(&token.token)
        .await
        .expect("second use");
    assert_eq!(second.uses, 1);

    assert!(
        store.redeem_registration_token(&token.token).await.is_err(),
        "token must be destroyed after its last use"
    );
}

#[tokio::test]
async fn effective_acl_merges_deterministically() {
    let Some(store) = test_store().await else {
        return;
    };

    let username = unique("it-user");
    let group = format!("group:{}", unique("it"));

    store
        .set_acl(
            "*",
            &AclRule {
                allow: vec!["10.10.0.0/24".to_string()],
                mfa: vec![],
            },
        )
        .await
        .expect("star rule");
    store
        .set_acl(
            &group,
            &AclRule {
                allow: vec!["10.11.0.0/24".to_string()],
                mfa: vec!["10.12.0.0/24".to_string()],
            },
        )
        .await
        .expect("group rule");
    store
        .set_group(&group, &[username.clone()])
        .await
        .expect("membership");

    let acl = store.effective_acl(&username).await.expect("derive");
    let allow: Vec<String> = acl.allow.iter().map(ToString::to_string).collect();
    assert!(allow.contains(&"10.10.0.0/24".to_string()));
    assert!(allow.contains(&"10.11.0.0/24".to_string()));
    assert_eq!(
        acl.mfa
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>(),
        vec!["10.12.0.0/24".to_string()]
    );

    // Same inputs, same output, in the same order.
    let again = store.effective_acl(&username).await.expect("derive again");
    assert_eq!(acl, again);
}

#[tokio::test]
async fn event_listeners_observe_commit_order() {
    let Some(store) = test_store().await else {
        return;
    };

    let username = unique("it-user");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let key = store
        .register_event_listener::<User, _, _>(
            format!("users-{username}"),
            false,
            move |_key, current, _previous, event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((event, current.locked));
                    Ok(())
                }
            },
        )
        .await
        .expect("register listener");

    let user = User {
        username: username.clone(),
        ..User::default()
    };
    store.put_user(&user).await.expect("create");
    store.set_user_lock(&username, true).await.expect("lock");

    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("created event")
        .expect("channel open");
    assert_eq!(first.0, EventType::Created);

    let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("modified event")
        .expect("channel open");
    assert_eq!(second, (EventType::Modified, true));

    store.deregister_event_listener(&key);
}
