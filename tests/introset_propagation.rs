//! Hidden-service introset publication and resolution across a small
//! network of relays, driven through a client with no inbound links.

mod common;

use std::sync::{Arc, Mutex};

use common::{spawn_client, spawn_relay, wait_until, TEST_TIMEOUT};
use veilnet::identity::{distance_cmp, xor_distance};
use veilnet::intro::{EncryptedIntroSet, IntroSet, Introduction};
use veilnet::outbound::SessionResult;
use veilnet::router::Router;
use veilnet::{Crypto, SecretKey};

struct TestNet {
    relays: Vec<Router>,
    _dirs: Vec<tempfile::TempDir>,
}

/// Spin up `n` relays that all know each other's RCs.
async fn spawn_network(n: usize) -> TestNet {
    let mut relays = Vec::new();
    let mut dirs = Vec::new();
    for _ in 0..n {
        let dir = tempfile::tempdir().unwrap();
        relays.push(spawn_relay(dir.path()).await);
        dirs.push(dir);
    }
    let mut rcs = Vec::new();
    for relay in &relays {
        rcs.push(relay.our_rc().await.unwrap());
    }
    for (i, relay) in relays.iter().enumerate() {
        for (j, rc) in rcs.iter().enumerate() {
            if i != j {
                relay.add_rc(rc.clone()).await.unwrap().unwrap();
            }
        }
    }
    TestNet {
        relays,
        _dirs: dirs,
    }
}

fn sealed_introset(crypto: &Crypto, owner: &SecretKey, via: veilnet::RouterId) -> EncryptedIntroSet {
    let set = IntroSet::create(
        crypto,
        owner,
        vec![Introduction {
            router: via,
            path_id: [7; 16],
            expires_at: veilnet::util::now_ms() + 5 * 60 * 1000,
            version: 0,
        }],
        None,
    );
    EncryptedIntroSet::seal(crypto, owner, &set)
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_reaches_closest_pair_and_acks_client() {
    let net = spawn_network(5).await;
    let client_dir = tempfile::tempdir().unwrap();
    let client = spawn_client(client_dir.path(), 2, 1).await;

    for relay in &net.relays {
        let rc = relay.our_rc().await.unwrap();
        client.add_rc(rc).await.unwrap().unwrap();
    }

    // The entry relay is whichever is *not* among the four closest, so the
    // publish has to propagate.
    let crypto = Crypto::new();
    let owner = SecretKey::generate();
    let sealed = sealed_introset(&crypto, &owner, net.relays[0].our_id());
    let key = sealed.dht_key();

    let mut ids: Vec<veilnet::RouterId> = Vec::new();
    for relay in &net.relays {
        ids.push(relay.our_id());
    }
    let mut by_distance: Vec<usize> = (0..ids.len()).collect();
    by_distance.sort_by(|&a, &b| {
        let da = xor_distance(ids[a].as_bytes(), &key);
        let db = xor_distance(ids[b].as_bytes(), &key);
        distance_cmp(&da, &db)
    });
    let entry = *by_distance.last().unwrap();

    let connect = client.connect_to(ids[entry]).await;
    assert_eq!(connect, Some(SessionResult::Established));

    let acked: Arc<Mutex<Option<Vec<EncryptedIntroSet>>>> = Arc::new(Mutex::new(None));
    let acked2 = acked.clone();
    let started = client
        .publish_introset(
            sealed.clone(),
            Some(ids[entry]),
            0,
            Box::new(move |values| {
                *acked2.lock().unwrap() = Some(values);
            }),
        )
        .await;
    assert!(started, "publish requires a connected router");

    // The two closest relays end up holding the introset.
    let stored = wait_until(
        || async {
            net.relays[by_distance[0]].stored_introset(key).await.is_some()
                && net.relays[by_distance[1]].stored_introset(key).await.is_some()
        },
        TEST_TIMEOUT,
    )
    .await;
    assert!(stored, "closest pair must store the published introset");

    // The client's completion fires with the stored copy.
    let got_ack = wait_until(|| async { acked.lock().unwrap().is_some() }, TEST_TIMEOUT).await;
    assert!(got_ack, "publish completion must fire");
    let values = acked.lock().unwrap().take().unwrap();
    assert!(!values.is_empty(), "publish ack should carry the introset");
    assert_eq!(values[0].dht_key(), key);

    client.stop().await;
    for relay in net.relays {
        relay.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn find_intro_resolves_published_introset() {
    let net = spawn_network(5).await;
    let client_dir = tempfile::tempdir().unwrap();
    let client = spawn_client(client_dir.path(), 2, 1).await;
    for relay in &net.relays {
        client.add_rc(relay.our_rc().await.unwrap()).await.unwrap().unwrap();
    }

    let crypto = Crypto::new();
    let owner = SecretKey::generate();
    let sealed = sealed_introset(&crypto, &owner, net.relays[0].our_id());
    let key = sealed.dht_key();

    // Publish through the first relay.
    let entry = net.relays[0].our_id();
    assert_eq!(
        client.connect_to(entry).await,
        Some(SessionResult::Established)
    );
    let published = Arc::new(Mutex::new(false));
    let published2 = published.clone();
    client
        .publish_introset(
            sealed.clone(),
            Some(entry),
            0,
            Box::new(move |values| {
                *published2.lock().unwrap() = !values.is_empty();
            }),
        )
        .await;
    assert!(
        wait_until(|| async { *published.lock().unwrap() }, TEST_TIMEOUT).await,
        "publish should be acknowledged"
    );

    // Resolve it back through the same relay.
    let found: Arc<Mutex<Option<Vec<EncryptedIntroSet>>>> = Arc::new(Mutex::new(None));
    let found2 = found.clone();
    client
        .lookup_introset(
            key,
            Some(entry),
            Box::new(move |values| {
                *found2.lock().unwrap() = Some(values);
            }),
        )
        .await;

    assert!(
        wait_until(|| async { found.lock().unwrap().is_some() }, TEST_TIMEOUT).await,
        "lookup must complete"
    );
    let values = found.lock().unwrap().take().unwrap();
    assert_eq!(values.len(), 1, "lookup should return the introset");
    assert_eq!(values[0].dht_key(), key);
    assert_eq!(values[0].expires_at, sealed.expires_at);

    client.stop().await;
    for relay in net.relays {
        relay.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn lookup_of_unknown_key_completes_empty_at_deadline() {
    let net = spawn_network(5).await;
    let client_dir = tempfile::tempdir().unwrap();
    let client = spawn_client(client_dir.path(), 2, 1).await;
    for relay in &net.relays {
        client.add_rc(relay.our_rc().await.unwrap()).await.unwrap().unwrap();
    }
    assert_eq!(
        client.connect_to(net.relays[0].our_id()).await,
        Some(SessionResult::Established)
    );

    let found: Arc<Mutex<Option<Vec<EncryptedIntroSet>>>> = Arc::new(Mutex::new(None));
    let found2 = found.clone();
    client
        .lookup_introset(
            [0xEE; 32],
            None,
            Box::new(move |values| {
                *found2.lock().unwrap() = Some(values);
            }),
        )
        .await;

    // Nothing holds this key; the TX completes empty no later than the
    // deadline.
    assert!(
        wait_until(|| async { found.lock().unwrap().is_some() }, TEST_TIMEOUT).await,
        "lookup must complete even when nothing is found"
    );
    assert!(found.lock().unwrap().take().unwrap().is_empty());

    client.stop().await;
    for relay in net.relays {
        relay.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn client_builds_paths_through_relays() {
    let net = spawn_network(4).await;
    let client_dir = tempfile::tempdir().unwrap();
    let client = spawn_client(client_dir.path(), 2, 1).await;
    for relay in &net.relays {
        client.add_rc(relay.our_rc().await.unwrap()).await.unwrap().unwrap();
    }

    // Path maintenance runs from the tick; within a few seconds the client
    // should have built its target number of paths.
    assert!(
        wait_until(|| async { client.num_paths().await >= 1 }, TEST_TIMEOUT).await,
        "client should build at least one path"
    );

    client.stop().await;
    for relay in net.relays {
        relay.stop().await;
    }
}
