//! End-to-end tests: real nodes talking over TCP on localhost

use keepnet_core::{Connectedness, Host};
use keepnet_dht::RoutingOptions;
use keepnet_node::{start_client, start_node, Config, Node, Role, RoleHandler};
use std::sync::Arc;
use tempfile::TempDir;

fn config(dir: &TempDir, role: Role, bootstrap: Vec<String>) -> Config {
    Config {
        data_dir: dir.path().to_string_lossy().into_owned(),
        listen: "127.0.0.1:0".to_string(),
        role,
        bootstrap_peers: bootstrap,
        ..Default::default()
    }
}

async fn pair(first: &TempDir, second: &TempDir) -> (Node, Node) {
    let a = start_node(&config(first, Role::Keeper, vec![])).await.unwrap();
    let b = start_node(&config(second, Role::User, vec![a.dial_string()])).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_bootstrap_peer_joins_routing_table() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, b) = pair(&d1, &d2).await;

    assert!(b.dht.routing_table_peers().contains(&a.peer_id()));
    // the inbound ping taught the keeper about the new node
    assert!(a.dht.routing_table_peers().contains(&b.peer_id()));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_put_get_across_nodes() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, b) = pair(&d1, &d2).await;

    b.dht
        .put_value("/files/readme", b"hello over tcp".to_vec(), RoutingOptions::default())
        .await
        .unwrap();

    let local = a.dht.get_value("/files/readme", RoutingOptions::offline()).await.unwrap();
    assert_eq!(local, b"hello over tcp");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_identity_and_store_survive_restart() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, Role::Keeper, vec![]);

    let first = start_node(&cfg).await.unwrap();
    let id = first.peer_id();
    first
        .dht
        .put_value("/persist", b"kept".to_vec(), RoutingOptions::offline())
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = start_node(&cfg).await.unwrap();
    assert_eq!(second.peer_id(), id);
    let value = second.dht.get_value("/persist", RoutingOptions::offline()).await.unwrap();
    assert_eq!(value, b"kept");
    second.shutdown().await;
}

#[tokio::test]
async fn test_meta_put_and_get_from_keeper() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (keeper, user) = pair(&d1, &d2).await;

    let ack = user
        .dht
        .send_meta_request("/bucket/a", b"payload".to_vec(), &keeper.peer_id(), "putTo")
        .await
        .unwrap();
    assert_eq!(ack, "ok");

    let got = user
        .dht
        .send_meta_request("/bucket/a", vec![], &keeper.peer_id(), "getFrom")
        .await
        .unwrap();
    assert_eq!(got, "payload");

    // users do not accept writes from other peers
    let rejected = keeper
        .dht
        .send_meta_request("/bucket/b", b"x".to_vec(), &user.peer_id(), "putTo")
        .await;
    assert!(rejected.is_err());

    user.shutdown().await;
    keeper.shutdown().await;
}

#[tokio::test]
async fn test_client_finds_provider() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, b) = pair(&d1, &d2).await;

    assert_eq!(b.announce(&["dataset-7".to_string()]).await, 1);
    // the announcement is one-way; a ping on the same stream orders it
    b.dht.ping(&a.peer_id()).await.unwrap();

    let client = start_client(&config(&d1, Role::User, vec![a.dial_string()]), "127.0.0.1:0")
        .await
        .unwrap();
    let mut rx = client.dht.find_providers_async(b"dataset-7", 1);
    let found = rx.recv().await.unwrap();
    // the persistent node is the provider, not the short-lived client
    assert_eq!(found.id, b.peer_id());
    assert!(found.addrs.contains(&b.host.local_addr().to_string()));

    client.shutdown().await;
    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_meta_handler_is_set_once() {
    let dir = TempDir::new().unwrap();
    let node = start_node(&config(&dir, Role::Provider, vec![])).await.unwrap();
    assert!(node.dht.assign_meta_handler(Arc::new(RoleHandler::new(Role::Keeper))).is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn test_departed_node_is_not_reported_connected() {
    let (d1, d2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (a, b) = pair(&d1, &d2).await;
    let gone = b.peer_id();
    assert_eq!(a.host.connectedness(&gone), Connectedness::Connected);

    b.shutdown().await;
    drop(b);

    let mut disconnected = false;
    for _ in 0..100 {
        if a.host.connectedness(&gone) != Connectedness::Connected {
            disconnected = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(disconnected);

    assert!(a.dht.find_peer(&gone).await.is_err());
    assert!(!a.dht.routing_table_peers().contains(&gone));
    a.shutdown().await;
}
