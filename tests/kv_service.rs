//! Clerk/server scenarios through real RPC over an in-process channel
//! transport, the same service implementation the binaries serve over a
//! UNIX socket.

use mrkv::kv::clerk::Clerk;
use mrkv::kv::server::{Kv, KvClient, KvServer};
use tarpc::server::{BaseChannel, Channel};
use tarpc::{client, context};

fn spawn_client(server: &KvServer) -> KvClient {
    let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
    // `Channel::execute` returns a future that spawns each response handler
    // on tokio's executor as requests arrive.
    tokio::spawn(BaseChannel::with_defaults(server_transport).execute(server.clone().serve()));
    KvClient::new(client::Config::default(), client_transport).spawn()
}

#[tokio::test]
async fn duplicate_put_is_applied_once() {
    let server = KvServer::new();
    let client = spawn_client(&server);
    // The first reply is "lost" and the clerk resends the same message.
    let first = client
        .put(context::current(), "k".into(), "v1".into(), 7, 1)
        .await
        .unwrap();
    let retry = client
        .put(context::current(), "k".into(), "v1".into(), 7, 1)
        .await
        .unwrap();
    assert_eq!(first, "");
    assert_eq!(retry, "");
    let value = client
        .get(context::current(), "k".into(), 7, 2)
        .await
        .unwrap();
    assert_eq!(value, "v1");
}

#[tokio::test]
async fn append_sequence_returns_prior_values() {
    let server = KvServer::new();
    let mut clerk = Clerk::new(spawn_client(&server));
    assert_eq!(clerk.append("k", "A").await, "");
    assert_eq!(clerk.append("k", "B").await, "A");
    assert_eq!(clerk.get("k").await, "AB");
}

#[tokio::test]
async fn appends_reconstruct_the_stored_value() {
    let server = KvServer::new();
    let mut clerk = Clerk::new(spawn_client(&server));
    let mut reconstructed = String::new();
    for piece in ["the", "quick", "brown", "fox"] {
        let old = clerk.append("k", piece).await;
        assert_eq!(old, reconstructed);
        reconstructed.push_str(piece);
    }
    assert_eq!(clerk.get("k").await, reconstructed);
}

#[tokio::test]
async fn clerks_interleave_linearizably() {
    let server = KvServer::new();
    let mut c1 = Clerk::new(spawn_client(&server));
    let mut c2 = Clerk::new(spawn_client(&server));
    c1.put("k", "x").await;
    assert_eq!(c2.append("k", "y").await, "x");
    assert_eq!(c1.get("k").await, "xy");
}

#[tokio::test]
async fn complete_op_is_only_a_hint() {
    let server = KvServer::new();
    let client = spawn_client(&server);
    client
        .put(context::current(), "k".into(), "v1".into(), 7, 1)
        .await
        .unwrap();
    client.complete_op(context::current(), 7, 1).await.unwrap();
    // The next correctly-issued mutation behaves exactly as if the entry
    // were still there.
    let old = client
        .put(context::current(), "k".into(), "v2".into(), 7, 2)
        .await
        .unwrap();
    assert_eq!(old, "v1");
    let value = client
        .get(context::current(), "k".into(), 7, 3)
        .await
        .unwrap();
    assert_eq!(value, "v2");
}
