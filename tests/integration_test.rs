mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statebridge::backend::TcpConnector;
use statebridge::engine::MemEngine;
use statebridge::sdk::Client;
use statebridge::server::{ComponentServer, EngineServer};
use statebridge::{
    BackendKind, Context, DeleteRequest, Error, Query, QueryFilter, SetRequest, StateStore, StateStoreAdapter,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use common::FlakyConnector;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct User {
    name: String,
    age: i32,
}

fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Serves an uninitialized in-process adapter on an ephemeral port.
async fn spawn_component(kind: BackendKind) -> String {
    let store: Arc<dyn StateStore> = Arc::new(StateStoreAdapter::new(kind, Arc::new(MemEngine::new())));
    spawn_server(ComponentServer::new(store)).await
}

async fn spawn_server(server: ComponentServer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve_tcp(listener).await;
    });
    addr.to_string()
}

async fn spawn_engine() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = EngineServer::new(MemEngine::new()).serve(listener).await;
    });
    port
}

#[tokio::test]
async fn test_sdk_client_round_trip() {
    let addr = spawn_component(BackendKind::Graph).await;
    let client = Client::connect_tcp(&addr).await.unwrap();
    let ctx = Context::background();

    assert!(matches!(client.get(&ctx, "k").await, Err(Error::NotInitialized)));
    client.init(meta(&[("host", "memory")])).await.unwrap();
    assert_eq!(client.features().await.unwrap().names(), vec!["ETAG", "QUERY_API"]);

    let user = User { name: "Alice".to_string(), age: 30 };
    client.set_as(&ctx, "user1", &user).await.unwrap();
    let got: Option<User> = client.get_as(&ctx, "user1").await.unwrap();
    assert_eq!(got, Some(user));

    let entry = client.get(&ctx, "user1").await.unwrap().unwrap();
    let etag = entry.etag.clone().unwrap();
    client
        .set(&ctx, SetRequest { key: "user1".into(), value: json!({ "name": "Bob", "age": 5 }), etag: Some(etag.clone()) })
        .await
        .unwrap();
    match client
        .set(&ctx, SetRequest { key: "user1".into(), value: json!(0), etag: Some(etag.clone()) })
        .await
    {
        Err(Error::Conflict { key, expected, .. }) => {
            assert_eq!(key, "user1");
            assert_eq!(expected, Some(etag));
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    client.ping(&ctx).await.unwrap();
    client.close().await.unwrap();
    let again = Client::connect_tcp(&addr).await.unwrap();
    assert!(matches!(again.get(&ctx, "user1").await, Err(Error::Closed)));
}

#[tokio::test]
async fn test_sdk_bulk_and_query() {
    let addr = spawn_component(BackendKind::Graph).await;
    let client = Client::connect_tcp(&addr).await.unwrap();
    let ctx = Context::background();
    client.init(meta(&[("host", "memory")])).await.unwrap();

    let items = (1..=3)
        .map(|i| SetRequest { key: format!("order-{}", i), value: json!({ "total": i * 10 }), etag: None })
        .collect();
    let outcome = client.bulk_set(&ctx, items).await.unwrap();
    assert_eq!(outcome.succeeded.len(), 3);

    let got = client
        .bulk_get(&ctx, vec!["order-1".into(), "order-9".into()])
        .await
        .unwrap();
    assert!(got[0].found);
    assert!(!got[1].found);

    let query: Query = serde_json::from_value(json!({
        "filter": { "GT": { "total": 10 } },
        "sort": [ { "key": "total" } ]
    }))
    .unwrap();
    let res = client.query(&ctx, query).await.unwrap();
    let keys: Vec<_> = res.results.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, vec!["order-2", "order-3"]);

    let outcome = client
        .bulk_delete(
            &ctx,
            vec![
                DeleteRequest { key: "order-1".into(), etag: None },
                DeleteRequest { key: "order-2".into(), etag: Some("stale".into()) },
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, vec!["order-1"]);
    assert_eq!(outcome.failed[0].kind, "conflict");
}

async fn call(reader: &mut BufReader<OwnedReadHalf>, writer: &mut OwnedWriteHalf, line: &str) -> Value {
    writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    let mut resp = String::new();
    reader.read_line(&mut resp).await.unwrap();
    serde_json::from_str(&resp).unwrap()
}

#[tokio::test]
async fn test_raw_protocol() {
    let addr = spawn_component(BackendKind::WideColumn).await;
    let stream = TcpStream::connect(&addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let resp = call(&mut reader, &mut writer, r#"{"method":"init","params":{"metadata":{"host":"memory"}}}"#).await;
    assert_eq!(resp, json!({ "ok": null }));

    let resp = call(&mut reader, &mut writer, r#"{"method":"set","params":{"key":"k","value":"v"}}"#).await;
    assert_eq!(resp, json!({ "ok": null }));

    let resp = call(&mut reader, &mut writer, r#"{"method":"get","params":{"key":"k"}}"#).await;
    assert_eq!(resp["ok"]["value"], "v");

    let resp = call(&mut reader, &mut writer, r#"{"method":"query","params":{"filter":{"EQ":{"color":"red"}}}}"#).await;
    assert_eq!(resp["error"]["kind"], "unsupported_query");

    let resp = call(&mut reader, &mut writer, "not json").await;
    assert_eq!(resp["error"]["kind"], "validation");

    let resp = call(&mut reader, &mut writer, r#"{"method":"ping"}"#).await;
    assert_eq!(resp, json!({ "ok": "PONG" }));
}

#[tokio::test]
async fn test_excess_connections_are_rejected() {
    let store: Arc<dyn StateStore> = Arc::new(StateStoreAdapter::new(BackendKind::Graph, Arc::new(MemEngine::new())));
    let addr = spawn_server(ComponentServer::with_max_connections(store, 1)).await;

    let first = Client::connect_tcp(&addr).await.unwrap();
    assert!(matches!(first.get(&Context::background(), "k").await, Err(Error::NotInitialized)));

    let mut second = TcpStream::connect(&addr).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), second.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_adapter_over_remote_engine() {
    let port = spawn_engine().await;
    let adapter = Arc::new(StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(TcpConnector::new())));
    let port = port.to_string();
    adapter
        .init(meta(&[("host", "127.0.0.1"), ("port", &port), ("poolSize", "4")]))
        .await
        .unwrap();
    let ctx = Context::background();

    adapter.set(&ctx, SetRequest { key: "k".into(), value: json!({ "n": 1 }), etag: None }).await.unwrap();
    let etag = adapter.get(&ctx, "k").await.unwrap().unwrap().etag;

    let writers: Vec<_> = (0..2)
        .map(|i| {
            let adapter = adapter.clone();
            let etag = etag.clone();
            tokio::spawn(async move {
                adapter
                    .set(&Context::background(), SetRequest { key: "k".into(), value: json!({ "n": i }), etag })
                    .await
            })
        })
        .collect();
    let mut wins = 0;
    for w in writers {
        match w.await.unwrap() {
            Ok(()) => wins += 1,
            Err(Error::Conflict { .. }) => {}
            Err(e) => panic!("unexpected {:?}", e),
        }
    }
    assert_eq!(wins, 1);

    let res = adapter
        .query(&ctx, Query::filtered(QueryFilter::eq("_key", "k")))
        .await
        .unwrap();
    assert_eq!(res.results.len(), 1);

    adapter.ping(&ctx).await.unwrap();
    adapter.close().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_backend_fails_init() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    drop(listener);

    let adapter = StateStoreAdapter::new(BackendKind::Graph, Arc::new(TcpConnector::new()));
    let err = adapter
        .init(meta(&[("host", "127.0.0.1"), ("port", &port), ("connectTimeoutMs", "500")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    assert!(matches!(adapter.get(&Context::background(), "k").await, Err(Error::NotInitialized)));
}

#[tokio::test]
async fn test_transient_failures_retry_reads_only() {
    let flaky = FlakyConnector::new(MemEngine::new());
    let adapter = StateStoreAdapter::new(BackendKind::WideColumn, Arc::new(flaky.clone()));
    adapter.init(meta(&[("host", "memory"), ("maxRetries", "2")])).await.unwrap();
    let ctx = Context::background();
    adapter.set(&ctx, SetRequest { key: "k".into(), value: json!(1), etag: None }).await.unwrap();

    flaky.fail_next(2);
    let entry = adapter.get(&ctx, "k").await.unwrap().unwrap();
    assert_eq!(entry.value, json!(1));

    flaky.fail_next(1);
    let before = flaky.executed();
    let err = adapter
        .set(&ctx, SetRequest { key: "k".into(), value: json!(2), etag: None })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(flaky.executed(), before);

    // The broken session was evicted; the pool keeps serving.
    adapter.set(&ctx, SetRequest { key: "k".into(), value: json!(3), etag: None }).await.unwrap();
    assert_eq!(adapter.get(&ctx, "k").await.unwrap().unwrap().value, json!(3));
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_endpoint() {
    use statebridge::sdk::Endpoint;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("statebridge.sock");
    let store: Arc<dyn StateStore> = Arc::new(StateStoreAdapter::new(BackendKind::Graph, Arc::new(MemEngine::new())));
    let server = ComponentServer::new(store);
    let server_path = path.clone();
    tokio::spawn(async move {
        let _ = server.listen_unix(&server_path).await;
    });

    let mut client = None;
    for _ in 0..50 {
        if let Ok(c) = Client::connect(Endpoint::Unix(path.clone())).await {
            client = Some(c);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let client = client.expect("server did not come up");
    client.init(meta(&[("host", "memory")])).await.unwrap();
    client.ping(&Context::background()).await.unwrap();
}
