#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use firestore_offline_sync::firestore::local::{MemoryStorage, StorageBackend};
use firestore_offline_sync::firestore::model::{DatabaseId, DocumentKey, ResourcePath, User};
use firestore_offline_sync::firestore::remote::{loopback, LoopbackServer, ServerStream, StaticCredentials};
use firestore_offline_sync::firestore::{
    ClientComponents, ClientSettings, FirestoreClient, Query, QuerySubscription, ViewSnapshot,
};
use firestore_offline_sync::util::BackoffConfig;
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(5);

pub struct TestClient {
    pub client: FirestoreClient,
    pub server: LoopbackServer,
    pub credentials: StaticCredentials,
}

pub fn fast_settings() -> ClientSettings {
    ClientSettings::default().with_backoff(BackoffConfig {
        interval_millis: 1,
        backoff_factor: 1.5,
        max_backoff_millis: 5,
    })
}

pub fn start_client_with(storage: Arc<dyn StorageBackend>, user: User) -> TestClient {
    let (datastore, server) = loopback();
    let token = user.uid().map(|uid| format!("{uid}-token"));
    let credentials = StaticCredentials::new(user, token);
    let components = ClientComponents {
        database_id: DatabaseId::default("project"),
        credentials: Arc::new(credentials.clone()),
        datastore: Arc::new(datastore),
        storage,
    };
    TestClient {
        client: FirestoreClient::new(components, fast_settings()),
        server,
        credentials,
    }
}

pub fn start_client() -> TestClient {
    start_client_with(Arc::new(MemoryStorage::new()), User::unauthenticated())
}

pub fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn doc_name(path: &str) -> String {
    format!("projects/project/databases/(default)/documents/{path}")
}

pub fn time(second: u32) -> String {
    format!("1970-01-01T00:00:{second:02}Z")
}

pub fn doc_change(path: &str, second: u32, target_id: i32) -> Value {
    json!({
        "documentChange": {
            "document": { "name": doc_name(path), "fields": {}, "updateTime": time(second) },
            "targetIds": [target_id]
        }
    })
}

pub fn read_time(second: u32) -> Value {
    json!({ "targetChange": { "readTime": time(second) } })
}

pub fn keys_of(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
    snapshot.docs.iter().map(|doc| doc.key().clone()).collect()
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

pub async fn send_all(stream: &ServerStream, messages: &[Value]) {
    for message in messages {
        stream.send_json(message).await.expect("client is connected");
    }
}

pub async fn next_snapshot(subscription: &mut QuerySubscription) -> ViewSnapshot {
    within(subscription.next())
        .await
        .expect("subscription is open")
        .expect("snapshot")
}

pub async fn snapshot_where(
    subscription: &mut QuerySubscription,
    done: impl Fn(&ViewSnapshot) -> bool,
) -> ViewSnapshot {
    loop {
        let snapshot = next_snapshot(subscription).await;
        if done(&snapshot) {
            return snapshot;
        }
    }
}

/// Next request on `stream` that adds `target_id`.
pub async fn expect_add_target(stream: &ServerStream, target_id: i32) -> Value {
    loop {
        let request = within(stream.recv_json()).await.expect("listen request");
        if request["addTarget"]["targetId"] == json!(target_id) {
            return request;
        }
    }
}

/// Listens to `rooms` and lets the server report `paths` as its current contents at second 2.
pub async fn synced_rooms(test: &TestClient, paths: &[&str]) -> (QuerySubscription, ServerStream) {
    let mut subscription = test.client.listen(rooms());
    let initial = next_snapshot(&mut subscription).await;
    assert!(initial.from_cache);

    let stream = within(test.server.next_listen_stream()).await.expect("listen stream");
    expect_add_target(&stream, 2).await;
    let mut messages = vec![json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } })];
    messages.extend(paths.iter().map(|path| doc_change(path, 2, 2)));
    messages.push(json!({
        "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ==" }
    }));
    messages.push(read_time(2));
    send_all(&stream, &messages).await;

    snapshot_where(&mut subscription, |snapshot| !snapshot.from_cache).await;
    (subscription, stream)
}

/// Accepts the next write stream and completes its handshake with token `[1]`.
pub async fn open_write_stream(server: &LoopbackServer) -> ServerStream {
    let stream = within(server.next_write_stream()).await.expect("write stream");
    let handshake = within(stream.recv_json()).await.expect("handshake");
    assert_eq!(handshake, json!({ "database": "projects/project/databases/(default)" }));
    stream
        .send_json(&json!({ "streamToken": "AQ==" }))
        .await
        .expect("client is connected");
    stream
}

/// Acknowledges the next write request, committing it at `second`.
pub async fn acknowledge_next(stream: &ServerStream, second: u32) -> Value {
    let request = within(stream.recv_json()).await.expect("write request");
    let writes = request["writes"].as_array().map(Vec::len).unwrap_or_default();
    let results: Vec<Value> = (0..writes).map(|_| json!({ "updateTime": time(second) })).collect();
    stream
        .send_json(&json!({
            "streamToken": "Ag==",
            "commitTime": time(second),
            "writeResults": results
        }))
        .await
        .expect("client is connected");
    request
}
