#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use firestore_offline_sync::firestore::error::{invalid_argument, unavailable};
use firestore_offline_sync::firestore::local::MemoryStorage;
use firestore_offline_sync::firestore::model::{Mutation, User};
use firestore_offline_sync::firestore::value::MapValue;
use firestore_offline_sync::firestore::FirestoreErrorCode;

fn set(path: &str) -> Vec<Mutation> {
    vec![Mutation::set(key(path), MapValue::empty())]
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_write_resolves() {
    let test = start_client();
    let pending = test.client.write(set("rooms/a"));

    let stream = open_write_stream(&test.server).await;
    let request = acknowledge_next(&stream, 7).await;
    assert_eq!(request["streamToken"], "AQ==");
    assert_eq!(request["writes"].as_array().unwrap().len(), 1);

    within(pending).await.unwrap();
    assert_eq!(test.client.pending_write_count().await.unwrap(), 0);
    let committed = test.client.document_from_cache(&key("rooms/a")).await.unwrap().unwrap();
    assert!(committed.has_committed_mutations());
}

#[tokio::test(flavor = "multi_thread")]
async fn permanent_error_rejects_and_reverts_the_write() {
    let test = start_client();
    let mut subscription = test.client.listen(rooms());
    let pending = test.client.write(set("rooms/a"));

    let stream = open_write_stream(&test.server).await;
    within(stream.recv_json()).await.unwrap();
    stream.fail(invalid_argument("field too large")).await;

    let error = within(pending).await.unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
    assert_eq!(test.client.pending_write_count().await.unwrap(), 0);
    assert_eq!(test.client.document_from_cache(&key("rooms/a")).await.unwrap(), None);

    let reverted = snapshot_where(&mut subscription, |snapshot| {
        snapshot.docs.is_empty() && !snapshot.changes.is_empty()
    })
    .await;
    assert!(!reverted.has_pending_writes);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_error_retries_on_a_new_stream() {
    let test = start_client();
    let pending = test.client.write(set("rooms/a"));

    let first = open_write_stream(&test.server).await;
    within(first.recv_json()).await.unwrap();
    first.fail(unavailable("connection reset")).await;

    let second = open_write_stream(&test.server).await;
    acknowledge_next(&second, 8).await;
    within(pending).await.unwrap();
    assert_eq!(test.client.pending_write_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_wait_for_their_user() {
    let test = start_client_with(Arc::new(MemoryStorage::new()), User::new("alice"));
    test.client.disable_network().await.unwrap();

    let alice_write = test.client.write(set("rooms/a"));
    assert_eq!(test.client.pending_write_count().await.unwrap(), 1);

    test.credentials.set_user(User::new("bob"), Some("bob-token".into()));
    assert_eq!(test.client.pending_write_count().await.unwrap(), 0);
    assert_eq!(test.client.document_from_cache(&key("rooms/a")).await.unwrap(), None);
    let mut bob_write = test.client.write(set("rooms/b"));
    assert_eq!(test.client.pending_write_count().await.unwrap(), 1);

    test.credentials.set_user(User::new("alice"), Some("alice-token".into()));
    assert_eq!(test.client.pending_write_count().await.unwrap(), 1);

    test.client.enable_network().await.unwrap();
    let stream = open_write_stream(&test.server).await;
    assert_eq!(stream.credentials().auth_token.as_deref(), Some("alice-token"));
    let request = acknowledge_next(&stream, 9).await;
    assert!(request.to_string().contains("rooms/a"));
    within(alice_write).await.unwrap();
    assert_eq!(test.client.pending_write_count().await.unwrap(), 0);

    assert!(tokio::time::timeout(Duration::from_millis(50), &mut bob_write)
        .await
        .is_err());
    test.credentials.set_user(User::new("bob"), Some("bob-token".into()));
    assert_eq!(test.client.pending_write_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_write_is_rejected() {
    let test = start_client();
    let error = within(test.client.write(Vec::new())).await.unwrap_err();
    assert_eq!(error.code, FirestoreErrorCode::InvalidArgument);
}
