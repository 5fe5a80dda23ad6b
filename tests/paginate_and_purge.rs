use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::Method;
use s3kit::s3::{
    BatchDeleter, ContinuationToken, DeleteOutcome, ErrorKind, Fault, ListRequest, MemoryTransport,
    ObjectIdentifier, PaginatorState, S3Client, SigV4Signer, StorageError, Waiter, WaiterConfig,
};
use s3kit::{ClientConfig, Credentials};
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "demo-bucket";

fn client(transport: &MemoryTransport) -> S3Client {
    let config = ClientConfig::new(
        "http://localhost:9000",
        "us-east-1",
        Credentials::new("AKIDEXAMPLE", "secret"),
    )
    .unwrap();
    S3Client::with_parts(config, Arc::new(transport.clone()), Arc::new(SigV4Signer::new()))
}

fn seeded(count: usize) -> MemoryTransport {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    for i in 0..count {
        transport.put(BUCKET, &format!("obj-{i:04}"), format!("body {i}"));
    }
    transport
}

fn identifiers(keys: impl IntoIterator<Item = String>) -> Vec<ObjectIdentifier> {
    keys.into_iter()
        .map(|key| ObjectIdentifier::new(BUCKET, key).unwrap())
        .collect()
}

fn as_stream(
    ids: Vec<ObjectIdentifier>,
) -> impl futures::Stream<Item = s3kit::Result<ObjectIdentifier>> {
    stream::iter(ids.into_iter().map(Ok))
}

#[tokio::test]
async fn listing_pages_through_every_object_once() {
    let transport = seeded(60);
    let client = client(&transport);

    let mut paginator = client.paginate(ListRequest::new(BUCKET).with_max_keys(25));
    let mut sizes = Vec::new();
    let mut truncated = Vec::new();
    let mut keys = Vec::new();

    while let Some(page) = paginator.next_page().await.unwrap() {
        sizes.push(page.len());
        truncated.push(page.truncated);
        assert_eq!(page.truncated, page.cursor.is_some());
        keys.extend(page.items.into_iter().map(|o| o.key));
    }

    assert_eq!(sizes, vec![25, 25, 10]);
    assert_eq!(truncated, vec![true, true, false]);
    assert_eq!(keys.len(), 60);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(paginator.state(), PaginatorState::Exhausted);
    assert_eq!(paginator.pages_fetched(), 3);

    // exhausted paginators stay exhausted without touching the service
    let before = transport.request_count();
    assert!(paginator.next_page().await.unwrap().is_none());
    assert_eq!(transport.request_count(), before);
}

#[tokio::test]
async fn empty_bucket_yields_one_empty_page() {
    let transport = seeded(0);
    let client = client(&transport);

    let pages: Vec<_> = client
        .paginate(ListRequest::new(BUCKET))
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(pages.len(), 1);
    assert!(pages[0].is_empty());
    assert!(!pages[0].truncated);
}

#[tokio::test]
async fn cursor_from_another_listing_is_rejected() {
    let transport = seeded(10);
    let client = client(&transport);

    let page = client
        .list_objects(&ListRequest::new(BUCKET).with_prefix("obj-").with_max_keys(3))
        .await
        .unwrap();
    let cursor = page.cursor.unwrap();

    // same cursor, different prefix
    let err = client
        .list_objects(
            &ListRequest::new(BUCKET)
                .with_prefix("other-")
                .with_cursor(cursor.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidContinuation);

    // garbage the client never issued
    let err = client
        .list_objects(&ListRequest::new(BUCKET).with_cursor(ContinuationToken::from_string("not-a-cursor")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidContinuation);

    // the original scope still accepts it
    let next = client
        .list_objects(
            &ListRequest::new(BUCKET)
                .with_prefix("obj-")
                .with_max_keys(3)
                .with_cursor(cursor),
        )
        .await
        .unwrap();
    assert_eq!(next.items[0].key, "obj-0003");
}

#[tokio::test]
async fn cursor_survives_a_string_round_trip() {
    let transport = seeded(5);
    let client = client(&transport);

    let request = ListRequest::new(BUCKET).with_max_keys(2);
    let page = client.list_objects(&request).await.unwrap();
    let saved = page.cursor.unwrap().to_string();

    let mut paginator = client.paginate(request);
    paginator.resume_from(ContinuationToken::from_string(saved));
    let page = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(page.items[0].key, "obj-0002");
}

#[tokio::test]
async fn failed_page_is_retried_from_the_same_cursor() {
    let transport = seeded(6);
    let client = client(&transport);
    let mut paginator = client.paginate(ListRequest::new(BUCKET).with_max_keys(3));

    let first = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(first.items[0].key, "obj-0000");
    let cursor = paginator.cursor().cloned();

    transport.inject_on(Method::GET, Fault::status(403, "AccessDenied"), 1);
    let err = paginator.next_page().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(paginator.state(), PaginatorState::Ready);
    assert_eq!(paginator.cursor().cloned(), cursor);

    let second = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(second.items[0].key, "obj-0003");
    assert!(paginator.next_page().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn abandoned_page_request_leaves_the_paginator_ready() {
    let transport = seeded(6);
    let client = client(&transport);
    let mut paginator = client.paginate(ListRequest::new(BUCKET).with_max_keys(3));

    paginator.next_page().await.unwrap().unwrap();
    let cursor = paginator.cursor().cloned();

    transport.inject_on(Method::GET, Fault::Delay(Duration::from_secs(60)), 1);
    let abandoned = tokio::time::timeout(Duration::from_secs(1), paginator.next_page()).await;
    assert!(abandoned.is_err());
    assert_eq!(paginator.state(), PaginatorState::Ready);
    assert_eq!(paginator.cursor().cloned(), cursor);
    assert_eq!(paginator.pages_fetched(), 1);

    let second = paginator.next_page().await.unwrap().unwrap();
    assert_eq!(second.items[0].key, "obj-0003");
    assert!(paginator.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn delimiter_rolls_keys_up_into_common_prefixes() {
    let transport = MemoryTransport::new();
    for key in ["a/1", "a/2", "b/x/1", "top.txt"] {
        transport.put(BUCKET, key, "x");
    }
    let client = client(&transport);

    let page = client
        .list_objects(&ListRequest::new(BUCKET).with_delimiter("/"))
        .await
        .unwrap();
    assert_eq!(page.common_prefixes, vec!["a/".to_string(), "b/".to_string()]);
    let keys: Vec<_> = page.items.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec!["top.txt"]);

    let page = client
        .list_objects(&ListRequest::new(BUCKET).with_prefix("b/").with_delimiter("/"))
        .await
        .unwrap();
    assert_eq!(page.common_prefixes, vec!["b/x/".to_string()]);
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn out_of_range_page_size_is_rejected() {
    let client = client(&seeded(1));
    for max_keys in [0, 1001] {
        let err = client
            .list_objects(&ListRequest::new(BUCKET).with_max_keys(max_keys))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}

#[tokio::test]
async fn purge_deletes_every_listed_object() {
    let transport = seeded(2500);
    let client = client(&transport);

    let deleter = BatchDeleter::new(&client, 1000).unwrap();
    let result = deleter
        .delete_all(client.paginate(ListRequest::new(BUCKET)).into_identifiers())
        .await
        .unwrap();

    assert_eq!(result.len(), 2500);
    assert_eq!(result.deleted_count(), 2500);
    assert_eq!(result.failures().count(), 0);
    assert!(!result.is_cancelled());
    assert_eq!(transport.object_count(BUCKET), 0);

    let bulk_requests = transport
        .request_log()
        .iter()
        .filter(|line| line.starts_with("POST "))
        .count();
    assert_eq!(bulk_requests, 3);
}

#[tokio::test]
async fn every_key_gets_exactly_one_outcome() {
    let transport = seeded(7);
    let client = client(&transport);

    // includes a key that was never there
    let mut keys: Vec<String> = (0..7).map(|i| format!("obj-{i:04}")).collect();
    keys.push("never-existed".to_string());
    let ids = identifiers(keys);

    let result = BatchDeleter::new(&client, 3)
        .unwrap()
        .delete_all(as_stream(ids.clone()))
        .await
        .unwrap();

    assert_eq!(result.len(), ids.len());
    for id in &ids {
        assert_eq!(result.get(id), Some(&DeleteOutcome::Deleted), "{id}");
    }
}

#[tokio::test]
async fn per_key_failures_are_reported() {
    let transport = seeded(4);
    transport.protect("obj-0001");
    transport.omit_from_delete_result("obj-0002");
    let client = client(&transport);

    let ids = identifiers((0..4).map(|i| format!("obj-{i:04}")));
    let result = BatchDeleter::new(&client, 10)
        .unwrap()
        .delete_all(as_stream(ids.clone()))
        .await
        .unwrap();

    assert_eq!(result.len(), 4);
    assert_eq!(result.get(&ids[0]), Some(&DeleteOutcome::Deleted));
    assert!(matches!(
        result.get(&ids[1]),
        Some(DeleteOutcome::Failed { code, .. }) if code == "AccessDenied"
    ));
    assert!(matches!(
        result.get(&ids[2]),
        Some(DeleteOutcome::Failed { code, .. }) if code == "MissingFromResponse"
    ));
    assert_eq!(result.get(&ids[3]), Some(&DeleteOutcome::Deleted));
    assert!(transport.contains(BUCKET, "obj-0001"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_batch_is_recorded_and_the_drain_continues() {
    let transport = seeded(4);
    // max_retries is 3: four failures exhaust the first batch
    transport.inject_on(Method::POST, Fault::Network, 4);
    let client = client(&transport);

    let ids = identifiers((0..4).map(|i| format!("obj-{i:04}")));
    let result = BatchDeleter::new(&client, 2)
        .unwrap()
        .delete_all(as_stream(ids.clone()))
        .await
        .unwrap();

    assert_eq!(result.len(), 4);
    for id in &ids[..2] {
        assert!(matches!(
            result.get(id),
            Some(DeleteOutcome::Failed { code, .. }) if code == "TransportFailure"
        ));
    }
    for id in &ids[2..] {
        assert_eq!(result.get(id), Some(&DeleteOutcome::Deleted));
    }
    assert_eq!(transport.object_count(BUCKET), 2);
}

#[tokio::test]
async fn non_transport_batch_error_aborts_the_drain() {
    let transport = seeded(2);
    transport.inject_on(Method::POST, Fault::status(403, "AccessDenied"), 1);
    let client = client(&transport);

    let err = BatchDeleter::new(&client, 10)
        .unwrap()
        .delete_all(as_stream(identifiers(["obj-0000".to_string()])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_batch() {
    let transport = seeded(10);
    let client = client(&transport);
    let token = CancellationToken::new();

    let ids = identifiers((0..10).map(|i| format!("obj-{i:04}")));
    let trigger = token.clone();
    let input = as_stream(ids.clone()).enumerate().map(move |(i, id)| {
        if i == 4 {
            trigger.cancel();
        }
        id
    });

    let result = BatchDeleter::new(&client, 2)
        .unwrap()
        .with_cancellation(token)
        .delete_all(input)
        .await
        .unwrap();

    assert!(result.is_cancelled());
    // four deleted in two batches, the fifth consumed but never sent
    assert_eq!(result.len(), 5);
    assert_eq!(result.deleted_count(), 4);
    assert!(matches!(
        result.get(&ids[4]),
        Some(DeleteOutcome::Failed { code, .. }) if code == "Cancelled"
    ));
    assert_eq!(transport.object_count(BUCKET), 6);
}

#[tokio::test]
async fn cancellation_at_a_bucket_switch_accounts_for_the_consumed_key() {
    let transport = MemoryTransport::new();
    transport.put("bucket-one", "a", "first");
    transport.put("bucket-two", "b", "second");
    let client = client(&transport);
    let token = CancellationToken::new();

    let ids = vec![
        ObjectIdentifier::new("bucket-one", "a").unwrap(),
        ObjectIdentifier::new("bucket-two", "b").unwrap(),
    ];
    let trigger = token.clone();
    let input = as_stream(ids.clone()).enumerate().map(move |(i, id)| {
        if i == 1 {
            trigger.cancel();
        }
        id
    });

    let result = BatchDeleter::new(&client, 10)
        .unwrap()
        .with_cancellation(token)
        .delete_all(input)
        .await
        .unwrap();

    assert!(result.is_cancelled());
    assert_eq!(result.len(), 2);
    for id in &ids {
        assert!(matches!(
            result.get(id),
            Some(DeleteOutcome::Failed { code, .. }) if code == "Cancelled"
        ));
    }
    assert!(transport.contains("bucket-one", "a"));
    assert!(transport.contains("bucket-two", "b"));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn input_errors_propagate() {
    let client = client(&seeded(0));
    let input = stream::iter(vec![Err::<ObjectIdentifier, _>(StorageError::invalid("bad input"))]);

    let err = BatchDeleter::new(&client, 10)
        .unwrap()
        .delete_all(input)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
}

#[test]
fn batch_size_is_bounded() {
    let client = client(&MemoryTransport::new());
    assert!(BatchDeleter::new(&client, 0).is_err());
    assert!(BatchDeleter::new(&client, 1001).is_err());
    assert_eq!(BatchDeleter::new(&client, 1000).unwrap().batch_size(), 1000);
}

#[tokio::test(start_paused = true)]
async fn waiter_sees_bucket_created_later() {
    let transport = MemoryTransport::new();
    let client = client(&transport);

    let creator = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        creator.create_bucket(BUCKET);
    });

    let waiter = Waiter::new(WaiterConfig::new(Duration::from_secs(5), Duration::from_secs(100)).unwrap());
    let report = waiter.wait_until_bucket_exists(&client, BUCKET).await.unwrap();
    // polls at 0s, 5s, 10s miss; 15s sees it
    assert_eq!(report.attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out_on_missing_object() {
    let transport = seeded(0);
    let client = client(&transport);

    let waiter = Waiter::new(WaiterConfig::new(Duration::from_secs(1), Duration::from_secs(3)).unwrap());
    let err = waiter
        .wait_until_object_exists(&client, BUCKET, "late.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::TimedOut(d) if d == Duration::from_secs(3)));
}
