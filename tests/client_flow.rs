use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, TimeDelta};
use reqwest::{Method, StatusCode};
use s3kit::s3::{
    BucketStatus, DEFAULT_PRESIGN_EXPIRY, ErrorKind, Fault, HttpRequest, MemoryTransport, PutOptions,
    S3Client, SigV4Signer, StorageError, Transport,
};
use s3kit::{ClientConfig, Credentials};

const BUCKET: &str = "demo-bucket";

fn credentials() -> Credentials {
    Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")
}

fn client_with(transport: &MemoryTransport, config: ClientConfig) -> S3Client {
    S3Client::with_parts(config, Arc::new(transport.clone()), Arc::new(SigV4Signer::new()))
}

fn client(transport: &MemoryTransport) -> S3Client {
    let config = ClientConfig::new("http://localhost:9000", "us-east-1", credentials()).unwrap();
    client_with(transport, config)
}

#[tokio::test]
async fn put_then_get_returns_same_bytes_and_metadata() {
    let transport = MemoryTransport::new().with_credentials(credentials());
    transport.create_bucket(BUCKET);
    let client = client(&transport);

    let options = PutOptions::default()
        .with_content_type("text/plain")
        .with_acl("public-read")
        .with_metadata("Author", "tyr");
    let put = client
        .put_object(BUCKET, "myobjpath/hello.txt", "hello world", &options)
        .await
        .unwrap();
    assert!(put.etag.is_some());

    let object = client.get_object(BUCKET, "myobjpath/hello.txt").await.unwrap();
    assert_eq!(&object.body[..], b"hello world");
    assert_eq!(object.metadata.size, 11);
    assert_eq!(object.metadata.content_type.as_deref(), Some("text/plain"));
    assert_eq!(object.metadata.etag, put.etag);
    assert!(object.metadata.last_modified.is_some());
}

#[tokio::test]
async fn deleted_object_is_not_found() {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    let client = client(&transport);

    client
        .put_object(BUCKET, "a/b.txt", "x", &PutOptions::default())
        .await
        .unwrap();
    client.get_object(BUCKET, "a/b.txt").await.unwrap();
    client.delete_object(BUCKET, "a/b.txt").await.unwrap();

    let err = client.get_object(BUCKET, "a/b.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(matches!(err, StorageError::NotFound { ref code, .. } if code == "NoSuchKey"));

    // deleting again is not an error
    client.delete_object(BUCKET, "a/b.txt").await.unwrap();
}

#[tokio::test]
async fn missing_bucket_reports_no_such_bucket() {
    let transport = MemoryTransport::new();
    let client = client(&transport);

    let err = client.get_object("nope-bucket", "k").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { ref code, .. } if code == "NoSuchBucket"));
    assert_eq!(client.head_bucket("nope-bucket").await.unwrap(), BucketStatus::Absent);
}

#[tokio::test]
async fn bucket_lifecycle() {
    let transport = MemoryTransport::new();
    let client = client(&transport);

    client.create_bucket(BUCKET).await.unwrap();
    assert_eq!(client.head_bucket(BUCKET).await.unwrap(), BucketStatus::Exists);

    let err = client.create_bucket(BUCKET).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    client.put_object(BUCKET, "k", "v", &PutOptions::default()).await.unwrap();
    let err = client.delete_bucket(BUCKET).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    client.delete_object(BUCKET, "k").await.unwrap();
    client.delete_bucket(BUCKET).await.unwrap();
    assert!(!transport.bucket_exists(BUCKET));
}

#[tokio::test]
async fn invalid_names_fail_before_any_request() {
    let transport = MemoryTransport::new();
    let client = client(&transport);

    let err = client.get_object("Bad_Bucket", "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    let err = client.get_object(BUCKET, "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn throttling_is_retried_then_succeeds() {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    transport.inject(Fault::slow_down(), 2);
    let client = client(&transport);

    client
        .put_object(BUCKET, "k", "v", &PutOptions::default())
        .await
        .unwrap();
    assert!(transport.contains(BUCKET, "k"));

    let stats = client.stats();
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.failures, 0);
}

#[tokio::test(start_paused = true)]
async fn throttling_past_retry_budget_surfaces_throttled() {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    transport.inject(Fault::slow_down(), 10);
    let client = client(&transport);

    let err = client.get_object(BUCKET, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Throttled);
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn auth_failure_is_not_retried() {
    let transport = MemoryTransport::new().with_credentials(credentials());
    transport.create_bucket(BUCKET);

    let config = ClientConfig::new(
        "http://localhost:9000",
        "us-east-1",
        Credentials::new("AKIDWRONG", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
    )
    .unwrap();
    let client = client_with(&transport, config);

    let err = client.get_object(BUCKET, "k").await.unwrap_err();
    assert!(matches!(err, StorageError::AuthFailure { ref code, .. } if code == "InvalidAccessKeyId"));
    assert_eq!(transport.request_count(), 1);
    assert_eq!(client.stats().failures, 1);
}

#[tokio::test]
async fn wrong_secret_fails_signature_check() {
    let transport = MemoryTransport::new().with_credentials(credentials());
    transport.create_bucket(BUCKET);

    let config = ClientConfig::new(
        "http://localhost:9000",
        "us-east-1",
        Credentials::new("AKIDEXAMPLE", "not-the-secret"),
    )
    .unwrap();
    let client = client_with(&transport, config);

    let err = client.head_object(BUCKET, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(transport.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn network_faults_exhaust_into_transport_failure() {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    transport.inject(Fault::Network, 10);
    let client = client(&transport);

    let err = client.get_object(BUCKET, "k").await.unwrap_err();
    assert!(matches!(err, StorageError::TransportFailure { attempts: 4, .. }), "{err:?}");
    assert_eq!(transport.request_count(), 4);

    let stats = client.stats();
    assert_eq!((stats.requests, stats.retries, stats.failures), (4, 3, 1));
}

#[tokio::test(start_paused = true)]
async fn slow_response_times_out_and_is_retried() {
    let transport = MemoryTransport::new();
    transport.put(BUCKET, "k", "v");
    transport.inject(Fault::Delay(Duration::from_secs(60)), 1);

    let config = ClientConfig::new("http://localhost:9000", "us-east-1", credentials())
        .unwrap()
        .with_request_timeout(Duration::from_secs(1));
    let client = client_with(&transport, config);

    let object = client.get_object(BUCKET, "k").await.unwrap();
    assert_eq!(&object.body[..], b"v");
    assert_eq!(transport.request_count(), 2);
    assert_eq!(client.stats().retries, 1);
}

#[tokio::test]
async fn zero_retries_makes_a_single_attempt() {
    let transport = MemoryTransport::new();
    transport.create_bucket(BUCKET);
    transport.inject(Fault::internal_error(), 1);

    let config = ClientConfig::new("http://localhost:9000", "us-east-1", credentials())
        .unwrap()
        .with_max_retries(0);
    let client = client_with(&transport, config);

    let err = client.get_object(BUCKET, "k").await.unwrap_err();
    assert!(matches!(err, StorageError::Transient { status: Some(500), .. }));
    assert_eq!(transport.request_count(), 1);
}

fn query_value(url: &reqwest::Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn presigned_url_expires_after_default_window_and_is_accepted() {
    let transport = MemoryTransport::new().with_credentials(credentials());
    transport.put(BUCKET, "myobjpath/hello.txt", "hello");
    let client = client(&transport);

    let presigned = client
        .presign(Method::GET, BUCKET, "myobjpath/hello.txt", DEFAULT_PRESIGN_EXPIRY)
        .unwrap();

    let date = query_value(&presigned.url, "X-Amz-Date").unwrap();
    let date = NaiveDateTime::parse_from_str(&date, "%Y%m%dT%H%M%SZ").unwrap().and_utc();
    let expires: i64 = query_value(&presigned.url, "X-Amz-Expires").unwrap().parse().unwrap();
    assert_eq!(expires, 900);

    let expected = presigned.issued_at + TimeDelta::minutes(15);
    let drift = (date + TimeDelta::seconds(expires) - expected).num_milliseconds().abs();
    assert!(drift <= 1000, "drift {drift}ms");
    assert!((presigned.expires_at - expected).num_milliseconds().abs() <= 1);
    assert!(query_value(&presigned.url, "X-Amz-Signature").is_some());

    // the service accepts the URL without any extra headers
    let response = transport
        .send(HttpRequest::new(Method::GET, presigned.url.clone()))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"hello");
}

#[tokio::test]
async fn tampered_presigned_url_is_rejected() {
    let transport = MemoryTransport::new().with_credentials(credentials());
    transport.put(BUCKET, "secret.txt", "s");
    transport.put(BUCKET, "other.txt", "o");
    let client = client(&transport);

    let presigned = client
        .presign(Method::GET, BUCKET, "secret.txt", Duration::from_secs(60))
        .unwrap();
    let mut url = presigned.url.clone();
    url.set_path(&format!("/{BUCKET}/other.txt"));

    let response = transport.send(HttpRequest::new(Method::GET, url)).await.unwrap();
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[test]
fn presign_rejects_out_of_range_expiry() {
    let client = client(&MemoryTransport::new());

    for expiry in [
        Duration::ZERO,
        Duration::from_millis(1500),
        Duration::from_secs(7 * 24 * 3600 + 1),
    ] {
        let err = client.presign(Method::GET, BUCKET, "k", expiry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
    assert!(
        client
            .presign(Method::PUT, BUCKET, "k", Duration::from_secs(7 * 24 * 3600))
            .is_ok()
    );
}

#[tokio::test]
async fn virtual_hosted_addressing_reaches_the_bucket() {
    let transport = MemoryTransport::new().with_virtual_host("s3.local");
    transport.create_bucket(BUCKET);

    let config = ClientConfig::new("http://s3.local:9000", "eu-west-1", credentials())
        .unwrap()
        .with_path_style(false);
    let client = client_with(&transport, config);

    client
        .put_object(BUCKET, "dir/file name.txt", "data", &PutOptions::default())
        .await
        .unwrap();
    assert!(transport.contains(BUCKET, "dir/file name.txt"));
    assert_eq!(transport.request_log(), vec!["PUT /dir/file%20name.txt".to_string()]);
}
