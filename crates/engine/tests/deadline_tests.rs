mod common;

use bytes::Bytes;
use common::{A, B, C, Harness, endpoints, identity};
use std::sync::Arc;
use keepsake_engine::{BlobPayload, EngineError, ErrorKind, OperationOptions};
use tokio::time::{Duration, Instant};

#[tokio::test(start_paused = true)]
async fn test_deadline_keeps_settled_successes() {
    let h = Harness::new();
    h.client.hang(B);
    h.client.delay(C, Duration::from_millis(200));

    let started = Instant::now();
    let report = h
        .engine
        .upload(
            &identity(),
            &endpoints(&[A, B, C]),
            BlobPayload::new(Bytes::from_static(b"in a hurry"), None),
            OperationOptions::with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(report.succeeded(), 2);
    let b = &report.blob.availability[1];
    assert_eq!(b.endpoint.url(), B);
    assert!(!b.succeeded);
    assert!(b.error.as_deref().unwrap().contains("deadline exceeded"));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_with_nothing_settled_fails() {
    let h = Harness::new();
    h.client.hang(A);
    h.client.hang(B);

    let err = h
        .engine
        .list(
            &identity(),
            &endpoints(&[A, B]),
            OperationOptions::with_timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();

    let EngineError::AllEndpointsFailed { attempts, .. } = &err else {
        panic!("expected AllEndpointsFailed, got {err:?}");
    };
    assert_eq!(attempts.len(), 2);
    assert_eq!(err.kind(), ErrorKind::Network);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_deadline_stops_walking_endpoints() {
    let h = Harness::new();
    h.client.hang(A);

    let err = h
        .engine
        .upload_with_fallback(
            &identity(),
            &endpoints(&[A, B]),
            BlobPayload::new(Bytes::from_static(b"stuck"), None),
            OperationOptions::with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();

    let EngineError::AllEndpointsFailed { attempts, .. } = err else {
        panic!("expected AllEndpointsFailed");
    };
    assert_eq!(attempts.len(), 1);
    assert!(h.client.calls_to("upload").iter().all(|url| url == A));
}

#[tokio::test(start_paused = true)]
async fn test_probe_deadline_reports_indeterminate() {
    let h = Harness::new();
    let hash = h.client.seed(A, b"here", "image/png", 1_700_000_000);
    h.client.hang(B);

    let report = h
        .engine
        .probe(
            &endpoints(&[A, B]),
            hash,
            OperationOptions::with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(report.available().count(), 1);
    assert_eq!(report.unavailable().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_joined_upload_honours_its_own_deadline() {
    let h = Arc::new(Harness::new());
    h.client.hang(A);

    let leader = {
        let h = h.clone();
        tokio::spawn(async move {
            h.engine
                .upload(
                    &identity(),
                    &endpoints(&[A]),
                    BlobPayload::new(Bytes::from_static(b"shared work"), None),
                    OperationOptions::default(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = Instant::now();
    let joined = tokio::time::timeout(
        Duration::from_secs(3600),
        h.engine.upload(
            &identity(),
            &endpoints(&[A]),
            BlobPayload::new(Bytes::from_static(b"shared work"), None),
            OperationOptions::with_timeout(Duration::from_secs(1)),
        ),
    )
    .await
    .expect("joined caller must return at its deadline");

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    let err = joined.unwrap_err();
    let EngineError::AllEndpointsFailed { attempts, .. } = &err else {
        panic!("expected AllEndpointsFailed, got {err:?}");
    };
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].error.as_deref().unwrap().contains("deadline exceeded"));
    assert_eq!(err.kind(), ErrorKind::Network);

    // The joiner never ran its own upload; the leader's run is still pending.
    assert_eq!(h.client.calls_to("upload"), vec![A.to_string()]);
    assert!(!leader.is_finished());
    leader.abort();
}

#[tokio::test(start_paused = true)]
async fn test_joined_probe_past_deadline_is_indeterminate() {
    let h = Arc::new(Harness::new());
    let hash = h.client.seed(B, b"somewhere", "image/png", 1_700_000_000);
    h.client.hang(A);

    let leader = {
        let h = h.clone();
        tokio::spawn(async move {
            h.engine
                .probe(&endpoints(&[A, B]), hash, OperationOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = h
        .engine
        .probe(
            &endpoints(&[A, B]),
            hash,
            OperationOptions::with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.available().count(), 0);
    assert_eq!(report.unavailable().count(), 0);
    leader.abort();
}
