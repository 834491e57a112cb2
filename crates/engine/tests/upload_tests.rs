mod common;

use bytes::Bytes;
use common::{A, B, C, Harness, endpoints, identity, test_config};
use keepsake_core::{AuthAction, ContentHash};
use keepsake_engine::{BlobPayload, EngineError, ErrorKind, EndpointError, OperationOptions};
use tokio::time::Duration;

fn png(data: &'static [u8]) -> BlobPayload {
    BlobPayload::new(Bytes::from_static(data), Some("image/png"))
}

#[tokio::test(start_paused = true)]
async fn test_upload_partial_success_reports_every_endpoint() {
    let h = Harness::new();
    h.client.fail(B, EndpointError::from_status(500, "disk full"));

    let report = h
        .engine
        .upload(&identity(), &endpoints(&[A, B, C]), png(b"picture"), OperationOptions::default())
        .await
        .unwrap();

    assert_eq!(report.primary_endpoint.url(), A);
    assert_eq!(report.primary.content_hash, ContentHash::compute(b"picture"));
    assert_eq!(report.blob.availability.len(), 3);
    assert_eq!(report.succeeded(), 2);

    let b = &report.blob.availability[1];
    assert_eq!(b.endpoint.url(), B);
    assert!(!b.succeeded);
    assert!(b.error.as_deref().unwrap().contains("disk full"));

    assert_eq!(report.blob.mime_type, "image/png");
    assert_eq!(report.blob.size, 7);
    assert!(h.client.holds(A, &report.blob.content_hash));
    assert!(!h.client.holds(B, &report.blob.content_hash));
}

#[tokio::test(start_paused = true)]
async fn test_primary_is_lowest_rank_success() {
    let h = Harness::new();
    h.client.fail(C, EndpointError::from_status(503, "maintenance"));

    // C is rank 0 but fails; B outranks A in this list.
    let report = h
        .engine
        .upload(&identity(), &endpoints(&[C, B, A]), png(b"ranked"), OperationOptions::default())
        .await
        .unwrap();

    assert_eq!(report.primary_endpoint.url(), B);
    assert!(report.primary.url.starts_with(B));
}

#[tokio::test(start_paused = true)]
async fn test_total_failure_names_every_endpoint() {
    let h = Harness::new();
    h.client.fail(A, EndpointError::network("connection refused"));
    h.client.fail(B, EndpointError::from_status(413, "too large"));
    h.client.fail(C, EndpointError::from_status(401, "bad signature"));

    let err = h
        .engine
        .upload(&identity(), &endpoints(&[A, B, C]), png(b"doomed"), OperationOptions::default())
        .await
        .unwrap_err();

    let EngineError::AllEndpointsFailed { attempts, .. } = &err else {
        panic!("expected AllEndpointsFailed, got {err:?}");
    };
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| !a.succeeded));

    let message = err.to_string();
    assert!(message.contains("failed on all 3 endpoint(s)"));
    assert!(message.contains("connection refused"));
    assert!(message.contains("too large"));
    assert!(message.contains("bad signature"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let h = Harness::new();
    h.client
        .fail_times(A, 2, EndpointError::from_status(503, "busy"));

    let report = h
        .engine
        .upload(&identity(), &endpoints(&[A]), png(b"retry me"), OperationOptions::default())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 1);
    assert_eq!(h.client.calls_to("upload").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_not_retried() {
    let h = Harness::new();
    h.client.fail(A, EndpointError::from_status(400, "bad request"));

    let err = h
        .engine
        .upload(&identity(), &endpoints(&[A]), png(b"once"), OperationOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.client.calls_to("upload").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_blob_rejected_before_any_request() {
    let mut config = test_config();
    config.max_blob_size = 4;
    let h = Harness::with_config(config);

    let err = h
        .engine
        .upload(&identity(), &endpoints(&[A, B]), png(b"too big"), OperationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.client.calls().is_empty());
    assert_eq!(h.issuer.issued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_uploads_reuse_one_token() {
    let h = Harness::new();
    let list = endpoints(&[A, B]);

    for _ in 0..2 {
        h.engine
            .upload(&identity(), &list, png(b"same"), OperationOptions::default())
            .await
            .unwrap();
    }

    assert_eq!(h.issuer.issued(), 1);
    assert_eq!(h.client.calls_to("upload").len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_token_reissued_after_expiry() {
    let h = Harness::new();
    let list = endpoints(&[A]);

    h.engine
        .upload(&identity(), &list, png(b"aging"), OperationOptions::default())
        .await
        .unwrap();
    // Lifetime is 300s; inside the 30s safety margin counts as expired.
    h.clock.advance(Duration::from_secs(280));
    h.engine
        .upload(&identity(), &list, png(b"aging"), OperationOptions::default())
        .await
        .unwrap();

    assert_eq!(h.issuer.issued_for(AuthAction::Upload), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_uploads_run_once() {
    let h = Harness::new();
    h.client.delay(A, Duration::from_millis(50));
    let list = endpoints(&[A, B]);
    let id = identity();

    let (first, second) = tokio::join!(
        h.engine
            .upload(&id, &list, png(b"popular"), OperationOptions::default()),
        h.engine
            .upload(&id, &list, png(b"popular"), OperationOptions::default()),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.client.calls_to("upload").len(), 2);
    assert_eq!(h.issuer.issued(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_different_blobs_both_run() {
    let h = Harness::new();
    h.client.delay(A, Duration::from_millis(50));
    let list = endpoints(&[A]);
    let id = identity();

    let (first, second) = tokio::join!(
        h.engine.upload(&id, &list, png(b"one"), OperationOptions::default()),
        h.engine.upload(&id, &list, png(b"two"), OperationOptions::default()),
    );

    assert_ne!(
        first.unwrap().blob.content_hash,
        second.unwrap().blob.content_hash
    );
    assert_eq!(h.client.calls_to("upload").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_stops_at_first_success() {
    let h = Harness::new();
    h.client.fail(A, EndpointError::from_status(500, "down"));

    let upload = h
        .engine
        .upload_with_fallback(&identity(), &endpoints(&[A, B, C]), png(b"fallback"), OperationOptions::default())
        .await
        .unwrap();

    assert_eq!(upload.endpoint.url(), B);
    assert_eq!(upload.attempts.len(), 2);
    assert_eq!(upload.attempts[0].endpoint.url(), A);
    assert!(!upload.attempts[0].succeeded);
    assert_eq!(upload.attempts[1].endpoint.url(), B);
    assert!(upload.attempts[1].succeeded);

    assert!(!h.client.calls_to("upload").iter().any(|url| url == C));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_total_failure_keeps_rank_order() {
    let h = Harness::new();
    h.client.fail(C, EndpointError::from_status(401, "c says no"));
    h.client.fail(A, EndpointError::from_status(403, "a says no"));

    let err = h
        .engine
        .upload_with_fallback(&identity(), &endpoints(&[C, A]), png(b"nowhere"), OperationOptions::default())
        .await
        .unwrap_err();

    let EngineError::AllEndpointsFailed { attempts, last_error, .. } = err else {
        panic!("expected AllEndpointsFailed");
    };
    let urls: Vec<&str> = attempts.iter().map(|a| a.endpoint.url()).collect();
    assert_eq!(urls, vec![C, A]);
    assert_eq!(last_error.kind, ErrorKind::Permission);
}

#[tokio::test(start_paused = true)]
async fn test_token_sweeper_drops_expired_tokens() {
    let h = Harness::new();
    let fleet = endpoints(&[A, B]);

    h.engine
        .upload(&identity(), &fleet, png(b"swept"), OperationOptions::default())
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(280));
    h.engine
        .list(&identity(), &fleet, OperationOptions::default())
        .await
        .unwrap();
    assert_eq!(h.engine.token_cache().len(), 2);

    let sweeper = h.engine.spawn_token_sweeper();
    tokio::time::sleep(test_config().tokens.sweep_interval() + Duration::from_secs(1)).await;

    // The upload token expired; the fresh list token survives.
    assert_eq!(h.engine.token_cache().len(), 1);
    sweeper.abort();
}
