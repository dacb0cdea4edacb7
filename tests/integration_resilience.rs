mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{BASE_URL, ScriptedTransport, Step, client_with, client_with_retry};
use http::header::{AUTHORIZATION, HeaderValue};
use reqflow::prelude::{
    CachePolicy, ErrorDisposition, FailureEnvelope, FailureKind, HttpClient, RequestDescriptor,
    ResponseEnvelope, RetryPolicy,
};
use reqflow::{RetryDecision, TransportErrorKind};
use serde_json::{Value, json};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn backoff_doubles_between_attempts_and_post_500_fails_after_three_calls() {
    let transport = ScriptedTransport::new(vec![Step::json(500, r#"{"error":"boom"}"#)]);
    let client = client_with(&transport);

    let failure = client
        .post("/documents")
        .json(&json!({ "title": "draft" }))
        .expect("serialize payload")
        .send()
        .await
        .expect_err("persistent 500 should fail");

    assert_eq!(failure.kind, FailureKind::HttpStatus);
    assert_eq!(failure.status_code(), Some(500));
    assert_eq!(transport.calls(), 3);
    assert_eq!(
        transport.call_gaps(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.http_status_errors, 3);
    assert_eq!(metrics.requests_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_status_surfaces_after_single_call() {
    let transport = ScriptedTransport::new(vec![Step::json(404, r#"{"error":"missing"}"#)]);
    let client = client_with(&transport);

    let failure = client
        .get("/documents/unknown")
        .send()
        .await
        .expect_err("404 should fail");

    assert_eq!(failure.status_code(), Some(404));
    assert_eq!(failure.body.and_then(|body| body.as_json().cloned()), Some(json!({"error": "missing"})));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_retried_then_succeeds() {
    let transport = ScriptedTransport::new(vec![
        Step::json(200, r#"{"slow":true}"#).delayed(Duration::from_secs(5)),
        Step::json(200, r#"{"slow":false}"#),
    ]);
    let client = HttpClient::builder(BASE_URL)
        .transport(transport.clone())
        .request_timeout(Duration::from_millis(100))
        .retry_config(3, Duration::from_millis(50))
        .try_build()
        .expect("client should build");

    let body: Value = client
        .get("/reports")
        .send_json()
        .await
        .expect("second attempt should succeed");

    assert_eq!(body, json!({"slow": false}));
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.metrics_snapshot().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn network_failures_are_retried() {
    let transport = ScriptedTransport::new(vec![
        Step::Fail(TransportErrorKind::Connect),
        Step::json(200, r#"{"ok":true}"#),
    ]);
    let client = client_with(&transport);

    let response = client.get("/health").send().await.expect("retry should recover");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.metrics_snapshot().network_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_on_throttling_overrides_backoff() {
    let transport = ScriptedTransport::new(vec![
        Step::status(429).with_header("retry-after", "2"),
        Step::json(200, "{}"),
    ]);
    let client = client_with_retry(
        &transport,
        RetryPolicy::standard().base_backoff(Duration::from_millis(100)),
    );

    client.get("/quota").send().await.expect("retry should recover");
    assert_eq!(transport.call_gaps(), vec![Duration::from_secs(2)]);
}

#[tokio::test(start_paused = true)]
async fn set_retry_config_applies_to_later_requests() {
    let transport = ScriptedTransport::new(vec![Step::status(503)]);
    let client = client_with(&transport);
    client.set_retry_config(1, Duration::from_millis(10));

    let failure = client.get("/busy").send().await.expect_err("503 should fail");
    assert_eq!(failure.status_code(), Some(503));
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.retry_policy().configured_max_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn custom_classifier_can_stop_retries() {
    let transport = ScriptedTransport::new(vec![Step::status(503)]);
    let client = client_with_retry(
        &transport,
        RetryPolicy::standard().retry_classifier(Arc::new(|decision: &RetryDecision| {
            decision.method != http::Method::GET
        })),
    );

    client.get("/busy").send().await.expect_err("503 should fail");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_gets_share_one_transport_call() {
    let transport = ScriptedTransport::new(vec![
        Step::json(200, r#"[{"id":"d1"}]"#).delayed(Duration::from_millis(50)),
    ]);
    let client = client_with(&transport);

    let (first, second, third) = tokio::join!(
        client.get("/documents").param("owned", true).send(),
        client.get("/documents").param("owned", true).send(),
        client.get("/documents").param("owned", true).send(),
    );

    for response in [first, second, third] {
        let response = response.expect("shared outcome should succeed");
        assert_eq!(response.body.as_json(), Some(&json!([{"id": "d1"}])));
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics_snapshot().dedup_joins, 2);
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn shared_failure_reaches_every_joined_caller_and_releases_fingerprint() {
    let transport = ScriptedTransport::new(vec![
        Step::json(400, r#"{"error":"bad"}"#).delayed(Duration::from_millis(20)),
        Step::json(200, "{}"),
    ]);
    let client = client_with(&transport);

    let (first, second) = tokio::join!(client.get("/items").send(), client.get("/items").send());
    assert_eq!(first.expect_err("leader fails").status_code(), Some(400));
    assert_eq!(second.expect_err("joiner fails").status_code(), Some(400));
    assert_eq!(transport.calls(), 1);

    client.get("/items").send().await.expect("fresh request runs");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn different_idempotency_keys_are_not_deduplicated() {
    let transport = ScriptedTransport::new(vec![
        Step::json(201, r#"{"id":"n1"}"#).delayed(Duration::from_millis(10)),
    ]);
    let client = client_with(&transport);
    let payload = json!({ "title": "draft" });

    let first = client
        .post("/documents")
        .idempotency_key("create-1")
        .expect("idempotency key")
        .json(&payload)
        .expect("serialize payload")
        .send();
    let second = client
        .post("/documents")
        .idempotency_key("create-2")
        .expect("idempotency key")
        .json(&payload)
        .expect("serialize payload")
        .send();
    let (first, second) = tokio::join!(first, second);

    first.expect("first create");
    second.expect("second create");
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.metrics_snapshot().dedup_joins, 0);
}

#[tokio::test(start_paused = true)]
async fn cached_get_expires_after_ttl() {
    let transport = ScriptedTransport::new(vec![Step::json(200, r#"{"v":1}"#)]);
    let client = client_with(&transport);
    client.set_cache_ttl(Duration::from_secs(1));

    let first = client.get("/settings").send().await.expect("first get");
    assert!(!first.from_cache);
    let second = client.get("/settings").send().await.expect("second get");
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(transport.calls(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    let third = client.get("/settings").send().await.expect("third get");
    assert!(!third.from_cache);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_policies_control_lookup() {
    let transport = ScriptedTransport::new(vec![Step::json(200, r#"{"v":1}"#)]);
    let client = client_with(&transport);
    client.set_cache_ttl(Duration::from_secs(1));

    client.get("/flags").send().await.expect("prime cache");
    let bypassed = client
        .get("/flags")
        .cache_policy(CachePolicy::NoCache)
        .send()
        .await
        .expect("no-cache get");
    assert!(!bypassed.from_cache);
    assert_eq!(transport.calls(), 2);

    tokio::time::advance(Duration::from_secs(5)).await;
    let stale = client
        .get("/flags")
        .cache_policy(CachePolicy::ForceCache)
        .send()
        .await
        .expect("force-cache get");
    assert!(stale.from_cache);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn clear_cache_forces_exactly_one_new_transport_call() {
    let transport = ScriptedTransport::new(vec![Step::json(200, r#"{"v":1}"#)]);
    let client = client_with(&transport);

    client.get("/catalog").send().await.expect("first get");
    let cached = client.get("/catalog").send().await.expect("cached get");
    assert!(cached.from_cache);
    assert_eq!(transport.calls(), 1);

    client.clear_cache();
    assert_eq!(client.cached_entry_count(), 0);
    let refreshed = client.get("/catalog").send().await.expect("get after clear");
    assert!(!refreshed.from_cache);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn response_interceptors_do_not_run_on_cache_hits() {
    let transport = ScriptedTransport::new(vec![Step::json(200, r#"{"v":1}"#)]);
    let client = client_with(&transport);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    client.add_response_interceptor(move |response: ResponseEnvelope| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, FailureEnvelope>(response) }
    });

    client.get("/profile").send().await.expect("fresh get");
    let cached = client.get("/profile").send().await.expect("cached get");
    assert!(cached.from_cache);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    client.invalidate_cache("/profile").expect("invalidate");
    client.get("/profile").send().await.expect("refetch");
    assert_eq!(transport.calls(), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_settles_leader_and_joiners_without_retry() {
    let transport = ScriptedTransport::new(vec![
        Step::json(200, "{}").delayed(Duration::from_secs(10)),
    ]);
    let client = client_with(&transport);
    let token = CancellationToken::new();

    let leader = client.get("/exports").cancellation(token.clone()).send();
    let joiner = client.get("/exports").send();
    let cancel = async {
        sleep(Duration::from_millis(100)).await;
        token.cancel();
    };
    let (leader, joiner, ()) = tokio::join!(leader, joiner, cancel);

    assert_eq!(leader.expect_err("leader cancelled").kind, FailureKind::Cancelled);
    assert_eq!(joiner.expect_err("joiner cancelled").kind, FailureKind::Cancelled);
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics_snapshot().retries, 0);
    assert_eq!(client.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retries() {
    let transport = ScriptedTransport::new(vec![Step::status(503)]);
    let client = client_with(&transport);
    let token = CancellationToken::new();

    let request = client.get("/busy").cancellation(token.clone()).send();
    let cancel = async {
        sleep(Duration::from_millis(500)).await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(request, cancel);

    assert_eq!(result.expect_err("cancelled").kind, FailureKind::Cancelled);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn detached_interceptor_no_longer_runs() {
    let transport = ScriptedTransport::new(vec![Step::json(200, "{}")]);
    let client = client_with(&transport);
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    let handle = client.add_request_interceptor(move |mut request: RequestDescriptor| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            request
                .headers
                .insert("x-trace", HeaderValue::from_static("on"));
            Ok::<_, FailureEnvelope>(request)
        }
    });

    client.get("/a").send().await.expect("with interceptor");
    handle.detach();
    handle.detach();
    assert!(handle.is_detached());
    client.get("/b").send().await.expect("after detach");

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    let requests = transport.requests();
    assert!(requests[0].headers.contains_key("x-trace"));
    assert!(!requests[1].headers.contains_key("x-trace"));
}

#[tokio::test(start_paused = true)]
async fn error_interceptor_retry_restarts_with_refreshed_credentials_once() {
    let transport = ScriptedTransport::new(vec![Step::status(401), Step::json(200, r#"{"ok":true}"#)]);
    let client = client_with(&transport);

    client.add_error_interceptor(|failure: FailureEnvelope| async move {
        match (failure.status_code(), failure.request.clone()) {
            (Some(401), Some(request)) => {
                let mut refreshed = *request;
                refreshed
                    .headers
                    .insert(AUTHORIZATION, HeaderValue::from_static("Bearer fresh"));
                ErrorDisposition::Retry(refreshed)
            }
            _ => ErrorDisposition::Fail(failure),
        }
    });

    let response = client.get("/me").send().await.expect("refresh should recover");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(transport.calls(), 2);
    let requests = transport.requests();
    assert!(requests[0].headers.get(AUTHORIZATION).is_none());
    assert_eq!(
        requests[1].headers.get(AUTHORIZATION),
        Some(&HeaderValue::from_static("Bearer fresh"))
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_error_interceptor_retry_is_honored_only_once() {
    let transport = ScriptedTransport::new(vec![Step::status(401)]);
    let client = client_with(&transport);

    client.add_error_interceptor(|failure: FailureEnvelope| async move {
        match failure.request.clone() {
            Some(request) => ErrorDisposition::Retry(*request),
            None => ErrorDisposition::Fail(failure),
        }
    });

    let failure = client.get("/me").send().await.expect_err("still unauthorized");
    assert_eq!(failure.status_code(), Some(401));
    assert_eq!(transport.calls(), 2);
}
