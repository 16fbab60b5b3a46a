use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, RETRY_AFTER},
    StatusCode,
};
use resilient_http::{
    ApiClient, ClientOptions, Error, HttpRequest, RequestContext, Response, Transport,
    TransportError,
};

/// Plays back canned outcomes, then repeats `fallback` forever.
#[derive(Clone)]
struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<Response, TransportError>>>>,
    fallback: Response,
    seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<Response, TransportError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: respond(StatusCode::ACCEPTED, ""),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().expect("log mutex must not be poisoned").len()
    }

    fn urls(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("log mutex must not be poisoned")
            .clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<Response, TransportError> {
        self.seen
            .lock()
            .expect("log mutex must not be poisoned")
            .push(request.url.to_string());
        let next = self
            .script
            .lock()
            .expect("script mutex must not be poisoned")
            .pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

fn respond(status: StatusCode, body: &str) -> Response {
    Response::new(status, HeaderMap::new(), body)
}

fn accepted_with_retry_after(seconds: &'static str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from_static(seconds));
    Response::new(StatusCode::ACCEPTED, headers, "")
}

fn options() -> ClientOptions {
    let mut opts = ClientOptions::default();
    opts.async_wait.poll_interval = Some(Duration::from_millis(1));
    opts.retry.server_error_retry_delay = Duration::from_millis(1);
    opts
}

fn client(transport: &ScriptedTransport, opts: ClientOptions) -> ApiClient {
    ApiClient::with_transport("https://example.com", transport.clone())
        .expect("base url must be valid")
        .with_options(opts)
}

#[tokio::test]
async fn polls_until_non_accepted_and_returns_it() {
    let transport = ScriptedTransport::new(vec![
        Ok(respond(StatusCode::ACCEPTED, "")),
        Ok(respond(StatusCode::ACCEPTED, "")),
        Ok(respond(StatusCode::OK, "{\"result\":\"ready\"}")),
    ]);
    let api = client(&transport, options());
    let initial = respond(StatusCode::ACCEPTED, "");

    let response = api
        .wait_for_async(&RequestContext::new(), "/status/123", &initial)
        .await
        .expect("poll must complete");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text(), "{\"result\":\"ready\"}");
    assert_eq!(transport.calls(), 3);
    assert!(transport
        .urls()
        .iter()
        .all(|url| url == "https://example.com/status/123"));
}

#[tokio::test]
async fn iteration_cap_is_a_distinct_error() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut opts = options();
    opts.async_wait.max_iterations = 5;
    let api = client(&transport, opts);
    let initial = respond(StatusCode::ACCEPTED, "");

    let err = api
        .wait_for_async(&RequestContext::new(), "/status/forever", &initial)
        .await
        .expect_err("backend never finishes");

    match &err {
        Error::AsyncWaitExceeded {
            location,
            iterations,
        } => {
            assert_eq!(*iterations, 5);
            assert_eq!(location, "https://example.com/status/forever");
        }
        other => panic!("expected async wait exceeded, got {other:?}"),
    }
    assert!(err.is_retry_later());
    assert!(!err.is_cancellation());
    assert_eq!(transport.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn default_iteration_cap_stops_endless_accepted() {
    let transport = ScriptedTransport::new(Vec::new());
    let api = client(&transport, ClientOptions::default());
    let initial = accepted_with_retry_after("0");

    let err = api
        .wait_for_async(&RequestContext::new(), "/status/forever", &initial)
        .await
        .expect_err("backend never finishes");

    assert!(matches!(
        err,
        Error::AsyncWaitExceeded {
            iterations: 1000,
            ..
        }
    ));
    assert_eq!(transport.calls(), 1000);
}

#[tokio::test]
async fn foreign_location_fails_before_polling() {
    let transport = ScriptedTransport::new(Vec::new());
    let api = client(&transport, options());
    let initial = respond(StatusCode::ACCEPTED, "");

    let err = api
        .wait_for_async(
            &RequestContext::new(),
            "https://attacker.example/status/1",
            &initial,
        )
        .await
        .expect_err("foreign host must be rejected");

    assert!(matches!(err, Error::InvalidUrl { .. }));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn empty_location_fails_before_polling() {
    let transport = ScriptedTransport::new(Vec::new());
    let api = client(&transport, options());

    let err = api
        .wait_for_async(
            &RequestContext::new(),
            " ",
            &respond(StatusCode::ACCEPTED, ""),
        )
        .await
        .expect_err("empty location must be rejected");

    assert!(matches!(err, Error::InvalidUrl { .. }));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn polls_are_not_retried_on_server_error() {
    let transport = ScriptedTransport::new(vec![
        Ok(respond(StatusCode::ACCEPTED, "")),
        Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, "boom")),
        Ok(respond(StatusCode::OK, "never reached")),
    ]);
    let api = client(&transport, options());

    let err = api
        .wait_for_async(
            &RequestContext::new(),
            "/status/1",
            &respond(StatusCode::ACCEPTED, ""),
        )
        .await
        .expect_err("5xx poll must fail");

    assert_eq!(err.status(), Some(500));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn overall_timeout_bounds_the_loop() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut opts = options();
    opts.async_wait.poll_interval = Some(Duration::from_secs(1));
    opts.async_wait.timeout = Duration::from_millis(2_500);
    let api = client(&transport, opts);

    let err = api
        .wait_for_async(
            &RequestContext::new(),
            "/status/slow",
            &respond(StatusCode::ACCEPTED, ""),
        )
        .await
        .expect_err("overall timeout must fire");

    assert!(matches!(err, Error::DeadlineExceeded));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn caller_deadline_is_not_loosened_by_config() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut opts = options();
    opts.async_wait.poll_interval = Some(Duration::from_secs(1));
    opts.async_wait.timeout = Duration::from_secs(600);
    let api = client(&transport, opts);
    let ctx = RequestContext::new().with_timeout(Duration::from_millis(1_500));

    let err = api
        .wait_for_async(&ctx, "/status/slow", &respond(StatusCode::ACCEPTED, ""))
        .await
        .expect_err("caller deadline must fire");

    assert!(err.is_deadline_exceeded());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn cancellation_interrupts_poll_sleep() {
    let transport = ScriptedTransport::new(Vec::new());
    let mut opts = options();
    opts.async_wait.poll_interval = Some(Duration::from_secs(30));
    let api = client(&transport, opts);
    let ctx = RequestContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = api
        .wait_for_async(&ctx, "/status/1", &respond(StatusCode::ACCEPTED, ""))
        .await
        .expect_err("cancel must stop the loop");

    assert!(matches!(err, Error::Canceled));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn transport_cancellation_is_normalized() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Canceled)]);
    let api = client(&transport, options());

    let err = api
        .wait_for_async(
            &RequestContext::new(),
            "/status/1",
            &respond(StatusCode::ACCEPTED, ""),
        )
        .await
        .expect_err("transport cancel must surface");

    assert!(matches!(err, Error::Canceled));
    assert_eq!(api.circuit_breaker().failure_count(), 0);
}

#[tokio::test]
async fn transport_failure_counts_against_breaker() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Other(
        "connection refused".to_owned(),
    ))]);
    let api = client(&transport, options());

    let err = api
        .get(&RequestContext::new(), "/widgets")
        .await
        .expect_err("connection error must surface");

    assert!(matches!(
        err.root_cause(),
        Error::Transport(TransportError::Other(_))
    ));
    assert_eq!(err.status(), None);
    assert_eq!(api.circuit_breaker().failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_on_accepted_sets_next_delay() {
    let transport = ScriptedTransport::new(vec![
        Ok(accepted_with_retry_after("5")),
        Ok(respond(StatusCode::OK, "done")),
    ]);
    let mut opts = options();
    opts.async_wait.poll_interval = Some(Duration::from_secs(60));
    let api = client(&transport, opts);
    let started = tokio::time::Instant::now();

    api.wait_for_async(
        &RequestContext::new(),
        "/status/1",
        &accepted_with_retry_after("1"),
    )
    .await
    .expect("poll must complete");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));
    assert_eq!(transport.calls(), 2);
}
