use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tenax::{Body, CancellationToken, Client, Error, ErrorCode, RetryDecision};

#[derive(Clone)]
struct ResponseSpec {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    echo_request_body: bool,
}

impl ResponseSpec {
    fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
            echo_request_body: false,
        }
    }

    fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn echo_request_body(mut self) -> Self {
        self.echo_request_body = true;
        self
    }
}

#[derive(Clone, Debug)]
struct ReceivedRequest {
    head: String,
    body: Vec<u8>,
}

impl ReceivedRequest {
    fn has_header(&self, name: &str, value: &str) -> bool {
        let needle = format!("{name}: {value}");
        self.head
            .lines()
            .any(|line| line.eq_ignore_ascii_case(&needle))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &str) -> usize {
    for line in raw_headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(parsed) = value.trim().parse::<usize>() {
                    return parsed;
                }
            }
        }
    }
    0
}

fn read_http_request(stream: &mut TcpStream) -> std::io::Result<ReceivedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
            let expected_total = header_end + 4 + parse_content_length(&head);
            if raw.len() >= expected_total {
                return Ok(ReceivedRequest {
                    head,
                    body: raw[header_end + 4..expected_total].to_vec(),
                });
            }
        }
    }

    Err(std::io::Error::other("connection closed mid-request"))
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn write_http_response(
    stream: &mut TcpStream,
    response: &ResponseSpec,
    body: &[u8],
) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    )
    .into_bytes();
    for (name, value) in &response.headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);

    stream.write_all(&raw)?;
    stream.flush()
}

/// Serves one scripted response per accepted connection, in order, each on
/// its own worker thread. Stops once the script is exhausted or after a
/// five second deadline.
struct MockServer {
    base_url: String,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<ResponseSpec>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let authority = listener.local_addr().expect("read local address").to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_clone = Arc::clone(&requests);
        let expected = responses.len();

        let join = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut workers = Vec::new();
            let mut accepted = 0_usize;

            while Instant::now() < deadline && accepted < expected {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let response = responses[accepted].clone();
                        accepted += 1;
                        let requests = Arc::clone(&requests_clone);
                        workers.push(thread::spawn(move || {
                            if !response.delay.is_zero() {
                                thread::sleep(response.delay);
                            }
                            if let Ok(request) = read_http_request(&mut stream) {
                                let body = if response.echo_request_body {
                                    request.body.clone()
                                } else {
                                    response.body.clone()
                                };
                                lock_unpoisoned(&requests).push(request);
                                let _ = write_http_response(&mut stream, &response, &body);
                            }
                        }));
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }

            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            base_url: format!("http://{authority}"),
            requests,
            join: Some(join),
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn requests(&self) -> Vec<ReceivedRequest> {
        lock_unpoisoned(&self.requests).clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_get_returns_body_and_counts_one_request() {
    let server = MockServer::start(vec![ResponseSpec::new(200, br#"{"ok":true}"#.to_vec())]);
    let client = Client::builder()
        .base_url(server.base_url())
        .timeout(Duration::from_secs(30))
        .build();
    let token = CancellationToken::new();

    let response = client.get("/test", &token).await.expect("get should succeed");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.body().as_ref(), br#"{"ok":true}"#);

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.rate_limited, 0);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn retries_twice_on_429_then_succeeds() {
    let server = MockServer::start(vec![
        ResponseSpec::new(429, "rate limited").header("Retry-After", "0"),
        ResponseSpec::new(429, "rate limited").header("Retry-After", "0"),
        ResponseSpec::new(200, "ok"),
    ]);

    let errors = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let rate_limited = Arc::new(AtomicUsize::new(0));
    let errors_hook = Arc::clone(&errors);
    let successes_hook = Arc::clone(&successes);
    let rate_limited_hook = Arc::clone(&rate_limited);

    let client = Client::builder()
        .base_url(server.base_url())
        .retry(3, Duration::from_millis(10))
        .timeout(Duration::from_secs(5))
        .on_error(move |_status, _context| {
            errors_hook.fetch_add(1, Ordering::SeqCst);
        })
        .on_success(move |_context, _status| {
            successes_hook.fetch_add(1, Ordering::SeqCst);
        })
        .on_rate_limited(move |_context| {
            rate_limited_hook.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let token = CancellationToken::new();

    let response = client.get("/", &token).await.expect("retries should recover");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.body().as_ref(), b"ok");
    assert_eq!(server.requests().len(), 3);

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.rate_limited, 2);

    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(rate_limited.load(Ordering::SeqCst), 2);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_surface_last_status() {
    let server = MockServer::start(vec![
        ResponseSpec::new(429, ""),
        ResponseSpec::new(429, ""),
        ResponseSpec::new(429, ""),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(2, Duration::from_millis(10))
        .build();
    let token = CancellationToken::new();

    let error = client.get("/", &token).await.expect_err("budget must run out");
    assert_eq!(error.code(), ErrorCode::RetriesExhausted);
    assert_eq!(error.status().map(|status| status.as_u16()), Some(429));
    assert!(matches!(error, Error::RetriesExhausted { max_retries: 2, .. }));

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 3);
    assert_eq!(stats.rate_limited, 3);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_interrupts_a_hanging_round_trip() {
    let server = MockServer::start(vec![
        ResponseSpec::new(200, "late").delay(Duration::from_millis(500)),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .timeout(Duration::from_secs(10))
        .build();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let error = client.get("/", &token).await.expect_err("cancel must win");
    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(300));
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn adaptive_reduction_halves_rate_then_restores_it() {
    let server = MockServer::start(vec![
        ResponseSpec::new(429, ""),
        ResponseSpec::new(200, "ok"),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .rate_limit(100.0, 10)
        .retry(2, Duration::from_millis(10))
        .adaptive_cooldown(Duration::from_millis(500))
        .build();
    let token = CancellationToken::new();

    client.get("/", &token).await.expect("request should recover");

    let (reduced_rate, _) = client.rate_limit();
    assert!(reduced_rate < 100.0, "rate still {reduced_rate}");

    tokio::time::sleep(Duration::from_millis(700)).await;
    let (restored_rate, _) = client.rate_limit();
    assert_eq!(restored_rate, 100.0);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn pacing_spaces_out_sequential_requests() {
    let server = MockServer::start(vec![
        ResponseSpec::new(200, "ok"),
        ResponseSpec::new(200, "ok"),
        ResponseSpec::new(200, "ok"),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .rate_limit(10.0, 1)
        .build();
    let token = CancellationToken::new();

    let started = Instant::now();
    for _ in 0..3 {
        client.get("/", &token).await.expect("paced request");
    }
    // Two inter-token gaps of ~100ms each, minus tolerance.
    assert!(started.elapsed() >= Duration::from_millis(150));
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_are_safe_and_all_counted() {
    let server = MockServer::start(vec![ResponseSpec::new(200, "ok"); 20]);
    let client = Client::builder()
        .base_url(server.base_url())
        .rate_limit(100.0, 10)
        .build();
    let token = CancellationToken::new();

    let mut workers = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        let token = token.clone();
        workers.push(tokio::spawn(async move { client.get("/", &token).await }));
    }
    for worker in workers {
        worker
            .await
            .expect("join request task")
            .expect("request should succeed");
    }

    assert_eq!(client.stats().total_requests, 20);
    assert_eq!(client.stats().total_errors, 0);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_classifier_retries_on_500() {
    let server = MockServer::start(vec![
        ResponseSpec::new(500, ""),
        ResponseSpec::new(500, ""),
        ResponseSpec::new(200, "ok"),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(5, Duration::from_millis(10))
        .retry_classifier(Arc::new(|decision: &RetryDecision| {
            decision.status.map(|status| status.as_u16()) == Some(500)
        }))
        .build();
    let token = CancellationToken::new();

    let response = client.get("/", &token).await.expect("classifier should retry 500");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.body().as_ref(), b"ok");
    assert_eq!(server.requests().len(), 3);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn post_body_is_replayed_on_every_attempt() {
    let server = MockServer::start(vec![
        ResponseSpec::new(503, ""),
        ResponseSpec::new(503, ""),
        ResponseSpec::new(200, "").echo_request_body(),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(3, Duration::from_millis(10))
        .build();
    let token = CancellationToken::new();

    let response = client
        .post("/echo", "text/plain", "hello", &token)
        .await
        .expect("third attempt should echo");
    assert_eq!(response.body().as_ref(), b"hello");

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.body, b"hello");
    }
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn hooks_mutate_requests_and_observe_responses() {
    let server = MockServer::start(vec![ResponseSpec::new(200, "ok")]);
    let response_hook_calls = Arc::new(AtomicUsize::new(0));
    let response_hook_calls_clone = Arc::clone(&response_hook_calls);

    let client = Client::builder()
        .base_url(server.base_url())
        .request_hook(|_context, headers| {
            headers.insert("x-hook", http::HeaderValue::from_static("applied"));
        })
        .response_hook(move |_context, _status, _headers| {
            response_hook_calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let token = CancellationToken::new();

    let response = client.get("/", &token).await.expect("hooked request");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response_hook_calls.load(Ordering::SeqCst), 1);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].has_header("x-hook", "applied"));
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_status_set_replacement_enables_502() {
    let server = MockServer::start(vec![
        ResponseSpec::new(502, ""),
        ResponseSpec::new(200, "ok"),
    ]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(2, Duration::from_millis(10))
        .retryable_status([502])
        .build();
    let token = CancellationToken::new();

    let response = client.get("/", &token).await.expect("502 should be retried");
    assert_eq!(response.status().as_u16(), 200);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_retry_budget_treats_429_as_terminal_status() {
    let server = MockServer::start(vec![ResponseSpec::new(429, "slow down")]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(0, Duration::from_millis(10))
        .build();
    let token = CancellationToken::new();

    let error = client.get("/", &token).await.expect_err("429 is terminal");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status().map(|status| status.as_u16()), Some(429));

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.rate_limited, 1);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_status_errors_still_deliver_the_body() {
    let payload = br#"{"error":"not_found","hint":"check the id"}"#;
    let server = MockServer::start(vec![ResponseSpec::new(404, payload.to_vec())]);
    let client = Client::builder().base_url(server.base_url()).build();
    let token = CancellationToken::new();

    let error = client.get("/missing", &token).await.expect_err("404 is terminal");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(
        error.response_body().map(|body| body.as_ref()),
        Some(payload.as_ref())
    );
    client.close();
}

#[derive(Debug, Serialize)]
struct EchoRequest {
    msg: String,
}

#[derive(Debug, Deserialize)]
struct EchoReply {
    echo: String,
}

#[tokio::test(flavor = "multi_thread")]
async fn json_round_trip_serializes_and_decodes() {
    let server = MockServer::start(vec![
        ResponseSpec::new(200, br#"{"echo":"hello"}"#.to_vec())
            .header("Content-Type", "application/json"),
    ]);
    let client = Client::builder().base_url(server.base_url()).build();
    let token = CancellationToken::new();

    let reply: EchoReply = client
        .send_json(
            http::Method::POST,
            "/echo",
            &EchoRequest {
                msg: "hello".to_owned(),
            },
            &token,
        )
        .await
        .expect("json request should succeed")
        .json()
        .expect("reply should decode");
    assert_eq!(reply.echo, "hello");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].has_header("content-type", "application/json"));
    assert_eq!(requests[0].body, br#"{"msg":"hello"}"#);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_response_body_is_rejected_without_retry() {
    let server = MockServer::start(vec![ResponseSpec::new(200, vec![b'x'; 2048])]);
    let client = Client::builder()
        .base_url(server.base_url())
        .retry(3, Duration::from_millis(10))
        .max_response_size(1024)
        .build();
    let token = CancellationToken::new();

    let error = client.get("/", &token).await.expect_err("cap must trip");
    assert_eq!(error.code(), ErrorCode::BodyTooLarge);
    assert_eq!(error.status().map(|status| status.as_u16()), Some(200));
    assert_eq!(server.requests().len(), 1);

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_errors, 1);
    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_request_bodies_are_captured_once() {
    let server = MockServer::start(vec![ResponseSpec::new(200, "").echo_request_body()]);
    let client = Client::builder().base_url(server.base_url()).build();
    let token = CancellationToken::new();

    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
        Ok(bytes::Bytes::from_static(b"chunked ")),
        Ok(bytes::Bytes::from_static(b"upload")),
    ];
    let body = Body::stream(futures_util::stream::iter(chunks));
    let response = client
        .post("/upload", "application/octet-stream", body, &token)
        .await
        .expect("streamed post");
    assert_eq!(response.body().as_ref(), b"chunked upload");
    client.close();
}
