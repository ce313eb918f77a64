//! End-to-end query cycles against a local server that replays canned
//! streaming responses.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use gemini_overlay::conversation::{ImageAttachment, QueryOrchestrator, QueryOutcome, QueryState};
use gemini_overlay::inference::{
    GeminiClient, ModelOption, Part, QueryError, ResponseSink, Role,
};
use gemini_overlay::keys::{self, KeyPool, RateLimit, UsageSelector, UsageStatistics};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ─── Canned server ───────────────────────────────────────────────────────────

/// What the server sends back for one connection.
enum Reply {
    /// `200 text/event-stream`, each chunk written separately, then close.
    Sse(Vec<String>),
    /// A non-success status with a plain body.
    Status(u16, &'static str),
    /// Headers and the given chunks, then hold the connection open until the
    /// client goes away.
    Stall(Vec<String>),
}

#[derive(Debug, Clone)]
struct Captured {
    head: String,
    body: serde_json::Value,
}

impl Captured {
    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

struct CannedServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Captured>>>,
}

impl CannedServer {
    /// Serve one reply per accepted connection, in order.
    async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind local test server");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));

        let captured = requests.clone();
        tokio::spawn(async move {
            for reply in replies {
                let (socket, _) = listener.accept().await.expect("accept connection");
                let captured = captured.clone();
                tokio::spawn(handle(socket, reply, captured));
            }
        });

        Self { addr, requests }
    }

    fn base_url(&self) -> String {
        format!("http://{}/v1beta", self.addr)
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

/// Read the request head and its `Content-Length` body.
async fn read_request(socket: &mut TcpStream) -> Captured {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.expect("read request");
        assert!(n > 0, "client closed before sending a full request");
        raw.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&raw).to_string();
        let Some(head_end) = text.find("\r\n\r\n") else {
            continue;
        };
        let head = text[..head_end].to_string();
        let content_length = head
            .lines()
            .find_map(|line| {
                let (key, value) = line.split_once(':')?;
                if key.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);

        let body_start = head_end + 4;
        if raw.len() >= body_start + content_length {
            let body = serde_json::from_slice(&raw[body_start..body_start + content_length])
                .unwrap_or(serde_json::Value::Null);
            return Captured { head, body };
        }
    }
}

async fn handle(mut socket: TcpStream, reply: Reply, captured: Arc<Mutex<Vec<Captured>>>) {
    let request = read_request(&mut socket).await;
    captured.lock().unwrap().push(request);

    const SSE_HEAD: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

    match reply {
        Reply::Sse(chunks) => {
            socket.write_all(SSE_HEAD.as_bytes()).await.unwrap();
            for chunk in chunks {
                socket.write_all(chunk.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = socket.shutdown().await;
        }
        Reply::Status(status, body) => {
            let response = format!(
                "HTTP/1.1 {status} Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        }
        Reply::Stall(chunks) => {
            socket.write_all(SSE_HEAD.as_bytes()).await.unwrap();
            for chunk in chunks {
                socket.write_all(chunk.as_bytes()).await.unwrap();
            }
            socket.flush().await.unwrap();
            // Returns once the client drops the connection.
            let mut buf = [0u8; 64];
            let _ = tokio::time::timeout(Duration::from_secs(10), socket.read(&mut buf)).await;
        }
    }
}

/// One `data:` event carrying a text fragment.
fn data(text: &str) -> String {
    let envelope = json!({
        "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]
    });
    format!("data: {envelope}\r\n\r\n")
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start,
    Update(String, bool),
    Error(String),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn has_update(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, Event::Update(..)))
    }
}

impl ResponseSink for RecordingSink {
    fn on_response_start(&self) {
        self.events.lock().unwrap().push(Event::Start);
    }

    fn on_response_updated(&self, text: &str, is_complete: bool) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Update(text.to_string(), is_complete));
    }

    fn on_error(&self, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Error(message.to_string()));
    }
}

/// Records like [`RecordingSink`] and cancels the orchestrator as soon as
/// the final update arrives.
#[derive(Default)]
struct CancelOnCompleteSink {
    inner: RecordingSink,
    orchestrator: OnceLock<Arc<QueryOrchestrator>>,
    cancelled: AtomicBool,
}

impl ResponseSink for CancelOnCompleteSink {
    fn on_response_start(&self) {
        self.inner.on_response_start();
    }

    fn on_response_updated(&self, text: &str, is_complete: bool) {
        self.inner.on_response_updated(text, is_complete);
        if is_complete {
            if let Some(orch) = self.orchestrator.get() {
                self.cancelled.store(orch.cancel(), Ordering::SeqCst);
            }
        }
    }

    fn on_error(&self, message: &str) {
        self.inner.on_error(message);
    }
}

const FLASH_ID: &str = "gemini-2.5-flash-preview-04-17";

fn orchestrator(server: &CannedServer, credentials: &[(&str, &str)]) -> QueryOrchestrator {
    let client = GeminiClient::new(&server.base_url(), Duration::from_secs(10)).unwrap();
    QueryOrchestrator::new(
        client,
        keys::shared(KeyPool::from_pairs(credentials.iter().copied())),
        RateLimit::default(),
        ModelOption::new("Gemini 2.5 Flash", FLASH_ID, Some(0)),
    )
}

fn usage_count(orch: &QueryOrchestrator, name: &str) -> u64 {
    let pool = orch.pool().lock().unwrap();
    match pool.usage_statistics(&UsageSelector::Named(name.to_string())) {
        Ok(UsageStatistics::Single(count)) => count,
        other => panic!("unexpected statistics: {other:?}"),
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_text_query_streams_commits_and_reports_usage() {
    // The first event is split mid-line across two writes.
    let first = data("Hel");
    let (head, tail) = first.split_at(20);
    let server = CannedServer::start(vec![Reply::Sse(vec![
        head.to_string(),
        tail.to_string(),
        data("lo"),
        "data: [DONE]\r\n\r\n".to_string(),
    ])])
    .await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a"), ("API_KEY_B", "key-b")]);
    let sink = RecordingSink::default();

    let outcome = orch.query_text("hi", &sink).await;

    assert_eq!(outcome.text(), Some("Hello"));
    assert_eq!(
        sink.events(),
        vec![
            Event::Start,
            Event::Update("Hel".into(), false),
            Event::Update("Hello".into(), false),
            Event::Update("Hello".into(), true),
        ]
    );

    let history = orch.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Model);

    assert_eq!(usage_count(&orch, "API_KEY_A"), 1);
    assert_eq!(orch.pool().lock().unwrap().current_key_name(), Some("API_KEY_B"));
    assert_eq!(orch.state(), QueryState::Idle);
    assert_eq!(orch.last_terminal_state(), Some(QueryState::Completed));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(
        request.request_line(),
        format!("POST /v1beta/models/{FLASH_ID}:streamGenerateContent?alt=sse HTTP/1.1")
    );
    assert_eq!(request.header("x-goog-api-key").as_deref(), Some("key-a"));
    assert!(!request.head.contains("key=key-a"), "credential must not be in the URL");
    assert_eq!(request.body["contents"][0]["role"], "user");
    assert_eq!(request.body["contents"][0]["parts"][0]["text"], "hi");
    assert_eq!(
        request.body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
        0
    );
}

#[tokio::test]
async fn test_http_error_surfaces_status_and_body() {
    let server = CannedServer::start(vec![Reply::Status(429, "quota exhausted")]).await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a")]);
    let sink = RecordingSink::default();

    let outcome = orch.query_text("hi", &sink).await;

    match outcome {
        QueryOutcome::Failed(QueryError::HttpError { status, body }) => {
            assert_eq!(status, 429);
            assert_eq!(body, "quota exhausted");
        }
        other => panic!("expected HttpError, got {other:?}"),
    }
    assert_eq!(sink.events(), vec![Event::Error("API Error: 429 - quota exhausted".into())]);
    assert_eq!(orch.history().len(), 1, "only the user turn is kept");
    assert_eq!(usage_count(&orch, "API_KEY_A"), 0);
    assert_eq!(orch.state(), QueryState::Idle);
}

#[tokio::test]
async fn test_empty_stream_reports_empty_response_once() {
    let server = CannedServer::start(vec![Reply::Sse(vec![
        ": keep-alive\r\n\r\n".to_string(),
        "data: [DONE]\r\n\r\n".to_string(),
    ])])
    .await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a")]);
    let sink = RecordingSink::default();

    let outcome = orch.query_text("hi", &sink).await;

    assert!(matches!(outcome, QueryOutcome::Failed(QueryError::EmptyResponse)));
    assert_eq!(
        sink.events(),
        vec![Event::Error(
            "API did not respond or returned an empty response.".into()
        )]
    );
    assert_eq!(orch.history().len(), 1);
    assert_eq!(usage_count(&orch, "API_KEY_A"), 0);
}

#[tokio::test]
async fn test_malformed_fragment_is_reported_and_skipped() {
    let server = CannedServer::start(vec![Reply::Sse(vec![
        data("A"),
        "data: {not json\r\n\r\n".to_string(),
        data("B"),
    ])])
    .await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a")]);
    let sink = RecordingSink::default();

    let outcome = orch.query_text("hi", &sink).await;

    assert_eq!(outcome.text(), Some("AB"));
    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("JSON parsing error"));
    assert_eq!(orch.history().len(), 2);
}

#[tokio::test]
async fn test_image_turn_is_sent_alone_and_not_replayed() {
    let server = CannedServer::start(vec![
        Reply::Sse(vec![data("Hello")]),
        Reply::Sse(vec![data("A cat.")]),
        Reply::Sse(vec![data("Orange.")]),
    ])
    .await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a")]);

    orch.query_text("hi", &RecordingSink::default()).await;
    let image = ImageAttachment::from_bytes("image/png", b"png-bytes");
    let outcome = orch
        .query_with_image(image, "what is this?", &RecordingSink::default())
        .await;
    assert_eq!(outcome.text(), Some("A cat."));
    orch.query_text("what color?", &RecordingSink::default()).await;

    let requests = server.requests();
    assert_eq!(requests.len(), 3);

    let image_contents = requests[1].body["contents"].as_array().unwrap();
    assert_eq!(image_contents.len(), 1, "image query sends only its own turn");
    assert_eq!(image_contents[0]["parts"][0]["inlineData"]["mimeType"], "image/png");
    assert_eq!(image_contents[0]["parts"][1]["text"], "what is this?");

    let follow_up = requests[2].body["contents"].as_array().unwrap();
    assert_eq!(follow_up.len(), 5);
    assert!(
        !requests[2].body.to_string().contains("inlineData"),
        "image data is not replayed"
    );
    assert_eq!(follow_up[2]["parts"][0]["text"], "what is this?");
    assert_eq!(follow_up[3]["parts"][0]["text"], "A cat.");

    let history = orch.history();
    assert_eq!(history.len(), 6);
    assert!(history[2].has_inline_data());
}

#[tokio::test]
async fn test_credentials_rotate_across_queries() {
    let server = CannedServer::start(vec![
        Reply::Sse(vec![data("one")]),
        Reply::Sse(vec![data("two")]),
        Reply::Sse(vec![data("three")]),
    ])
    .await;
    let orch = orchestrator(&server, &[("API_KEY_A", "key-a"), ("API_KEY_B", "key-b")]);

    for question in ["1", "2", "3"] {
        let outcome = orch.query_text(question, &RecordingSink::default()).await;
        assert!(outcome.is_completed());
    }

    let sent_keys: Vec<String> = server
        .requests()
        .iter()
        .map(|r| r.header("x-goog-api-key").unwrap_or_default())
        .collect();
    assert_eq!(sent_keys, vec!["key-a", "key-b", "key-a"]);
    assert_eq!(usage_count(&orch, "API_KEY_A"), 2);
    assert_eq!(usage_count(&orch, "API_KEY_B"), 1);
}

#[tokio::test]
async fn test_cancel_mid_stream_is_silent() {
    let server = CannedServer::start(vec![Reply::Stall(vec![data("Partial")])]).await;
    let orch = Arc::new(orchestrator(&server, &[("API_KEY_A", "key-a")]));
    let sink = Arc::new(RecordingSink::default());

    let task = {
        let orch = orch.clone();
        let sink = sink.clone();
        tokio::spawn(async move { orch.query_text("long question", &*sink).await })
    };

    wait_until(|| sink.has_update()).await;
    assert_eq!(orch.state(), QueryState::Streaming);
    assert!(orch.cancel());

    let outcome = task.await.unwrap();
    assert!(matches!(outcome, QueryOutcome::Cancelled));
    assert_eq!(
        sink.events(),
        vec![Event::Start, Event::Update("Partial".into(), false)]
    );

    let history = orch.history();
    assert_eq!(history.len(), 1, "the user turn stays, the answer is withheld");
    assert_eq!(history[0].role, Role::User);
    assert_eq!(usage_count(&orch, "API_KEY_A"), 0);
    assert_eq!(orch.state(), QueryState::Idle);
    assert_eq!(orch.last_terminal_state(), Some(QueryState::Cancelled));
}

#[tokio::test]
async fn test_cancel_after_final_update_still_commits() {
    let server = CannedServer::start(vec![Reply::Sse(vec![
        data("Answer"),
        "data: [DONE]\r\n\r\n".to_string(),
    ])])
    .await;
    let orch = Arc::new(orchestrator(&server, &[("API_KEY_A", "key-a")]));
    let sink = CancelOnCompleteSink::default();
    sink.orchestrator
        .set(orch.clone())
        .unwrap_or_else(|_| panic!("orchestrator already set"));

    let outcome = orch.query_text("hi", &sink).await;

    assert!(sink.cancelled.load(Ordering::SeqCst), "cancel hit the running query");
    assert_eq!(outcome.text(), Some("Answer"));
    assert_eq!(
        sink.inner.events(),
        vec![
            Event::Start,
            Event::Update("Answer".into(), false),
            Event::Update("Answer".into(), true),
        ]
    );

    let history = orch.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, Role::Model);
    assert_eq!(usage_count(&orch, "API_KEY_A"), 1);
    assert_eq!(orch.state(), QueryState::Idle);
    assert_eq!(orch.last_terminal_state(), Some(QueryState::Completed));
}

#[tokio::test]
async fn test_new_query_supersedes_in_flight_query() {
    let server = CannedServer::start(vec![
        Reply::Stall(vec![data("Stale")]),
        Reply::Sse(vec![data("Fresh")]),
    ])
    .await;
    let orch = Arc::new(orchestrator(&server, &[("API_KEY_A", "key-a")]));
    let first_sink = Arc::new(RecordingSink::default());

    let first = {
        let orch = orch.clone();
        let sink = first_sink.clone();
        tokio::spawn(async move { orch.query_text("first", &*sink).await })
    };
    wait_until(|| first_sink.has_update()).await;

    let second_sink = RecordingSink::default();
    let second = orch.query_text("second", &second_sink).await;

    assert_eq!(second.text(), Some("Fresh"));
    assert!(matches!(first.await.unwrap(), QueryOutcome::Cancelled));
    assert!(first_sink.errors().is_empty());

    let texts: Vec<String> = orch
        .history()
        .iter()
        .map(|turn| match &turn.parts[0] {
            Part::Text { text } => text.clone(),
            other => panic!("unexpected part: {other:?}"),
        })
        .collect();
    assert_eq!(texts, vec!["first", "second", "Fresh"]);
    assert_eq!(orch.state(), QueryState::Idle);
    assert_eq!(orch.last_terminal_state(), Some(QueryState::Completed));
}

#[tokio::test]
async fn test_empty_pool_sends_nothing() {
    let server = CannedServer::start(vec![]).await;
    let orch = orchestrator(&server, &[]);
    let sink = RecordingSink::default();

    let outcome = orch.query_text("hi", &sink).await;

    assert!(matches!(outcome.error(), Some(e) if e.is_preflight()));
    assert_eq!(sink.errors().len(), 1);
    assert!(server.requests().is_empty());
    assert!(orch.history().is_empty());
}
