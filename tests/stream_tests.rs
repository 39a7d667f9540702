//! Streaming Tests
//!
//! Binds a real listener and drives `/ws` with a tokio-tungstenite client.
//! A recording engine captures everything forwarded so ordering and
//! interruption can be checked byte for byte.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::util::ServiceExt;

use avatar_gateway::{
    ServerConfig,
    config::ApiKeyEntry,
    core::{AudioFrame, AvatarEngine, EngineResult, RenderSessionConfig, RenderSink},
    routes,
    session::{SessionStatus, TerminationReason},
    state::AppState,
};

const API_KEY: &str = "stream-test-api-key";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Recording engine
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Audio(Vec<u8>),
    End,
    Cancel,
    Special(Value),
    Close,
}

#[derive(Default, Clone)]
struct RecordingEngine {
    events: Arc<Mutex<Vec<Event>>>,
}

struct RecordingSink(Arc<Mutex<Vec<Event>>>);

#[async_trait]
impl AvatarEngine for RecordingEngine {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn open(&self, _: &RenderSessionConfig) -> EngineResult<Box<dyn RenderSink>> {
        Ok(Box::new(RecordingSink(self.events.clone())))
    }
}

#[async_trait]
impl RenderSink for RecordingSink {
    async fn push_audio(&mut self, frame: AudioFrame) -> EngineResult<()> {
        self.0.lock().push(Event::Audio(frame.data.to_vec()));
        Ok(())
    }

    async fn end_utterance(&mut self) -> EngineResult<()> {
        self.0.lock().push(Event::End);
        Ok(())
    }

    async fn cancel_utterance(&mut self) -> EngineResult<()> {
        self.0.lock().push(Event::Cancel);
        Ok(())
    }

    async fn special(&mut self, content: &Value) -> EngineResult<()> {
        self.0.lock().push(Event::Special(content.clone()));
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.0.lock().push(Event::Close);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    app: axum::Router,
    events: Arc<Mutex<Vec<Event>>>,
}

struct StartedSession {
    session_id: String,
    token: String,
}

fn base_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.api_keys = vec![ApiKeyEntry {
        id: "tests".to_string(),
        key: API_KEY.to_string(),
    }];
    config.token_secret = Some("stream-test-secret-0123456789abcdef".to_string());
    config
}

async fn spawn_server(config: ServerConfig) -> TestServer {
    let engine = RecordingEngine::default();
    let events = engine.events.clone();
    let state = AppState::with_engine(config, Arc::new(engine));
    let app = routes::create_app(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = app.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            served.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        state,
        app,
        events,
    }
}

fn session_body(idle: u64) -> Value {
    json!({
        "avatar_id": "avatar-1",
        "quality": "low",
        "version": "v1",
        "video_encoding": "AV1",
        "activity_idle_timeout": idle,
        "agora_settings": {"app_id": "app", "token": "rtc", "channel": "c1", "uid": 7}
    })
}

impl TestServer {
    async fn start_session(&self, idle: u64) -> StartedSession {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/session/start")
            .header("x-api-key", API_KEY)
            .body(Body::from(session_body(idle).to_string()))
            .unwrap();
        let response = self.app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        StartedSession {
            session_id: body["session_id"].as_str().unwrap().to_string(),
            token: body["session_token"].as_str().unwrap().to_string(),
        }
    }

    async fn stop_session(&self, session: &StartedSession) -> StatusCode {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/session/stop")
            .header("x-api-key", API_KEY)
            .body(Body::from(
                json!({"session_id": session.session_id, "session_token": session.token})
                    .to_string(),
            ))
            .unwrap();
        self.app.clone().oneshot(req).await.unwrap().status()
    }

    async fn connect(&self, token: &str) -> Result<Client, tungstenite::Error> {
        let mut request = format!("ws://{}/ws", self.addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {token}").parse().unwrap());
        tokio_tungstenite::connect_async(request)
            .await
            .map(|(ws, _)| ws)
    }

    async fn connect_and_init(&self, session: &StartedSession, idle: u64) -> Client {
        let mut ws = self.connect(&session.token).await.unwrap();
        let mut init = session_body(idle);
        init["command"] = json!("init");
        init["session_id"] = json!(session.session_id);
        send_json(&mut ws, &init).await;
        assert_eq!(
            next_json(&mut ws).await,
            json!({"command": "initialized", "session_id": session.session_id})
        );
        ws
    }

    fn status(&self, session: &StartedSession) -> SessionStatus {
        self.state.sessions.get(&session.session_id).unwrap().status
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Poll until the engine has seen `count` events.
    async fn wait_for_events(&self, count: usize) -> Vec<Event> {
        for _ in 0..100 {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.events()
    }

    async fn wait_for_status(&self, session: &StartedSession, status: SessionStatus) {
        for _ in 0..100 {
            if self.status(session) == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(self.status(session), status);
    }
}

async fn send_json(ws: &mut Client, value: &Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn voice(bytes: &[u8], event_id: &str) -> Value {
    json!({
        "command": "voice",
        "audio": BASE64.encode(bytes),
        "sampleRate": 16000,
        "encoding": "PCM16",
        "event_id": event_id
    })
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for server message")
            .expect("stream ended")
            .expect("websocket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_json(ws: &mut Client) -> Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text message, got {other:?}"),
    }
}

async fn expect_close(ws: &mut Client) -> u16 {
    match next_message(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_upgrade_requires_valid_token() {
    let server = spawn_server(base_config()).await;

    match server.connect("not-a-token").await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
        }
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }

    let mut request = format!("ws://{}/ws", server.addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().remove("authorization");
    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
        }
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }
    assert_eq!(server.state.ws_connection_count(), 0);
}

#[tokio::test]
async fn test_terminated_session_cannot_upgrade() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    assert_eq!(server.stop_session(&session).await, StatusCode::OK);

    assert!(matches!(
        server.connect(&session.token).await,
        Err(tungstenite::Error::Http(_))
    ));
}

#[tokio::test]
async fn test_command_before_init_closes_with_policy_violation() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect(&session.token).await.unwrap();

    send_json(&mut ws, &voice(&[1, 2], "early")).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["command"], "error");
    assert_eq!(error["code"], "NOT_INITIALIZED");
    assert_eq!(expect_close(&mut ws).await, 1008);

    // The session was never bound, so the client may reconnect
    assert_eq!(server.status(&session), SessionStatus::Pending);
    let _ws = server.connect_and_init(&session, 120).await;
    assert_eq!(server.status(&session), SessionStatus::Active);
}

#[tokio::test]
async fn test_voice_frames_forwarded_in_order() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    let chunks: [&[u8]; 3] = [&[0x01, 0x02, 0x03, 0x04], &[0x05, 0x06], &[0x07, 0x08, 0x09, 0x0a]];
    for (i, chunk) in chunks.iter().enumerate() {
        send_json(&mut ws, &voice(chunk, &format!("c{}", i + 1))).await;
    }
    send_json(&mut ws, &json!({"command": "voice_end", "event_id": "end"})).await;

    let events = server.wait_for_events(4).await;
    assert_eq!(
        events,
        vec![
            Event::Audio(chunks[0].to_vec()),
            Event::Audio(chunks[1].to_vec()),
            Event::Audio(chunks[2].to_vec()),
            Event::End,
        ]
    );
}

#[tokio::test]
async fn test_interrupt_discards_buffered_audio() {
    let mut config = base_config();
    config.forward_batch_bytes = 64 * 1024;
    config.max_buffer_delay_ms = 60_000;
    let server = spawn_server(config).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    send_json(&mut ws, &voice(&[1, 1], "c1")).await;
    send_json(&mut ws, &voice(&[2, 2], "c2")).await;
    send_json(&mut ws, &json!({"command": "voice_interrupt", "event_id": "stop"})).await;
    send_json(&mut ws, &voice(&[3, 3], "c3")).await;
    send_json(&mut ws, &json!({"command": "voice_end", "event_id": "end"})).await;

    let events = server.wait_for_events(3).await;
    assert_eq!(
        events,
        vec![Event::Cancel, Event::Audio(vec![3, 3]), Event::End]
    );
}

#[tokio::test]
async fn test_heartbeat_and_special() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    send_json(
        &mut ws,
        &json!({"command": "heartbeat", "event_id": "hb-1", "timestamp": 1712345678}),
    )
    .await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"command": "heartbeat_ack", "event_id": "hb-1", "timestamp": 1712345678})
    );

    send_json(
        &mut ws,
        &json!({"command": "special", "event_id": "sp-1", "content": {"emotion": "happy"}}),
    )
    .await;
    let events = server.wait_for_events(1).await;
    assert_eq!(events, vec![Event::Special(json!({"emotion": "happy"}))]);
}

#[tokio::test]
async fn test_per_message_errors_keep_connection() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    send_json(&mut ws, &json!({"command": "wave", "event_id": "w1"})).await;
    let error = next_json(&mut ws).await;
    assert_eq!(error["code"], "UNKNOWN_COMMAND");
    assert_eq!(error["event_id"], "w1");

    send_json(
        &mut ws,
        &json!({"command": "voice_end", "event_id": "e1", "extra": true}),
    )
    .await;
    assert_eq!(next_json(&mut ws).await["code"], "VALIDATION_ERROR");

    send_json(&mut ws, &voice(&[1, 2, 3], "odd")).await;
    assert_eq!(next_json(&mut ws).await["code"], "DECODE_ERROR");

    ws.send(Message::Binary(vec![0u8; 4].into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "UNSUPPORTED_FRAME");

    send_json(&mut ws, &json!({"command": "heartbeat", "event_id": "still-here"})).await;
    assert_eq!(next_json(&mut ws).await["command"], "heartbeat_ack");
    assert_eq!(server.status(&session), SessionStatus::Active);
}

#[tokio::test]
async fn test_idle_timeout_closes_and_terminates() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(2).await;
    let mut ws = server.connect_and_init(&session, 2).await;

    let error = timeout(Duration::from_secs(4), next_json(&mut ws))
        .await
        .expect("idle timeout did not fire");
    assert_eq!(error["code"], "IDLE_TIMEOUT");
    assert_eq!(expect_close(&mut ws).await, 1000);

    let record = server.state.sessions.get(&session.session_id).unwrap();
    assert_eq!(record.status, SessionStatus::Terminated);
    assert_eq!(record.termination_reason, Some(TerminationReason::IdleTimeout));
    assert_eq!(server.stop_session(&session).await, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_idle_timeout_zero_never_closes() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(0).await;
    let mut ws = server.connect_and_init(&session, 0).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    send_json(&mut ws, &json!({"command": "heartbeat", "event_id": "late"})).await;
    assert_eq!(next_json(&mut ws).await["command"], "heartbeat_ack");
    assert_eq!(server.status(&session), SessionStatus::Active);
}

#[tokio::test]
async fn test_stop_closes_bound_stream() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    assert_eq!(server.stop_session(&session).await, StatusCode::OK);
    assert_eq!(expect_close(&mut ws).await, 1000);

    let events = server.wait_for_events(1).await;
    assert_eq!(events, vec![Event::Close]);
    assert_eq!(
        server
            .state
            .sessions
            .get(&session.session_id)
            .unwrap()
            .termination_reason,
        Some(TerminationReason::Stopped)
    );
}

#[tokio::test]
async fn test_disconnect_terminates_active_session() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let mut ws = server.connect_and_init(&session, 120).await;

    ws.close(None).await.unwrap();
    server
        .wait_for_status(&session, SessionStatus::Terminated)
        .await;
    assert_eq!(
        server
            .state
            .sessions
            .get(&session.session_id)
            .unwrap()
            .termination_reason,
        Some(TerminationReason::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_second_connection_cannot_bind() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    let _first = server.connect_and_init(&session, 120).await;

    let mut second = server.connect(&session.token).await.unwrap();
    let mut init = session_body(120);
    init["command"] = json!("init");
    init["session_id"] = json!(session.session_id);
    send_json(&mut second, &init).await;

    assert_eq!(next_json(&mut second).await["code"], "SESSION_UNAVAILABLE");
    assert_eq!(expect_close(&mut second).await, 1008);
    assert_eq!(server.status(&session), SessionStatus::Active);
}

#[tokio::test]
async fn test_end_to_end_session() {
    let server = spawn_server(base_config()).await;
    let session = server.start_session(120).await;
    assert_eq!(server.status(&session), SessionStatus::Pending);

    let mut ws = server.connect_and_init(&session, 120).await;
    assert_eq!(server.status(&session), SessionStatus::Active);

    send_json(&mut ws, &voice(&[10, 20], "a1")).await;
    send_json(&mut ws, &voice(&[30, 40], "a2")).await;
    send_json(&mut ws, &json!({"command": "voice_end", "event_id": "a3"})).await;
    send_json(&mut ws, &json!({"command": "heartbeat", "event_id": "h1"})).await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"command": "heartbeat_ack", "event_id": "h1", "timestamp": 0})
    );

    assert_eq!(server.stop_session(&session).await, StatusCode::OK);
    assert_eq!(expect_close(&mut ws).await, 1000);
    assert_eq!(server.status(&session), SessionStatus::Terminated);

    let events = server.wait_for_events(4).await;
    assert_eq!(
        events,
        vec![
            Event::Audio(vec![10, 20]),
            Event::Audio(vec![30, 40]),
            Event::End,
            Event::Close,
        ]
    );

    // Connection slot is released once the socket task ends
    for _ in 0..100 {
        if server.state.ws_connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.state.ws_connection_count(), 0);
}
