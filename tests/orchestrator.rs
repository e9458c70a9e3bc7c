//! Session lifecycle of `BotSessionOrchestrator` against a mock HTTP
//! backend, a local WebSocket server and in-memory audio devices.

use async_trait::async_trait;
use botstream::analytics::MemoryErrorSink;
use botstream::audio::{AudioBackend, CaptureDevice, PlaybackDevice};
use botstream::bot::{
    AudioStreamRequest, BotSessionOrchestrator, Notification, RoomTimeline, SessionEvent,
    SessionState, WebSearchQuery,
};
use botstream::config::{AudioConfig, BotConfig, Config};
use botstream::error::{AudioError, AudioResult, BotResult};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROOM: &str = "!room:example.org";

// ── Fake devices ──────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Speaker {
    written: Arc<Mutex<Vec<u8>>>,
    write_delay: Duration,
}

impl PlaybackDevice for Speaker {
    fn buffer_capacity(&self) -> usize {
        4_096
    }
    fn start(&mut self) -> AudioResult<()> {
        Ok(())
    }
    fn write(&mut self, pcm: &[u8]) -> AudioResult<usize> {
        std::thread::sleep(self.write_delay);
        self.written.lock().extend_from_slice(pcm);
        Ok(pcm.len())
    }
    fn pause(&mut self) -> AudioResult<()> {
        Ok(())
    }
    fn release(&mut self) {}
}

struct Mic {
    frame: usize,
    blocked: bool,
}

impl CaptureDevice for Mic {
    fn frame_size(&self) -> usize {
        self.frame
    }
    fn start(&mut self) -> AudioResult<()> {
        if self.blocked {
            return Err(AudioError::Security("capture blocked by policy".into()));
        }
        Ok(())
    }
    fn read(&mut self, frame: &mut [u8]) -> AudioResult<usize> {
        std::thread::sleep(Duration::from_millis(10));
        frame.fill(1);
        Ok(frame.len())
    }
    fn stop(&mut self) {}
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MicMode {
    Live,
    Denied,
    Blocked,
}

struct FakeBackend {
    speaker: Speaker,
    mic: MicMode,
}

impl AudioBackend for FakeBackend {
    fn open_capture(&self, config: &AudioConfig) -> AudioResult<Box<dyn CaptureDevice>> {
        if self.mic == MicMode::Denied {
            return Err(AudioError::PermissionDenied);
        }
        Ok(Box::new(Mic {
            frame: config.capture_frame_bytes,
            blocked: self.mic == MicMode::Blocked,
        }))
    }

    fn open_playback(&self, _config: &AudioConfig) -> AudioResult<Box<dyn PlaybackDevice>> {
        Ok(Box::new(self.speaker.clone()))
    }
}

// ── Harness ───────────────────────────────────────────────────────

struct Rig {
    orchestrator: BotSessionOrchestrator,
    notifications: mpsc::UnboundedReceiver<Notification>,
    speaker: Speaker,
    errors: Arc<MemoryErrorSink>,
}

fn rig(base_url: &str, ws_url: &str, mic: MicMode) -> Rig {
    rig_with_speaker(base_url, ws_url, mic, Speaker::default())
}

fn rig_with_speaker(base_url: &str, ws_url: &str, mic: MicMode, speaker: Speaker) -> Rig {
    let config = Config {
        bot: BotConfig {
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            ..BotConfig::default()
        },
        audio: AudioConfig {
            capture_frame_bytes: 64,
            idle_poll_ms: 50,
            ..AudioConfig::default()
        },
    };
    let backend = FakeBackend {
        speaker: speaker.clone(),
        mic,
    };
    let errors = Arc::new(MemoryErrorSink::new());
    let (orchestrator, notifications) =
        BotSessionOrchestrator::new(config, Arc::new(backend), errors.clone()).unwrap();
    Rig {
        orchestrator,
        notifications,
        speaker,
        errors,
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}

/// Collect notifications up to and including the return to idle.
async fn until_idle(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    loop {
        let notification = next(rx).await;
        let done = notification == Notification::StateChanged(SessionState::Idle);
        seen.push(notification);
        if done {
            return seen;
        }
    }
}

async fn until(rx: &mut mpsc::UnboundedReceiver<Notification>, want: &Notification) {
    while &next(rx).await != want {}
}

fn toasts(seen: &[Notification]) -> Vec<String> {
    seen.iter()
        .filter_map(|n| match n {
            Notification::Toast { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn exchange(event_id: &str) -> SessionEvent {
    SessionEvent::Start {
        room_id: ROOM.to_string(),
        request: AudioStreamRequest {
            query: "tell me a joke".into(),
            event_id: event_id.into(),
            user_id: "@alice:example.org".into(),
        },
    }
}

/// WebSocket server for one client: sends `greeting` as a binary frame,
/// reports every frame it receives and whether the client closed, then
/// optionally hangs up on its own after `hang_up_after`.
async fn ws_server(
    greeting: Vec<u8>,
    hang_up_after: Option<Duration>,
) -> (String, mpsc::UnboundedReceiver<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if !greeting.is_empty() {
            ws.send(WsMessage::Binary(greeting.into())).await.unwrap();
        }
        if let Some(delay) = hang_up_after {
            tokio::time::sleep(delay).await;
            let _ = ws.close(None).await;
            return;
        }
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                WsMessage::Binary(data) => {
                    let _ = seen_tx.send(Some(data.to_vec()));
                }
                WsMessage::Close(_) => {
                    let _ = seen_tx.send(None);
                    break;
                }
                _ => {}
            }
        }
    });

    (format!("ws://{addr}/ws/audio"), seen_rx)
}

// ── Single exchange ───────────────────────────────────────────────

#[tokio::test]
async fn exchange_plays_audio_and_returns_to_idle() {
    let server = MockServer::start().await;
    let body = concat!(
        r#"{"type":"text","data":"Why did the crab"}"#,
        r#"{"type":"audio","data":"AQIDBA=="}"#,
        r#"{"type":"audio","data":"BQY="}"#,
    );
    Mock::given(method("POST"))
        .and(path(format!("/stream_audio/{ROOM}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let mut rig = rig(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live);
    rig.orchestrator.handle(exchange("$q1")).await;

    let seen = until_idle(&mut rig.notifications).await;
    assert_eq!(seen.first(), Some(&Notification::StateChanged(SessionState::Active)));
    assert!(seen.contains(&Notification::BotText("Why did the crab".into())));
    let started = seen.iter().position(|n| *n == Notification::PlaybackStarted);
    let finished = seen.iter().position(|n| *n == Notification::PlaybackFinished);
    assert!(started.is_some() && finished.is_some() && started < finished);
    assert!(seen.contains(&Notification::StateChanged(SessionState::Closing)));
    assert!(toasts(&seen).is_empty());

    assert_eq!(rig.speaker.written.lock().as_slice(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(rig.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn backend_failure_toasts_once_and_returns_to_idle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/stream_audio/{ROOM}")))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut rig = rig(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live);
    rig.orchestrator.handle(exchange("$q2")).await;

    let seen = until_idle(&mut rig.notifications).await;
    let toasts = toasts(&seen);
    assert_eq!(toasts.len(), 1);
    assert!(toasts[0].contains("500"), "toast = {}", toasts[0]);
    assert_eq!(rig.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn repeated_question_is_not_sent_twice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/stream_audio/{ROOM}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"type":"text","data":"once"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let mut rig = rig(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live);
    rig.orchestrator.handle(exchange("$dup")).await;
    until_idle(&mut rig.notifications).await;

    rig.orchestrator.handle(exchange("$dup")).await;
    let seen = until_idle(&mut rig.notifications).await;
    assert!(toasts(&seen).is_empty());
    assert!(!seen.contains(&Notification::BotText("once".into())));
}

struct PostingTimeline {
    posted: Mutex<Option<String>>,
}

#[async_trait]
impl RoomTimeline for PostingTimeline {
    fn room_id(&self) -> &str {
        ROOM
    }
    fn user_id(&self) -> &str {
        "@alice:example.org"
    }
    async fn send_message(&self, _body: &str, html_body: &str) -> BotResult<()> {
        *self.posted.lock() = Some(html_body.to_string());
        Ok(())
    }
    async fn event_id_for_formatted_body(&self, html_body: &str) -> Option<String> {
        (self.posted.lock().as_deref() == Some(html_body)).then(|| "$posted".to_string())
    }
}

#[tokio::test]
async fn ask_posts_question_then_streams_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/stream_audio/{ROOM}")))
        .and(wiremock::matchers::body_json(json!({
            "query": "is it raining",
            "eventId": "$posted",
            "user_id": "@alice:example.org"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"type":"text","data":"no"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let mut rig = rig(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live);
    let timeline = PostingTimeline {
        posted: Mutex::new(None),
    };
    rig.orchestrator.ask(&timeline, "is it raining").await;

    let seen = until_idle(&mut rig.notifications).await;
    assert_eq!(timeline.posted.lock().as_deref(), Some("<p>is it raining</p>"));
    assert!(seen.contains(&Notification::BotText("no".into())));
}

// ── Duplex voice session ──────────────────────────────────────────

#[tokio::test]
async fn connect_streams_both_ways_until_disconnect() {
    let (ws_url, mut server_seen) = ws_server(vec![9; 32], None).await;
    let mut rig = rig("http://127.0.0.1:9", &ws_url, MicMode::Live);

    rig.orchestrator.handle(SessionEvent::Connect).await;
    assert_eq!(
        next(&mut rig.notifications).await,
        Notification::StateChanged(SessionState::Connecting)
    );
    assert_eq!(
        next(&mut rig.notifications).await,
        Notification::StateChanged(SessionState::Active)
    );
    until(&mut rig.notifications, &Notification::PlaybackStarted).await;

    let frame = timeout(Duration::from_secs(5), server_seen.recv())
        .await
        .unwrap()
        .unwrap()
        .expect("a microphone frame before close");
    assert_eq!(frame.len(), 64);

    rig.orchestrator.handle(SessionEvent::Disconnect).await;
    let seen = until_idle(&mut rig.notifications).await;
    assert!(seen.contains(&Notification::StateChanged(SessionState::Closing)));
    assert!(toasts(&seen).is_empty());

    let closed = timeout(Duration::from_secs(5), async {
        while let Some(event) = server_seen.recv().await {
            if event.is_none() {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed, "server never saw a close frame");
    assert_eq!(&rig.speaker.written.lock()[..32], &[9; 32]);
}

#[tokio::test]
async fn server_hang_up_toasts_and_returns_to_idle() {
    let (ws_url, _server_seen) = ws_server(Vec::new(), Some(Duration::from_millis(100))).await;
    let mut rig = rig("http://127.0.0.1:9", &ws_url, MicMode::Live);

    rig.orchestrator.handle(SessionEvent::Connect).await;
    let seen = until_idle(&mut rig.notifications).await;

    assert_eq!(toasts(&seen), vec!["Connection closed".to_string()]);
    assert_eq!(rig.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn denied_microphone_asks_for_permission() {
    let mut rig = rig("http://127.0.0.1:9", "ws://127.0.0.1:9/unused", MicMode::Denied);

    rig.orchestrator.handle(SessionEvent::Connect).await;
    let seen = until_idle(&mut rig.notifications).await;

    assert!(seen.contains(&Notification::PermissionRequired));
    assert!(toasts(&seen).is_empty());
}

#[tokio::test]
async fn unreachable_transport_toasts_and_returns_to_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut rig = rig("http://127.0.0.1:9", &format!("ws://{addr}/ws/audio"), MicMode::Live);
    rig.orchestrator.handle(SessionEvent::Connect).await;
    let seen = until_idle(&mut rig.notifications).await;

    assert_eq!(toasts(&seen).len(), 1);
    assert!(!seen.contains(&Notification::StateChanged(SessionState::Active)));
}

/// Drain what is queued right now.
fn pending(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

async fn connected(rig: &mut Rig) {
    rig.orchestrator.handle(SessionEvent::Connect).await;
    assert_eq!(
        next(&mut rig.notifications).await,
        Notification::StateChanged(SessionState::Connecting)
    );
    assert_eq!(
        next(&mut rig.notifications).await,
        Notification::StateChanged(SessionState::Active)
    );
}

#[tokio::test]
async fn stop_halts_capture_but_keeps_session_active() {
    let (ws_url, mut server_seen) = ws_server(Vec::new(), None).await;
    let mut rig = rig("http://127.0.0.1:9", &ws_url, MicMode::Live);
    connected(&mut rig).await;

    let frame = timeout(Duration::from_secs(5), server_seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(frame.is_some());

    rig.orchestrator.handle(SessionEvent::Stop).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(rig.orchestrator.state(), SessionState::Active);
    let seen = pending(&mut rig.notifications);
    assert!(toasts(&seen).is_empty(), "unexpected {seen:?}");
    assert!(!seen.contains(&Notification::StateChanged(SessionState::Closing)));
    let server_events = std::iter::from_fn(|| server_seen.try_recv().ok()).collect::<Vec<_>>();
    assert!(!server_events.contains(&None), "transport was closed by Stop");

    rig.orchestrator.handle(SessionEvent::Disconnect).await;
    until_idle(&mut rig.notifications).await;
}

#[tokio::test]
async fn blocked_capture_is_tracked_and_session_stays_up() {
    let (ws_url, _server_seen) = ws_server(vec![4; 16], None).await;
    let mut rig = rig("http://127.0.0.1:9", &ws_url, MicMode::Blocked);
    connected(&mut rig).await;

    until(&mut rig.notifications, &Notification::PlaybackStarted).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(rig.orchestrator.state(), SessionState::Active);
    assert!(toasts(&pending(&mut rig.notifications)).is_empty());
    let reports = rig.errors.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].context, "capture.start");

    rig.orchestrator.handle(SessionEvent::Disconnect).await;
    until_idle(&mut rig.notifications).await;
}

#[tokio::test]
async fn disconnect_does_not_wait_for_a_busy_speaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/stream_audio/{ROOM}")))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"type":"audio","data":"AQIDBA=="}"#),
        )
        .mount(&server)
        .await;

    let speaker = Speaker {
        write_delay: Duration::from_secs(2),
        ..Speaker::default()
    };
    let mut rig = rig_with_speaker(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live, speaker);
    rig.orchestrator.handle(exchange("$slow")).await;
    until(&mut rig.notifications, &Notification::PlaybackStarted).await;

    timeout(
        Duration::from_millis(500),
        rig.orchestrator.handle(SessionEvent::Disconnect),
    )
    .await
    .expect("disconnect blocked on the playback device");
    assert_eq!(rig.orchestrator.state(), SessionState::Idle);
}

// ── Idle events ───────────────────────────────────────────────────

#[tokio::test]
async fn stop_and_disconnect_while_idle_are_ignored() {
    let mut rig = rig("http://127.0.0.1:9", "ws://127.0.0.1:9/unused", MicMode::Live);

    rig.orchestrator.handle(SessionEvent::Stop).await;
    rig.orchestrator.handle(SessionEvent::Disconnect).await;

    assert_eq!(rig.orchestrator.state(), SessionState::Idle);
    assert!(rig.notifications.try_recv().is_err());
}

#[tokio::test]
async fn exit_reports_exited() {
    let mut rig = rig("http://127.0.0.1:9", "ws://127.0.0.1:9/unused", MicMode::Live);
    rig.orchestrator.handle(SessionEvent::Exit).await;
    assert_eq!(next(&mut rig.notifications).await, Notification::Exited);
}

// ── Web search ────────────────────────────────────────────────────

#[tokio::test]
async fn web_search_publishes_each_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/web_stream"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "$_$\n{\"source_links\": [\"https://a.example.org\"]}\n$_$\n<i>answer</i>\n",
        ))
        .mount(&server)
        .await;

    let mut rig = rig(&server.uri(), "ws://127.0.0.1:9/unused", MicMode::Live);
    let query = WebSearchQuery {
        room_id: Some(ROOM.into()),
        event_id: Some("$ws".into()),
        question_id: Some("q".into()),
        raw_question: Some("question".into()),
    };
    let result = rig.orchestrator.web_search(&query).await.unwrap();
    assert_eq!(result.answer.text, "answer");

    let Notification::WebSearch(first) = next(&mut rig.notifications).await else {
        panic!("expected a web search update");
    };
    assert_eq!(first.links, vec!["https://a.example.org"]);
    assert!(first.answer.is_empty());
    assert_eq!(
        next(&mut rig.notifications).await,
        Notification::WebSearch(result)
    );
}
