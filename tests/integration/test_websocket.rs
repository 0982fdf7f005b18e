//! Integration tests for the WebSocket event stream.
//!
//! Clients connect to a real server and watch the events produced by HTTP
//! requests and machine bring-up.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use shelltutor_runtime::{
    create_router, spawn_event_forwarder, AppState, LessonCatalog, LessonController, RunVerdict,
    TutorEvent,
};
use shelltutor_vm::{DeviceStack, Readiness, ScriptedBackend, VmSession};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// App state on the builtin course with the fixture machine, and its
/// console relayed into the broadcaster.
fn test_state() -> AppState {
    let scenario = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures/linux-course/machine.json");
    let backend = ScriptedBackend::from_file(&scenario).expect("Failed to load scenario");
    let session = Arc::new(VmSession::new(
        Arc::new(backend),
        DeviceStack::new("debian:bookworm-slim"),
    ));
    let controller = LessonController::new(LessonCatalog::builtin(), session, 0)
        .expect("Failed to create controller");
    let state = AppState::new(controller, "http://127.0.0.1:5000/chat");

    let console = state
        .controller
        .try_lock()
        .expect("Controller is not shared yet")
        .console()
        .clone();
    spawn_event_forwarder(Arc::clone(&state.session), console, state.broadcaster.clone());
    state
}

/// Spawns the test server and returns its `host:port`.
async fn spawn_test_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, handle)
}

async fn connect_client(addr: &str) -> WsClient {
    let (ws_stream, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next event, answering pings along the way.
async fn receive_event(client: &mut WsClient) -> TutorEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Receives events until one named `name` arrives.
async fn receive_named(client: &mut WsClient, name: &str) -> TutorEvent {
    loop {
        let event = receive_event(client).await;
        if event.event_name() == name {
            return event;
        }
    }
}

// ============================================================================
// Connection Tests
// ============================================================================

#[tokio::test]
async fn test_client_receives_connected_event_on_connect() {
    let (addr, _handle) = spawn_test_server(test_state()).await;

    let mut client = connect_client(&addr).await;
    let event = receive_event(&mut client).await;

    let TutorEvent::Connected(payload) = event else {
        panic!("Expected Connected event, got: {event:?}");
    };
    assert_eq!(payload.readiness, Readiness::Uninitialized);
    assert_eq!(payload.state.active_lesson_index, 0);
    assert_eq!(payload.lesson.expected_output, "Hello, World!");
}

#[tokio::test]
async fn test_connected_event_reflects_selected_lesson() {
    let state = test_state();
    state
        .controller
        .lock()
        .await
        .select_lesson(4)
        .expect("Lesson 4 exists");
    let (addr, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&addr).await;

    let TutorEvent::Connected(payload) = receive_event(&mut client).await else {
        panic!("Expected Connected event");
    };
    assert_eq!(payload.state.active_lesson_index, 4);
    assert_eq!(
        payload.state.editable_command_text,
        "cp file.txt file2.txt && cat file2.txt"
    );
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_boot_is_streamed_as_readiness_changes() {
    let state = test_state();
    let session = Arc::clone(&state.session);
    let (addr, _handle) = spawn_test_server(state).await;
    let mut client = connect_client(&addr).await;
    receive_event(&mut client).await;

    session.initialize().await.expect("Scripted machine failed to boot");

    loop {
        let TutorEvent::ReadinessChanged(payload) =
            receive_named(&mut client, "readiness_changed").await
        else {
            unreachable!();
        };
        if payload.readiness == Readiness::Ready {
            break;
        }
    }
}

#[tokio::test]
async fn test_run_streams_console_and_result_to_all_clients() {
    let state = test_state();
    state
        .session
        .initialize()
        .await
        .expect("Scripted machine failed to boot");
    let (addr, _handle) = spawn_test_server(state).await;

    let mut client1 = connect_client(&addr).await;
    let mut client2 = connect_client(&addr).await;
    receive_event(&mut client1).await;
    receive_event(&mut client2).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/run"))
        .send()
        .await
        .expect("Request failed");
    assert!(response.status().is_success());

    for client in [&mut client1, &mut client2] {
        let TutorEvent::RunStarted(started) = receive_named(client, "run_started").await else {
            unreachable!();
        };
        assert_eq!(started.command, r#"echo "Hello, World!""#);

        // Console output is relayed by its own task and may trail the result.
        let mut console = String::new();
        let mut report = None;
        while report.is_none() || console.is_empty() {
            match receive_event(client).await {
                TutorEvent::ConsoleOutput(chunk) => console.push_str(&chunk.text),
                TutorEvent::RunFinished(finished) => report = Some(finished),
                _ => {}
            }
        }
        assert_eq!(console, "Hello, World!\n");
        let report = report.expect("run_finished received");
        assert_eq!(report.verdict, RunVerdict::Passed);
        assert!(report.state.last_success);
    }
}

#[tokio::test]
async fn test_lesson_selection_is_broadcast() {
    let (addr, _handle) = spawn_test_server(test_state()).await;
    let mut client = connect_client(&addr).await;
    receive_event(&mut client).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/lessons/6/select"))
        .send()
        .await
        .expect("Request failed");
    assert!(response.status().is_success());

    let TutorEvent::LessonChanged(payload) = receive_named(&mut client, "lesson_changed").await
    else {
        unreachable!();
    };
    assert_eq!(payload.lesson.title, "Lesson 7: Iteration with For Loops");
    assert_eq!(payload.state.active_lesson_index, 6);
}

// ============================================================================
// Connection Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_client_close_is_handled() {
    let state = test_state();
    let broadcaster = state.broadcaster.clone();
    let (addr, _handle) = spawn_test_server(state).await;

    let mut client = connect_client(&addr).await;
    receive_event(&mut client).await;
    assert_eq!(broadcaster.receiver_count(), 1);

    client.close(None).await.expect("Failed to close");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broadcaster.receiver_count(), 0);
}
