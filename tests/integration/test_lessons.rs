//! End-to-end tests for lesson progression over the HTTP API.
//!
//! The machine is a scripted backend loaded from the fixture scenario, so
//! these run without Docker. The Docker round trip at the bottom is
//! `#[ignore]`d for environments without a daemon.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use shelltutor_runtime::{
    create_router, AppState, Config, LessonCatalog, LessonController, RunReport, RunVerdict,
    StateResponse,
};
use shelltutor_vm::{DockerBackend, Readiness, ScriptedBackend, VmSession};

/// Path to the lesson fixtures.
fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/linux-course")
}

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Builds app state around the builtin course and the scripted machine.
fn scripted_state() -> AppState {
    let backend = ScriptedBackend::from_file(&fixture_path().join("machine.json"))
        .expect("Failed to load machine scenario");
    let config = Config::default();
    let session = Arc::new(VmSession::new(
        Arc::new(backend),
        config.machine.device_stack(&std::env::temp_dir()),
    ));
    let controller = LessonController::new(LessonCatalog::builtin(), session, 0)
        .expect("Failed to create controller")
        .with_runner(config.machine.command_runner());
    AppState::new(controller, config.assistant_url)
}

/// Spawns the server and returns its base URL.
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

    (format!("http://{addr}"), handle)
}

async fn boot(state: &AppState) {
    state
        .session
        .initialize()
        .await
        .expect("Scripted machine failed to boot");
    assert_eq!(state.session.readiness(), Readiness::Ready);
}

async fn post<T: serde::de::DeserializeOwned>(client: &reqwest::Client, url: &str) -> T {
    let response = client.post(url).send().await.expect("Request failed");
    assert!(
        response.status().is_success(),
        "POST {url} returned {}",
        response.status()
    );
    response.json().await.expect("Invalid JSON response")
}

// ============================================================================
// Fixtures
// ============================================================================

#[test]
fn test_fixture_config_loads() {
    let config = Config::load_from_file(&fixture_path().join("shelltutor.json"))
        .expect("Failed to load config");

    assert_eq!(config.lessons.as_deref(), Some("lessons.json"));
    assert_eq!(config.start_lesson, 1);
    assert_eq!(config.machine.name, "shelltutor-fixture");
    assert_eq!(config.machine.command_timeout_seconds, 10);
    assert!(config.machine.keep_on_exit);
    // Unset keys keep their defaults
    assert_eq!(config.machine.shell, "/bin/bash");
    assert_eq!(config.machine.working_dir, "/app");
}

#[test]
fn test_fixture_lessons_load() {
    let catalog = LessonCatalog::load_from_file(&fixture_path().join("lessons.json"))
        .expect("Failed to load lessons");

    assert_eq!(catalog.count(), 2);
    assert_eq!(catalog.get(1).map(|l| l.starter_command.as_str()), Some("whoami"));
}

// ============================================================================
// Lesson progression
// ============================================================================

/// Walks the whole built-in course: every starter command passes and
/// unlocks the next lesson.
#[tokio::test]
async fn test_complete_course_over_http() {
    let state = scripted_state();
    boot(&state).await;
    let (base, _handle) = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    let lessons: Vec<Value> = client
        .get(format!("{base}/api/lessons"))
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("Invalid JSON");
    assert_eq!(lessons.len(), 8);

    for index in 0..lessons.len() {
        let report: RunReport = post(&client, &format!("{base}/api/run")).await;
        assert_eq!(
            report.verdict,
            RunVerdict::Passed,
            "lesson {index} did not pass: {report:?}"
        );
        assert_eq!(report.state.active_lesson_index, index);

        let advance = client
            .post(format!("{base}/api/advance"))
            .send()
            .await
            .expect("Request failed");
        if index + 1 < lessons.len() {
            let snapshot: StateResponse = advance.json().await.expect("Invalid JSON");
            assert_eq!(snapshot.state.active_lesson_index, index + 1);
            assert_eq!(
                snapshot.state.editable_command_text,
                lessons[index + 1]["starter_command"].as_str().unwrap_or_default()
            );
            assert!(!snapshot.state.last_success);
        } else {
            assert_eq!(advance.status(), reqwest::StatusCode::CONFLICT);
        }
    }
}

#[tokio::test]
async fn test_run_before_boot_is_rejected() {
    let state = scripted_state();
    let (base, _handle) = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/api/run"))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let snapshot: StateResponse = client
        .get(format!("{base}/api/state"))
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("Invalid JSON");
    assert!(!snapshot.state.is_running);
    assert_eq!(snapshot.readiness, Readiness::Uninitialized);
}

#[tokio::test]
async fn test_stderr_output_is_evaluated() {
    let state = scripted_state();
    boot(&state).await;
    let (base, _handle) = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .put(format!("{base}/api/command"))
        .json(&json!({"command": "cat missing.txt"}))
        .send()
        .await
        .expect("Request failed");
    assert!(response.status().is_success());

    let report: RunReport = post(&client, &format!("{base}/api/run")).await;

    assert_eq!(report.verdict, RunVerdict::Mismatch);
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(
        report.output.as_deref(),
        Some("cat: missing.txt: No such file or directory")
    );
}

/// A lesson change while a command runs drops that command's result.
#[tokio::test]
async fn test_lesson_change_during_run_discards_result() {
    let state = scripted_state();
    boot(&state).await;
    let (base, _handle) = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    client
        .put(format!("{base}/api/command"))
        .json(&json!({"command": "sleep 2"}))
        .send()
        .await
        .expect("Request failed");

    let run = tokio::spawn({
        let client = client.clone();
        let url = format!("{base}/api/run");
        async move { client.post(url).send().await.expect("Request failed") }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot: StateResponse = post(&client, &format!("{base}/api/lessons/3/select")).await;
    assert!(snapshot.state.is_running);

    let report: RunReport = run
        .await
        .expect("Run task panicked")
        .json()
        .await
        .expect("Invalid JSON");
    assert_eq!(report.verdict, RunVerdict::Stale);
    assert_eq!(report.state.active_lesson_index, 3);
    assert!(!report.state.is_running);
    assert!(report.state.last_output.is_empty());
}

// ============================================================================
// Docker
// ============================================================================

/// Runs the first lesson in a real container.
#[tokio::test]
#[ignore = "requires a running Docker daemon"]
async fn test_first_lesson_in_docker() {
    let config = Config::default();
    let work_dir = std::env::temp_dir().join("shelltutor-docker-test");
    let backend = DockerBackend::new("shelltutor-integration-test")
        .expect("Docker client")
        .with_pull_image(true);
    let session = Arc::new(VmSession::new(
        Arc::new(backend),
        config.machine.device_stack(&work_dir),
    ));
    let mut controller = LessonController::new(LessonCatalog::builtin(), Arc::clone(&session), 0)
        .expect("Failed to create controller")
        .with_runner(config.machine.command_runner());

    session.initialize().await.expect("Machine failed to boot");
    let outcome = controller.run().await;
    session.shutdown().await.expect("Teardown failed");

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(controller.state().last_output, "Hello, World!");
}
