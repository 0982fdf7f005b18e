//! shelltutor CLI
//!
//! Interactive Linux command-line lessons run against a Docker machine.

mod render;
mod repl;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use shelltutor_runtime::{
    create_router, spawn_event_forwarder, AppState, Config, EventBroadcaster, LessonCatalog,
    LessonController, TutorError,
};
use shelltutor_vm::{DockerBackend, MachineBackend, ScriptedBackend, VmSession};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use crate::repl::Repl;

/// Default port for the HTTP API server.
const DEFAULT_PORT: u16 = 3000;

/// shelltutor - learn the Linux command line
///
/// Walks through a sequence of lessons. Each lesson's command runs in a
/// throwaway Docker machine and its output is checked against the lesson.
#[derive(Parser, Debug)]
#[command(name = "shelltutor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: shelltutor.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Lesson file to use instead of the built-in course
    #[arg(long, value_name = "FILE")]
    lessons: Option<String>,

    /// Machine image to run lessons in
    #[arg(long, value_name = "IMAGE")]
    image: Option<String>,

    /// Lesson number to start on (1-based)
    #[arg(short, long, value_name = "N")]
    lesson: Option<usize>,

    /// Serve the HTTP and WebSocket API instead of the interactive prompt
    #[arg(long)]
    serve: bool,

    /// Port for the HTTP API server
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Run against canned replies from a JSON file instead of Docker
    #[arg(long, value_name = "FILE")]
    scripted: Option<PathBuf>,

    /// Check configuration, lessons and the machine, then exit
    #[arg(long)]
    check: bool,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr so the prompt on stdout stays readable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Loads everything, runs the chosen front end, then tears the machine down.
async fn run(args: Args) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(args.config.as_deref())?;
    let config = apply_overrides(config, &args)?;

    let catalog = load_catalog(&config, &base_dir)?;
    tracing::info!(lessons = catalog.count(), "Lesson catalog loaded");

    let backend = create_backend(&config, args.scripted.as_deref())?;
    let session = Arc::new(VmSession::new(
        backend,
        config.machine.device_stack(&base_dir),
    ));
    let controller = LessonController::new(catalog, Arc::clone(&session), config.start_lesson)?
        .with_runner(config.machine.command_runner());

    if args.check {
        return check(&session, &config).await;
    }

    let boot = spawn_boot(Arc::clone(&session));

    let result = if args.serve {
        serve(controller, &config, args.port, boot).await
    } else {
        let mut repl = Repl::new(controller, &config.assistant_url, Some(boot));
        let outcome = repl
            .run_loop(BufReader::new(tokio::io::stdin()), &mut std::io::stdout())
            .await;
        repl.finish();
        outcome.map_err(anyhow::Error::from)
    };

    shutdown(&session).await;
    result
}

/// Loads configuration and returns it with the directory relative paths
/// resolve against.
fn load_config(config_path: Option<&str>) -> anyhow::Result<(Config, PathBuf)> {
    let current_dir = std::env::current_dir()?;
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            let base_dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| current_dir.clone(), Path::to_path_buf);
            Ok((Config::load_from_file(path)?, base_dir))
        }
        None => Ok((Config::load_from_dir(&current_dir)?, current_dir)),
    }
}

/// Applies command line overrides and re-validates.
fn apply_overrides(mut config: Config, args: &Args) -> anyhow::Result<Config> {
    if let Some(lessons) = &args.lessons {
        config.lessons = Some(lessons.clone());
    }
    if let Some(image) = &args.image {
        config.machine.image.clone_from(image);
    }
    if let Some(number) = args.lesson {
        config.start_lesson = number.checked_sub(1).ok_or_else(|| {
            anyhow::anyhow!("Lesson numbers start at 1\n\nSuggestion: Use --lesson 1 for the first lesson")
        })?;
    }
    config.validate()?;
    Ok(config)
}

fn load_catalog(config: &Config, base_dir: &Path) -> Result<LessonCatalog, TutorError> {
    match config.lessons_path() {
        Some(path) => LessonCatalog::load_from_file(&base_dir.join(path)),
        None => Ok(LessonCatalog::builtin()),
    }
}

fn create_backend(
    config: &Config,
    scripted: Option<&Path>,
) -> Result<Arc<dyn MachineBackend>, TutorError> {
    if let Some(path) = scripted {
        tracing::info!(path = %path.display(), "Using scripted machine");
        return Ok(Arc::new(ScriptedBackend::from_file(path)?));
    }
    let docker = DockerBackend::new(&config.machine.name)?
        .with_pull_image(config.machine.pull_image)
        .with_keep_on_exit(config.machine.keep_on_exit);
    Ok(Arc::new(docker))
}

/// Starts machine bring-up in the background.
pub(crate) fn spawn_boot(session: Arc<VmSession>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = session.initialize().await {
            // Readiness is already Failed; the front end reports it.
            tracing::warn!(error = %TutorError::from(e), "Lesson machine did not start");
        }
    })
}

/// Brings the machine up once, prints what was checked and tears it down.
async fn check(session: &VmSession, config: &Config) -> anyhow::Result<()> {
    println!("Configuration OK");
    println!("  Image: {}", config.machine.image);
    println!("  Machine: {}", config.machine.name);
    println!();
    println!("Starting lesson machine...");

    let result = session.initialize().await.map_err(TutorError::from);
    shutdown(session).await;
    result?;

    println!("Lesson machine OK");
    Ok(())
}

/// Serves the HTTP and WebSocket API until Ctrl-C.
async fn serve(
    controller: LessonController,
    config: &Config,
    port: u16,
    boot: JoinHandle<()>,
) -> anyhow::Result<()> {
    let session = Arc::clone(controller.session());
    let console = controller.console().clone();
    let broadcaster = EventBroadcaster::default();

    let forwarder = spawn_event_forwarder(Arc::clone(&session), console, broadcaster.clone());
    let app_state = AppState::with_shared(
        Arc::new(Mutex::new(controller)),
        session,
        broadcaster,
        &config.assistant_url,
    );
    let router = create_router(app_state);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!("shelltutor API running on http://{addr}");
    println!("Press Ctrl+C to stop");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl+C, shutting down");
        })
        .await;

    forwarder.abort();
    boot.abort();
    result.map_err(anyhow::Error::from)
}

/// Tears the machine down, logging instead of failing.
async fn shutdown(session: &VmSession) {
    if let Err(e) = session.shutdown().await {
        tracing::warn!(error = %e, "Failed to tear down lesson machine");
    }
}
