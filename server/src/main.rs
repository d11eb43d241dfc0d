//! Standalone Agentrix server binary. Run with --port and --workdir, or use
//! defaults. Components come up in dependency order: bus, persistence,
//! engine, tasks, then rehydration, then the HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use common::agent::CodexManager;
use common::bus::EventBus;
use common::config;
use common::persist::SessionStore;
use common::tasks::{TaskStore, TaskTracker};
use common::terminal::{EngineOptions, SessionMode, TerminalEngine};
use common::tunnels::TunnelManager;
use common::worktree::FsWorktreeResolver;
use server::AppState;

const DEFAULT_PORT: u16 = 5190;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::ensure_loaded();
    let mut port = DEFAULT_PORT;
    let mut workdir: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
            i += 2;
            continue;
        }
        if args[i] == "--workdir" && i + 1 < args.len() {
            workdir = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }
    let workdir = workdir.unwrap_or_else(|| cfg.working_dir.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(port, workdir))
}

async fn run(port: u16, workdir: PathBuf) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = config::ensure_loaded();

    let bus = EventBus::new();
    let engine = TerminalEngine::new(
        bus.clone(),
        SessionStore::at_default_path(),
        Box::new(FsWorktreeResolver),
        EngineOptions {
            sigkill_delay: cfg.sigkill_delay,
            ..Default::default()
        },
    );

    let tasks = TaskTracker::new(bus.clone());
    tasks
        .configure_persistence(TaskStore::for_workdir(&workdir))
        .await;

    let codex = CodexManager::new(Box::new(FsWorktreeResolver));
    let tunnels = TunnelManager::new();

    let restored = engine.rehydrate(&workdir, SessionMode::Auto).await;
    if restored > 0 {
        tracing::info!("rehydrated {restored} tmux-backed sessions");
    }

    let state = AppState {
        engine: engine.clone(),
        tasks,
        tunnels: tunnels.clone(),
        codex,
        bus,
        workdir,
    };

    let server = tokio::spawn(server::run_web_server(port, state));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    tunnels.close_all();
    engine.dispose_all().await;
    server.abort();
    Ok(())
}
