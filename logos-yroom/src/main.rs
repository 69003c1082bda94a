use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use logos_yroom::{
    Gateway, GatewayConfig, LocalBus, Settings, ShutdownCause, ShutdownOutcome, StoreRegistry,
    Worker, YrsEngine,
};

#[derive(Parser, Debug)]
#[command(name = "logos-yroom")]
#[command(about = "Room worker for real-time document collaboration")]
#[command(version)]
struct Cli {
    /// JSON settings file (built-in defaults if omitted)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Channel the worker listens on (default: channel_name of the default namespace)
    #[arg(long)]
    channel: Option<String>,

    /// WebSocket listen address
    #[arg(long, default_value = "127.0.0.1:8765")]
    listen: String,

    /// Namespace prepended to room names opened through the gateway
    #[arg(long, default_value = "yroom")]
    room_prefix: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::error!("Invalid settings in {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Settings::new(),
    };
    let settings = Arc::new(settings);
    let channel = cli
        .channel
        .unwrap_or_else(|| settings.default_room().channel_name.clone());

    let bus = Arc::new(LocalBus::new());
    let gateway = Gateway::new(
        GatewayConfig {
            bind_addr: cli.listen,
            room_prefix: cli.room_prefix,
        },
        settings.clone(),
        bus.clone(),
    );
    let listener = match gateway.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Cannot start gateway: {e}");
            return ExitCode::FAILURE;
        }
    };
    let gateway_task = tokio::spawn(async move { gateway.serve(listener).await });

    log::info!("Running worker for channel '{channel}'");
    let worker = Worker::new(
        bus,
        channel,
        YrsEngine::new(),
        settings,
        Arc::new(StoreRegistry::new()),
    );
    let report = worker.run(termination_signal()).await;
    gateway_task.abort();

    match (&report.cause, report.outcome) {
        (ShutdownCause::Signal(_), ShutdownOutcome::Flushed { .. }) => ExitCode::SUCCESS,
        (cause, outcome) => {
            log::error!("Worker stopped after {cause:?} with outcome {outcome:?}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn termination_signal() -> String {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind) -> Option<Signal> {
        match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                log::warn!("Cannot listen for {kind:?}: {e}");
                None
            }
        }
    }

    async fn recv(stream: &mut Option<Signal>) {
        match stream {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    let mut interrupt = install(SignalKind::interrupt());
    let mut terminate = install(SignalKind::terminate());
    let mut hangup = install(SignalKind::hangup());

    tokio::select! {
        _ = recv(&mut interrupt) => "SIGINT".to_string(),
        _ = recv(&mut terminate) => "SIGTERM".to_string(),
        _ = recv(&mut hangup) => "SIGHUP".to_string(),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> String {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    "CTRL-C".to_string()
}
