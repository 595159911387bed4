//! mcpd transport service: HTTP+SSE and stdio bindings over the core.

use clap::Parser;
use mcpd::{
    AnonymousVerifier, AuthVerifier, Dispatcher, InMemorySessionStore, PrimitiveRegistry,
    ServerConfig, StaticTokenVerifier, TransportKind, spawn_reaper,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod http;
mod stdio;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the HTTP transport to (overrides MCP_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Port for the HTTP transport (overrides MCP_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Transport selection: http, stdio or both (overrides MCP_TRANSPORT)
    #[arg(long)]
    transport: Option<TransportKindArg>,
    /// Bearer token required on HTTP requests; omit to run open
    #[arg(long)]
    auth_key: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum TransportKindArg {
    Http,
    Stdio,
    Both,
}

impl From<TransportKindArg> for TransportKind {
    fn from(arg: TransportKindArg) -> Self {
        match arg {
            TransportKindArg::Http => TransportKind::Http,
            TransportKindArg::Stdio => TransportKind::Stdio,
            TransportKindArg::Both => TransportKind::Both,
        }
    }
}

const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 64;
const EXIT_FATAL: u8 = 70;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcpd=info,mcpd_service=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let args = Args::parse();

    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(transport) = args.transport {
        config.transport = transport.into();
    }

    match run(config, args.auth_key).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Bind(e)) => {
            error!(error = %e, "failed to bind transport");
            ExitCode::from(EXIT_BIND)
        }
        Err(RunError::Fatal(e)) => {
            error!(error = %e, "fatal error");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

enum RunError {
    Bind(std::io::Error),
    Fatal(anyhow::Error),
}

async fn run(config: ServerConfig, auth_key: Option<String>) -> Result<(), RunError> {
    let verifier: Arc<dyn AuthVerifier> = match &auth_key {
        Some(key) => Arc::new(StaticTokenVerifier::new().grant(key.clone(), "api", [])),
        None => Arc::new(AnonymousVerifier::new([])),
    };

    info!(
        addr = %config.bind_addr(),
        transport = ?config.transport,
        auth = if auth_key.is_some() { "enabled" } else { "disabled" },
        "starting mcpd service"
    );

    let registry = Arc::new(PrimitiveRegistry::new());
    let store = Arc::new(InMemorySessionStore::new());

    let shutdown = CancellationToken::new();
    let reaper = spawn_reaper(
        Arc::clone(&store),
        config.reaper_interval,
        shutdown.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        store,
        verifier,
        config.clone(),
    ));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_shutdown.cancel();
        }
    });

    let result = match config.transport {
        TransportKind::Http => serve_http(&config, Arc::clone(&dispatcher), shutdown.clone()).await,
        TransportKind::Stdio => stdio::serve(Arc::clone(&dispatcher), shutdown.clone())
            .await
            .map_err(RunError::Fatal),
        TransportKind::Both => {
            let http_dispatcher = Arc::clone(&dispatcher);
            let http_config = config.clone();
            let http_shutdown = shutdown.clone();
            let http_task = tokio::spawn(async move {
                serve_http(&http_config, http_dispatcher, http_shutdown).await
            });
            let stdio_result = stdio::serve(Arc::clone(&dispatcher), shutdown.clone())
                .await
                .map_err(RunError::Fatal);
            // Stdio EOF ends the process; take the HTTP listener down too.
            shutdown.cancel();
            match http_task.await {
                Ok(http_result) => stdio_result.and(http_result),
                Err(e) => Err(RunError::Fatal(anyhow::anyhow!("http task failed: {e}"))),
            }
        }
    };

    shutdown.cancel();
    let _ = reaper.await;
    result
}

async fn serve_http(
    config: &ServerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<(), RunError> {
    let app = http::router(dispatcher);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr())
        .await
        .map_err(RunError::Bind)?;
    info!(addr = %config.bind_addr(), "HTTP transport listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| RunError::Fatal(e.into()))
}
