use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use portico::config::{GatewayConfig, LoggingConfig, load_json_file};
use portico::{AppState, RouteTable, build_router, metrics, utils};

/// HTTP API gateway with rate limiting, routing, circuit breaking, and
/// response caching.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(long, default_value = "config/gateway.json")]
    config: PathBuf,

    /// Path to the routes file
    #[arg(long, default_value = "config/routes.json")]
    routes: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Process-wide crypto provider for rustls; must happen before any TLS
    // config (server or client) is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    // Configuration problems are fatal and must be visible even before the
    // log subscriber exists, so they go to stderr directly.
    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    let _log_guard = init_logging(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        routes = %cli.routes.display(),
        "Starting API gateway"
    );

    match run(config, &cli.routes).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(code) => ExitCode::from(code as u8),
    }
}

async fn run(config: GatewayConfig, routes_path: &Path) -> Result<(), exitcode::ExitCode> {
    let routes_doc = load_json_file(routes_path).map_err(|e| {
        error!("Failed to load routes: {e}");
        exitcode::CONFIG
    })?;
    let routes = RouteTable::from_json(&routes_doc);
    if routes.is_empty() {
        error!("No usable routes loaded; refusing to start");
        return Err(exitcode::CONFIG);
    }

    let metrics_handle = metrics::init_metrics().map_err(|e| {
        error!("Failed to initialize metrics: {e}");
        exitcode::SOFTWARE
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let tls = config.server.tls.clone();

    let state = AppState::new(config, routes, metrics_handle)
        .await
        .map_err(|e| {
            error!("Startup failed: {e}");
            exitcode::CONFIG
        })?;
    let app = build_router(state.clone());

    if tls.enabled {
        serve_tls(app, addr, &tls.cert_file, &tls.key_file).await?;
    } else {
        serve_plain(app, addr).await?;
    }

    info!("Listener stopped, shutting down background tasks");
    state.shutdown().await;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn serve_plain(app: axum::Router, addr: SocketAddr) -> Result<(), exitcode::ExitCode> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })
}

async fn serve_tls(
    app: axum::Router,
    addr: SocketAddr,
    cert_file: &str,
    key_file: &str,
) -> Result<(), exitcode::ExitCode> {
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_file, key_file)
        .await
        .map_err(|e| {
            error!("Failed to load TLS certificate: {e}");
            exitcode::CONFIG
        })?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        utils::shutdown_signal().await;
        // Bounded drain: lingering requests are cut off after the grace
        // period rather than holding the process open.
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
    });

    info!("Gateway listening on https://{addr}");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })
}

/// Install the tracing subscriber: stderr always, plus a rolling file sink
/// when configured. The returned guard must live for the whole process so
/// the non-blocking writer flushes on exit.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if logging.file.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
        return None;
    }

    let path = Path::new(&logging.file);
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gateway.log".to_string());
    let appender = tracing_appender::rolling::daily(directory, file_name);

    if logging.async_writes {
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
        None
    }
}
