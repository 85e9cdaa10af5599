//! Mutual-TLS tunnel CLI
//!
//! Terminates or originates mutual TLS in front of a TCP service, enforcing
//! certificate-based identity allow-lists.

mod status;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mtls_tunnel_core::config::LoggingConfig;
use mtls_tunnel_core::events::CompositeEventSink;
use mtls_tunnel_core::metrics::TunnelMetrics;
use mtls_tunnel_core::store::spawn_timed_reload;
use mtls_tunnel_core::{
    CertificateStore, SharedEventSink, TlsConfigBuilder, TlsConfigCache, TracingEventSink,
    TunnelConfig, TunnelListener,
};

use crate::status::StatusState;

/// Mutual-TLS terminating tunnel.
#[derive(Parser)]
#[command(name = "mtls-tunnel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override target address.
    #[arg(long)]
    target: Option<String>,

    /// Load the configuration and key material, then exit.
    #[arg(long)]
    check: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TunnelConfig::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(target) = args.target {
        config.target.address = target;
    }
    config.validate()?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.mode,
        listen = %config.listen.address,
        target = %config.target.address,
        min_tls = %config.tls.min_version,
        "starting mtls tunnel"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if args.check {
        return runtime.block_on(check(config));
    }
    runtime.block_on(async move { run_tunnel(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Load key material and build both TLS configurations without listening.
async fn check(config: TunnelConfig) -> anyhow::Result<()> {
    let events: SharedEventSink = Arc::new(TracingEventSink);
    let store = Arc::new(
        CertificateStore::initialize(config.keystore_sources()?, events)
            .await
            .context("failed to load key material")?,
    );
    let tls = TlsConfigCache::new(
        Arc::clone(&store),
        TlsConfigBuilder::new(config.tls_policy()?),
    )?;
    let current = tls.current();
    info!(
        certificate_version = current.version,
        min_tls = %current.min_version,
        require_client_auth = current.require_client_auth,
        "configuration ok"
    );
    Ok(())
}

async fn run_tunnel(config: TunnelConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(TunnelMetrics::new());
    let tracing_sink: SharedEventSink = Arc::new(TracingEventSink);
    let metrics_sink: SharedEventSink = metrics.clone();
    let events: SharedEventSink = Arc::new(CompositeEventSink::new(vec![tracing_sink, metrics_sink]));

    let store = Arc::new(
        CertificateStore::initialize(config.keystore_sources()?, Arc::clone(&events))
            .await
            .context("failed to load key material")?,
    );
    metrics.set_certificate_version(store.version());

    let tls = Arc::new(TlsConfigCache::new(
        Arc::clone(&store),
        TlsConfigBuilder::new(config.tls_policy()?),
    )?);
    info!(
        certificate_version = store.version(),
        allow_patterns = config.tls.allow.len(),
        "certificates loaded"
    );

    let listener = TunnelListener::bind(config.proxy_settings(), Arc::clone(&tls), events)
        .await
        .with_context(|| format!("failed to bind {}", config.listen.address))?;
    let shutdown_handle = listener.shutdown_handle();
    let background = CancellationToken::new();
    let draining = Arc::new(AtomicBool::new(false));

    // Start timed reload if enabled
    if let Some(interval) = config.reload_interval() {
        spawn_timed_reload(Arc::clone(&store), interval, background.clone());
        info!(interval_secs = interval.as_secs(), "timed certificate reload started");
    }

    #[cfg(unix)]
    spawn_sighup_reload(Arc::clone(&store), background.clone())?;

    // Start status endpoint if enabled
    if config.status.enabled {
        let addr: SocketAddr = config
            .status
            .address
            .parse()
            .with_context(|| format!("invalid status address {}", config.status.address))?;
        let state = Arc::new(StatusState {
            mode: config.mode,
            store: Arc::clone(&store),
            metrics: Arc::clone(&metrics),
            active_connections: listener.active_counter(),
            draining: Arc::clone(&draining),
        });
        let shutdown = background.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state, shutdown).await {
                error!(error = %e, "status endpoint error");
            }
        });
    }

    // Handle shutdown signals
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => info!(signal = name, "shutdown signal received, draining connections"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signals, stopping"),
        }
        draining.store(true, Ordering::Relaxed);
        let _ = shutdown_handle.send(());
    });

    listener.run().await?;
    background.cancel();

    info!("tunnel shutdown complete");
    Ok(())
}

/// Reload certificates on every `SIGHUP`.
#[cfg(unix)]
fn spawn_sighup_reload(
    store: Arc<CertificateStore>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("failed to listen for SIGHUP")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received, reloading certificates");
                    // Outcome is reported through the event sinks.
                    let _ = store.reload().await;
                }
                () = shutdown.cancelled() => break,
            }
        }
    });
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "ctrl-c")
    }
}
