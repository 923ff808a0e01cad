use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use logproxy_core::config::{LogproxyConfig, StartMode, EVENTS_PATH};
use logproxy_core::LogproxyError;
use logproxy_pipeline::{bus, Broadcaster, IngestEnd, Ingestor};
use tracing::{info, warn};

mod app;
mod http;

const DEFAULT_LOG_FILTER: &str =
    "logproxy=info,logproxy_gateway=info,logproxy_pipeline=info,tower_http=info";

/// Stream stdin to browsers over Server-Sent Events.
#[derive(Debug, Parser)]
#[command(name = "logproxy", version, about)]
struct Cli {
    /// Config file (default: $LOGPROXY_CONFIG, then ./logproxy.toml).
    #[arg(short, long)]
    config: Option<String>,
    /// Listen address.
    #[arg(long)]
    bind: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Static directory, `http(s)://` dev server to proxy, or `embedded`.
    #[arg(long)]
    frontend: Option<String>,
}

impl Cli {
    /// Flags win over file and env settings.
    fn apply(&self, config: &mut LogproxyConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(frontend) = &self.frontend {
            config.frontend = frontend.clone();
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout stays free for whatever wraps us.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = LogproxyConfig::load(cli.config.as_deref()).context("loading config")?;
    cli.apply(&mut config);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    // A pending stdin read holds a blocking-pool thread that never returns
    // on its own; don't wait for it.
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(config: LogproxyConfig) -> anyhow::Result<()> {
    let (publisher, bus_rx) = bus::channel(config.broadcast.bus_capacity);
    let broadcaster = Broadcaster::new(&config.broadcast, bus_rx);
    if config.broadcast.start == StartMode::Eager {
        broadcaster.start();
    }

    // Bind before touching stdin so a taken port fails fast.
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| LogproxyError::Bind {
            addr: addr.clone(),
            source,
        })?;

    let ingestor = Ingestor::new(
        tokio::io::BufReader::new(tokio::io::stdin()),
        publisher,
        &config.ingest,
    );
    tokio::spawn(async move {
        let report = ingestor.run().await;
        match report.end {
            IngestEnd::EndOfInput => {
                info!(lines = report.lines, "stdin closed, connected viewers stay attached")
            }
            IngestEnd::ReadError(e) => {
                warn!(lines = report.lines, error = %e, "stdin read failed, ingestion stopped")
            }
            IngestEnd::BusClosed => warn!(lines = report.lines, "broadcaster gone, ingestion stopped"),
        }
    });

    info!(
        frontend = app::frontend_kind(&config.frontend_target()),
        target = %config.frontend,
        start = ?config.broadcast.start,
        queue_depth = config.broadcast.queue_depth,
        "logproxy listening on http://{}{}",
        addr,
        EVENTS_PATH
    );

    let state = Arc::new(app::AppState::new(config, Arc::clone(&broadcaster)));
    let router = app::build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(broadcaster))
        .await?;

    info!("server stopped");
    Ok(())
}

/// Wait for Ctrl-C / SIGTERM, then end every open event stream so the
/// graceful shutdown does not wait on long-lived connections.
async fn shutdown_signal(broadcaster: Arc<Broadcaster>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    broadcaster.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "logproxy",
            "--port",
            "9999",
            "--frontend",
            "http://localhost:3000/",
        ]);
        let mut config = LogproxyConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(app::frontend_kind(&config.frontend_target()), "proxy");
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
