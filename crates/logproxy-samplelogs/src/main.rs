//! Emits a fixed rotation of sample log lines for exercising the gateway:
//!
//! ```sh
//! logproxy-samplelogs | logproxy --frontend embedded
//! ```

use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// One line per level tag, plus lines the viewer cannot classify.
const PATTERNS: &[&str] = &[
    "<debug>: debug message 1",
    "<debug>: debug message 2",
    "<info>: info message",
    "<error>: error message",
    "<warning>: warning message",
    "<unexpected>: unexpected message",
    "no level message",
];

#[derive(Debug, Parser)]
#[command(name = "logproxy-samplelogs", version, about = "Print sample log lines forever")]
struct Cli {
    /// Delay between lines.
    #[arg(long, default_value_t = 20)]
    interval_ms: u64,
    /// Stop after this many lines (default: never).
    #[arg(long)]
    count: Option<u64>,
}

/// The `n`th line of the rotation.
fn sample_line(n: u64) -> &'static str {
    PATTERNS[(n % PATTERNS.len() as u64) as usize]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logproxy_samplelogs=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut out = BufWriter::new(tokio::io::stdout());
    let mut tick = tokio::time::interval(Duration::from_millis(cli.interval_ms.max(1)));

    let mut n = 0u64;
    while cli.count.map_or(true, |count| n < count) {
        tick.tick().await;
        let line = format!("{}\n", sample_line(n));
        let written = match out.write_all(line.as_bytes()).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // The reader went away (usually a closed pipe); nothing left to do.
            debug!(error = %e, lines = n, "stdout closed");
            return Ok(());
        }
        n += 1;
    }
    Ok(())
}
