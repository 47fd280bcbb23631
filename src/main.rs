//! netkit - protocol exercise runner
//!
//! Selects one of the bundled exercise servers and runs it until Ctrl+C.

use clap::{Parser, ValueEnum};
use netkit::protocol::{JsonCodec, LineEncoder, LineParser, Message, RawCodec, TextCodec};
use netkit::{Context, Server, ServerError};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{info, Dispatch};
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "netkit")]
#[command(version)]
#[command(about = "Runs one of the bundled protocol exercise servers", long_about = None)]
struct Cli {
    /// Exercise to run
    #[arg(value_enum)]
    script: Script,

    /// Address to bind to (e.g., 0.0.0.0:6969 or :6969)
    #[arg(short, long)]
    addr: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Script {
    /// Echo every byte back unchanged
    SmokeTest,
    /// Echo every line back
    LineEcho,
    /// Answer JSON primality queries, one per line
    PrimeTime,
}

#[derive(Debug, Deserialize)]
struct PrimeRequest {
    method: String,
    number: serde_json::Number,
}

impl Message for PrimeRequest {}

#[derive(Debug, Serialize)]
struct PrimeResponse {
    method: &'static str,
    prime: bool,
}

fn is_prime(number: &serde_json::Number) -> bool {
    let n = match (number.as_u64(), number.as_f64()) {
        (Some(n), _) => n,
        (None, Some(f)) if f.fract() == 0.0 && f >= 0.0 && f < u64::MAX as f64 => f as u64,
        _ => return false,
    };

    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }

    let mut i = 5u64;
    while i.saturating_mul(i) <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

fn prime_time(_ctx: Context, req: PrimeRequest) -> PrimeResponse {
    if req.method != "isPrime" {
        info!(method = %req.method, "Unsupported method");
    }
    PrimeResponse {
        method: "isPrime",
        prime: req.method == "isPrime" && is_prime(&req.number),
    }
}

async fn run(
    script: Script,
    addr: Option<String>,
    logger: Dispatch,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr = addr.unwrap_or_default();

    match script {
        Script::SmokeTest => {
            let server = Server::new(LineParser::of::<String>(), LineEncoder::new(RawCodec), RawCodec)
                .with_addr(addr)
                .with_logger(logger)
                .with_raw_handler(|conn| {
                    Box::pin(async move {
                        while let Ok(Some(chunk)) = conn.read_chunk().await {
                            if conn.write_all(&chunk).await.is_err() {
                                break;
                            }
                        }
                    })
                });
            serve_until(server.shutdown_token(), shutdown, server.listen_and_serve()).await
        }
        Script::LineEcho => {
            let server = Server::new(LineParser::of::<String>(), LineEncoder::new(TextCodec), TextCodec)
                .with_addr(addr)
                .with_logger(logger)
                .handle_fn(|_ctx, line: String| line);
            serve_until(server.shutdown_token(), shutdown, server.listen_and_serve()).await
        }
        Script::PrimeTime => {
            let server = Server::new(LineParser::of::<PrimeRequest>(), LineEncoder::new(JsonCodec), JsonCodec)
                .with_addr(addr)
                .with_logger(logger)
                .handle_fn(prime_time);
            serve_until(server.shutdown_token(), shutdown, server.listen_and_serve()).await
        }
    }
}

/// Forwards the process-level shutdown signal to one server.
async fn serve_until(
    server_token: CancellationToken,
    shutdown: CancellationToken,
    serving: impl std::future::Future<Output = Result<(), ServerError>>,
) -> Result<(), ServerError> {
    tokio::spawn(async move {
        shutdown.cancelled().await;
        server_token.cancel();
    });
    serving.await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    let logger = Dispatch::new(subscriber);

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    let signal_logger = logger.clone();
    tokio::spawn(
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, stopping server...");
                ctrl_c.cancel();
            }
        }
        .with_subscriber(signal_logger),
    );

    let main_logger = logger.clone();
    async move {
        info!(script = ?cli.script, version = netkit::VERSION, "Running script");
        run(cli.script, cli.addr, logger, shutdown).await?;
        info!("Server shutdown complete");
        Ok(())
    }
    .with_subscriber(main_logger)
    .await
}
