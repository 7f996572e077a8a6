//! transmission-cli: feed stdin lines through a transmission pipeline.
//!
//! ## Subcommands
//!
//! - `transmission-cli` or `transmission-cli run` - one event per stdin line
//! - `transmission-cli config` - print the effective configuration
//!
//! Configuration comes from `TRANSMISSION_*` environment variables, or from a
//! TOML file named by `TRANSMISSION_CONFIG`. Batches are written to the log
//! instead of a remote endpoint.

use std::process::ExitCode;

use event_transmission::telemetry::{init_logging, LogConfig};
use event_transmission::{
    Batch, BatchSink, EventData, ShutdownResult, TelemetryEvent, TransmissionConfig,
    TransmissionError, TransmissionPipeline,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Sink that logs each batch.
struct LogSink;

#[async_trait::async_trait]
impl BatchSink<EventData> for LogSink {
    async fn send_batch(&self, batch: &Batch<EventData>) -> Result<(), TransmissionError> {
        let bytes: usize = batch.iter().map(|item| item.body.len()).sum();
        tracing::info!(items = batch.len(), bytes, "batch transmitted");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match command {
        "run" | "" => {
            if let Err(e) = init_logging(&LogConfig::from_env()) {
                eprintln!("Logging setup failed: {}", e);
                return ExitCode::FAILURE;
            }
            let config = match load_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            match run(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Pipeline error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "config" => match load_config() {
            Ok(config) => {
                println!("{:#?}", config);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                ExitCode::FAILURE
            }
        },
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("transmission-cli {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<TransmissionConfig, TransmissionError> {
    match std::env::var("TRANSMISSION_CONFIG") {
        Ok(path) => {
            let source = std::fs::read_to_string(&path)?;
            Ok(TransmissionConfig::from_toml_str(&source)?)
        }
        Err(_) => {
            let config = TransmissionConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(config: TransmissionConfig) -> Result<(), TransmissionError> {
    let pipeline = TransmissionPipeline::<EventData>::with_file_spool(config, LogSink)?;
    let session = format!("cli-{}", std::process::id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let event = TelemetryEvent::new("transmission-cli", "Line", session.as_str())
                        .with_message(line);
                    pipeline.enqueue(event)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    let metrics = pipeline.metrics();
    match pipeline.shutdown().await {
        ShutdownResult::Complete => {}
        ShutdownResult::Timeout { remaining } => {
            eprintln!("{} stage(s) still running at exit", remaining);
        }
    }
    eprintln!(
        "enqueued={} dropped={} batches={}",
        metrics.counter("events_enqueued"),
        metrics.counter("events_dropped"),
        pipeline.metrics().counter("batches_dispatched"),
    );
    Ok(())
}

fn print_usage() {
    println!("transmission-cli {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("    transmission-cli [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    run        Read events from stdin, one per line (default)");
    println!("    config     Print the effective configuration");
    println!("    help       Show this message");
    println!("    version    Print version");
}
