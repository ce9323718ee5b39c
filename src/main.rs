use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use log::{debug, warn};

use speedmeter::client::HttpTransferClient;
use speedmeter::discovery::{DiscoveryConfig, HttpServerProvider};
use speedmeter::engine::{Engine, EngineConfig};
use speedmeter::errors::{exit_codes, SpeedTestError};
use speedmeter::progress::{ProgressCallback, ProgressEvent, StatusCallback};
use speedmeter::results::TestResult;
use speedmeter::retry::RetryConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server list endpoint returning a JSON array of candidate servers
    #[arg(long, value_name = "URL")]
    servers_url: String,

    /// Fallback server list endpoint
    #[arg(long, value_name = "URL")]
    servers_fallback_url: Option<String>,

    /// Client info endpoint returning a JSON object
    #[arg(long, value_name = "URL")]
    client_url: String,

    /// Network timeout in seconds for discovery and transfer requests
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Number of consecutive test runs
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// Retry a failed run once with backoff
    #[arg(long)]
    retry: bool,

    /// Emit results as JSON instead of human-readable text
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,
}

/// Prints engine status lines to stderr so JSON output stays clean.
struct StatusPrinter {
    quiet: bool,
}

impl StatusCallback for StatusPrinter {
    fn on_status(&self, message: &str) {
        if !self.quiet {
            eprintln!("{}", message.dimmed());
        }
    }
}

/// Forwards progress events to the debug log.
struct DebugProgress;

impl ProgressCallback for DebugProgress {
    fn on_progress(&self, event: ProgressEvent) {
        debug!("{:?}", event);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    let timeout = Duration::from_secs(cli.timeout);

    let provider = match HttpServerProvider::new(
        DiscoveryConfig {
            servers_url: cli.servers_url.clone(),
            servers_fallback_url: cli.servers_fallback_url.clone(),
            client_info_url: cli.client_url.clone(),
        },
        timeout,
    ) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("{} {}", "Error:".bold().red(), err);
            process::exit(err.exit_code());
        }
    };

    let client = match HttpTransferClient::new(timeout) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("{} {}", "Error:".bold().red(), err);
            process::exit(err.exit_code());
        }
    };

    let mut engine = Engine::new(provider, client, EngineConfig::default());

    // Ctrl-C aborts the run in flight instead of killing the process
    // with transfers mid-air.
    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling test");
            cancel.cancel();
        }
    });

    let retry_config = if cli.retry {
        RetryConfig::default()
    } else {
        RetryConfig::disabled()
    };

    let status = StatusPrinter { quiet: cli.json };
    let progress = DebugProgress;

    for run in 0..cli.runs {
        if cli.runs > 1 && !cli.json {
            eprintln!("{}", format!("--- run {}/{} ---", run + 1, cli.runs).dimmed());
        }

        let mut attempt = 0u32;
        let result = loop {
            match engine.run(&status, &progress).await {
                Ok(result) => break Ok(result),
                Err(err)
                    if attempt < retry_config.max_retries
                        && !matches!(&err.source, SpeedTestError::Cancelled) =>
                {
                    let delay = retry_config.delay_for_attempt(attempt);
                    warn!("{}; retrying in {:?}", err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(result) => print_result(&result, cli.json),
            Err(err) => {
                eprintln!("{} {}", "Error:".bold().red(), err);
                process::exit(err.exit_code());
            }
        }
    }

    if cli.runs > 1 && !cli.json {
        let history = engine.history();
        if let (Some(download), Some(upload)) = (
            history.average_download_mbps(),
            history.average_upload_mbps(),
        ) {
            println!();
            println!(
                "{} {}",
                "Average download:".bold().white(),
                format!("{:.2} Mbps", download).bright_cyan()
            );
            println!(
                "{} {}",
                "Average upload:".bold().white(),
                format!("{:.2} Mbps", upload).bright_cyan()
            );
        }
    }

    process::exit(exit_codes::SUCCESS);
}

fn print_result(result: &TestResult, json: bool) {
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(output) => println!("{}", output),
            Err(err) => {
                eprintln!("{} {}", "Error:".bold().red(), err);
                process::exit(exit_codes::UNKNOWN_ERROR);
            }
        }
        return;
    }

    println!(
        "{} {} {}",
        "Server:".bold().white(),
        result.server.name.bright_blue(),
        format!("({})", result.server.sponsor).bright_blue()
    );
    if let Some(client) = &result.client {
        println!(
            "{} {} {}",
            "Your IP:".bold().white(),
            client.ip.bright_blue(),
            format!("({})", client.isp).bright_blue()
        );
    }
    println!("{} {:.2} ms", "Latency:".bold().white(), result.ping_ms);
    println!(
        "{} {}",
        "Download speed:".bold().white(),
        format!("{:.2} Mbps", result.download_mbps).bright_cyan()
    );
    println!(
        "{} {}",
        "Upload speed:".bold().white(),
        format!("{:.2} Mbps", result.upload_mbps).bright_cyan()
    );
}
