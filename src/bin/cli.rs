//! Scalelink CLI - Command-line interface
//!
//! Headless front-end for diagnostics, single reads and polling sessions.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use scalelink_core::config::{self, Mode, ScaleConfig};
use scalelink_core::core::logger::init_tracing;
use scalelink_core::core::session::{all_passed, run_diagnostics, run_polling_session};
use scalelink_core::{
    CliResult, DataLogger, ExitCodes, MockScaleController, ScaleController, ScaleDriver,
    SerialConnection,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Driver selection
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    /// Synthetic scale
    Testing,
    /// Real scale on a serial port
    Scale,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Testing => Mode::Testing,
            CliMode::Scale => Mode::Scale,
        }
    }
}

/// Scalelink CLI
#[derive(Parser, Debug)]
#[command(
    name = "scalelink",
    version,
    about = "Serial driver for Sterling 7600 class digital scales",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "SCALELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured mode
    #[arg(short, long, value_enum)]
    mode: Option<CliMode>,

    /// Serial port path (auto-detected when omitted)
    #[arg(short, long)]
    port: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Run connection and command checks
    Diagnose,

    /// Send one command and print the reply
    Read {
        /// Command name (grossWeight, netWeight, count, ...)
        command: String,
    },

    /// Poll a command and report packet loss and timing
    Poll {
        /// Session length in seconds
        #[arg(short, long, default_value_t = 60)]
        duration: u64,

        /// Command to poll
        #[arg(default_value = "grossWeight")]
        command: String,
    },
}

fn build_driver(config: &Arc<ScaleConfig>, logger: &DataLogger) -> anyhow::Result<Box<dyn ScaleDriver>> {
    Ok(match config.mode {
        Mode::Testing => Box::new(MockScaleController::new(Arc::clone(config))?),
        Mode::Scale => Box::new(ScaleController::with_transport(
            Arc::clone(config),
            SerialConnection::system(config.connection_options()),
            logger.clone(),
        )?),
    })
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn list_ports(cli: &Cli, driver: &dyn ScaleDriver) -> anyhow::Result<CliResult> {
    let endpoints = driver.list_endpoints().await?;

    if cli.json {
        print_json(&endpoints)?;
    } else if endpoints.is_empty() {
        println!("No serial ports found.");
    } else {
        println!("Available Serial Ports:");
        println!("{:-<60}", "");
        for e in &endpoints {
            let ids = match (e.vendor_id, e.product_id) {
                (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
                _ => "-".to_string(),
            };
            println!(
                "  {:<24} {:<10} {}",
                e.path,
                ids,
                e.manufacturer.as_deref().unwrap_or("")
            );
        }
    }

    Ok(CliResult::success())
}

async fn diagnose(
    cli: &Cli,
    driver: &dyn ScaleDriver,
    config: &ScaleConfig,
    logger: &DataLogger,
) -> anyhow::Result<CliResult> {
    logger.start_session("diagnostics", json!({ "mode": config.mode }));
    let results = run_diagnostics(driver, config, cli.port.as_deref()).await;
    driver.disconnect().await;

    for result in &results {
        logger.log_test_result(result);
    }

    if cli.json {
        print_json(&results)?;
    } else {
        for result in &results {
            println!("{:<8} {:<24} {}", result.outcome, result.name, result.details);
        }
    }

    Ok(if all_passed(&results) {
        CliResult::success_with_message("All checks passed")
    } else {
        CliResult::validation_failed("One or more checks failed")
    })
}

async fn read(cli: &Cli, driver: &dyn ScaleDriver, command: &str) -> anyhow::Result<CliResult> {
    driver.connect(cli.port.as_deref()).await?;
    let response = driver.send_command(command).await;
    driver.disconnect().await;
    let response = response?;

    if cli.json {
        print_json(&response)?;
    } else {
        println!("{}", response.raw);
    }

    Ok(CliResult::success())
}

async fn poll(
    cli: &Cli,
    driver: &dyn ScaleDriver,
    config: &ScaleConfig,
    logger: &DataLogger,
    command: &str,
    duration: Duration,
) -> anyhow::Result<CliResult> {
    driver.connect(cli.port.as_deref()).await?;
    logger.start_session(
        "polling",
        json!({ "mode": config.mode, "command": command, "durationSecs": duration.as_secs() }),
    );

    let summary = tokio::select! {
        summary = run_polling_session(driver, command, duration, config, logger) => summary,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping");
            driver.stop_polling();
            driver.disconnect().await;
            return Ok(CliResult::error(ExitCodes::ERROR, "Interrupted"));
        }
    };

    logger.end_session(&summary);
    driver.disconnect().await;

    if cli.json {
        print_json(&summary)?;
    } else {
        println!("Readings:     {}", summary.total_readings);
        println!("Sent:         {}", summary.commands_sent);
        println!("Received:     {}", summary.responses_received);
        println!("Errors:       {}", summary.errors);
        println!("Timeouts:     {}", summary.timeouts);
        println!("Packet loss:  {:.2}%", summary.packet_loss * 100.0);
        if let Some(perf) = &summary.performance {
            println!(
                "Response ms:  avg {:.1} / min {:.1} / max {:.1}",
                perf.avg_response_time_ms, perf.min_response_time_ms, perf.max_response_time_ms
            );
        }
    }

    Ok(if summary.criteria.passed {
        CliResult::success_with_message("Session criteria met")
    } else {
        CliResult::validation_failed("Session criteria not met")
    })
}

async fn run(cli: Cli) -> anyhow::Result<CliResult> {
    let mut config = config::load(cli.config.clone()).context("Loading configuration")?;
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if cli.port.is_some() {
        config.serial.path.clone_from(&cli.port);
    }

    let _guard = init_tracing(&config.logging)?;
    let config = Arc::new(config);
    let logger = DataLogger::from_config(&config.logging);
    info!("scalelink {} in {:?} mode", scalelink_core::VERSION, config.mode);

    let driver = build_driver(&config, &logger)?;

    match &cli.command {
        Commands::ListPorts => list_ports(&cli, driver.as_ref()).await,
        Commands::Diagnose => diagnose(&cli, driver.as_ref(), &config, &logger).await,
        Commands::Read { command } => read(&cli, driver.as_ref(), command).await,
        Commands::Poll { duration, command } => {
            poll(
                &cli,
                driver.as_ref(),
                &config,
                &logger,
                command,
                Duration::from_secs(*duration),
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match run(cli).await {
        Ok(result) => result,
        Err(e) => CliResult::from(&e),
    };

    match &result {
        CliResult::Success(Some(msg)) => println!("{}", msg),
        CliResult::Error(code, msg) => eprintln!("Error ({}): {}", code, msg),
        CliResult::Success(None) => {}
    }

    result.to_exit_code()
}
