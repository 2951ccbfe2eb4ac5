use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rover_relay_client::{ClientOptions, PeripheralEmulator, ReconnectingController};
use rover_relay_core::Command;
use rover_relay_server::{RelayConfig, RelayServer, ServeArgs, Telemetry, TelemetryOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "rover-relay",
    author,
    version,
    about = "Relay controller commands to a NodeMCU rover over TCP",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the relay server (the default when no subcommand is given)
    Serve(ServeArgs),

    /// Read command tokens from stdin, one per line, and relay them
    Controller {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Register as the peripheral and log every command received
    Peripheral {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Debug, clap::Args)]
struct ClientArgs {
    /// Relay address to connect to.
    #[arg(long, short, default_value = "127.0.0.1:4210")]
    relay: String,

    /// Seconds to wait before reconnecting after the relay goes away.
    #[arg(long, default_value_t = 3)]
    reconnect_secs: u64,
}

impl ClientArgs {
    fn resolve(&self) -> Result<(SocketAddr, ClientOptions)> {
        let addr = self
            .relay
            .parse()
            .with_context(|| format!("invalid relay address: {}", self.relay))?;
        let options = ClientOptions {
            reconnect_delay: Duration::from_secs(self.reconnect_secs),
            ..ClientOptions::default()
        };
        Ok((addr, options))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None => serve(cli.serve).await,
        Some(Commands::Serve(args)) => serve(args).await,
        Some(Commands::Controller { client }) => {
            let _telemetry = Telemetry::init(&TelemetryOptions::default())?;
            run_controller(client).await
        }
        Some(Commands::Peripheral { client }) => {
            let _telemetry = Telemetry::init(&TelemetryOptions::default())?;
            run_peripheral(client).await
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = RelayConfig::try_from(args)?;
    let _telemetry = Telemetry::init(&TelemetryOptions {
        otel_stdout: config.otel_stdout,
        metrics_addr: config.metrics_addr,
    })?;
    info!(
        listen_addr = %config.listen_addr,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        strict_handshake = config.strict_handshake,
        "starting rover relay"
    );

    let server = RelayServer::bind(config).await?;
    server.run().await
}

async fn run_controller(args: ClientArgs) -> Result<()> {
    let (addr, options) = args.resolve()?;
    let mut controller = ReconnectingController::new(addr, options);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match Command::new(&line) {
            Ok(command) => command,
            Err(_) => continue,
        };
        if controller.send(&command).await? {
            info!(
                command = %command,
                directive = command.directive().map(|d| d.label()),
                "sent"
            );
        }
    }
    info!("stdin closed; exiting");
    Ok(())
}

async fn run_peripheral(args: ClientArgs) -> Result<()> {
    let (addr, options) = args.resolve()?;
    loop {
        match PeripheralEmulator::connect(addr, &options).await {
            Ok(mut emulator) => loop {
                match emulator.next_command().await {
                    Ok(Some(command)) => info!(
                        command = %command,
                        directive = command.directive().map(|d| d.label()),
                        "received"
                    ),
                    Ok(None) => {
                        warn!("relay closed the peripheral link");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "peripheral link failed");
                        break;
                    }
                }
            },
            Err(err) => warn!(error = %err, "failed to reach relay"),
        }
        tokio::time::sleep(options.reconnect_delay).await;
    }
}
