use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Args;
use rover_relay_core::{Command, HandshakeTokens, DEFAULT_MAX_LINE_BYTES, DEFAULT_PORT, STOP_TOKEN};

/// Startup options for the relay listener.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the relay listener to.
    #[arg(long, env = "ROVER_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:4210")]
    pub listen_addr: String,

    /// Handshake line a peripheral sends to register itself.
    #[arg(long, env = "ROVER_RELAY_PERIPHERAL_HELLO", default_value = "HELLO_NODEMCU")]
    pub peripheral_hello: String,

    /// Handshake line a controller sends to identify itself.
    #[arg(
        long,
        env = "ROVER_RELAY_CONTROLLER_HELLO",
        default_value = "HELLO_CONTROLLER"
    )]
    pub controller_hello: String,

    /// Reply sent to a controller after its handshake.
    #[arg(long, env = "ROVER_RELAY_CONTROLLER_ACK", default_value = "ACK_CONTROLLER")]
    pub controller_ack: String,

    /// Command injected by the idle watchdog.
    #[arg(long, env = "ROVER_RELAY_STOP_COMMAND", default_value = STOP_TOKEN)]
    pub stop_command: String,

    /// Bounded wait for input on each connection before the watchdog runs.
    #[arg(long, env = "ROVER_RELAY_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Quiet period after which an idle controller triggers a stop (0 disables).
    #[arg(long, env = "ROVER_RELAY_IDLE_TIMEOUT_MS", default_value_t = 500)]
    pub idle_timeout_ms: u64,

    /// Maximum time a single write to the peripheral may take.
    #[arg(long, env = "ROVER_RELAY_WRITE_TIMEOUT_MS", default_value_t = 1000)]
    pub write_timeout_ms: u64,

    /// Longest accepted protocol line, in bytes.
    #[arg(long, env = "ROVER_RELAY_MAX_LINE_BYTES", default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Drop commands from connections that never completed a handshake.
    #[arg(long, env = "ROVER_RELAY_STRICT_HANDSHAKE", default_value_t = false)]
    pub strict_handshake: bool,

    /// Time allowed for connection tasks to finish after a shutdown signal.
    #[arg(long, env = "ROVER_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "ROVER_RELAY_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "ROVER_RELAY_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub tokens: HandshakeTokens,
    pub stop_command: Command,
    pub poll_interval: Duration,
    /// `None` disables the idle watchdog.
    pub idle_timeout: Option<Duration>,
    pub write_timeout: Duration,
    pub max_line_bytes: usize,
    pub strict_handshake: bool,
    pub shutdown_grace: Duration,
    pub metrics_addr: Option<SocketAddr>,
    pub otel_stdout: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tokens: HandshakeTokens::default(),
            stop_command: Command::stop(),
            poll_interval: Duration::from_millis(500),
            idle_timeout: Some(Duration::from_millis(500)),
            write_timeout: Duration::from_secs(1),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            strict_handshake: false,
            shutdown_grace: Duration::from_secs(2),
            metrics_addr: None,
            otel_stdout: false,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        self.tokens
            .validate()
            .context("invalid handshake tokens")?;
        let stop = self.stop_command.as_str();
        if stop == self.tokens.peripheral_hello || stop == self.tokens.controller_hello {
            bail!("stop command `{stop}` collides with a handshake token");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.write_timeout.is_zero() {
            bail!("write timeout must be greater than zero");
        }
        if self.max_line_bytes == 0 {
            bail!("max line length must be greater than zero");
        }
        Ok(())
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let metrics_addr = args
            .metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;
        let stop_command = Command::new(&args.stop_command)
            .with_context(|| format!("invalid stop command: {:?}", args.stop_command))?;

        let config = RelayConfig {
            listen_addr,
            tokens: HandshakeTokens {
                peripheral_hello: args.peripheral_hello,
                controller_hello: args.controller_hello,
                controller_ack: args.controller_ack,
            },
            stop_command,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            idle_timeout: (args.idle_timeout_ms > 0)
                .then(|| Duration::from_millis(args.idle_timeout_ms)),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
            max_line_bytes: args.max_line_bytes,
            strict_handshake: args.strict_handshake,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            metrics_addr,
            otel_stdout: args.otel_stdout,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> Result<RelayConfig> {
        let cli = TestCli::try_parse_from(std::iter::once("rover-relay").chain(args.iter().copied()))
            .expect("arguments parse");
        RelayConfig::try_from(cli.serve)
    }

    #[test_timeout::timeout]
    fn defaults_match_firmware_expectations() {
        let config = parse(&[]).expect("defaults are valid");
        assert_eq!(config.listen_addr.port(), 4210);
        assert_eq!(config.tokens, HandshakeTokens::default());
        assert_eq!(config.stop_command.as_str(), "S");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(500)));
        assert!(!config.strict_handshake);
        assert!(config.metrics_addr.is_none());
    }

    #[test_timeout::timeout]
    fn zero_idle_timeout_disables_watchdog() {
        let config = parse(&["--idle-timeout-ms", "0"]).expect("valid");
        assert_eq!(config.idle_timeout, None);
    }

    #[test_timeout::timeout]
    fn rejects_bad_addresses() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--metrics-addr", "9000"]).is_err());
        let config = parse(&["--metrics-addr", "127.0.0.1:9000"]).expect("valid");
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test_timeout::timeout]
    fn rejects_colliding_tokens() {
        assert!(parse(&["--controller-hello", "HELLO_NODEMCU"]).is_err());
        assert!(parse(&["--stop-command", "HELLO_CONTROLLER"]).is_err());
        assert!(parse(&["--stop-command", "  "]).is_err());
        assert!(parse(&["--poll-interval-ms", "0"]).is_err());
    }
}
