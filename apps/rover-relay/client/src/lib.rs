//! Client side of the rover relay protocol.
//!
//! [`ControllerClient`] speaks for a driver: it performs the controller
//! handshake and only sends a command when it differs from the previous one.
//! [`ReconnectingController`] wraps it with the fixed-delay reconnect loop the
//! mobile controller uses. [`PeripheralEmulator`] stands in for the NodeMCU
//! when testing without hardware.

use std::{io, net::SocketAddr, time::Duration};

use rover_relay_core::{write_line, Command, HandshakeTokens, LineReader, ReadLineError, Role};
use thiserror::Error;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Read(#[from] ReadLineError),
    #[error("relay closed the connection")]
    Closed,
    #[error("gave up after {0} connection attempts")]
    RetriesExhausted(usize),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub tokens: HandshakeTokens,
    pub connect_timeout: Duration,
    /// How long a controller waits for the relay's acknowledgment.
    pub ack_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
    pub max_line_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tokens: HandshakeTokens::default(),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(3),
            max_attempts: None,
            max_line_bytes: rover_relay_core::DEFAULT_MAX_LINE_BYTES,
        }
    }
}

async fn open(
    addr: SocketAddr,
    role: Role,
    options: &ClientOptions,
) -> Result<(LineReader<OwnedReadHalf>, OwnedWriteHalf), ClientError> {
    let stream = timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::ConnectTimeout(addr))?
        .map_err(|source| ClientError::Connect { addr, source })?;
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    write_line(
        &mut write_half,
        options.tokens.hello_for(role),
        options.write_timeout,
    )
    .await?;
    Ok((LineReader::new(read_half, options.max_line_bytes), write_half))
}

/// One controller connection to the relay.
pub struct ControllerClient {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    _reader: LineReader<OwnedReadHalf>,
    acknowledged: bool,
    last_sent: Option<Command>,
    write_timeout: Duration,
}

impl ControllerClient {
    /// Connects and performs the controller handshake. A missing or
    /// unexpected acknowledgment is logged but not fatal.
    pub async fn connect(addr: SocketAddr, options: &ClientOptions) -> Result<Self, ClientError> {
        let (mut reader, writer) = open(addr, Role::Controller, options).await?;
        info!(relay = %addr, "connected to relay");

        let acknowledged = match timeout(options.ack_timeout, reader.next_line()).await {
            Ok(Ok(Some(reply))) if options.tokens.is_ack(&reply) => {
                info!("relay acknowledged controller");
                true
            }
            Ok(Ok(Some(reply))) => {
                warn!(response = %reply, "unexpected handshake response");
                false
            }
            Ok(Ok(None)) => return Err(ClientError::Closed),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                warn!(
                    timeout_ms = options.ack_timeout.as_millis() as u64,
                    "no acknowledgment from relay"
                );
                false
            }
        };

        Ok(Self {
            addr,
            writer,
            _reader: reader,
            acknowledged,
            last_sent: None,
            write_timeout: options.write_timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn last_sent(&self) -> Option<&Command> {
        self.last_sent.as_ref()
    }

    /// Sends `command` unless it equals the last one sent on this
    /// connection. Returns whether anything was written.
    pub async fn send(&mut self, command: &Command) -> Result<bool, ClientError> {
        if self.last_sent.as_ref() == Some(command) {
            return Ok(false);
        }
        write_line(&mut self.writer, command.as_str(), self.write_timeout).await?;
        debug!(command = %command, "sent");
        self.last_sent = Some(command.clone());
        Ok(true)
    }
}

/// Controller that reconnects after a fixed delay whenever the relay goes
/// away, resending the pending command on the new connection.
pub struct ReconnectingController {
    addr: SocketAddr,
    options: ClientOptions,
    client: Option<ControllerClient>,
}

impl ReconnectingController {
    pub fn new(addr: SocketAddr, options: ClientOptions) -> Self {
        Self {
            addr,
            options,
            client: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub async fn send(&mut self, command: &Command) -> Result<bool, ClientError> {
        let mut attempts = 0usize;
        loop {
            if self.client.is_none() {
                attempts += 1;
                match ControllerClient::connect(self.addr, &self.options).await {
                    Ok(client) => self.client = Some(client),
                    Err(err) => {
                        self.backoff(attempts, &err).await?;
                        continue;
                    }
                }
            }
            let Some(client) = self.client.as_mut() else {
                continue;
            };

            match client.send(command).await {
                Ok(sent) => return Ok(sent),
                Err(err) => {
                    warn!(error = %err, "connection lost");
                    self.client = None;
                    attempts += 1;
                    self.backoff(attempts, &err).await?;
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.client = None;
    }

    async fn backoff(&self, attempts: usize, err: &ClientError) -> Result<(), ClientError> {
        if let Some(max) = self.options.max_attempts {
            if attempts >= max {
                return Err(ClientError::RetriesExhausted(attempts));
            }
        }
        warn!(
            error = %err,
            retry_in_ms = self.options.reconnect_delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::time::sleep(self.options.reconnect_delay).await;
        Ok(())
    }
}

/// Registers as the peripheral and yields every command the relay forwards.
pub struct PeripheralEmulator {
    reader: LineReader<OwnedReadHalf>,
    // dropping the write half would half-close the socket
    _writer: OwnedWriteHalf,
}

impl PeripheralEmulator {
    pub async fn connect(addr: SocketAddr, options: &ClientOptions) -> Result<Self, ClientError> {
        let (reader, writer) = open(addr, Role::Peripheral, options).await?;
        info!(relay = %addr, "registered as peripheral");
        Ok(Self {
            reader,
            _writer: writer,
        })
    }

    /// Next forwarded command, or `None` once the relay closes the link.
    pub async fn next_command(&mut self) -> Result<Option<Command>, ClientError> {
        while let Some(line) = self.reader.next_line().await? {
            if let Ok(command) = Command::new(&line) {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    fn fast_options() -> ClientOptions {
        ClientOptions {
            ack_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(20),
            max_attempts: Some(3),
            ..ClientOptions::default()
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn controller_handshake_and_client_side_dedup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("HELLO_CONTROLLER"));
            write_half.write_all(b"ACK_CONTROLLER\n").await.unwrap();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
            }
            received
        });

        let mut client = ControllerClient::connect(addr, &fast_options()).await.unwrap();
        assert!(client.acknowledged());
        let forward = Command::new("F").unwrap();
        let stop = Command::stop();
        assert!(client.send(&forward).await.unwrap());
        assert!(!client.send(&forward).await.unwrap());
        assert!(client.send(&stop).await.unwrap());
        assert_eq!(client.last_sent(), Some(&stop));
        drop(client);

        assert_eq!(relay.await.unwrap(), vec!["F".to_string(), "S".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unexpected_ack_is_tolerated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"WHO_ARE_YOU\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let client = ControllerClient::connect(addr, &fast_options()).await.unwrap();
        assert!(!client.acknowledged());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnecting_controller_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut controller = ReconnectingController::new(addr, fast_options());
        let err = controller
            .send(&Command::new("F").unwrap())
            .await
            .expect_err("nothing is listening");
        assert!(matches!(err, ClientError::RetriesExhausted(3)));
        assert!(!controller.is_connected());
    }

    #[test_timeout::tokio_timeout_test]
    async fn emulator_registers_and_reads_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("HELLO_NODEMCU"));
            write_half.write_all(b"F\n\nH\n").await.unwrap();
        });

        let mut emulator = PeripheralEmulator::connect(addr, &fast_options()).await.unwrap();
        assert_eq!(emulator.next_command().await.unwrap(), Some(Command::new("F").unwrap()));
        assert_eq!(emulator.next_command().await.unwrap(), Some(Command::new("H").unwrap()));
        assert_eq!(emulator.next_command().await.unwrap(), None);
    }
}
