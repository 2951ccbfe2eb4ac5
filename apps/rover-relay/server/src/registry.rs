use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rover_relay_core::{write_line, Command};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, Notify},
};
use tracing::{debug, info};
use uuid::Uuid;

pub type PeripheralSink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("peripheral write timed out")]
    TimedOut,
    #[error("peripheral write failed: {0}")]
    Io(io::Error),
    #[error("peripheral link was retired")]
    Retired,
}

impl From<io::Error> for ForwardError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            ForwardError::TimedOut
        } else {
            ForwardError::Io(err)
        }
    }
}

impl ForwardError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ForwardError::TimedOut => "timeout",
            ForwardError::Io(_) => "io",
            ForwardError::Retired => "retired",
        }
    }
}

/// Result of writing one command to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Written,
    /// Same as the last command the link accepted; nothing was written.
    Duplicate,
}

/// The registered downstream connection.
///
/// Writes are serialised through `writer`, which also carries the dedup state,
/// so the compare, the write and the bookkeeping happen as one step with
/// respect to every other session sharing the link.
pub struct PeripheralLink {
    id: Uuid,
    addr: SocketAddr,
    writer: AsyncMutex<LinkWriter>,
    retire_signal: Notify,
}

struct LinkWriter {
    sink: PeripheralSink,
    last_command: Option<Command>,
    last_forward_at: Option<Instant>,
    retired: bool,
}

impl PeripheralLink {
    pub fn new(id: Uuid, addr: SocketAddr, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            id,
            addr,
            writer: AsyncMutex::new(LinkWriter {
                sink: Box::new(sink),
                last_command: None,
                last_forward_at: None,
                retired: false,
            }),
            retire_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send(
        &self,
        command: &Command,
        write_timeout: Duration,
    ) -> Result<SendOutcome, ForwardError> {
        let mut writer = self.writer.lock().await;
        if writer.retired {
            return Err(ForwardError::Retired);
        }
        if writer.last_command.as_ref() == Some(command) {
            return Ok(SendOutcome::Duplicate);
        }
        write_line(&mut writer.sink, command.as_str(), write_timeout).await?;
        writer.last_command = Some(command.clone());
        writer.last_forward_at = Some(Instant::now());
        Ok(SendOutcome::Written)
    }

    pub async fn last_command(&self) -> Option<Command> {
        self.writer.lock().await.last_command.clone()
    }

    pub async fn last_forward_at(&self) -> Option<Instant> {
        self.writer.lock().await.last_forward_at
    }

    /// Shuts the write half down and wakes the task serving this link.
    /// Later sends fail with [`ForwardError::Retired`].
    pub async fn retire(&self) {
        let mut writer = self.writer.lock().await;
        if writer.retired {
            return;
        }
        writer.retired = true;
        if let Err(err) = writer.sink.shutdown().await {
            debug!(peripheral = %self.id, error = %err, "peripheral shutdown failed");
        }
        drop(writer);
        self.retire_signal.notify_one();
    }

    /// Resolves once [`retire`](Self::retire) has been called.
    pub async fn retired(&self) {
        self.retire_signal.notified().await;
    }
}

impl std::fmt::Debug for PeripheralLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralLink")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// What happened to a command handed to [`PeripheralRegistry::forward`].
#[derive(Debug)]
pub enum Delivery {
    Forwarded { peripheral: Uuid },
    Suppressed,
    NoPeripheral,
    /// The registered peripheral is the connection that asked to forward.
    OwnConnection,
    Failed(ForwardError),
}

impl Delivery {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Delivery::Forwarded { .. } => "forwarded",
            Delivery::Suppressed => "suppressed",
            Delivery::NoPeripheral => "no_peripheral",
            Delivery::OwnConnection => "own_connection",
            Delivery::Failed(_) => "failed",
        }
    }
}

/// Holds zero or one peripheral links.
///
/// The slot lock only guards `Arc` swaps; it is never held across I/O.
#[derive(Clone, Default)]
pub struct PeripheralRegistry {
    slot: Arc<Mutex<Option<Arc<PeripheralLink>>>>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `link`, handing back whatever it replaced. The caller owns
    /// closing the previous link.
    pub fn register_peripheral(&self, link: Arc<PeripheralLink>) -> Option<Arc<PeripheralLink>> {
        self.slot.lock().replace(link)
    }

    pub fn current_peripheral(&self) -> Option<Arc<PeripheralLink>> {
        self.slot.lock().clone()
    }

    /// Clears the slot only if it still holds the link with `id`.
    pub fn clear_peripheral_if(&self, id: Uuid) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(current) if current.id() == id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_registered(&self, id: Uuid) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|current| current.id() == id)
    }

    /// Sends `command` to the registered peripheral on behalf of the
    /// connection `origin`. A transport failure unregisters and retires the
    /// link that failed; a newer registration is left alone.
    pub async fn forward(&self, command: &Command, origin: Uuid, write_timeout: Duration) -> Delivery {
        let Some(link) = self.current_peripheral() else {
            return Delivery::NoPeripheral;
        };
        if link.id() == origin {
            return Delivery::OwnConnection;
        }

        match link.send(command, write_timeout).await {
            Ok(SendOutcome::Written) => Delivery::Forwarded {
                peripheral: link.id(),
            },
            Ok(SendOutcome::Duplicate) => Delivery::Suppressed,
            Err(err) => {
                if self.clear_peripheral_if(link.id()) {
                    info!(
                        peripheral = %link.id(),
                        peer = %link.addr(),
                        error = %err,
                        "peripheral unregistered after failed forward"
                    );
                }
                link.retire().await;
                Delivery::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

    fn link(addr_port: u16) -> (Arc<PeripheralLink>, DuplexStream) {
        let (server_side, device_side) = duplex(256);
        let addr = SocketAddr::from(([127, 0, 0, 1], addr_port));
        (
            Arc::new(PeripheralLink::new(Uuid::new_v4(), addr, server_side)),
            device_side,
        )
    }

    fn cmd(token: &str) -> Command {
        Command::new(token).unwrap()
    }

    async fn read_line(reader: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read line");
        line
    }

    #[test_timeout::timeout]
    fn register_keeps_only_latest_peripheral() {
        let registry = PeripheralRegistry::new();
        let (first, _a) = link(1);
        let (second, _b) = link(2);

        assert!(registry.register_peripheral(first.clone()).is_none());
        let replaced = registry
            .register_peripheral(second.clone())
            .expect("first link handed back");
        assert_eq!(replaced.id(), first.id());
        assert_eq!(registry.current_peripheral().unwrap().id(), second.id());
    }

    #[test_timeout::timeout]
    fn stale_clear_does_not_drop_newer_registration() {
        let registry = PeripheralRegistry::new();
        let (first, _a) = link(1);
        let (second, _b) = link(2);
        registry.register_peripheral(first.clone());
        registry.register_peripheral(second.clone());

        assert!(!registry.clear_peripheral_if(first.id()));
        assert!(registry.is_registered(second.id()));
        assert!(registry.clear_peripheral_if(second.id()));
        assert!(registry.current_peripheral().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn consecutive_duplicates_are_written_once() {
        let registry = PeripheralRegistry::new();
        let (peripheral, device) = link(1);
        registry.register_peripheral(peripheral.clone());
        let origin = Uuid::new_v4();

        for _ in 0..5 {
            registry.forward(&cmd("F"), origin, WRITE_TIMEOUT).await;
        }
        assert!(matches!(
            registry.forward(&cmd("S"), origin, WRITE_TIMEOUT).await,
            Delivery::Forwarded { .. }
        ));
        assert!(matches!(
            registry.forward(&cmd("S"), origin, WRITE_TIMEOUT).await,
            Delivery::Suppressed
        ));
        assert_eq!(peripheral.last_command().await, Some(cmd("S")));
        assert!(peripheral.last_forward_at().await.is_some());

        drop(registry);
        drop(peripheral);
        let mut reader = BufReader::new(device);
        assert_eq!(read_line(&mut reader).await, "F\n");
        assert_eq!(read_line(&mut reader).await, "S\n");
        assert_eq!(read_line(&mut reader).await, "");
    }

    #[test_timeout::tokio_timeout_test]
    async fn new_registration_resets_dedup_state() {
        let registry = PeripheralRegistry::new();
        let origin = Uuid::new_v4();
        let (first, _a) = link(1);
        registry.register_peripheral(first);
        registry.forward(&cmd("F"), origin, WRITE_TIMEOUT).await;

        let (second, device) = link(2);
        registry.register_peripheral(second);
        assert!(matches!(
            registry.forward(&cmd("F"), origin, WRITE_TIMEOUT).await,
            Delivery::Forwarded { .. }
        ));

        let mut reader = BufReader::new(device);
        assert_eq!(read_line(&mut reader).await, "F\n");
    }

    #[test_timeout::tokio_timeout_test]
    async fn forward_without_peripheral_is_dropped() {
        let registry = PeripheralRegistry::new();
        assert!(matches!(
            registry.forward(&cmd("F"), Uuid::new_v4(), WRITE_TIMEOUT).await,
            Delivery::NoPeripheral
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn peripheral_never_forwards_to_itself() {
        let registry = PeripheralRegistry::new();
        let (peripheral, _device) = link(1);
        registry.register_peripheral(peripheral.clone());
        assert!(matches!(
            registry.forward(&cmd("S"), peripheral.id(), WRITE_TIMEOUT).await,
            Delivery::OwnConnection
        ));
        assert_eq!(peripheral.last_command().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_forward_clears_and_retires_link() {
        let registry = PeripheralRegistry::new();
        let (peripheral, device) = link(1);
        registry.register_peripheral(peripheral.clone());
        drop(device);

        let delivery = registry.forward(&cmd("F"), Uuid::new_v4(), WRITE_TIMEOUT).await;
        assert!(matches!(delivery, Delivery::Failed(ForwardError::Io(_))));
        assert!(registry.current_peripheral().is_none());
        assert_eq!(peripheral.last_command().await, None);

        // the retire notification is latched for the serving task
        tokio::time::timeout(Duration::from_millis(100), peripheral.retired())
            .await
            .expect("retire signalled");
        assert!(matches!(
            peripheral.send(&cmd("S"), WRITE_TIMEOUT).await,
            Err(ForwardError::Retired)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_peripheral_times_out() {
        let registry = PeripheralRegistry::new();
        let (server_side, _device) = duplex(1);
        let peripheral = Arc::new(PeripheralLink::new(
            Uuid::new_v4(),
            SocketAddr::from(([127, 0, 0, 1], 9)),
            server_side,
        ));
        registry.register_peripheral(peripheral);

        let delivery = registry
            .forward(&cmd("FORWARD"), Uuid::new_v4(), Duration::from_millis(50))
            .await;
        assert!(matches!(delivery, Delivery::Failed(ForwardError::TimedOut)));
        assert!(registry.current_peripheral().is_none());
    }
}
