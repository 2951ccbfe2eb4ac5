use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use rover_relay_core::LineReader;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    channel::{ChannelExit, CommandChannel},
    config::RelayConfig,
    registry::{Delivery, PeripheralLink, PeripheralRegistry},
};

/// State shared by every connection task.
pub struct RelayState {
    pub registry: PeripheralRegistry,
    pub config: RelayConfig,
    controllers_active: AtomicUsize,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: PeripheralRegistry::new(),
            config,
            controllers_active: AtomicUsize::new(0),
        }
    }

    pub fn controllers_active(&self) -> usize {
        self.controllers_active.load(Ordering::Relaxed)
    }

    /// Counts a connection as an active controller until the slot drops.
    pub fn controller_slot(self: &Arc<Self>) -> ControllerSlot {
        let active = self.controllers_active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("rover_relay_controllers_active", active as f64);
        ControllerSlot {
            state: Arc::clone(self),
        }
    }
}

pub struct ControllerSlot {
    state: Arc<RelayState>,
}

impl Drop for ControllerSlot {
    fn drop(&mut self) {
        let active = self
            .state
            .controllers_active
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!("rover_relay_controllers_active", active as f64);
    }
}

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Binds the listening socket. Failing to bind is the one fatal error
    /// the relay has.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
        Ok(Self {
            listener,
            state: Arc::new(RelayState::new(config)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    pub fn registry(&self) -> PeripheralRegistry {
        self.state.registry.clone()
    }

    /// Accepts connections until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accepts connections until `shutdown` resolves, then stops the
    /// peripheral and drains connection tasks within the grace period.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.local_addr()?;
        info!(listen_addr = %local_addr, "rover relay listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&self.state);
                        let shutdown = shutdown_rx.clone();
                        tasks.spawn(handle_connection(stream, peer, state, shutdown));
                    }
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "connection task panicked");
                    }
                }
            }
        }

        info!("shutdown requested; stopping peripheral");
        let stop = &self.state.config.stop_command;
        match self
            .state
            .registry
            .forward(stop, Uuid::nil(), self.state.config.write_timeout)
            .await
        {
            Delivery::Forwarded { peripheral } => {
                info!(peripheral = %peripheral, "sent final stop to peripheral");
            }
            Delivery::Failed(err) => warn!(error = %err, "failed to send final stop"),
            other => debug!(outcome = other.metric_label(), "no final stop needed"),
        }

        let _ = shutdown_tx.send(true);
        let grace = self.state.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "aborting connection tasks after grace period"
            );
            tasks.abort_all();
        }
        info!("relay shutdown complete");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
    shutdown: watch::Receiver<bool>,
) {
    let connection_id = Uuid::new_v4();
    let span = info_span!("connection", peer = %peer, connection_id = %connection_id);
    async move {
        counter!("rover_relay_connections_total", 1);
        info!("new connection");
        if let Err(err) = serve_connection(stream, peer, connection_id, state, shutdown).await {
            warn!("connection ended with error: {err:#}");
        }
        info!("disconnected");
    }
    .instrument(span)
    .await
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: Uuid,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to disable Nagle");
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half, state.config.max_line_bytes);

    let exit = {
        let mut channel = CommandChannel::new(connection_id, peer, Arc::clone(&state));
        channel
            .run(&mut reader, &mut write_half, &mut shutdown)
            .await?
    };

    match exit {
        ChannelExit::PeripheralHello => {
            serve_peripheral(reader, write_half, peer, connection_id, state, shutdown).await
        }
        ChannelExit::Closed | ChannelExit::Shutdown => Ok(()),
    }
}

/// Registers the connection as the peripheral and holds it open until the
/// device disconnects, a newer peripheral replaces it, or the relay stops.
async fn serve_peripheral(
    mut reader: LineReader<OwnedReadHalf>,
    write_half: OwnedWriteHalf,
    peer: SocketAddr,
    connection_id: Uuid,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let link = Arc::new(PeripheralLink::new(connection_id, peer, write_half));
    if let Some(previous) = state.registry.register_peripheral(Arc::clone(&link)) {
        info!(
            previous = %previous.id(),
            previous_peer = %previous.addr(),
            "superseding previously registered peripheral"
        );
        previous.retire().await;
    }
    counter!("rover_relay_peripheral_registrations_total", 1);
    info!("peripheral registered");

    let result = loop {
        if *shutdown.borrow() {
            break Ok(());
        }
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            _ = link.retired() => {
                info!("peripheral link retired");
                break Ok(());
            }
            line = reader.next_line() => match line {
                Ok(Some(line)) => debug!(line = %line, "peripheral sent data"),
                Ok(None) => break Ok(()),
                Err(err) => {
                    break Err(anyhow::Error::new(err).context("failed to read from peripheral"))
                }
            },
        }
    };

    if state.registry.clear_peripheral_if(connection_id) {
        info!("peripheral unregistered");
    }
    link.retire().await;
    result
}
