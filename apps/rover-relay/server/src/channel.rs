use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use metrics::counter;
use rover_relay_core::{write_line, Command, Inbound, LineReader, Role};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    registry::Delivery,
    server::{ControllerSlot, RelayState},
    watchdog::IdleWatchdog,
};

/// Where a non-peripheral connection stands in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHandshake,
    /// First line was not a handshake and strict mode is on; further
    /// commands are dropped until a handshake arrives.
    Unclassified,
    /// First line was not a handshake; later commands are relayed anyway.
    /// The unrecognized first line itself is logged and never forwarded,
    /// unlike the original socket server, which relayed any non-handshake
    /// line.
    Lenient,
    Controller,
}

impl SessionPhase {
    fn relays_commands(self) -> bool {
        matches!(self, SessionPhase::Lenient | SessionPhase::Controller)
    }
}

/// Why [`CommandChannel::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelExit {
    Closed,
    Shutdown,
    /// The connection sent the peripheral handshake before committing to the
    /// controller role; the caller should register it.
    PeripheralHello,
}

/// Command loop for one connection that has not registered as the
/// peripheral.
pub struct CommandChannel {
    id: Uuid,
    addr: SocketAddr,
    state: Arc<RelayState>,
    phase: SessionPhase,
    last_command: Option<Command>,
    watchdog: IdleWatchdog,
    slot: Option<ControllerSlot>,
}

impl CommandChannel {
    pub fn new(id: Uuid, addr: SocketAddr, state: Arc<RelayState>) -> Self {
        let watchdog = IdleWatchdog::new(
            state.config.idle_timeout,
            state.config.stop_command.clone(),
            Instant::now(),
        );
        Self {
            id,
            addr,
            state,
            phase: SessionPhase::AwaitingHandshake,
            last_command: None,
            watchdog,
            slot: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn last_command(&self) -> Option<&Command> {
        self.last_command.as_ref()
    }

    pub async fn run<R, W>(
        &mut self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ChannelExit>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let poll_interval = self.state.config.poll_interval;
        loop {
            if *shutdown.borrow() {
                return Ok(ChannelExit::Shutdown);
            }

            let read = tokio::select! {
                _ = shutdown.changed() => return Ok(ChannelExit::Shutdown),
                read = timeout(poll_interval, reader.next_line()) => read,
            };
            let line = match read {
                Err(_elapsed) => {
                    self.on_poll_timeout().await;
                    continue;
                }
                Ok(result) => match result.context("failed to read from connection")? {
                    Some(line) => line,
                    None => return Ok(ChannelExit::Closed),
                },
            };

            if let Some(exit) = self.handle_line(&line, writer).await? {
                return Ok(exit);
            }
        }
    }

    async fn handle_line<W>(&mut self, line: &str, writer: &mut W) -> Result<Option<ChannelExit>>
    where
        W: AsyncWrite + Unpin,
    {
        let now = Instant::now();
        self.watchdog.record_activity(now);
        match self.state.config.tokens.classify(line) {
            Inbound::Empty => {}
            Inbound::Hello(Role::Peripheral) => {
                if self.phase != SessionPhase::Controller {
                    return Ok(Some(ChannelExit::PeripheralHello));
                }
                warn!("ignoring peripheral handshake on a controller connection");
            }
            Inbound::Hello(Role::Controller) => {
                write_line(
                    writer,
                    &self.state.config.tokens.controller_ack,
                    self.state.config.write_timeout,
                )
                .await
                .context("failed to acknowledge controller")?;
                if self.phase != SessionPhase::Controller {
                    info!("controller connected");
                    self.enter(SessionPhase::Controller);
                }
            }
            Inbound::Command(command) => match self.phase {
                SessionPhase::AwaitingHandshake => {
                    counter!("rover_relay_unrecognized_handshakes_total", 1);
                    if self.state.config.strict_handshake {
                        warn!(message = %command, "unrecognized handshake; connection left unclassified");
                        self.phase = SessionPhase::Unclassified;
                    } else {
                        warn!(message = %command, "unrecognized handshake; relaying as controller");
                        self.enter(SessionPhase::Lenient);
                    }
                }
                SessionPhase::Unclassified => {
                    counter!(
                        "rover_relay_commands_dropped_total",
                        1,
                        "reason" => "unclassified"
                    );
                    debug!(message = %command, "dropping message from unclassified connection");
                }
                SessionPhase::Lenient | SessionPhase::Controller => {
                    self.dispatch(command).await;
                }
            },
        }
        Ok(None)
    }

    async fn dispatch(&mut self, command: Command) {
        let delivery = self
            .state
            .registry
            .forward(&command, self.id, self.state.config.write_timeout)
            .await;
        record_delivery(&command, &delivery);
        self.last_command = Some(command);
    }

    async fn on_poll_timeout(&self) {
        self.watchdog
            .on_poll_timeout(
                &self.state.registry,
                self.id,
                self.state.config.write_timeout,
                Instant::now(),
            )
            .await;
    }

    fn enter(&mut self, phase: SessionPhase) {
        self.phase = phase;
        if self.slot.is_none() {
            self.slot = Some(self.state.controller_slot());
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if self.phase.relays_commands() {
            info!(
                peer = %self.addr,
                last_command = ?self.last_command.as_ref().map(Command::as_str),
                "controller session closed"
            );
        }
    }
}

fn record_delivery(command: &Command, delivery: &Delivery) {
    match delivery {
        Delivery::Forwarded { peripheral } => {
            counter!("rover_relay_commands_forwarded_total", 1);
            info!(
                command = %command,
                directive = command.directive().map(|d| d.label()),
                peripheral = %peripheral,
                "forwarded to peripheral"
            );
        }
        Delivery::Suppressed => {
            counter!("rover_relay_commands_suppressed_total", 1);
            debug!(command = %command, "duplicate command suppressed");
        }
        Delivery::NoPeripheral => {
            counter!(
                "rover_relay_commands_dropped_total",
                1,
                "reason" => "no_peripheral"
            );
            warn!(command = %command, "no peripheral connected, command ignored");
        }
        Delivery::OwnConnection => {
            debug!(command = %command, "command originated from the peripheral itself");
        }
        Delivery::Failed(err) => {
            counter!(
                "rover_relay_forward_failures_total",
                1,
                "reason" => err.metric_label()
            );
            warn!(command = %command, error = %err, "could not send to peripheral");
        }
    }
}
