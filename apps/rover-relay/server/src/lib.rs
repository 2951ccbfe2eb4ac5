//! Relay server that forwards controller commands to a single registered
//! NodeMCU peripheral over newline-delimited TCP.
//!
//! Every accepted connection gets its own task. The first handshake line
//! decides whether it becomes the peripheral (stored in the
//! [`PeripheralRegistry`]) or a controller served by a [`CommandChannel`].
//! Any connection left quiet past the idle window tries to stop the
//! peripheral through its [`IdleWatchdog`].

pub mod channel;
pub mod config;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod watchdog;

pub use channel::{ChannelExit, CommandChannel, SessionPhase};
pub use config::{RelayConfig, ServeArgs};
pub use registry::{Delivery, ForwardError, PeripheralLink, PeripheralRegistry, SendOutcome};
pub use server::{RelayServer, RelayState};
pub use telemetry::{Telemetry, TelemetryOptions};
pub use watchdog::IdleWatchdog;
