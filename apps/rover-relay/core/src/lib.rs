//! Core primitives shared by the rover relay server and its clients.
//!
//! The wire protocol is plain newline-delimited ASCII over TCP: a connection
//! opens with a handshake line naming its role, after which controllers stream
//! short command tokens that the relay forwards verbatim to the peripheral.

pub mod codec;
pub mod command;
pub mod handshake;

pub use codec::{write_line, LineReader, ReadLineError};
pub use command::{Command, Directive, PresetSlot, ProtocolError};
pub use handshake::{HandshakeTokens, Inbound, Role};

/// Port the relay and the NodeMCU firmware agree on out of the box.
pub const DEFAULT_PORT: u16 = 4210;

/// Token the peripheral firmware interprets as "halt all motion".
pub const STOP_TOKEN: &str = "S";

/// Upper bound on a single protocol line, matching the 1 KiB receive buffer
/// the firmware and original tooling use.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024;
