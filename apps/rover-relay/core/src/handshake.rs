use crate::command::{Command, ProtocolError};

pub const PERIPHERAL_HELLO: &str = "HELLO_NODEMCU";
pub const CONTROLLER_HELLO: &str = "HELLO_CONTROLLER";
pub const CONTROLLER_ACK: &str = "ACK_CONTROLLER";

/// Role a connection claims through its handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Peripheral,
    Controller,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Peripheral => "peripheral",
            Role::Controller => "controller",
        }
    }
}

/// Classification of one inbound protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Blank or whitespace-only line.
    Empty,
    Hello(Role),
    Command(Command),
}

/// Identification strings exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTokens {
    pub peripheral_hello: String,
    pub controller_hello: String,
    pub controller_ack: String,
}

impl Default for HandshakeTokens {
    fn default() -> Self {
        Self {
            peripheral_hello: PERIPHERAL_HELLO.to_owned(),
            controller_hello: CONTROLLER_HELLO.to_owned(),
            controller_ack: CONTROLLER_ACK.to_owned(),
        }
    }
}

impl HandshakeTokens {
    /// Classifies a raw line. Whitespace is trimmed first, so `"HELLO_NODEMCU\r"`
    /// still registers a peripheral.
    pub fn classify(&self, line: &str) -> Inbound {
        let message = line.trim();
        if message.is_empty() {
            Inbound::Empty
        } else if message == self.peripheral_hello {
            Inbound::Hello(Role::Peripheral)
        } else if message == self.controller_hello {
            Inbound::Hello(Role::Controller)
        } else {
            Inbound::Command(Command::from_trimmed(message))
        }
    }

    pub fn hello_for(&self, role: Role) -> &str {
        match role {
            Role::Peripheral => &self.peripheral_hello,
            Role::Controller => &self.controller_hello,
        }
    }

    /// Returns true when `line` is the acknowledgment a controller expects.
    pub fn is_ack(&self, line: &str) -> bool {
        line.trim() == self.controller_ack
    }

    /// Checks every token is usable on the wire and that no two collide.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let tokens = [
            &self.peripheral_hello,
            &self.controller_hello,
            &self.controller_ack,
        ];
        for token in tokens {
            let checked = Command::new(token)?;
            if checked.as_str() != token.as_str() {
                return Err(ProtocolError::Padded(token.clone()));
            }
        }
        if self.peripheral_hello == self.controller_hello {
            return Err(ProtocolError::DuplicateToken(self.peripheral_hello.clone()));
        }
        Ok(())
    }
}
