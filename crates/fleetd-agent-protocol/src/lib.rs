//! Value types and error taxonomy shared by the agent-plane crates:
//! session table, command router, forwarder, dispatch, and command
//! server.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 128-bit unguessable session token, minted at registration and
/// rotated on every subsequent `register` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl SessionToken {
    /// Generates a fresh token from 128 bits of randomness, hex-encoded.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity header every command envelope and response carries:
/// `{client_id, session_token, client_name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub client_id: String,
    pub session_token: String,
    pub client_name: String,
}

/// Opaque correlation id for one outstanding command, unique among the
/// currently-pending set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command type/subtype pair identifying which processor/responser pair
/// handles an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandKind {
    pub r#type: String,
    pub subtype: String,
}

impl CommandKind {
    #[must_use]
    pub fn new(r#type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self { r#type: r#type.into(), subtype: subtype.into() }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.subtype)
    }
}

/// Agent-plane identity/lifetime faults: the command fails fast with no
/// retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("client is not connected")]
    NotConnected,

    #[error("unknown client")]
    UnknownClient,

    #[error("session token does not match")]
    BadSession,

    #[error("registration token not recognized")]
    BadToken,
}

/// Command dispatch outcomes, returned by the router after a send is
/// attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("failed to write command to stream")]
    SendFailed,

    #[error("no response within the command deadline")]
    Timeout,

    #[error("agent stream closed while the command was outstanding")]
    Cancelled,

    #[error("no controller owns this client")]
    NotRegistered,

    #[error("failed to dial the owning controller")]
    ForwardDialFailed,

    #[error("forwarded call failed")]
    ForwardFailed,

    #[error("the owning controller rejected the forwarded command")]
    ForwardRejected,
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tokens_are_unique_and_hex() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 32);
        assert!(a.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn command_ids_are_unique() {
        assert_ne!(CommandId::generate(), CommandId::generate());
    }

    #[test]
    fn command_kind_displays_as_slash_pair() {
        assert_eq!(CommandKind::new("deploy", "proxy").to_string(), "deploy/proxy");
    }
}
