/*!
 * Error types for the gepace driver.
 */
use std::convert::Infallible;
use std::io;

use thiserror::Error;

use gepace_core::error::Error as CoreError;

use crate::registry::EntityKind;

/// Error type for driver operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Channel letter or loop number not present in the address registry
    #[error("Invalid address: {kind} {id:?} is not defined for this model")]
    InvalidAddress {
        /// The entity kind that was addressed
        kind: EntityKind,
        /// The rejected identifier
        id: String,
    },

    /// Property name not defined for the entity kind
    #[error("Unknown property {property:?} for {kind}")]
    UnknownProperty {
        /// The entity kind
        kind: EntityKind,
        /// The rejected property name
        property: String,
    },

    /// Read of a write-only property
    #[error("{0} is not readable")]
    NotReadable(String),

    /// Write of a read-only property
    #[error("{0} is not writable")]
    NotWritable(String),

    /// Value cannot be encoded for the property
    #[error("Invalid value for {property}: {reason}")]
    InvalidValue {
        /// The command header of the property
        property: String,
        /// Why the value was rejected
        reason: String,
    },

    /// Underlying connection failure or timeout
    #[error("Transport error on {command:?}: {source}")]
    Transport {
        /// The command being transmitted
        command: String,
        /// The transport's own fault information
        #[source]
        source: io::Error,
    },

    /// Reply text does not match the property's value shape
    #[error("Malformed reply to {command:?}: {raw:?} ({reason})")]
    MalformedReply {
        /// The command that produced the reply
        command: String,
        /// The raw reply text
        raw: String,
        /// What did not parse
        reason: String,
    },

    /// A group is already open on this dispatcher
    #[error("A command group is already active")]
    GroupAlreadyActive,

    /// A grouped transmission did not produce one reply per query
    #[error("Group reply mismatch: expected {expected} replies, got {received} ({reason})")]
    GroupReplyMismatch {
        /// Number of reply-expecting commands
        expected: usize,
        /// Number of replies actually obtained
        received: usize,
        /// Details of the failure
        reason: String,
    },

    /// A grouped reply was read but its group never resolved
    #[error("Reply to {command:?} is unresolved")]
    Unresolved {
        /// The queued command
        command: String,
    },

    /// Invalid device model definition
    #[error("Registry error: {0}")]
    Registry(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new registry error
    pub fn registry<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Registry(msg.as_ref().to_string())
    }

    /// Create a malformed reply error
    pub fn malformed(command: &str, raw: &str, reason: impl Into<String>) -> Self {
        DeviceError::MalformedReply {
            command: command.to_string(),
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a transport error for a command
    pub fn transport(command: &str, source: io::Error) -> Self {
        DeviceError::Transport {
            command: command.to_string(),
            source,
        }
    }

    /// Whether the error is a transport timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Transport { source, .. } if source.kind() == io::ErrorKind::TimedOut)
    }
}

impl From<toml::de::Error> for DeviceError {
    fn from(err: toml::de::Error) -> Self {
        DeviceError::Registry(err.to_string())
    }
}

impl From<Infallible> for DeviceError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
