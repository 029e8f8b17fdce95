use std::borrow::Cow;
use std::io::ErrorKind;
use std::net::SocketAddr;

use blockio_types::{AddressError, ConfigError, VirtualBlock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error reported by a storage primitive.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// I/O error.
    #[error("{kind}: {message}")]
    StdIo { kind: ErrorKind, message: String },

    /// Read ended before the full request length.
    #[error("read of {wanted} bytes at offset {offset} runs past the end of the file")]
    ShortRead { offset: u64, wanted: usize },

    /// The storage was used after it was closed.
    #[error("storage is closed")]
    Closed,

    /// A whole-block write was handed a buffer of the wrong length.
    #[error("{len} bytes is not one block of {block_size} bytes")]
    BadBlockLength { len: usize, block_size: usize },

    /// The storage would grow past its configured quota.
    #[error("growing storage to {requested} bytes exceeds its quota of {quota} bytes")]
    QuotaExceeded { requested: u64, quota: u64 },

    /// A block header could not be decoded.
    #[error("malformed block: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Self::StdIo {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::StdIo { kind, .. } => *kind,
            StorageError::ShortRead { .. } => ErrorKind::UnexpectedEof,
            StorageError::Closed => ErrorKind::NotConnected,
            StorageError::BadBlockLength { .. } => ErrorKind::InvalidInput,
            StorageError::QuotaExceeded { .. } => ErrorKind::Other,
            StorageError::Corrupt(_) => ErrorKind::InvalidData,
        }
    }
}

/// An error in a master/worker link.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("{kind}: {message}")]
    Io { kind: ErrorKind, message: String },

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("bootstrap controller at {address}: {message}")]
    Bootstrap { address: SocketAddr, message: String },

    #[error("transport for tablespace {0} is shut down")]
    Closed(usize),

    #[error("no response from tablespace {tablespace} after {attempts} attempts")]
    Unanswered { tablespace: usize, attempts: u32 },
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A broken consistency guarantee.  Continuing after one of these risks
/// serving corrupt pages, so the operation that detects it fails.
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("block {0} was read while a write to it was in flight")]
    InCoreRead(VirtualBlock),

    #[error("node block buffer holds {0} blocks with writes in flight and nothing to evict")]
    BufferExhausted(usize),
}

/// Coarse classification of an [`Error`] that survives a trip over the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Storage,
    Transport,
    Invariant,
    Allocation,
    Address,
    Unavailable,
    Protocol,
}

/// Top-level error for block operations.
#[derive(Clone, Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("fatal: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("allocation in tablespace {tablespace} failed: {source}")]
    Allocation {
        tablespace: usize,
        source: StorageError,
    },

    #[error("block {block} does not belong to tablespace {tablespace}")]
    Misrouted {
        block: VirtualBlock,
        tablespace: usize,
    },

    #[error("database has no tablespace {0}")]
    NoSuchTablespace(usize),

    #[error("worker for tablespace {0} is unavailable")]
    WorkerUnavailable(usize),

    #[error("tablespace {tablespace} returned an unexpected result for {operation}")]
    Protocol {
        tablespace: usize,
        operation: &'static str,
    },

    #[error("tablespace {tablespace} worker failed ({kind:?}): {message}")]
    Remote {
        tablespace: usize,
        kind: FailureKind,
        message: String,
    },
}

impl Error {
    /// A short, stable identifier for the error, suitable for metrics labels
    /// and log filtering.
    pub fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Storage(_) => Cow::from("StorageError"),
            Self::Transport(_) => Cow::from("TransportError"),
            Self::Invariant(InvariantViolation::InCoreRead(_)) => Cow::from("InCoreRead"),
            Self::Invariant(InvariantViolation::BufferExhausted(_)) => {
                Cow::from("BufferExhausted")
            }
            Self::Address(_) => Cow::from("AddressError"),
            Self::Config(_) => Cow::from("ConfigError"),
            Self::Allocation { .. } => Cow::from("AllocationFailed"),
            Self::Misrouted { .. } => Cow::from("Misrouted"),
            Self::NoSuchTablespace(_) => Cow::from("NoSuchTablespace"),
            Self::WorkerUnavailable(_) => Cow::from("WorkerUnavailable"),
            Self::Protocol { .. } => Cow::from("ProtocolError"),
            Self::Remote { kind, .. } => Cow::from(format!("Remote{kind:?}")),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Storage(_) => FailureKind::Storage,
            Self::Transport(_) => FailureKind::Transport,
            Self::Invariant(_) => FailureKind::Invariant,
            Self::Address(_) | Self::Misrouted { .. } | Self::NoSuchTablespace(_) => {
                FailureKind::Address
            }
            Self::Allocation { .. } => FailureKind::Allocation,
            Self::WorkerUnavailable(_) => FailureKind::Unavailable,
            Self::Config(_) | Self::Protocol { .. } => FailureKind::Protocol,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// `true` for invariant violations, which must never be retried or
    /// papered over.
    pub fn is_fatal(&self) -> bool {
        self.failure_kind() == FailureKind::Invariant
    }
}
