//! Transport error types

use crate::worker::Role;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        /// Address that failed
        addr: std::net::SocketAddr,
        /// Underlying error
        source: io::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Packet backend could not be initialized
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    /// A worker has nothing to serve
    #[error("No descriptors for {role} worker {thread_id}")]
    NoDescriptors {
        /// Worker thread id
        thread_id: usize,
        /// Role the worker was assigned
        role: Role,
    },

    /// Worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(io::Error),
}

/// Connection table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// Identifier exceeds the maximum connection id length
    #[error("Connection id too long: {len} bytes (max {max})")]
    IdTooLong {
        /// Offered length
        len: usize,
        /// Maximum length
        max: usize,
    },

    /// Identifier already present
    #[error("Connection id already present")]
    Duplicate,

    /// Table cannot hold any connection
    #[error("Connection table full")]
    Full,

    /// Bucket already chains the maximum number of identifiers
    #[error("Connection table bucket full")]
    ChainFull,

    /// No connection under the given identifier
    #[error("Connection id not found")]
    NotFound,

    /// Table created without buckets
    #[error("Connection table needs at least one bucket")]
    ZeroBuckets,
}

/// QUIC packet decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuicError {
    /// Datagram ended inside the header
    #[error("Truncated QUIC header")]
    Truncated,

    /// Connection id length above the protocol limit
    #[error("Connection id too long: {0}")]
    CidTooLong(usize),

    /// Short header packet where a long header is required
    #[error("Not a long header packet")]
    NotLongHeader,

    /// Long header packet that does not start a connection
    #[error("Not an Initial packet")]
    NotInitial,

    /// Version the server does not speak
    #[error("Unsupported version {0:#010x}")]
    UnsupportedVersion(u32),

    /// Initial packet with a destination connection id below 8 bytes
    #[error("Initial destination connection id too short: {0}")]
    ShortDcid(usize),

    /// Initial datagram below the 1200 byte minimum
    #[error("Initial datagram too short: {0} bytes")]
    ShortDatagram(usize),

    /// Output buffer too small
    #[error("Output buffer too small")]
    NoSpace,
}
