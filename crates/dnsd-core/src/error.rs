//! Error types for the dnsd protocol core.

use crate::wire::Rcode;
use std::io;
use thiserror::Error;

/// Wire-format errors raised while parsing or writing a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Message ended before a complete field could be read
    #[error("message truncated at offset {0}")]
    Truncated(usize),

    /// Domain name is not well formed
    #[error("malformed domain name")]
    MalformedName,

    /// A single label exceeded 63 octets
    #[error("label too long")]
    LabelTooLong,

    /// Name exceeded 255 octets in wire form
    #[error("name too long")]
    NameTooLong,

    /// Compression pointer loops or points forward
    #[error("invalid compression pointer")]
    BadPointer,

    /// More than one question in a query
    #[error("unsupported question count: {0}")]
    QuestionCount(u16),

    /// More than one OPT record, or OPT outside the additional section
    #[error("malformed EDNS OPT record")]
    MalformedOpt,

    /// Bytes left over after the last record
    #[error("trailing data after last record")]
    TrailingData,

    /// Output buffer has no room for the requested write
    #[error("no space left in packet buffer")]
    NoSpace,

    /// Sections must be written in order
    #[error("sections written out of order")]
    SectionOrder,
}

/// Per-exchange arena errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// The arena cannot satisfy an allocation until it is reset
    #[error("arena exhausted: requested {requested}, {available} available")]
    Exhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes left in the arena
        available: usize,
    },
}

/// Zone content errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    /// Record owner is not at or below the zone apex
    #[error("record owner {owner} is outside zone {zone}")]
    OutOfZone {
        /// Record owner
        owner: String,
        /// Zone apex
        zone: String,
    },

    /// Record data does not match its type
    #[error("invalid {rtype} record data: {reason}")]
    InvalidData {
        /// Record type mnemonic
        rtype: &'static str,
        /// What was wrong
        reason: String,
    },
}

/// Outbound exchange errors
#[derive(Debug, Error)]
pub enum RequestError {
    /// Could not establish a connection to the remote
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    /// Sending the request failed
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    /// Receiving the reply failed
    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    /// Remote closed the connection before replying
    #[error("connection closed by remote")]
    Closed,

    /// No reply arrived before the deadline
    #[error("operation timed out")]
    Timeout,

    /// The reply could not be parsed
    #[error("malformed reply: {0}")]
    Malformed(#[from] WireError),

    /// Reply does not answer the request (ID or question mismatch)
    #[error("reply does not match the request")]
    Mismatch,

    /// The protocol layer ended the exchange in the failed state
    #[error("processing failed")]
    LayerFailed,

    /// Request could not be assembled
    #[error("request could not be built: {0}")]
    Build(WireError),
}

impl RequestError {
    /// Whether the error originated in the transport, so a retry on a
    /// fresh connection may succeed
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Send(_) | Self::Receive(_) | Self::Closed | Self::Mismatch
        )
    }
}

/// NOTIFY delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Every configured remote was unreachable on every address
    #[error("no remote reachable ({failed} of {total} failed)")]
    AllRemotesFailed {
        /// Remotes that failed
        failed: usize,
        /// Remotes configured
        total: usize,
    },
}

/// Reply classification for an exchange that completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Extended response code of the reply
    pub rcode: Rcode,
    /// Size of the reply in bytes
    pub size: usize,
    /// An already established connection was reused
    pub reused: bool,
}
