//! # Error taxonomy
//!
//! A single `PgmError` surfaces at every public API boundary. Packet-level
//! parse failures are absorbed inside the engine (counters only); only
//! APDU-level and config-level failures reach the caller as `Err`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PgmError>;

/// The error taxonomy of the reliability engine.
#[derive(Debug, Error)]
pub enum PgmError {
    /// Invalid bind-time configuration; rejected before any effect.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transient datagram-sink failure; caller may retry.
    #[error("network down")]
    NetDown,

    /// No route to the destination; caller may retry.
    #[error("no route to destination")]
    NoRoute,

    /// Non-blocking path had nothing to do.
    #[error("operation would block")]
    WouldBlock,

    /// Packet checksum did not match.
    #[error("bad checksum")]
    ParseBadChecksum,

    /// An OPT TLV was malformed or its length ran past the packet.
    #[error("bad option")]
    ParseBadOpt,

    /// A length field was inconsistent with the packet's actual size.
    #[error("bad length")]
    ParseBadLength,

    /// An unrecognized or out-of-context packet type.
    #[error("bad packet type")]
    ParseBadType,

    /// Requested sequence number is below the transmit window's trail.
    #[error("sequence number no longer retained (GONE)")]
    WindowGone,

    /// Requested sequence number is above the transmit window's lead.
    #[error("sequence number not yet sent (NXIO)")]
    WindowNxio,

    /// Window is full and cannot accept another packet right now.
    #[error("window full")]
    WindowFull,

    /// Irrecoverable peer data loss; surfaced once per event.
    #[error("unrecoverable loss, window reset")]
    Reset,

    /// FEC decode did not have enough surviving blocks.
    #[error("insufficient blocks to recover via FEC")]
    FecInsufficient,

    /// Operation attempted after the engine was destroyed.
    #[error("operation on closed transport")]
    Closed,
}
