//! # pgm-core
//!
//! PGM (RFC 3208) reliable multicast transport — the reliability engine
//! only: transmit/receive windows, Reed-Solomon FEC, the rate regulator,
//! and the protocol state machine that drives SPM/NAK/NCF/ODATA/RDATA
//! across them. Socket creation, multicast group membership, and NLA
//! resolution are the host's concern; this crate consumes them through
//! narrow trait seams ([`engine::DatagramSink`], [`engine::DatagramSource`]).
//!
//! ## Crate structure
//!
//! - [`wire`] — packet header/TLV-option serialization and checksum
//! - [`tsi`] — transport session identifier and 32-bit serial-number sqns
//! - [`skb`] — packet buffer with fragment metadata
//! - [`gf256`] — GF(2^8) arithmetic tables underlying the FEC codec
//! - [`codec`] — Reed-Solomon encode/decode over GF(2^8)
//! - [`txw`] — transmit window: retention, retransmission, proactive parity
//! - [`rxw`] — receive window: gap detection, NAK/NCF/back-off, reassembly
//! - [`rate`] — token-bucket rate regulator
//! - [`peer`] — TSI-keyed peer table
//! - [`timer`] — deadline priority queue
//! - [`config`] — bind-time configuration and validation
//! - [`stats`] — per-session sender/receiver statistics
//! - [`engine`] — the protocol engine tying the above together
//! - [`error`] — the crate's error type

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gf256;
pub mod peer;
pub mod rate;
pub mod rxw;
pub mod skb;
pub mod stats;
pub mod timer;
pub mod tsi;
pub mod txw;
pub mod wire;
