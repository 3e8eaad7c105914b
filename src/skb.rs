//! # Packet buffer (SKB)
//!
//! A contiguous byte region with four cursors — `head ≤ data ≤ tail ≤ end`
//! — plus the metadata windows and the parser attach to it: a TSI copy, the
//! packet's sequence number, parsed-header offsets, and an optional
//! fragment descriptor. `reserve`/`put` grow the occupied region from the
//! front/back; `pull`/`push` move the `data` cursor without copying.
//!
//! Design Note §9 calls for replacing manual refcounting with ownership
//! transfer: rather than hand-roll a refcount, `Skb` wraps `bytes::Bytes`,
//! whose clone is already a cheap atomic increment over a shared
//! allocation. `clone()` is the one place an `Skb` is explicitly shared
//! (e.g. to serve a retransmit without touching the window's copy); the
//! window that owns the canonical copy never mutates it after sending.

use bytes::{Bytes, BytesMut};

use crate::error::{PgmError, Result};
use crate::tsi::{Sqn, Tsi};

/// A fragment descriptor attached to an SKB carrying a piece of a larger
/// APDU, mirroring wire's `OPT_FRAGMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Sequence number of the first TPDU of the APDU.
    pub apdu_first_sqn: Sqn,
    /// Total length of the reassembled APDU, in bytes.
    pub apdu_len: u32,
    /// This fragment's byte offset within the APDU.
    pub frag_offset: u32,
}

/// Packet buffer: a builder while being assembled, effectively frozen
/// (shared, read-only) once handed to a window — `Skb` never exposes a
/// `&mut` view into bytes it has already shared via `clone()`.
#[derive(Debug, Clone)]
pub struct Skb {
    buf: Bytes,
    head: usize,
    data: usize,
    tail: usize,
    end: usize,
    pub tsi: Tsi,
    pub sqn: Sqn,
    pub fragment: Option<FragmentInfo>,
}

/// Builder for an `Skb` under construction: owns an exclusive `BytesMut`
/// until `freeze()` converts it into the shared `Skb` the windows retain.
pub struct SkbBuilder {
    buf: BytesMut,
    head: usize,
    data: usize,
    tail: usize,
    end: usize,
    tsi: Tsi,
    sqn: Sqn,
    fragment: Option<FragmentInfo>,
}

impl SkbBuilder {
    /// Allocate a buffer of `capacity` bytes. `headroom` bytes at the front
    /// are reserved immediately (for IP/UDP + PGM header) and are not part
    /// of the writable region until `reserve` is called again or `pull`ed
    /// back into.
    pub fn allocate(capacity: usize, headroom: usize, tsi: Tsi, sqn: Sqn) -> Result<Self> {
        if headroom > capacity {
            return Err(PgmError::Config("headroom exceeds capacity".into()));
        }
        let mut buf = BytesMut::with_capacity(capacity);
        buf.resize(capacity, 0);
        Ok(SkbBuilder {
            buf,
            head: 0,
            data: headroom,
            tail: headroom,
            end: capacity,
            tsi,
            sqn,
            fragment: None,
        })
    }

    /// Advance `data` backwards by `n`, reserving head room (e.g. to
    /// prepend a header after the payload was already written). Fails with
    /// `WindowFull`-flavored `Config` if it would cross `head`.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if self.data < self.head + n {
            return Err(PgmError::Config("reserve: insufficient headroom".into()));
        }
        self.data -= n;
        Ok(())
    }

    /// Write `bytes` at `tail`, advancing `tail` by its length. Fails if it
    /// would cross `end`.
    pub fn put(&mut self, bytes: &[u8]) -> Result<()> {
        if self.tail + bytes.len() > self.end {
            return Err(PgmError::Config("put: capacity exceeded".into()));
        }
        self.buf[self.tail..self.tail + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    pub fn set_fragment(&mut self, fragment: FragmentInfo) {
        self.fragment = Some(fragment);
    }

    /// Consume the builder, producing the shared, read-only `Skb` that
    /// windows and the parser retain. No further mutation is possible.
    pub fn freeze(self) -> Skb {
        Skb {
            buf: self.buf.freeze(),
            head: self.head,
            data: self.data,
            tail: self.tail,
            end: self.end,
            tsi: self.tsi,
            sqn: self.sqn,
            fragment: self.fragment,
        }
    }
}

impl Skb {
    /// The occupied region `[data, tail)` — the wire bytes as currently
    /// delimited, exactly what goes on the wire or up to the parser.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    /// Move `data` forward by `n` without copying (consume n bytes from the
    /// front, e.g. after parsing a header). Fails with `Config` if it would
    /// cross `tail`.
    pub fn pull(&mut self, n: usize) -> Result<()> {
        if self.data + n > self.tail {
            return Err(PgmError::Config("pull: past tail".into()));
        }
        self.data += n;
        Ok(())
    }

    /// Move `data` backward by `n` without copying (re-expose bytes already
    /// consumed, e.g. to re-parse from a checkpoint). Fails if it would
    /// cross `head`.
    pub fn push(&mut self, n: usize) -> Result<()> {
        if self.data < self.head + n {
            return Err(PgmError::Config("push: past head".into()));
        }
        self.data -= n;
        Ok(())
    }

    /// A cheap, explicit clone sharing the same underlying allocation — the
    /// only form of aliasing this type permits, used when a window must
    /// hand the same bytes to both the retransmit path and the live send
    /// path.
    pub fn share(&self) -> Skb {
        self.clone()
    }

    /// A zero-copy slice of the occupied region, for handing payload bytes
    /// to the codec or the application without copying.
    pub fn as_bytes(&self) -> Bytes {
        self.buf.slice(self.data..self.tail)
    }
}
