//! # Transmit window (C4)
//!
//! An ordered ring of sent packets, indexed by `sqn mod capacity`, with two
//! monotone cursors `trail ≤ lead`. Packets below `trail` are no longer
//! retained; `add` evicts the oldest packet when the window is full. For
//! FEC, the window is partitioned into transmission groups of `k`
//! consecutive sqns aligned on multiples of `k`; each group may carry up to
//! `h = n − k` parity packets, generated proactively at group close or
//! lazily on first repair request.

use std::collections::HashMap;

use bytes::Bytes;

use crate::codec::RsCodec;
use crate::error::{PgmError, Result};
use crate::skb::{FragmentInfo, Skb, SkbBuilder};
use crate::tsi::{Sqn, Tsi};

/// FEC parameters bound to a transmit window.
pub struct FecParams {
    pub codec: RsCodec,
    pub proactive: bool,
}

struct ParityGroup {
    /// One slot per parity index `0..h`; `None` until generated.
    parity: Vec<Option<Bytes>>,
}

/// Transmit window. Holds retained `Skb`s plus, if FEC is configured, the
/// lazily- or proactively-generated parity for each transmission group.
pub struct Txw {
    capacity: usize,
    ring: Vec<Option<Skb>>,
    trail: Sqn,
    lead: Sqn,
    has_sent: bool,
    fec: Option<FecParams>,
    parity_groups: HashMap<u32, ParityGroup>,
    last_apdu_first_sqn: Option<Sqn>,
    /// Sqn of the first packet ever assigned, the anchor `group_sqn_of`
    /// measures every later group boundary from.
    first_sqn: Option<Sqn>,
    /// Count of real data pushes into the currently-open group; reaching
    /// `k` closes the group. Counting pushes rather than taking `sqn mod k`
    /// keeps group boundaries correct across a random starting sqn and
    /// across the `h`-sqn gaps proactive mode reserves after each group.
    group_fill: usize,
}

impl Txw {
    pub fn new(capacity: usize, fec: Option<FecParams>) -> Self {
        Self::with_start(capacity, fec, Sqn::ZERO)
    }

    /// Like `new`, but the first sqn assigned is `start` rather than zero —
    /// RFC 3208 sources pick a random initial sqn at bind time rather than
    /// always starting from zero, so the engine seeds this from its `Rng`.
    pub fn with_start(capacity: usize, fec: Option<FecParams>, start: Sqn) -> Self {
        Txw {
            capacity,
            ring: vec![None; capacity],
            trail: start,
            lead: start,
            has_sent: false,
            fec,
            parity_groups: HashMap::new(),
            last_apdu_first_sqn: None,
            first_sqn: None,
            group_fill: 0,
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    /// The sqn the next `add` will assign, without mutating anything —
    /// callers that need to stamp `OPT_FRAGMENT.apdu_first_sqn` ahead of
    /// time (the engine, when it starts fragmenting a new APDU) read this
    /// first.
    pub fn next_sqn(&self) -> Sqn {
        if self.has_sent {
            self.lead.wrapping_add(1)
        } else {
            self.trail
        }
    }

    fn k(&self) -> Option<usize> {
        self.fec.as_ref().map(|f| f.codec.k())
    }

    /// Assign the next sqn to `payload`, store it, and — if this push
    /// closes a proactive-parity transmission group — generate that
    /// group's parity immediately. `fragment`, if present, must carry a
    /// strictly increasing `apdu_first_sqn` across distinct APDUs (spec's
    /// fragmentation monotonicity invariant); only checked at an APDU's
    /// first fragment (`frag_offset == 0`).
    ///
    /// Returns the assigned sqn and, if this push closed a group, that
    /// group's `group_sqn` — the caller uses the latter to know when to
    /// also emit the parity `add` just generated, without re-deriving the
    /// same group boundary from `sqn` a second time.
    pub fn add(&mut self, tsi: Tsi, payload: Bytes, fragment: Option<FragmentInfo>) -> Result<(Sqn, Option<Sqn>)> {
        if let Some(f) = fragment {
            if f.frag_offset == 0 {
                if let Some(prev) = self.last_apdu_first_sqn {
                    if f.apdu_first_sqn <= prev {
                        return Err(PgmError::Config(
                            "APDU first-sqn must strictly increase across APDUs".into(),
                        ));
                    }
                }
                self.last_apdu_first_sqn = Some(f.apdu_first_sqn);
            }
        }

        let sqn = if self.has_sent {
            self.lead.wrapping_add(1)
        } else {
            self.trail
        };

        let mut builder = SkbBuilder::allocate(payload.len(), 0, tsi, sqn)?;
        builder.put(&payload)?;
        if let Some(f) = fragment {
            builder.set_fragment(f);
        }
        let skb = builder.freeze();

        // Evict before writing: the new slot may alias the slot about to be
        // freed (ring index wraps at `capacity`), so trail must advance
        // first or the write below would be clobbered.
        if self.has_sent {
            let prospective_len = (sqn.distance(self.trail) + 1) as usize;
            if prospective_len > self.capacity {
                self.evict_trail();
            }
        }

        self.ring[sqn.index(self.capacity)] = Some(skb);
        self.lead = sqn;
        if !self.has_sent {
            self.trail = sqn;
            self.has_sent = true;
            self.first_sqn = Some(sqn);
        }

        let mut closed_group = None;
        if let Some(k) = self.k() {
            self.group_fill += 1;
            if self.group_fill == k {
                let group_sqn = Sqn(sqn.0 - (k as u32 - 1));
                self.group_fill = 0;
                if self.fec.as_ref().unwrap().proactive {
                    let h = self.fec.as_ref().unwrap().codec.h();
                    for j in 0..h {
                        let _ = self.generate_parity(group_sqn, j);
                    }
                    if h > 0 {
                        // Reserve h wire sqns right after the group's data so a
                        // later `add` doesn't reuse what the engine is about to
                        // transmit as parity ODATA/RDATA. The reservation isn't
                        // retained in `ring` — a NAK against a parity sqn falls
                        // through to WindowGone, same as any other double loss.
                        self.lead = self.lead.wrapping_add(h as u32);
                    }
                }
                closed_group = Some(group_sqn);
            }
        }

        Ok((sqn, closed_group))
    }

    /// The sqn the engine should stamp on the group's first proactively
    /// generated parity block, once `add` has just closed `group_sqn`'s
    /// transmission group. Parity block `j` (`0..h`) goes out as sqn
    /// `group_sqn + k + j`. Only valid for proactive groups, whose `h`
    /// trailing sqns `add` reserved right after the group's data — an
    /// on-demand group reserved nothing there, so those sqns are long since
    /// claimed by later real data; use `reserve_sqn` for those instead.
    pub fn parity_block_sqn(&self, group_sqn: Sqn, parity_index: usize) -> Option<Sqn> {
        let k = self.k()?;
        Some(group_sqn.wrapping_add(k as u32 + parity_index as u32))
    }

    /// Mint a fresh, never-before-used wire sqn from the window's own
    /// monotonic sequence, without retaining any packet under it. Used for
    /// on-demand parity repairs: their payload is routed purely by
    /// `OPT_PARITY_GRP` + the explicit parity index, so the wire sqn only
    /// needs to be unique, not reserved in advance the way proactive
    /// parity's is.
    pub fn reserve_sqn(&mut self) -> Sqn {
        let sqn = if self.has_sent {
            self.lead.wrapping_add(1)
        } else {
            self.trail
        };
        self.lead = sqn;
        if !self.has_sent {
            self.trail = sqn;
            self.has_sent = true;
            self.first_sqn = Some(sqn);
        }
        sqn
    }

    /// The `group_sqn` that `sqn` — a past or present data sqn of this
    /// window — belongs to. The stride between group starts is `k` once
    /// FEC is proactive-reserving `h` sqns after each group's data, else
    /// just `k` (on-demand-only windows never reserve, so the data stream
    /// stays contiguous). Used by NAK handling to locate a lost sqn's group
    /// without re-deriving it from a sqn that may predate the current one.
    pub fn group_sqn_of(&self, sqn: Sqn) -> Option<Sqn> {
        let k = self.k()?;
        let first = self.first_sqn?;
        let fec = self.fec.as_ref().unwrap();
        let stride = if fec.proactive { k + fec.codec.h() } else { k };
        let offset = sqn.distance(first);
        if offset < 0 {
            return None;
        }
        let group_idx = offset as u32 / stride as u32;
        Some(first.wrapping_add(group_idx * stride as u32))
    }

    /// Whether any parity block has already been generated (proactively or
    /// on demand) for the group starting at `group_sqn` — on-demand NAK
    /// handling uses this to generate lazily only on the group's first NAK.
    pub fn any_parity_generated(&self, group_sqn: Sqn) -> bool {
        self.parity_groups
            .get(&group_sqn.0)
            .is_some_and(|g| g.parity.iter().any(Option::is_some))
    }

    fn evict_trail(&mut self) {
        self.ring[self.trail.index(self.capacity)] = None;
        self.trail = self.trail.wrapping_add(1);
    }

    /// Fetch the retained `Skb` for `sqn`, suitable for rebuilding an RDATA
    /// packet (the engine copies `OPT_FRAGMENT` verbatim from it). Original
    /// data packets are never mutated — callers receive a cheap shared
    /// clone.
    pub fn retransmit(&self, sqn: Sqn) -> Result<Skb> {
        if sqn < self.trail {
            return Err(PgmError::WindowGone);
        }
        if sqn > self.lead {
            return Err(PgmError::WindowNxio);
        }
        match &self.ring[sqn.index(self.capacity)] {
            Some(skb) if skb.sqn == sqn => Ok(skb.share()),
            _ => Err(PgmError::WindowGone),
        }
    }

    /// Fetch (generating lazily if needed) the `parity_index`-th parity
    /// block for the transmission group starting at `group_sqn`.
    pub fn retransmit_parity(&mut self, group_sqn: Sqn, parity_index: usize) -> Result<Bytes> {
        if self.fec.is_none() {
            return Err(PgmError::Config("FEC not configured on this window".into()));
        }
        if let Some(group) = self.parity_groups.get(&group_sqn.0) {
            if let Some(block) = &group.parity[parity_index] {
                return Ok(block.clone());
            }
        }
        self.generate_parity(group_sqn, parity_index)
    }

    fn generate_parity(&mut self, group_sqn: Sqn, parity_index: usize) -> Result<Bytes> {
        let k = self.k().expect("fec configured");
        let h = self.fec.as_ref().unwrap().codec.h();
        if parity_index >= h {
            return Err(PgmError::Config("parity_index out of range".into()));
        }

        let mut owned_blocks: Vec<Vec<u8>> = Vec::with_capacity(k);
        for i in 0..k {
            let sqn = group_sqn.wrapping_add(i as u32);
            let skb = self.retransmit(sqn)?;
            owned_blocks.push(skb.payload().to_vec());
        }
        let refs: Vec<&[u8]> = owned_blocks.iter().map(|b| b.as_slice()).collect();
        let block = Bytes::from(self.fec.as_ref().unwrap().codec.encode(&refs, parity_index)?);

        let group = self
            .parity_groups
            .entry(group_sqn.0)
            .or_insert_with(|| ParityGroup {
                parity: vec![None; h],
            });
        group.parity[parity_index] = Some(block.clone());
        Ok(block)
    }

    /// `(trail, lead)` to advertise in the next SPM.
    pub fn on_spm_request(&self) -> (Sqn, Sqn) {
        (self.trail, self.lead)
    }
}
