//! # PGM wire format
//!
//! Every packet shares a fixed header — source port, destination port,
//! type, an options-present flag, a checksum, the sender's GSI, the
//! packet's sequence number, and a TSDU length — followed by an optional
//! chain of `OPT_*` TLVs and, for data packets, the payload. All
//! multi-byte fields are network byte order.
//!
//! Parsing is strictly length-validated: every option's length must lie
//! within the packet, unknown options are skipped by their length field,
//! and a chain that runs past the packet's bounds fails the whole packet
//! with `ParseBadOpt`. The checksum is a one's-complement 16-bit sum over
//! the header and payload with the checksum field zeroed during
//! computation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgmError, Result};
use crate::tsi::{Gsi, Sqn, Tsi};

// ─── Packet type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Nnak = 0x09,
    Ncf = 0x0A,
}

impl TryFrom<u8> for PacketType {
    type Error = PgmError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0x00 => PacketType::Spm,
            0x01 => PacketType::Poll,
            0x02 => PacketType::Polr,
            0x04 => PacketType::Odata,
            0x05 => PacketType::Rdata,
            0x08 => PacketType::Nak,
            0x09 => PacketType::Nnak,
            0x0A => PacketType::Ncf,
            _ => return Err(PgmError::ParseBadType),
        })
    }
}

// ─── Options (OPT_* TLV chain) ───────────────────────────────────────────────

const OPT_LENGTH: u8 = 0x00;
const OPT_FRAGMENT: u8 = 0x01;
const OPT_PARITY: u8 = 0x08;
const OPT_PARITY_GRP: u8 = 0x09;
const OPT_PARITY_CUR_TGSIZE: u8 = 0x0A;

/// `OPT_FRAGMENT`: identifies which APDU this TPDU belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    pub apdu_first_sqn: Sqn,
    pub frag_offset: u32,
    pub apdu_len: u32,
}

/// `OPT_PARITY`: marks a data packet's payload as a parity symbol rather
/// than source data, whether it was generated proactively or on demand, and
/// which of the group's `0..h` parity symbols this one is — carried
/// explicitly rather than derived from `sqn`/`parity_grp`, since on-demand
/// parity has no fixed sqn offset from its group the way proactive parity
/// does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptParity {
    pub proactive: bool,
    pub on_demand: bool,
    pub parity_index: u8,
}

/// The option chain attached to a single packet. A given packet carries at
/// most one of each option kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    pub fragment: Option<OptFragment>,
    pub parity: Option<OptParity>,
    pub parity_grp: Option<Sqn>,
    pub parity_cur_tgsize: Option<u16>,
}

impl Options {
    pub fn is_empty(&self) -> bool {
        self.fragment.is_none()
            && self.parity.is_none()
            && self.parity_grp.is_none()
            && self.parity_cur_tgsize.is_none()
    }

    fn encoded_len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut len = 4; // OPT_LENGTH: type+len+u16 value
        if self.fragment.is_some() {
            len += 2 + 12;
        }
        if self.parity.is_some() {
            len += 2 + 2;
        }
        if self.parity_grp.is_some() {
            len += 2 + 4;
        }
        if self.parity_cur_tgsize.is_some() {
            len += 2 + 2;
        }
        len
    }

    fn encode(&self, buf: &mut BytesMut) {
        if self.is_empty() {
            return;
        }
        let total = self.encoded_len() as u16;
        buf.put_u8(OPT_LENGTH);
        buf.put_u8(4);
        buf.put_u16(total);

        if let Some(f) = self.fragment {
            buf.put_u8(OPT_FRAGMENT);
            buf.put_u8(2 + 12);
            buf.put_u32(f.apdu_first_sqn.0);
            buf.put_u32(f.frag_offset);
            buf.put_u32(f.apdu_len);
        }
        if let Some(p) = self.parity {
            buf.put_u8(OPT_PARITY);
            buf.put_u8(2 + 2);
            let mut flags = 0u8;
            if p.proactive {
                flags |= 0x01;
            }
            if p.on_demand {
                flags |= 0x02;
            }
            buf.put_u8(flags);
            buf.put_u8(p.parity_index);
        }
        if let Some(grp) = self.parity_grp {
            buf.put_u8(OPT_PARITY_GRP);
            buf.put_u8(2 + 4);
            buf.put_u32(grp.0);
        }
        if let Some(tgsize) = self.parity_cur_tgsize {
            buf.put_u8(OPT_PARITY_CUR_TGSIZE);
            buf.put_u8(2 + 2);
            buf.put_u16(tgsize);
        }
    }

    /// Parse an option chain of exactly `chain_len` bytes out of `buf`.
    fn decode(buf: &mut Bytes, chain_len: usize) -> Result<Options> {
        if chain_len == 0 {
            return Ok(Options::default());
        }
        if buf.remaining() < chain_len {
            return Err(PgmError::ParseBadOpt);
        }
        let mut region = buf.split_to(chain_len);
        let mut opts = Options::default();
        let mut first = true;

        while region.has_remaining() {
            if region.remaining() < 2 {
                return Err(PgmError::ParseBadOpt);
            }
            let opt_type = region.get_u8();
            let opt_len = region.get_u8() as usize;
            if opt_len < 2 || opt_len - 2 > region.remaining() {
                return Err(PgmError::ParseBadOpt);
            }
            let value_len = opt_len - 2;

            if first {
                if opt_type != OPT_LENGTH {
                    return Err(PgmError::ParseBadOpt);
                }
                first = false;
            }

            match opt_type {
                OPT_LENGTH => {
                    if value_len != 2 {
                        return Err(PgmError::ParseBadOpt);
                    }
                    let declared = region.get_u16() as usize;
                    if declared != chain_len {
                        return Err(PgmError::ParseBadOpt);
                    }
                }
                OPT_FRAGMENT => {
                    if value_len != 12 {
                        return Err(PgmError::ParseBadOpt);
                    }
                    opts.fragment = Some(OptFragment {
                        apdu_first_sqn: Sqn(region.get_u32()),
                        frag_offset: region.get_u32(),
                        apdu_len: region.get_u32(),
                    });
                }
                OPT_PARITY => {
                    if value_len != 2 {
                        return Err(PgmError::ParseBadOpt);
                    }
                    let flags = region.get_u8();
                    let parity_index = region.get_u8();
                    opts.parity = Some(OptParity {
                        proactive: flags & 0x01 != 0,
                        on_demand: flags & 0x02 != 0,
                        parity_index,
                    });
                }
                OPT_PARITY_GRP => {
                    if value_len != 4 {
                        return Err(PgmError::ParseBadOpt);
                    }
                    opts.parity_grp = Some(Sqn(region.get_u32()));
                }
                OPT_PARITY_CUR_TGSIZE => {
                    if value_len != 2 {
                        return Err(PgmError::ParseBadOpt);
                    }
                    opts.parity_cur_tgsize = Some(region.get_u16());
                }
                _ => {
                    // unknown option: skip by its declared length.
                    region.advance(value_len);
                }
            }
        }
        Ok(opts)
    }
}

// ─── Packet body ─────────────────────────────────────────────────────────────

/// Type-specific payload. `Odata`/`Rdata` carry the trailing-edge
/// advertisement every data packet piggybacks, plus the TSDU itself;
/// `Spm` advertises both edges of the sender's window; the repair-request
/// types carry no body beyond the common `sqn` field (the requested sqn).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Spm { trail: Sqn, lead: Sqn },
    Odata { trail: Sqn, payload: Bytes },
    Rdata { trail: Sqn, payload: Bytes },
    Nak,
    Nnak,
    Ncf,
}

impl Body {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Body::Spm { .. } => PacketType::Spm,
            Body::Odata { .. } => PacketType::Odata,
            Body::Rdata { .. } => PacketType::Rdata,
            Body::Nak => PacketType::Nak,
            Body::Nnak => PacketType::Nnak,
            Body::Ncf => PacketType::Ncf,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Body::Odata { payload, .. } | Body::Rdata { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

// ─── Packet ──────────────────────────────────────────────────────────────────

const FIXED_HEADER_LEN: usize = 2 + 2 + 1 + 1 + 2 + 6 + 4 + 2; // 20 bytes
const OPTIONS_PRESENT: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source_port: u16,
    pub dest_port: u16,
    pub gsi: Gsi,
    pub sqn: Sqn,
    pub options: Options,
    pub body: Body,
}

impl Packet {
    pub fn tsi(&self) -> Tsi {
        Tsi::new(self.gsi, self.source_port)
    }

    /// Encode the packet to wire bytes, computing the checksum last.
    pub fn encode(&self) -> Bytes {
        let payload = self.body.payload().cloned().unwrap_or_default();
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_LEN + self.options.encoded_len() + payload.len(),
        );

        buf.put_u16(self.source_port);
        buf.put_u16(self.dest_port);
        buf.put_u8(self.body.packet_type() as u8);
        buf.put_u8(if self.options.is_empty() {
            0
        } else {
            OPTIONS_PRESENT
        });
        buf.put_u16(0); // checksum placeholder
        buf.put_slice(&self.gsi);
        buf.put_u32(self.sqn.0);
        buf.put_u16(payload.len() as u16);

        match &self.body {
            Body::Spm { trail, lead } => {
                buf.put_u32(trail.0);
                buf.put_u32(lead.0);
            }
            Body::Odata { trail, .. } | Body::Rdata { trail, .. } => {
                buf.put_u32(trail.0);
            }
            Body::Nak | Body::Nnak | Body::Ncf => {}
        }

        self.options.encode(&mut buf);
        buf.put_slice(&payload);

        let checksum = checksum16(&buf);
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());

        buf.freeze()
    }

    /// Parse a packet from wire bytes, validating checksum and option
    /// lengths. Packet-level parse failures are meant to be absorbed by the
    /// caller (counted, not propagated) per the engine's error policy.
    pub fn decode(raw: &[u8]) -> Result<Packet> {
        if raw.len() < FIXED_HEADER_LEN {
            return Err(PgmError::ParseBadLength);
        }

        let computed = {
            let mut copy = raw.to_vec();
            copy[6..8].copy_from_slice(&[0, 0]);
            checksum16(&copy)
        };
        let stored = u16::from_be_bytes([raw[6], raw[7]]);
        if computed != stored {
            return Err(PgmError::ParseBadChecksum);
        }

        let mut buf = Bytes::copy_from_slice(raw);
        let source_port = buf.get_u16();
        let dest_port = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;
        let options_flag = buf.get_u8();
        let _checksum = buf.get_u16();
        let mut gsi = [0u8; 6];
        buf.copy_to_slice(&mut gsi);
        let sqn = Sqn(buf.get_u32());
        let tsdu_length = buf.get_u16() as usize;

        let type_specific_len = match packet_type {
            PacketType::Spm => 8,
            PacketType::Odata | PacketType::Rdata => 4,
            _ => 0,
        };
        if buf.remaining() < type_specific_len {
            return Err(PgmError::ParseBadLength);
        }

        let trail = if type_specific_len > 0 {
            Some(Sqn(buf.get_u32()))
        } else {
            None
        };
        let lead = if matches!(packet_type, PacketType::Spm) {
            Some(Sqn(buf.get_u32()))
        } else {
            None
        };

        if buf.remaining() < tsdu_length {
            return Err(PgmError::ParseBadLength);
        }
        let options_region_len = buf.remaining() - tsdu_length;

        let options = if options_flag & OPTIONS_PRESENT != 0 {
            Options::decode(&mut buf, options_region_len)?
        } else {
            if options_region_len != 0 {
                return Err(PgmError::ParseBadLength);
            }
            Options::default()
        };

        if buf.remaining() != tsdu_length {
            return Err(PgmError::ParseBadLength);
        }
        let payload = buf.copy_to_bytes(tsdu_length);

        let body = match packet_type {
            PacketType::Spm => Body::Spm {
                trail: trail.unwrap(),
                lead: lead.unwrap(),
            },
            PacketType::Odata => Body::Odata {
                trail: trail.unwrap(),
                payload,
            },
            PacketType::Rdata => Body::Rdata {
                trail: trail.unwrap(),
                payload,
            },
            PacketType::Nak => Body::Nak,
            PacketType::Nnak => Body::Nnak,
            PacketType::Ncf => Body::Ncf,
            PacketType::Poll | PacketType::Polr => return Err(PgmError::ParseBadType),
        };

        Ok(Packet {
            source_port,
            dest_port,
            gsi,
            sqn,
            options,
            body,
        })
    }
}

/// One's-complement 16-bit checksum (RFC 1071 style) over `data`, with the
/// checksum field expected to already be zeroed by the caller.
fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
