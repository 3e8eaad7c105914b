//! # Protocol engine (C6)
//!
//! Ties the transmit window, the per-peer receive windows, the Reed-Solomon
//! codec, the rate regulator, the peer table, and the timer wheel together
//! behind three entry points: `send_apdu` (application → wire), `recv_packet`
//! (wire → application/timers), and `poll_timers` (timer wheel → wire). Like
//! the teacher's `sender.rs`/`receiver.rs`, the engine owns no socket — every
//! entry point returns a list of `EngineAction`s for the host to execute
//! (transmit bytes, deliver an APDU, tear down a peer), and the host's own
//! datagram sink/source/clock are the only I/O the core ever touches.
//!
//! `quanta::Instant` stands in for the "monotonic clock" host collaborator
//! (kept from the teacher's own dependency, see `rate.rs`); `recv_packet`
//! and `poll_timers` both take `now` explicitly rather than calling a clock
//! trait, matching the rest of this crate's pure, no-I/O window/codec layer.

use bytes::Bytes;
use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use crate::codec::RsCodec;
use crate::config::{Bound, Mode};
use crate::error::{PgmError, Result};
use crate::peer::{Peer, PeerTable};
use crate::rate::{RateRegulator, SendFlags};
use crate::rxw::{Rxw, RxwAction, RxwConfig};
use crate::skb::FragmentInfo;
use crate::stats::{ReceiverStats, SenderStats};
use crate::timer::TimerWheel;
use crate::tsi::{Sqn, Tsi};
use crate::txw::{FecParams, Txw};
use crate::wire::{Body, OptFragment, OptParity, Options, Packet};

/// Conservative upper bound on the PGM header + a full `OPT_FRAGMENT`/
/// `OPT_PARITY` chain, used only to size application-data fragments so a
/// single TPDU never exceeds `tpdu_max`. The wire format's actual encoded
/// length (computed by `Options::encoded_len` internally) is always ≤ this.
const MAX_HEADER_OVERHEAD: usize = 40;

/// A source of fresh entropy, seeded once at bind time — RFC 3208 sources
/// pick a random initial transmit sqn rather than always starting at zero,
/// so a restarted source's sqn space doesn't collide with its own prior
/// incarnation's leftover receiver state.
struct PgmRng(StdRng);

impl PgmRng {
    fn seeded_at_bind() -> Self {
        PgmRng(StdRng::from_os_rng())
    }

    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

/// Host-provided datagram sink — the only place bytes ever leave the
/// engine. Addressing (which multicast NLA, router-alert vs. ordinary
/// socket selection beyond the boolean below) is the host's concern per
/// §1's scope exclusion of socket/multicast syscalls.
pub trait DatagramSink {
    fn send(&mut self, bytes: &[u8], router_alert: bool) -> Result<usize>;
}

/// Host-provided datagram source feeding `Engine::recv_packet`.
pub trait DatagramSource {
    fn recv(&mut self) -> Option<Bytes>;
}

/// Admit `len` bytes through `rate`, counting a `WouldBlock` (or any other
/// regulator rejection) in `stats.rate_limited` before propagating it. A
/// free function, not an `Engine` method, so callers can hold it alongside
/// an active `&mut Txw` borrow of a different `Engine` field.
fn rate_check(rate: &mut RateRegulator, stats: &mut SenderStats, len: usize, flags: SendFlags) -> Result<()> {
    match rate.check(len, flags) {
        Ok(()) => Ok(()),
        Err(e) => {
            stats.rate_limited += 1;
            Err(e)
        }
    }
}

/// Forward every `Send` action to the host's sink, in order. A thin
/// convenience wrapper — callers that need finer control (e.g. splitting
/// router-alert traffic onto a second socket under its own lock, per §5)
/// can just match on `EngineAction` themselves instead.
pub fn dispatch(actions: &[EngineAction], sink: &mut impl DatagramSink) -> Result<()> {
    for action in actions {
        if let EngineAction::Send { bytes, router_alert } = action {
            sink.send(bytes, *router_alert)?;
        }
    }
    Ok(())
}

/// Action the host must take in response to an inbound packet, an
/// application send, or a fired timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// Transmit `bytes`, on the router-alert socket if `router_alert`.
    Send { bytes: Bytes, router_alert: bool },
    /// An APDU/TSDU is ready for the application, from the named source.
    Deliver { tsi: Tsi, data: Bytes },
    /// Irrecoverable loss surfaced once per event (spec §7).
    Reset { tsi: Tsi },
    /// A peer aged out of the peer table.
    PeerExpired { tsi: Tsi },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineTimer {
    Spm,
}

/// The protocol engine for one bound PGM endpoint. Sending and receiving
/// share one instance because SPM/NAK/NCF all carry both roles' state
/// (a sender watches for NAKs; a receiver watches for SPM); which parts
/// are active is governed by `Bound::mode`.
pub struct Engine {
    bound: Bound,
    tsi: Tsi,
    source_port: u16,
    dest_port: u16,
    txw: Option<Txw>,
    rate: RateRegulator,
    peers: PeerTable,
    timers: TimerWheel<EngineTimer>,
    heartbeat_idx: usize,
    stats_sender: SenderStats,
    stats_receiver: ReceiverStats,
    closed: bool,
}

impl Engine {
    /// Bind a new engine. `source_port`/`dest_port` are the PGM header's
    /// port pair (spec §4.6); `tsi`'s GSI is this host's own when sending,
    /// or ignored (a receive-only bind learns every peer's TSI from the
    /// packets it receives).
    pub fn bind(bound: Bound, tsi: Tsi, source_port: u16, dest_port: u16, now: Instant) -> Self {
        let txw = match bound.mode {
            Mode::SendOnly => {
                let fec = bound.fec.map(|f| FecParams {
                    codec: RsCodec::new(f.n, f.k).expect("validated by BindConfig::validate"),
                    proactive: f.proactive_h > 0,
                });
                let mut rng = PgmRng::seeded_at_bind();
                let start = Sqn(rng.next_u32());
                Some(Txw::with_start(bound.txw_capacity, fec, start))
            }
            Mode::RecvOnly | Mode::Passive => None,
        };

        let mut timers = TimerWheel::new();
        if txw.is_some() {
            timers.schedule(now + bound.spm_ambient_interval, EngineTimer::Spm);
        }

        info!(?tsi, mode = ?bound.mode, "engine bound");

        Engine {
            rate: RateRegulator::new(bound.peak_rate_bytes_per_sec, bound.iphdr_overhead),
            bound,
            tsi,
            source_port,
            dest_port,
            txw,
            peers: PeerTable::new(),
            timers,
            heartbeat_idx: 0,
            stats_sender: SenderStats::new(),
            stats_receiver: ReceiverStats::new(),
            closed: false,
        }
    }

    pub fn sender_stats(&self) -> &SenderStats {
        &self.stats_sender
    }

    pub fn receiver_stats(&self) -> &ReceiverStats {
        &self.stats_receiver
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark the engine destroyed; every subsequent call returns `Closed`
    /// (or, for the action-returning entry points that can't fail, does
    /// nothing) per spec §7.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// The host's next wakeup: the earliest of the SPM/heartbeat schedule,
    /// every peer's expiry, and every peer's outstanding NAK timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut earliest = self.timers.next_deadline();
        if let Some(d) = self.peers.next_deadline() {
            earliest = Some(match earliest {
                Some(e) if e <= d => e,
                _ => d,
            });
        }
        earliest
    }

    // ─── Sender path ────────────────────────────────────────────────────

    /// Fragment `data` into TPDU-sized ODATA packets, admit each through
    /// the rate regulator, and retain it in the transmit window for
    /// repair. Returns the wire-ready `Send` actions in transmission
    /// order. Fails fast with `WouldBlock`/`NetDown`-flavored errors from
    /// the regulator before anything is committed to the window.
    pub fn send_apdu(&mut self, data: Bytes, flags: SendFlags, now: Instant) -> Result<Vec<EngineAction>> {
        if self.closed {
            return Err(PgmError::Closed);
        }
        let Some(txw) = self.txw.as_mut() else {
            return Err(PgmError::Config("this bind cannot send (recv_only/passive)".into()));
        };

        let max_payload = self.bound.tpdu_max.saturating_sub(MAX_HEADER_OVERHEAD).max(1);
        let apdu_len = data.len() as u32;
        let first_sqn = txw.next_sqn();
        let needs_fragment = data.len() > max_payload;

        let mut actions = Vec::with_capacity(data.len() / max_payload + 1);
        let mut offset: usize = 0;
        loop {
            let end = (offset + max_payload).min(data.len());
            let chunk = data.slice(offset..end);

            let fragment = needs_fragment.then_some(FragmentInfo {
                apdu_first_sqn: first_sqn,
                apdu_len,
                frag_offset: offset as u32,
            });
            let options = fragment
                .map(|f| Options {
                    fragment: Some(OptFragment {
                        apdu_first_sqn: f.apdu_first_sqn,
                        frag_offset: f.frag_offset,
                        apdu_len: f.apdu_len,
                    }),
                    ..Options::default()
                })
                .unwrap_or_default();

            let predicted_sqn = txw.next_sqn();
            let pkt = Packet {
                source_port: self.source_port,
                dest_port: self.dest_port,
                gsi: self.tsi.gsi(),
                sqn: predicted_sqn,
                options,
                body: Body::Odata {
                    trail: txw.trail(),
                    payload: chunk.clone(),
                },
            };
            let wire = pkt.encode();
            rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), flags)?;

            let (actual_sqn, closed_group) = txw.add(self.tsi, chunk, fragment)?;
            debug_assert_eq!(actual_sqn, predicted_sqn);

            self.stats_sender.odata_sent += 1;
            self.stats_sender.bytes_sent += wire.len() as u64;
            actions.push(EngineAction::Send {
                bytes: wire,
                router_alert: false,
            });

            if let Some(group_sqn) = closed_group {
                if let Some(fec) = self.bound.fec.filter(|f| f.proactive_h > 0) {
                    let h = fec.n - fec.k;
                    for j in 0..h {
                        let Some(parity_sqn) = txw.parity_block_sqn(group_sqn, j) else {
                            break;
                        };
                        let Ok(block) = txw.retransmit_parity(group_sqn, j) else {
                            continue;
                        };
                        let ppkt = Packet {
                            source_port: self.source_port,
                            dest_port: self.dest_port,
                            gsi: self.tsi.gsi(),
                            sqn: parity_sqn,
                            options: Options {
                                parity: Some(OptParity {
                                    proactive: true,
                                    on_demand: false,
                                    parity_index: j as u8,
                                }),
                                parity_grp: Some(group_sqn),
                                ..Options::default()
                            },
                            body: Body::Odata {
                                trail: txw.trail(),
                                payload: block,
                            },
                        };
                        let wire = ppkt.encode();
                        if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), flags).is_ok() {
                            self.stats_sender.parity_sent += 1;
                            actions.push(EngineAction::Send {
                                bytes: wire,
                                router_alert: false,
                            });
                        }
                    }
                }
            }

            offset = end;
            if offset >= data.len() {
                break;
            }
        }

        self.heartbeat_idx = 0;
        Ok(actions)
    }

    // ─── Receiver path ──────────────────────────────────────────────────

    /// Parse and dispatch one inbound datagram. Packet-level parse
    /// failures are absorbed here (counted, not propagated) per spec §7's
    /// propagation policy.
    pub fn recv_packet(&mut self, raw: &[u8], now: Instant) -> Vec<EngineAction> {
        if self.closed {
            return Vec::new();
        }
        let pkt = match Packet::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = ?e, "dropping packet: parse failure");
                return Vec::new();
            }
        };
        let tsi = pkt.tsi();

        match &pkt.body {
            Body::Spm { trail, .. } => self.handle_spm(tsi, *trail, now),
            Body::Odata { .. } | Body::Rdata { .. } => self.handle_data(tsi, &pkt, now),
            Body::Nak => self.handle_nak(&pkt),
            Body::Ncf => {
                if let Some(peer) = self.peers.get_mut(&tsi) {
                    self.stats_receiver.ncfs_received += 1;
                    peer.rxw.on_ncf(pkt.sqn, now);
                }
                Vec::new()
            }
            Body::Nnak => Vec::new(),
        }
    }

    fn handle_spm(&mut self, tsi: Tsi, trail: Sqn, now: Instant) -> Vec<EngineAction> {
        if self.bound.mode != Mode::RecvOnly {
            return Vec::new();
        }
        let Some(peer) = self.peers.get_mut(&tsi) else {
            // No data seen from this source yet: nothing to advance. A
            // peer is created on first ODATA/RDATA/SPM (spec §4.7), but an
            // RXW anchored purely on an SPM with no data sqn to start from
            // has nothing meaningful to do yet.
            return Vec::new();
        };
        peer.touch(now, self.bound.peer_expiry);
        let actions = peer.rxw.on_spm(trail);
        self.convert(tsi, actions)
    }

    fn handle_data(&mut self, tsi: Tsi, pkt: &Packet, now: Instant) -> Vec<EngineAction> {
        if self.bound.mode != Mode::RecvOnly {
            return Vec::new();
        }
        let payload = match pkt.body.payload() {
            Some(p) => p.clone(),
            None => return Vec::new(),
        };

        let rxw_capacity = self.bound.rxw_capacity;
        let nak_bo_ivl = self.bound.nak_bo_ivl;
        let nak_rpt_ivl = self.bound.nak_rpt_ivl;
        let nak_rdata_ivl = self.bound.nak_rdata_ivl;
        let nak_data_retries = self.bound.nak_data_retries;
        let nak_ncf_retries = self.bound.nak_ncf_retries;
        let abort_on_reset = self.bound.abort_on_reset;
        let peer_expiry = self.bound.peer_expiry;
        let fec_cfg = self.bound.fec;
        let fec_codec = fec_cfg.map(|f| RsCodec::new(f.n, f.k).expect("validated by BindConfig::validate"));

        let peer = self.peers.get_or_insert_with(tsi, || {
            let rxw_cfg = RxwConfig {
                capacity: rxw_capacity,
                nak_bo_ivl,
                nak_rpt_ivl,
                nak_rdata_ivl,
                nak_data_retries,
                nak_ncf_retries,
                abort_on_reset,
            };
            Peer::new(tsi, Rxw::new(rxw_cfg, fec_codec), now, peer_expiry)
        });
        peer.touch(now, peer_expiry);
        self.stats_receiver.packets_received += 1;

        let fragment = pkt.options.fragment.map(|f| FragmentInfo {
            apdu_first_sqn: f.apdu_first_sqn,
            apdu_len: f.apdu_len,
            frag_offset: f.frag_offset,
        });

        let is_parity = pkt.options.parity.is_some();
        let actions = if is_parity {
            if fec_cfg.is_none() {
                return Vec::new();
            }
            let group_sqn = pkt.options.parity_grp.unwrap_or(pkt.sqn);
            let parity_index = pkt.options.parity.map(|p| p.parity_index as usize).unwrap_or(0);
            peer.rxw.on_parity(group_sqn, parity_index, payload, now)
        } else {
            peer.rxw.on_data(pkt.sqn, payload, fragment, now)
        };
        if is_parity {
            let recovered = actions.iter().filter(|a| matches!(a, RxwAction::Deliver(_))).count();
            self.stats_receiver.fec_recoveries += recovered as u64;
        }
        self.convert(tsi, actions)
    }

    fn handle_nak(&mut self, pkt: &Packet) -> Vec<EngineAction> {
        let Some(txw) = self.txw.as_mut() else {
            return Vec::new();
        };
        self.stats_sender.naks_received += 1;
        let sqn = pkt.sqn;
        let mut actions = Vec::new();

        let ncf_pkt = Packet {
            source_port: self.source_port,
            dest_port: self.dest_port,
            gsi: self.tsi.gsi(),
            sqn,
            options: Options::default(),
            body: Body::Ncf,
        };
        let wire = ncf_pkt.encode();
        if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), SendFlags { dontwait: true }).is_ok() {
            self.stats_sender.ncfs_sent += 1;
            actions.push(EngineAction::Send {
                bytes: wire,
                router_alert: false,
            });
        }

        match txw.retransmit(sqn) {
            Ok(skb) => {
                let fragment = skb.fragment.map(|f| OptFragment {
                    apdu_first_sqn: f.apdu_first_sqn,
                    frag_offset: f.frag_offset,
                    apdu_len: f.apdu_len,
                });
                let rpkt = Packet {
                    source_port: self.source_port,
                    dest_port: self.dest_port,
                    gsi: self.tsi.gsi(),
                    sqn,
                    options: Options {
                        fragment,
                        ..Options::default()
                    },
                    body: Body::Rdata {
                        trail: txw.trail(),
                        payload: skb.as_bytes(),
                    },
                };
                let wire = rpkt.encode();
                if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), SendFlags { dontwait: true }).is_ok() {
                    self.stats_sender.rdata_sent += 1;
                    actions.push(EngineAction::Send {
                        bytes: wire,
                        router_alert: false,
                    });
                }
            }
            Err(PgmError::WindowGone) => {
                warn!(?sqn, "NAK for a sqn already GONE from the transmit window");
            }
            Err(_) => {}
        }

        // On-demand FEC (spec §4.4): the group's parity is never generated
        // up front when `proactive_h == 0`, so the first NAK against any of
        // its sqns is what triggers lazy generation — and since it covers
        // the whole group, later NAKs in the same group find it already
        // done.
        if let Some(fec) = self.bound.fec {
            if fec.ondemand {
                if let Some(group_sqn) = txw.group_sqn_of(sqn) {
                    if !txw.any_parity_generated(group_sqn) {
                        let h = fec.n - fec.k;
                        for j in 0..h {
                            let Ok(block) = txw.retransmit_parity(group_sqn, j) else {
                                continue;
                            };
                            let parity_sqn = txw.reserve_sqn();
                            let ppkt = Packet {
                                source_port: self.source_port,
                                dest_port: self.dest_port,
                                gsi: self.tsi.gsi(),
                                sqn: parity_sqn,
                                options: Options {
                                    parity: Some(OptParity {
                                        proactive: false,
                                        on_demand: true,
                                        parity_index: j as u8,
                                    }),
                                    parity_grp: Some(group_sqn),
                                    ..Options::default()
                                },
                                body: Body::Rdata {
                                    trail: txw.trail(),
                                    payload: block,
                                },
                            };
                            let wire = ppkt.encode();
                            if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), SendFlags { dontwait: true })
                                .is_ok()
                            {
                                self.stats_sender.parity_sent += 1;
                                actions.push(EngineAction::Send {
                                    bytes: wire,
                                    router_alert: false,
                                });
                            }
                        }
                    }
                }
            }
        }

        actions
    }

    fn convert(&mut self, tsi: Tsi, actions: Vec<RxwAction>) -> Vec<EngineAction> {
        let mut out = Vec::with_capacity(actions.len());
        for action in actions {
            match action {
                RxwAction::SendNak(sqn) => {
                    let pkt = Packet {
                        source_port: tsi.source_port(),
                        dest_port: self.dest_port,
                        gsi: tsi.gsi(),
                        sqn,
                        options: Options::default(),
                        body: Body::Nak,
                    };
                    let wire = pkt.encode();
                    if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), SendFlags { dontwait: true }).is_ok() {
                        self.stats_receiver.naks_sent += 1;
                        out.push(EngineAction::Send {
                            bytes: wire,
                            router_alert: false,
                        });
                    }
                }
                RxwAction::Deliver(data) => {
                    self.stats_receiver.apdus_delivered += 1;
                    self.stats_receiver.bytes_delivered += data.len() as u64;
                    out.push(EngineAction::Deliver { tsi, data });
                }
                RxwAction::Reset => {
                    self.stats_receiver.resets += 1;
                    out.push(EngineAction::Reset { tsi });
                }
            }
        }
        out
    }

    // ─── Timers ─────────────────────────────────────────────────────────

    /// Drive every timer-driven behavior forward to `now`: ambient/
    /// heartbeat SPMs, per-peer NAK back-off and repair timeouts, and peer
    /// expiry. Call whenever `next_deadline()` elapses.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<EngineAction> {
        if self.closed {
            return Vec::new();
        }
        let mut actions = Vec::new();

        for timer in self.timers.pop_due(now) {
            match timer {
                EngineTimer::Spm => actions.extend(self.fire_ambient_spm(now)),
            }
        }

        let fired: Vec<(Tsi, Vec<RxwAction>)> = self
            .peers
            .iter_mut()
            .map(|peer| (peer.tsi, peer.rxw.expire(now)))
            .collect();
        for (tsi, rxw_actions) in fired {
            actions.extend(self.convert(tsi, rxw_actions));
        }

        for tsi in self.peers.expire(now) {
            self.stats_receiver.peers_expired += 1;
            actions.push(EngineAction::PeerExpired { tsi });
        }

        actions
    }

    fn fire_ambient_spm(&mut self, now: Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        if let Some(txw) = self.txw.as_ref() {
            let (trail, lead) = txw.on_spm_request();
            let pkt = Packet {
                source_port: self.source_port,
                dest_port: self.dest_port,
                gsi: self.tsi.gsi(),
                sqn: lead,
                options: Options::default(),
                body: Body::Spm { trail, lead },
            };
            let wire = pkt.encode();
            if rate_check(&mut self.rate, &mut self.stats_sender, wire.len(), SendFlags { dontwait: true }).is_ok() {
                self.stats_sender.spms_sent += 1;
                actions.push(EngineAction::Send {
                    bytes: wire,
                    router_alert: false,
                });
            }
        }
        self.reschedule_spm(now);
        actions
    }

    /// After an ODATA burst, the next few SPMs follow
    /// `spm_heartbeat_schedule`'s shorter intervals rather than the ambient
    /// one, so a fresh receiver or a brief network partition converges on
    /// the sender's trailing edge quickly; once the schedule is exhausted
    /// this falls back to `spm_ambient_interval` until the next burst
    /// resets `heartbeat_idx` (spec §4.6).
    fn reschedule_spm(&mut self, now: Instant) {
        let ivl = if self.heartbeat_idx < self.bound.spm_heartbeat_schedule.len() {
            let d = self.bound.spm_heartbeat_schedule[self.heartbeat_idx];
            self.heartbeat_idx += 1;
            d
        } else {
            self.bound.spm_ambient_interval
        };
        self.timers.schedule(now + ivl, EngineTimer::Spm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressFamily, BindConfig, FecConfig, WindowSize};
    use std::time::Duration;

    fn sender_bound() -> Bound {
        BindConfig {
            address_family: AddressFamily::V4,
            tpdu_max: 1500,
            peak_rate_bytes_per_sec: 10_000_000,
            iphdr_overhead: 28,
            txw_size: WindowSize::Sqns(64),
            rxw_size: WindowSize::Sqns(64),
            mode: Mode::SendOnly,
            ..BindConfig::default()
        }
        .validate()
        .unwrap()
    }

    fn receiver_bound() -> Bound {
        BindConfig {
            mode: Mode::RecvOnly,
            nak_bo_ivl: Duration::from_millis(10),
            nak_rpt_ivl: Duration::from_millis(10),
            nak_rdata_ivl: Duration::from_millis(10),
            ..BindConfig::default()
        }
        .validate()
        .unwrap()
    }

    fn src_tsi() -> Tsi {
        Tsi::new([7, 7, 7, 7, 7, 7], 9000)
    }

    #[test]
    fn s1_in_order_delivery_no_naks() {
        let now = Instant::now();
        let mut sender = Engine::bind(sender_bound(), src_tsi(), 9000, 9001, now);
        let mut receiver = Engine::bind(receiver_bound(), src_tsi(), 9001, 9000, now);

        let mut delivered = Vec::new();
        for i in 0..10u8 {
            let actions = sender
                .send_apdu(Bytes::from(vec![i]), SendFlags::default(), now)
                .unwrap();
            for action in actions {
                if let EngineAction::Send { bytes, .. } = action {
                    for a in receiver.recv_packet(&bytes, now) {
                        if let EngineAction::Deliver { data, .. } = a {
                            delivered.push(data);
                        }
                    }
                }
            }
        }
        assert_eq!(delivered.len(), 10);
        for (i, d) in delivered.iter().enumerate() {
            assert_eq!(d[0], i as u8);
        }
        assert_eq!(receiver.receiver_stats().naks_sent, 0);
    }

    #[test]
    fn s2_gap_triggers_nak_ncf_rdata_then_in_order_release() {
        let t0 = Instant::now();
        let mut sender = Engine::bind(sender_bound(), src_tsi(), 9000, 9001, t0);
        let mut receiver = Engine::bind(receiver_bound(), src_tsi(), 9001, 9000, t0);

        let mut wire_by_sqn = Vec::new();
        for i in 0..10u8 {
            let actions = sender
                .send_apdu(Bytes::from(vec![i]), SendFlags::default(), t0)
                .unwrap();
            for action in actions {
                if let EngineAction::Send { bytes, .. } = action {
                    wire_by_sqn.push(bytes);
                }
            }
        }

        let mut delivered = Vec::new();
        for (i, wire) in wire_by_sqn.iter().enumerate() {
            if i == 3 || i == 4 {
                continue; // dropped
            }
            for a in receiver.recv_packet(wire, t0) {
                if let EngineAction::Deliver { data, .. } = a {
                    delivered.push(data);
                }
            }
        }
        assert_eq!(delivered.len(), 3); // sqns 0,1,2 only so far

        let t1 = t0 + Duration::from_millis(20);
        let nak_actions = receiver.poll_timers(t1);
        let naks: Vec<Bytes> = nak_actions
            .into_iter()
            .filter_map(|a| match a {
                EngineAction::Send { bytes, .. } => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(naks.len(), 2); // one NAK each for sqn 3 and 4

        let mut repairs = Vec::new();
        for nak in &naks {
            for a in sender.recv_packet(nak, t1) {
                if let EngineAction::Send { bytes, .. } = a {
                    repairs.push(bytes);
                }
            }
        }
        // each NAK yields an NCF plus an RDATA repair.
        assert_eq!(repairs.len(), 4);

        for repair in &repairs {
            for a in receiver.recv_packet(repair, t1) {
                if let EngineAction::Deliver { data, .. } = a {
                    delivered.push(data);
                }
            }
        }
        assert_eq!(delivered.len(), 10);
        for (i, d) in delivered.iter().enumerate() {
            assert_eq!(d[0], i as u8);
        }
    }

    #[test]
    fn s5_bind_rejects_invalid_config() {
        let bad_window = BindConfig {
            txw_size: WindowSize::Sqns(0),
            ..BindConfig::default()
        };
        assert!(matches!(bad_window.validate(), Err(PgmError::Config(_))));

        let bad_tpdu = BindConfig {
            tpdu_max: 64,
            ..BindConfig::default()
        };
        assert!(matches!(bad_tpdu.validate(), Err(PgmError::Config(_))));

        let bad_fec = BindConfig {
            fec: Some(FecConfig {
                n: 255,
                k: 100,
                proactive_h: 0,
                ondemand: true,
                varpkt_len: None,
            }),
            ..BindConfig::default()
        };
        assert!(matches!(bad_fec.validate(), Err(PgmError::Config(_))));
    }

    #[test]
    fn s6_dontwait_backpressure_yields_wouldblock() {
        let now = Instant::now();
        let bound = BindConfig {
            mode: Mode::SendOnly,
            peak_rate_bytes_per_sec: 1_000_000,
            txw_size: WindowSize::Sqns(4096),
            ..BindConfig::default()
        }
        .validate()
        .unwrap();
        let mut sender = Engine::bind(bound, src_tsi(), 9000, 9001, now);

        let payload = vec![0u8; 1200];
        let mut wouldblock_count = 0;
        let mut sent = 0;
        for _ in 0..2000 {
            match sender.send_apdu(Bytes::from(payload.clone()), SendFlags { dontwait: true }, now) {
                Ok(_) => sent += 1,
                Err(PgmError::WouldBlock) => wouldblock_count += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(sent > 0);
        assert!(wouldblock_count > 0);
    }

    #[test]
    fn send_only_bind_cannot_receive_data() {
        let now = Instant::now();
        let mut bound_as_recv = Engine::bind(sender_bound(), src_tsi(), 9000, 9001, now);
        // a send-only engine ignores inbound ODATA entirely (no peer created).
        let pkt = Packet {
            source_port: 9001,
            dest_port: 9000,
            gsi: [1; 6],
            sqn: Sqn(0),
            options: Options::default(),
            body: Body::Odata {
                trail: Sqn(0),
                payload: Bytes::from_static(b"x"),
            },
        };
        let actions = bound_as_recv.recv_packet(&pkt.encode(), now);
        assert!(actions.is_empty());
        assert_eq!(bound_as_recv.peer_count(), 0);
    }

    #[test]
    fn recv_only_bind_cannot_send() {
        let now = Instant::now();
        let mut receiver = Engine::bind(receiver_bound(), src_tsi(), 9001, 9000, now);
        let err = receiver
            .send_apdu(Bytes::from_static(b"x"), SendFlags::default(), now)
            .unwrap_err();
        assert!(matches!(err, PgmError::Config(_)));
    }

    #[test]
    fn closed_engine_rejects_further_sends() {
        let now = Instant::now();
        let mut sender = Engine::bind(sender_bound(), src_tsi(), 9000, 9001, now);
        sender.close();
        let err = sender
            .send_apdu(Bytes::from_static(b"x"), SendFlags::default(), now)
            .unwrap_err();
        assert!(matches!(err, PgmError::Closed));
        assert!(sender.recv_packet(&[0u8; 32], now).is_empty());
    }

    #[test]
    fn peer_expiry_surfaces_peer_expired_action() {
        let t0 = Instant::now();
        let bound = BindConfig {
            mode: Mode::RecvOnly,
            peer_expiry: Duration::from_millis(10),
            ..BindConfig::default()
        }
        .validate()
        .unwrap();
        let mut receiver = Engine::bind(bound, src_tsi(), 9001, 9000, t0);

        let pkt = Packet {
            source_port: 9000,
            dest_port: 9001,
            gsi: [3; 6],
            sqn: Sqn(0),
            options: Options::default(),
            body: Body::Odata {
                trail: Sqn(0),
                payload: Bytes::from_static(b"hi"),
            },
        };
        receiver.recv_packet(&pkt.encode(), t0);
        assert_eq!(receiver.peer_count(), 1);

        let actions = receiver.poll_timers(t0 + Duration::from_millis(50));
        assert!(actions
            .iter()
            .any(|a| matches!(a, EngineAction::PeerExpired { .. })));
        assert_eq!(receiver.peer_count(), 0);
    }
}
