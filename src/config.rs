//! # Bind-time configuration
//!
//! `BindConfig` collects every knob spec §6 recognizes; `validate()`
//! consumes it into a `Bound`, following `rist-bonding-core::config`'s
//! `*Input` → validated-`*Config` split. There is no runtime "already bound"
//! check to get wrong: once a `Bound` exists, every field is immutable, and
//! a `BindConfig` that failed validation never produced one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PgmError, Result};

/// IPv4 vs IPv6 floor for `tpdu_max` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn tpdu_floor(self) -> usize {
        match self {
            AddressFamily::V4 => 68,
            AddressFamily::V6 => 1280,
        }
    }
}

/// Whether this bind can send, receive, or does neither yet (a passive
/// bind used only to join the multicast group ahead of a later send/recv
/// call out of this crate's scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    SendOnly,
    RecvOnly,
    Passive,
}

/// Either a fixed sqn-count window or a (seconds, peak-rate) budget,
/// converted to an equivalent sqn count once `tpdu_max` is known (spec §3:
/// "sized EITHER by sequence count OR by seconds × peak-rate ÷ TPDU").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowSize {
    Sqns(usize),
    SecsAtRate { secs: u64, max_rte: u64 },
}

impl WindowSize {
    fn resolve(self, tpdu_max: usize) -> Option<usize> {
        match self {
            WindowSize::Sqns(n) if n > 0 => Some(n),
            WindowSize::SecsAtRate { secs, max_rte } if secs > 0 && max_rte > 0 && tpdu_max > 0 => {
                Some(((secs * max_rte) as usize / tpdu_max).max(1))
            }
            _ => None,
        }
    }
}

/// Reed-Solomon parameters for this bind (spec §6 `fec:{n,k,proactive_h,
/// ondemand,varpkt_len}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecConfig {
    pub n: usize,
    pub k: usize,
    /// Parity symbols generated proactively at each group's close.
    pub proactive_h: usize,
    /// Whether on-demand (NAK-triggered) parity generation is permitted.
    pub ondemand: bool,
    /// Fixed symbol length for variable-length packet payloads, if the
    /// transport pads/truncates to a common FEC symbol size.
    pub varpkt_len: Option<usize>,
}

impl FecConfig {
    fn validate(&self) -> Result<()> {
        if !(2..=128).contains(&self.k) || !self.k.is_power_of_two() {
            return Err(PgmError::Config(format!(
                "fec.k={} must be a power of two in [2,128]",
                self.k
            )));
        }
        if !(self.k + 1..=255).contains(&self.n) {
            return Err(PgmError::Config(format!(
                "fec.n={} must be in [k+1,255] for k={}",
                self.n, self.k
            )));
        }
        if self.proactive_h > self.n - self.k {
            return Err(PgmError::Config(format!(
                "fec.proactive_h={} exceeds h=n-k={}",
                self.proactive_h,
                self.n - self.k
            )));
        }
        Ok(())
    }
}

/// Raw bind-time input, as the host collects it from its own configuration
/// surface (file, CLI flags, API call) — named `*Input` by convention
/// against the validated `Bound` it produces, same split as the teacher's
/// `rist-bonding-core::config` layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub address_family: AddressFamily,
    pub tpdu_max: usize,
    /// Peak rate the token-bucket regulator (C3) paces all transmitted
    /// bytes to. When `txw_size` is `SecsAtRate`, this should match its
    /// `max_rte` — the window's time budget and the regulator's pacing
    /// rate describe the same peak, just from two angles (how much to
    /// retain vs. how fast to send).
    pub peak_rate_bytes_per_sec: u64,
    /// Fixed per-packet IP/UDP overhead the regulator charges alongside
    /// payload length.
    pub iphdr_overhead: usize,
    pub txw_size: WindowSize,
    pub rxw_size: WindowSize,
    pub spm_ambient_interval: Duration,
    pub spm_heartbeat_schedule: Vec<Duration>,
    pub peer_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    pub hops: u8,
    pub multicast_loop: bool,
    pub sndbuf: usize,
    pub rcvbuf: usize,
    pub mode: Mode,
    pub fec: Option<FecConfig>,
    pub nonblocking: bool,
    pub abort_on_reset: bool,
}

impl Default for BindConfig {
    fn default() -> Self {
        BindConfig {
            address_family: AddressFamily::V4,
            tpdu_max: 1500,
            peak_rate_bytes_per_sec: 10_000_000,
            iphdr_overhead: 28,
            txw_size: WindowSize::Sqns(4096),
            rxw_size: WindowSize::Sqns(4096),
            spm_ambient_interval: Duration::from_secs(30),
            spm_heartbeat_schedule: vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            peer_expiry: Duration::from_secs(150), // 5 × default ambient interval
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_millis(200),
            nak_rdata_ivl: Duration::from_millis(200),
            nak_data_retries: 5,
            nak_ncf_retries: 2,
            hops: 16,
            multicast_loop: false,
            sndbuf: 1 << 20,
            rcvbuf: 1 << 20,
            mode: Mode::SendOnly,
            fec: None,
            nonblocking: false,
            abort_on_reset: false,
        }
    }
}

/// A validated, immutable bind. Every knob in `BindConfig` survives here
/// except the two window specifications, which are resolved to concrete
/// sqn capacities now that `tpdu_max` is known.
#[derive(Debug, Clone)]
pub struct Bound {
    pub address_family: AddressFamily,
    pub tpdu_max: usize,
    pub peak_rate_bytes_per_sec: u64,
    pub iphdr_overhead: usize,
    pub txw_capacity: usize,
    pub rxw_capacity: usize,
    pub spm_ambient_interval: Duration,
    pub spm_heartbeat_schedule: Vec<Duration>,
    pub peer_expiry: Duration,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    pub hops: u8,
    pub multicast_loop: bool,
    pub sndbuf: usize,
    pub rcvbuf: usize,
    pub mode: Mode,
    pub fec: Option<FecConfig>,
    pub nonblocking: bool,
    pub abort_on_reset: bool,
}

impl BindConfig {
    /// Validate every invalid combination named in spec §6/S5, consuming
    /// `self` into a `Bound`. Rejected before any effect — no partial bind.
    pub fn validate(self) -> Result<Bound> {
        if self.tpdu_max < self.address_family.tpdu_floor() {
            return Err(PgmError::Config(format!(
                "tpdu_max={} below the {:?} floor of {}",
                self.tpdu_max,
                self.address_family,
                self.address_family.tpdu_floor()
            )));
        }
        if self.hops == 0 {
            return Err(PgmError::Config("hops must be in [1,255]".into()));
        }

        let txw_capacity = self.txw_size.resolve(self.tpdu_max).ok_or_else(|| {
            PgmError::Config("txw_sqns=0 and txw_secs=0 (or txw_max_rte=0): no transmit window size".into())
        })?;
        let rxw_capacity = self.rxw_size.resolve(self.tpdu_max).ok_or_else(|| {
            PgmError::Config("rxw_sqns=0 and rxw_secs=0 (or rxw_max_rte=0): no receive window size".into())
        })?;

        if let Some(fec) = &self.fec {
            fec.validate()?;
        }

        if self.nak_data_retries == 0 || self.nak_ncf_retries == 0 {
            return Err(PgmError::Config(
                "nak_data_retries and nak_ncf_retries must be at least 1".into(),
            ));
        }
        if self.peak_rate_bytes_per_sec == 0 {
            return Err(PgmError::Config("peak_rate_bytes_per_sec must be nonzero".into()));
        }

        Ok(Bound {
            address_family: self.address_family,
            tpdu_max: self.tpdu_max,
            peak_rate_bytes_per_sec: self.peak_rate_bytes_per_sec,
            iphdr_overhead: self.iphdr_overhead,
            txw_capacity,
            rxw_capacity,
            spm_ambient_interval: self.spm_ambient_interval,
            spm_heartbeat_schedule: self.spm_heartbeat_schedule,
            peer_expiry: self.peer_expiry,
            nak_bo_ivl: self.nak_bo_ivl,
            nak_rpt_ivl: self.nak_rpt_ivl,
            nak_rdata_ivl: self.nak_rdata_ivl,
            nak_data_retries: self.nak_data_retries,
            nak_ncf_retries: self.nak_ncf_retries,
            hops: self.hops,
            multicast_loop: self.multicast_loop,
            sndbuf: self.sndbuf,
            rcvbuf: self.rcvbuf,
            mode: self.mode,
            fec: self.fec,
            nonblocking: self.nonblocking,
            abort_on_reset: self.abort_on_reset,
        })
    }
}
