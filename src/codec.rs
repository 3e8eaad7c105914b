//! # Reed-Solomon FEC codec (C2)
//!
//! RS(n,k) over GF(2^8), `2 ≤ k ≤ 128` (power of two), `k+1 ≤ n ≤ 255`. The
//! generator is the top `k` rows of an `n×k` Vandermonde matrix at points
//! `α^0 … α^(n-1)`, inverted so the systematic identity occupies rows
//! `0..k`: sending the first `k` rows unmodified reproduces the source
//! blocks exactly, and rows `k..n` are the parity blocks.
//!
//! Pure and thread-safe given separate scratch buffers — no I/O, no shared
//! mutable state, matching the "pure logic" convention the rest of the
//! window/codec layer follows.

use crate::error::{PgmError, Result};
use crate::gf256::GfTables;

/// A bound RS(n,k) instance: holds the precomputed `n×k` systematic
/// encoding matrix so `encode`/`decode` never recompute it.
pub struct RsCodec {
    gf: GfTables,
    n: usize,
    k: usize,
    /// `n` rows of `k` coefficients each; rows `0..k` are the identity.
    enc_matrix: Vec<Vec<u8>>,
}

impl RsCodec {
    /// Construct RS(n,k), validating the parameters from spec §4.2.
    pub fn new(n: usize, k: usize) -> Result<Self> {
        if !(2..=128).contains(&k) || !k.is_power_of_two() {
            return Err(PgmError::Config(format!(
                "FEC k={k} must be a power of two in [2,128]"
            )));
        }
        if !(k + 1..=255).contains(&n) {
            return Err(PgmError::Config(format!(
                "FEC n={n} must be in [k+1,255] for k={k}"
            )));
        }
        let gf = GfTables::new();
        let vandermonde = build_vandermonde(&gf, n, k);
        let m0: Vec<Vec<u8>> = vandermonde[..k].to_vec();
        let m0_inv = invert(&gf, &m0)?;
        let enc_matrix = matmul(&gf, &vandermonde, &m0_inv);
        Ok(RsCodec { gf, n, k, enc_matrix })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Maximum number of parity blocks this instance can emit.
    pub fn h(&self) -> usize {
        self.n - self.k
    }

    /// Compute the `parity_index`-th parity block (row `k + parity_index`
    /// of the encoding matrix applied to the `k` source blocks). All
    /// `src_blocks` must share the same length — the codec is byte-wise and
    /// otherwise length-independent.
    pub fn encode(&self, src_blocks: &[&[u8]], parity_index: usize) -> Result<Vec<u8>> {
        if src_blocks.len() != self.k {
            return Err(PgmError::Config(format!(
                "encode expects {} source blocks, got {}",
                self.k,
                src_blocks.len()
            )));
        }
        if parity_index >= self.h() {
            return Err(PgmError::Config(format!(
                "parity_index {} out of range (h={})",
                parity_index,
                self.h()
            )));
        }
        let symbol_len = src_blocks[0].len();
        if src_blocks.iter().any(|b| b.len() != symbol_len) {
            return Err(PgmError::Config(
                "all source blocks must share one symbol length".into(),
            ));
        }
        let row = &self.enc_matrix[self.k + parity_index];
        let mut out = vec![0u8; symbol_len];
        for (j, &coeff) in row.iter().enumerate() {
            if coeff == 0 {
                continue;
            }
            for b in 0..symbol_len {
                out[b] ^= self.gf.mul(coeff, src_blocks[j][b]);
            }
        }
        Ok(out)
    }

    /// Reconstruct missing source blocks given `blocks[0..n)` (data first,
    /// then parity) and an erasure bitmap of the same length, in place.
    /// `blocks[i]` for `erased[i] == true` may be `None`; reconstructed
    /// blocks are written back into those slots. Requires at least `k` of
    /// the `n` positions present.
    pub fn decode_parity_inline(
        &self,
        blocks: &mut [Option<Vec<u8>>],
        erased: &[bool],
    ) -> Result<()> {
        self.reconstruct(blocks, erased)
    }

    /// Same reconstruction, used when the caller's parity blocks are laid
    /// out appended after the data group (RXW's per-group parity set)
    /// rather than interleaved in the transmit ring; by the time either
    /// entry point is called the caller has normalized into one `n`-length
    /// array, so the math is identical.
    pub fn decode_parity_appended(
        &self,
        blocks: &mut [Option<Vec<u8>>],
        erased: &[bool],
    ) -> Result<()> {
        self.reconstruct(blocks, erased)
    }

    fn reconstruct(&self, blocks: &mut [Option<Vec<u8>>], erased: &[bool]) -> Result<()> {
        if blocks.len() != self.n || erased.len() != self.n {
            return Err(PgmError::Config(
                "decode: blocks/erasure bitmap length must equal n".into(),
            ));
        }
        for (i, e) in erased.iter().enumerate() {
            if *e != blocks[i].is_none() {
                return Err(PgmError::Config(
                    "decode: erasure bitmap inconsistent with block presence".into(),
                ));
            }
        }
        let present: Vec<usize> = (0..self.n).filter(|&i| !erased[i]).collect();
        if present.len() < self.k {
            return Err(PgmError::FecInsufficient);
        }
        if (0..self.k).all(|i| !erased[i]) {
            return Ok(()); // no data block missing, nothing to reconstruct
        }

        let symbol_len = present
            .iter()
            .find_map(|&i| blocks[i].as_ref().map(|b| b.len()))
            .unwrap_or(0);

        let chosen = &present[..self.k];
        let submatrix: Vec<Vec<u8>> = chosen.iter().map(|&i| self.enc_matrix[i].clone()).collect();
        let inv = invert(&self.gf, &submatrix)?;

        // recovered[j] = sum_i inv[j][i] * received[chosen[i]]
        let mut recovered: Vec<Vec<u8>> = vec![vec![0u8; symbol_len]; self.k];
        for (j, recovered_row) in recovered.iter_mut().enumerate() {
            for (i, &src_idx) in chosen.iter().enumerate() {
                let coeff = inv[j][i];
                if coeff == 0 {
                    continue;
                }
                let block = blocks[src_idx].as_ref().expect("present block");
                for b in 0..symbol_len {
                    recovered_row[b] ^= self.gf.mul(coeff, block[b]);
                }
            }
        }

        for i in 0..self.k {
            if erased[i] {
                blocks[i] = Some(recovered[i].clone());
            }
        }
        Ok(())
    }
}

fn build_vandermonde(gf: &GfTables, n: usize, k: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            let x = gf.exp_of(i);
            (0..k).map(|j| gf.pow(x, j as u32)).collect()
        })
        .collect()
}

fn matmul(gf: &GfTables, a: &[Vec<u8>], b: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let rows = a.len();
    let inner = b.len();
    let cols = b[0].len();
    let mut out = vec![vec![0u8; cols]; rows];
    for (r, out_row) in out.iter_mut().enumerate() {
        for (c, out_cell) in out_row.iter_mut().enumerate() {
            let mut acc = 0u8;
            for t in 0..inner {
                acc ^= gf.mul(a[r][t], b[t][c]);
            }
            *out_cell = acc;
        }
    }
    out
}

/// Gauss-Jordan inversion of a square matrix over GF(2^8).
fn invert(gf: &GfTables, m: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
    let n = m.len();
    let mut aug: Vec<Vec<u8>> = m
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.resize(2 * n, 0);
            r[n + i] = 1;
            r
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n).find(|&r| aug[r][col] != 0).ok_or_else(|| {
            PgmError::Config("RS decode matrix is singular for this erasure pattern".into())
        })?;
        aug.swap(col, pivot_row);

        let pivot_inv = gf.inv(aug[col][col]);
        for cell in aug[col].iter_mut() {
            *cell = gf.mul(*cell, pivot_inv);
        }

        for r in 0..n {
            if r == col || aug[r][col] == 0 {
                continue;
            }
            let factor = aug[r][col];
            for c in 0..2 * n {
                aug[r][c] ^= gf.mul(factor, aug[col][c]);
            }
        }
    }

    Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}
