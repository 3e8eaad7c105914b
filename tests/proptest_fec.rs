//! Property-based tests for the Reed-Solomon FEC codec.
//!
//! Verifies spec §8 property 3: any `h` losses out of a `k+h` transmission
//! group are reconstructible from the remaining `k` blocks, across varied
//! group sizes, loss patterns, and symbol lengths.

use pgm_core::codec::RsCodec;
use proptest::prelude::*;

/// Smallest power-of-two `k` in `[2,128]` with room for at least one
/// parity symbol (`k+1 <= 255`), derived from an arbitrary `u32` seed.
fn k_strategy() -> impl Strategy<Value = usize> {
    (1u32..=7).prop_map(|shift| 1usize << shift) // 2,4,...,128
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Losing up to `h` of the `k+h` blocks in a group must always
    /// reconstruct every lost data block exactly, regardless of which
    /// positions are lost.
    #[test]
    fn reconstructs_any_erasure_pattern_up_to_h_losses(
        k in k_strategy(),
        h in 1usize..8,
        symbol_len in 1usize..=128,
        seed in any::<u64>(),
        loss_seed in any::<u64>(),
    ) {
        let n = (k + h).min(255);
        let h = n - k;
        prop_assume!(n > k);

        let codec = RsCodec::new(n, k).unwrap();
        let source: Vec<Vec<u8>> = (0..k)
            .map(|i| {
                (0..symbol_len)
                    .map(|j| ((i as u64).wrapping_mul(97).wrapping_add(j as u64).wrapping_add(seed)) as u8)
                    .collect()
            })
            .collect();
        let refs: Vec<&[u8]> = source.iter().map(|b| b.as_slice()).collect();

        let mut blocks: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
        for p in 0..h {
            blocks.push(Some(codec.encode(&refs, p).unwrap()));
        }

        // Erase a pseudo-random up-to-h subset of the n positions.
        let mut order: Vec<usize> = (0..n).collect();
        let mut x = loss_seed | 1;
        for i in (1..n).rev() {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            let j = (x >> 33) as usize % (i + 1);
            order.swap(i, j);
        }
        let losses = h.min(n - k);
        let erased_positions: std::collections::HashSet<usize> = order[..losses].iter().copied().collect();

        let mut erased = vec![false; n];
        for &pos in &erased_positions {
            erased[pos] = true;
            blocks[pos] = None;
        }

        codec.decode_parity_inline(&mut blocks, &erased).unwrap();

        for i in 0..k {
            prop_assert_eq!(blocks[i].as_deref(), Some(source[i].as_slice()));
        }
    }

    /// More than `h` losses must surface `FecInsufficient` rather than
    /// silently returning wrong data.
    #[test]
    fn insufficient_blocks_reports_an_error_not_garbage(
        k in k_strategy(),
        h in 1usize..8,
        symbol_len in 1usize..=64,
        seed in any::<u64>(),
    ) {
        let n = (k + h).min(255);
        let h = n - k;
        prop_assume!(n > k && h > 0);

        let codec = RsCodec::new(n, k).unwrap();
        let source: Vec<Vec<u8>> = (0..k)
            .map(|i| vec![((i as u64).wrapping_add(seed)) as u8; symbol_len])
            .collect();
        let refs: Vec<&[u8]> = source.iter().map(|b| b.as_slice()).collect();

        let mut blocks: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
        for p in 0..h {
            blocks.push(Some(codec.encode(&refs, p).unwrap()));
        }

        // Erase one more than the codec can tolerate.
        let mut erased = vec![false; n];
        for i in 0..(h + 1) {
            erased[i] = true;
            blocks[i] = None;
        }

        prop_assert!(codec.decode_parity_inline(&mut blocks, &erased).is_err());
    }
}

#[test]
fn construction_rejects_non_power_of_two_k() {
    assert!(RsCodec::new(255, 223).is_err());
    assert!(RsCodec::new(10, 8).is_ok());
}

#[test]
fn construction_rejects_n_out_of_range() {
    assert!(RsCodec::new(8, 8).is_err()); // n must exceed k
    assert!(RsCodec::new(300, 8).is_err()); // n must be <= 255
}
