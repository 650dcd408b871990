//! Balanced-word representation of residues mod `2^E - 1`.
//!
//! A length-N vector of small signed words represents
//! `sum(w[k] * 2^offset(k))` where `offset(k) = ceil(E*k / N)`. Word `k`
//! carries `E/N` bits, or one more when the offset sequence jumps ("big"
//! word); after carry normalization each word lies in
//! `[-base/2, +base/2)` for its own base.
//!
//! This module converts between that form and the packed little-endian
//! u32 form used for checkpoints and host math, and computes the 64-bit
//! residues used in logs and reports.

use num_bigint::{BigInt, BigUint};
use num_traits::{Signed, Zero};

// ======================================================================
// FUNCTIONS - PUBLIC - word geometry

/// Fractional-weight numerator of word `k`: `offset(k) = (E*k + extra) / N`
/// and the IBDWT weight is `2^(extra/N)`.
#[inline]
pub fn extra(n: u32, e: u32, k: u32) -> u32 {
    (u64::from(n - e % n) * u64::from(k) % u64::from(n)) as u32
}

/// Whether word `k` carries `E/N + 1` bits. Exactly `E mod N` words of a
/// length-N vector are big.
#[inline]
pub fn is_big_word(n: u32, e: u32, k: u32) -> bool {
    extra(n, e, k) < e % n
}

/// Bit capacity of word `k`.
#[inline]
pub fn bit_len(n: u32, e: u32, k: u32) -> u32 {
    e / n + u32::from(is_big_word(n, e, k))
}

/// Bit offset of word `k`, `ceil(E*k / N)`.
#[inline]
pub fn bits_below(n: u32, e: u32, k: u32) -> u64 {
    (u64::from(e) * u64::from(k) + u64::from(extra(n, e, k))) / u64::from(n)
}

// ======================================================================
// FUNCTIONS - PUBLIC - packed <-> balanced

/// Number of u32 limbs in the packed form of an E-bit residue.
pub fn packed_len(e: u32) -> usize {
    ((e - 1) / 32 + 1) as usize
}

/// Expands a packed little-endian u32 residue into N balanced words.
pub fn expand_bits(packed: &[u32], n: u32, e: u32) -> Vec<i32> {
    assert_eq!(packed.len(), packed_len(e));
    let x = BigUint::from_slice(packed);

    let mut words = vec![0i32; n as usize];
    let mut carry = 0i64;
    for k in 0..n {
        let len = bit_len(n, e, k);
        let o = bits_below(n, e, k);
        let mut limb = 0u64;
        for bit in 0..len {
            if x.bit(o + u64::from(bit)) {
                limb |= 1 << bit;
            }
        }
        let base = 1i64 << len;
        let mut w = limb as i64 + carry;
        if w >= base / 2 {
            w -= base;
            carry = 1;
        } else {
            carry = 0;
        }
        words[k as usize] = w as i32;
    }
    // 2^E == 1, so the top carry folds into word 0.
    words[0] += carry as i32;
    words
}

/// Compacts N balanced words into the canonical packed u32 residue
/// in `[0, 2^E - 1)`.
pub fn compact_bits(words: &[i32], n: u32, e: u32) -> Vec<u32> {
    assert_eq!(words.len(), n as usize);
    let mut x = BigInt::zero();
    for k in 0..n {
        let w = words[k as usize];
        if w != 0 {
            x += BigInt::from(w) << bits_below(n, e, k);
        }
    }
    let mp = mersenne(e);
    let mp_signed = BigInt::from(mp.clone());
    x %= &mp_signed;
    if x.is_negative() {
        x += &mp_signed;
    }
    let mut out = x.to_biguint().unwrap().to_u32_digits();
    out.resize(packed_len(e), 0);
    out
}

/// `2^e - 1`.
pub fn mersenne(e: u32) -> BigUint {
    (BigUint::from(1u32) << e) - 1u32
}

// ======================================================================
// FUNCTIONS - PUBLIC - residues

/// Low 64 bits of a packed residue.
pub fn residue_from_compact(packed: &[u32]) -> u64 {
    u64::from(packed[0]) | (u64::from(*packed.get(1).unwrap_or(&0)) << 32)
}

/// Low 64 bits computed from the leading balanced words of a raw device
/// read. Only words below bit offset 64 can contribute (higher words
/// add multiples of 2^64, and their shifts would overflow the
/// accumulator); offsets grow monotonically, so the scan stops at the
/// first word past the boundary. 128 words always cover the low 64 bits
/// at the minimum 1.5 bits/word.
pub fn residue_from_raw(n: u32, e: u32, words: &[i32]) -> u64 {
    let mut sum = 0i128;
    for k in 0..n.min(128) {
        let off = bits_below(n, e, k);
        if off >= 64 {
            break;
        }
        let w = words[k as usize];
        if w != 0 {
            sum += i128::from(w) << off;
        }
    }
    sum as u64
}

// ======================================================================
// FUNCTIONS - PUBLIC - final-residue helpers

/// Whether a packed residue equals the integer 9.
pub fn equals_nine(packed: &[u32]) -> bool {
    packed[0] == 9 && packed[1..].iter().all(|&w| w == 0)
}

fn mod3(packed: &[u32]) -> u32 {
    // 2^32 % 3 == 1.
    let mut r = 0u32;
    for &w in packed {
        r += w % 3;
    }
    r % 3
}

fn div3(e: u32, packed: &mut [u32]) {
    let mut r = (3 - mod3(packed)) % 3;
    let top_bits = e % 32;
    assert!(top_bits > 0 && top_bits < 32);

    let last = packed.len() - 1;
    let w = (u64::from(r) << top_bits) + u64::from(packed[last]);
    packed[last] = (w / 3) as u32;
    r = (w % 3) as u32;

    for i in (0..last).rev() {
        let w = (u64::from(r) << 32) + u64::from(packed[i]);
        packed[i] = (w / 3) as u32;
        r = (w % 3) as u32;
    }
}

/// Divides a packed residue by 9 mod `2^e - 1`, in place.
pub fn div9(e: u32, packed: &mut [u32]) {
    div3(e, packed);
    div3(e, packed);
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_packed(e: u32, seed: u8) -> Vec<u32> {
        let mut rng = ChaCha8Rng::from_seed([seed; 32]);
        let mp = mersenne(e);
        loop {
            let mut packed: Vec<u32> = (0..packed_len(e)).map(|_| rng.gen()).collect();
            let top = e % 32;
            *packed.last_mut().unwrap() &= (1u32 << top) - 1;
            if BigUint::from_slice(&packed) < mp {
                return packed;
            }
        }
    }

    #[test]
    fn extra_starts_at_zero() {
        assert_eq!(extra(64, 127, 0), 0);
    }

    #[test]
    fn big_word_count_is_e_mod_n() {
        for &(n, e) in &[(64u32, 127u32), (128, 241), (256, 521), (1024, 13007)] {
            let count = (0..n).filter(|&k| is_big_word(n, e, k)).count() as u32;
            assert_eq!(count, e % n, "n={} e={}", n, e);
        }
    }

    #[test]
    fn bit_lens_sum_to_e() {
        for &(n, e) in &[(64u32, 127u32), (128, 241), (512, 1277)] {
            let total: u32 = (0..n).map(|k| bit_len(n, e, k)).sum();
            assert_eq!(total, e);
        }
    }

    #[test]
    fn offsets_match_bit_lens() {
        let (n, e) = (128u32, 521u32);
        for k in 0..n - 1 {
            assert_eq!(
                bits_below(n, e, k) + u64::from(bit_len(n, e, k)),
                bits_below(n, e, k + 1)
            );
        }
    }

    #[test]
    fn expand_compact_roundtrip() {
        for &(n, e) in &[(64u32, 127u32), (128, 241), (256, 521)] {
            for seed in 0..4 {
                let packed = random_packed(e, seed);
                let words = expand_bits(&packed, n, e);
                assert!(words
                    .iter()
                    .enumerate()
                    .all(|(k, &w)| i64::from(w).abs() <= 1i64 << bit_len(n, e, k as u32)));
                assert_eq!(compact_bits(&words, n, e), packed, "n={} e={}", n, e);
            }
        }
    }

    #[test]
    fn compact_of_small_value() {
        let (n, e) = (64u32, 127u32);
        let mut words = vec![0i32; n as usize];
        words[0] = 3;
        let packed = compact_bits(&words, n, e);
        assert_eq!(packed[0], 3);
        assert!(packed[1..].iter().all(|&w| w == 0));
    }

    #[test]
    fn negative_words_wrap_to_canonical() {
        let (n, e) = (64u32, 127u32);
        let mut words = vec![0i32; n as usize];
        words[0] = -1;
        let packed = compact_bits(&words, n, e);
        // -1 == 2^127 - 2 mod M(127).
        let x = BigUint::from_slice(&packed);
        assert_eq!(x, mersenne(e) - 2u32);
    }

    #[test]
    fn residue_of_compact() {
        assert_eq!(residue_from_compact(&[9, 0, 0, 0]), 9);
        assert_eq!(
            residue_from_compact(&[0xdead_beef, 0x1234_5678, 7]),
            0x1234_5678_dead_beef
        );
    }

    #[test]
    fn raw_residue_of_small_values() {
        let (n, e) = (128u32, 521u32);
        for x in [9u64, 1, 0x1234_5678_9abc_def0] {
            let mut packed = vec![0u32; packed_len(e)];
            packed[0] = x as u32;
            packed[1] = (x >> 32) as u32;
            let words = expand_bits(&packed, n, e);
            assert_eq!(residue_from_raw(n, e, &words), x);
        }
    }

    #[test]
    fn raw_residue_wraps_negative_sums() {
        let (n, e) = (64u32, 127u32);
        let mut words = vec![0i32; n as usize];
        words[0] = -1;
        assert_eq!(residue_from_raw(n, e, &words), u64::MAX);
    }

    #[test]
    fn raw_residue_ignores_words_past_the_low_bits() {
        use num_traits::ToPrimitive;

        // Random residues fill words at offsets far beyond 128 bits;
        // the reference below sums every word at full width.
        for &(n, e) in &[(128u32, 521u32), (1024, 13007)] {
            for seed in 20..23 {
                let packed = random_packed(e, seed);
                let words = expand_bits(&packed, n, e);
                assert!((0..n)
                    .any(|k| bits_below(n, e, k) >= 128 && words[k as usize] != 0));

                let mut v = BigInt::zero();
                for (k, &w) in words.iter().enumerate() {
                    if w != 0 {
                        v += BigInt::from(w) << bits_below(n, e, k as u32);
                    }
                }
                let m = BigInt::from(1u128 << 64);
                let expect = (((v % &m) + &m) % &m).to_u64().unwrap();
                assert_eq!(residue_from_raw(n, e, &words), expect, "n={} e={}", n, e);
            }
        }
    }

    #[test]
    fn raw_residue_with_only_a_high_word_set() {
        // Production scale: word 100 sits at bit offset 763. Its value
        // must not fold into the low bits (the unchecked shift used to
        // overflow the accumulator here).
        let (n, e) = (131072u32, 1_000_003u32);
        let o = bits_below(n, e, 100);
        assert_eq!(o, 763);

        let mut packed = vec![0u32; packed_len(e)];
        packed[(o / 32) as usize] |= 3 << (o % 32);
        let words = expand_bits(&packed, n, e);
        assert_eq!(words[100], 3);
        assert!(words
            .iter()
            .enumerate()
            .all(|(k, &w)| k == 100 || w == 0));

        assert_eq!(residue_from_raw(n, e, &words), 0);
    }

    #[test]
    fn equals_nine_and_div9() {
        let e = 127u32;
        let mut packed = vec![0u32; packed_len(e)];
        packed[0] = 9;
        assert!(equals_nine(&packed));
        div9(e, &mut packed);
        assert_eq!(packed[0], 1);
        assert!(packed[1..].iter().all(|&w| w == 0));

        packed[0] = 10;
        assert!(!equals_nine(&packed));
    }

    #[test]
    fn div9_is_multiplication_by_inverse() {
        let e = 241u32;
        let packed = random_packed(e, 77);
        let mut out = packed.clone();
        div9(e, &mut out);
        let mp = mersenne(e);
        let got = BigUint::from_slice(&out);
        assert_eq!((got * 9u32) % &mp, BigUint::from_slice(&packed) % &mp);
    }
}
