//! Stage-2 prime cover.
//!
//! Stage 2 sweeps blocks of stride `13 * D = 30030` with offsets drawn
//! from the J-set, the 2880 integers in `[1, 15015]` coprime to 30030.
//! An odd prime `p > 13` is coprime to 30030 while block centers are
//! multiples of it, so `p = 30030 * B - j` or `p = 30030 * B + j` for
//! exactly one `(B, j)` with `j` in the J-set: each prime has a unique
//! cover, and one selected pair covers both `30030 * B - j` and
//! `30030 * B + j` when both are targets.

use fixedbitset::FixedBitSet;
use num_integer::Integer;
use once_cell::sync::Lazy;

// ======================================================================
// CONST - PUBLIC

/// The primorial `2 * 3 * 5 * 7 * 11`.
pub const D: u32 = 2310;

/// Stage-2 block stride, `13 * D`.
pub const BLOCK: u32 = 13 * D;

/// Half the block stride; the largest J-set offset is `BLOCK/2 - 2`.
pub const HALF_BLOCK: u32 = BLOCK / 2;

/// Number of J-set elements.
pub const JSET_SIZE: usize = 2880;

// ======================================================================
// STATIC - PRIVATE

static JSET: Lazy<Vec<u32>> = Lazy::new(|| {
    let jset: Vec<u32> = (1..=HALF_BLOCK).filter(|j| j.gcd(&BLOCK) == 1).collect();
    assert_eq!(jset.len(), JSET_SIZE);
    jset
});

// ======================================================================
// FUNCTIONS - PUBLIC

/// The J-set, ascending.
pub fn jset() -> &'static [u32] {
    &JSET
}

/// Primes in `[lo, hi]` by plain sieve.
pub fn primes_in(lo: u32, hi: u32) -> Vec<u32> {
    let mut primes = Vec::new();
    if hi < 2 {
        return primes;
    }
    let n = hi as usize + 1;
    let mut composite = FixedBitSet::with_capacity(n);
    for p in 2..n {
        if !composite.contains(p) {
            if p as u32 >= lo {
                primes.push(p as u32);
            }
            let mut m = p * p;
            while m < n {
                composite.insert(m);
                m += p;
            }
        }
    }
    primes
}

// ======================================================================
// Pm1Plan - PUBLIC

/// The sparse prime-pair cover for one `(B1, B2]` range.
pub struct Pm1Plan {
    /// First block; may be 0 when the range starts below `HALF_BLOCK`.
    pub start_block: u32,
    /// Number of primes covered.
    pub n_primes: u32,
    /// Per block, the J-set positions needed; `selected[i]` belongs to
    /// block `start_block + i`.
    pub selected: Vec<FixedBitSet>,
}

/// Builds the cover of all primes in `(b1, b2]`. Requires `b1 >= 13` so
/// every target prime is coprime to the block stride.
pub fn make_plan(b1: u32, b2: u32) -> Pm1Plan {
    assert!(b1 >= 13 && b2 >= b1);

    let primes = primes_in(b1 + 1, b2);
    if primes.is_empty() {
        return Pm1Plan {
            start_block: 0,
            n_primes: 0,
            selected: Vec::new(),
        };
    }

    let mut pos_of_j = vec![usize::MAX; HALF_BLOCK as usize + 1];
    for (pos, &j) in jset().iter().enumerate() {
        pos_of_j[j as usize] = pos;
    }

    let block_of = |p: u32| (p + HALF_BLOCK) / BLOCK;
    let start_block = block_of(primes[0]);
    let n_blocks = block_of(*primes.last().unwrap()) - start_block + 1;

    let mut selected = vec![FixedBitSet::with_capacity(JSET_SIZE); n_blocks as usize];
    for &p in &primes {
        let block = block_of(p);
        let j = (i64::from(p) - i64::from(block) * i64::from(BLOCK)).unsigned_abs() as usize;
        let pos = pos_of_j[j];
        assert!(pos != usize::MAX, "prime {} has no J-set cover", p);
        selected[(block - start_block) as usize].insert(pos);
    }

    Pm1Plan {
        start_block,
        n_primes: primes.len() as u32,
        selected,
    }
}

// ======================================================================
// TESTS
