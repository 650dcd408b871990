//! Precomputed tables used by [`Engine`]s.
//!
//! All tables are derived from the plan `(E, N)` and are immutable for
//! its lifetime:
//!
//! | Table         | Size       | Used by |
//! | ------------- | ---------- | ------- |
//! | `a_tab`       | N doubles  | weighted forward transform |
//! | `i_tab`       | N doubles  | carry kernels (unweight + inverse scale) |
//! | `big_word`    | N bits     | carry kernels, word codec |
//! | `small_trig`  | size cplx  | width/height sub-FFTs |
//!
//! [`Engine`]: crate::engine::Engine

use fixedbitset::FixedBitSet;

use crate::engine::Complex;
use crate::words;

// ======================================================================
// FUNCTIONS - PUBLIC - trigonometry

/// The primitive root of unity of order `n`, to the power `k`:
/// `e^(-2*pi*i*k/n)`.
pub fn root1(n: u32, k: u32) -> Complex {
    let k = k % n;
    let angle = -2.0 * std::f64::consts::PI * f64::from(k) / f64::from(n);
    Complex::new(angle.cos(), angle.sin())
}

fn small_trig_block(w: u32, h: u32, tab: &mut Vec<Complex>) {
    for line in 1..h {
        for col in 0..w {
            tab.push(root1(w * h, line * col));
        }
    }
}

/// Sub-FFT twiddle table in recursive block layout: for each level
/// `w = radix, radix^2, ...` below `size`, a block of
/// `root1(w * h, line * col)` values with `h = min(radix, size / w)`.
///
/// With radix 2 the block at offset `m` holds `root1(2m, col)` for
/// `col < m`, the classic iterated decimation-in-time layout.
pub fn small_trig(size: u32, radix: u32) -> Vec<Complex> {
    let mut tab = vec![Complex::ZERO; radix as usize];
    let mut w = radix;
    while w < size {
        small_trig_block(w, radix.min(size / w), &mut tab);
        w *= radix;
    }
    assert_eq!(tab.len(), size as usize);
    tab
}

// ======================================================================
// Weights - PUBLIC

/// Per-index direct and inverse IBDWT weights plus the big-word map.
pub struct Weights {
    /// Direct weights, `2^(extra(N,E,k)/N)`.
    pub a_tab: Vec<f64>,
    /// Inverse weights, `1 / (4*N*a)`; the `4N` absorbs the unnormalized
    /// inverse transform.
    pub i_tab: Vec<f64>,
    /// Bit `k` set iff word `k` carries `E/N + 1` bits.
    pub big_word: FixedBitSet,
}

/// Direct weight of word `k`.
pub fn weight(n: u32, e: u32, k: u32) -> f64 {
    (f64::from(words::extra(n, e, k)) / f64::from(n)).exp2()
}

/// Inverse weight of word `k`, without the transform scale.
pub fn inv_weight(n: u32, e: u32, k: u32) -> f64 {
    (-f64::from(words::extra(n, e, k)) / f64::from(n)).exp2()
}

/// Generates the weight tables for a plan.
pub fn gen_weights(n: u32, e: u32) -> Weights {
    let mut a_tab = Vec::with_capacity(n as usize);
    let mut i_tab = Vec::with_capacity(n as usize);
    let mut big_word = FixedBitSet::with_capacity(n as usize);

    for k in 0..n {
        let a = weight(n, e, k);
        a_tab.push(a);
        i_tab.push(1.0 / (4.0 * f64::from(n) * a));
        big_word.set(k as usize, words::is_big_word(n, e, k));
    }

    Weights {
        a_tab,
        i_tab,
        big_word,
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_product_identity() {
        // sum(a[k] * i[k]) * 4N == N exactly up to round-off.
        for &(n, e) in &[(64u32, 127u32), (128, 241), (256, 521), (1024, 13007)] {
            let w = gen_weights(n, e);
            let sum: f64 = (0..n as usize).map(|k| w.a_tab[k] * w.i_tab[k]).sum();
            let got = sum * 4.0 * f64::from(n);
            assert!(
                (got - f64::from(n)).abs() < 1e-10,
                "n={} e={} got={}",
                n,
                e,
                got
            );
        }
    }

    #[test]
    fn weights_are_in_range() {
        let (n, e) = (128u32, 521u32);
        let w = gen_weights(n, e);
        assert_eq!(w.a_tab[0], 1.0);
        assert_eq!(w.i_tab[0], 1.0 / (4.0 * f64::from(n)));
        for k in 0..n as usize {
            assert!(w.a_tab[k] >= 1.0 && w.a_tab[k] < 2.0);
        }
    }

    #[test]
    fn direct_and_inverse_weights_cancel() {
        let (n, e) = (128u32, 521u32);
        for k in [0u32, 1, 17, 127] {
            let prod = weight(n, e, k) * inv_weight(n, e, k);
            assert!((prod - 1.0).abs() < 1e-14);
        }
    }

    #[test]
    fn big_word_bits_match_word_geometry() {
        let (n, e) = (256u32, 1279u32);
        let w = gen_weights(n, e);
        assert_eq!(w.big_word.count_ones(..) as u32, e % n);
        for k in 0..n {
            assert_eq!(w.big_word.contains(k as usize), words::is_big_word(n, e, k));
        }
    }

    #[test]
    fn root1_basics() {
        let one = root1(8, 0);
        assert_eq!((one.re, one.im), (1.0, 0.0));
        let minus_i = root1(4, 1);
        assert!(minus_i.re.abs() < 1e-15 && (minus_i.im + 1.0).abs() < 1e-15);
        // Wraps mod n.
        let w = root1(16, 19);
        let expect = root1(16, 3);
        assert!((w.re - expect.re).abs() < 1e-15 && (w.im - expect.im).abs() < 1e-15);
    }

    #[test]
    fn small_trig_radix2_layout() {
        let trig = small_trig(16, 2);
        assert_eq!(trig.len(), 16);
        // Block at offset m holds root1(2m, col).
        for m in [2u32, 4, 8] {
            for col in 0..m {
                let t = trig[(m + col) as usize];
                let expect = root1(2 * m, col);
                assert!((t.re - expect.re).abs() < 1e-15);
                assert!((t.im - expect.im).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn small_trig_radix4_layout() {
        let trig = small_trig(16, 4);
        assert_eq!(trig.len(), 16);
        // Single block (w=4, h=4) of root1(16, line*col) at offset 4.
        for line in 1..4u32 {
            for col in 0..4u32 {
                let t = trig[(4 * line + col) as usize];
                let expect = root1(16, line * col);
                assert!((t.re - expect.re).abs() < 1e-15);
                assert!((t.im - expect.im).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn unit_modulus() {
        for t in small_trig(64, 2).iter().skip(2) {
            assert!((t.re * t.re + t.im * t.im - 1.0).abs() < 1e-12);
        }
    }
}
