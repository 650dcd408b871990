//! Low-level compute layer: the kernel-set contract and its host
//! reference implementation.
//!
//! An [`Engine`] is the fixed set of kernels the transform orchestration
//! is built from. The kernels and their contracts mirror the GPU compute
//! program; [`Cpu`] executes them on host buffers and is the engine used
//! by default. An OpenCL-backed engine implements the same trait and
//! plugs into [`Ibdwt`] unchanged.
//!
//! # Buffer states
//!
//! A work buffer of N doubles passes through these states during one
//! squaring (`C = N/2` complex values, viewed as an `H x W` matrix of
//! rows during the width stages and `W x H` during the height stages):
//!
//! 1. *width rows*, after [`Engine::fft_p`] (or [`Engine::fft_w`] on
//!    the way back): each length-W row transformed.
//! 2. *height rows*, after [`Engine::transpose_w`]: twiddled transpose.
//! 3. *low position*, after [`Engine::fft_h`]: the full forward
//!    transform; pointwise kernels operate here. Buffers passed across
//!    function boundaries (`exponentiate`, the stage-2 squaring sets)
//!    are in this state.
//!
//! The same `fft_w`/`fft_h` kernels serve both directions: the pointwise
//! kernels and [`Engine::transpose_h`] write through index-reversed maps,
//! which turns the second forward pass into the inverse transform, with
//! the scaling absorbed in the inverse weights.
//!
//! [`Ibdwt`]: crate::Ibdwt

use std::ops::{Add, Mul, Neg, Sub};

use crate::fft::FftConfig;
use crate::Error;

pub use self::engine_cpu::Cpu;
pub use self::queue::{Buffer, Profile, Queue, TimeInfo};

mod engine_cpu;
pub mod queue;
pub mod tables;

// ======================================================================
// CONST - PUBLIC

/// Smallest usable word size; below this the transform is oversized for
/// the exponent.
pub const MIN_BITS_PER_WORD: f64 = 1.5;

/// Largest usable word size; above this the convolution overflows the
/// double mantissa.
pub const MAX_BITS_PER_WORD: f64 = 20.0;

/// Below this word size the short (fused) carry leaves too little
/// headroom and long carries are forced.
pub const LONG_CARRY_BITS: f64 = 14.5;

// ======================================================================
// Complex - PUBLIC

/// One complex point of a work buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Complex {
    /// Real part.
    pub re: f64,
    /// Imaginary part.
    pub im: f64,
}

impl Complex {
    /// Zero.
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    /// Creates a complex value.
    #[inline(always)]
    pub fn new(re: f64, im: f64) -> Complex {
        Complex { re, im }
    }

    /// Complex conjugate.
    #[inline(always)]
    pub fn conj(self) -> Complex {
        Complex::new(self.re, -self.im)
    }

    /// Multiplication by `i`.
    #[inline(always)]
    pub fn mul_i(self) -> Complex {
        Complex::new(-self.im, self.re)
    }
}

impl Add for Complex {
    type Output = Complex;
    #[inline(always)]
    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Complex;
    #[inline(always)]
    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Complex;
    #[inline(always)]
    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl Neg for Complex {
    type Output = Complex;
    #[inline(always)]
    fn neg(self) -> Complex {
        Complex::new(-self.re, -self.im)
    }
}

// ======================================================================
// Plan - PUBLIC

/// A validated transform plan for one exponent.
#[derive(Clone, Copy, Debug)]
pub struct Plan {
    /// The Mersenne exponent under test.
    pub e: u32,
    /// Transform configuration.
    pub config: FftConfig,
    /// Number of balanced words, `2 * width * height * middle`.
    pub n: u32,
}

impl Plan {
    /// Validates `config` against exponent `e`.
    pub fn new(e: u32, config: FftConfig) -> Result<Plan, Error> {
        let n = 2 * config.fft_size();
        let bits_per_word = f64::from(e) / f64::from(n);
        if bits_per_word > MAX_BITS_PER_WORD {
            return Err(Error::FftSizeTooSmall { e, n, bits_per_word });
        }
        if bits_per_word < MIN_BITS_PER_WORD {
            return Err(Error::FftSizeTooLarge { e, n, bits_per_word });
        }
        Ok(Plan { e, config, n })
    }

    /// Average word size in bits.
    pub fn bits_per_word(&self) -> f64 {
        f64::from(self.e) / f64::from(self.n)
    }
}

// ======================================================================
// Engine - PUBLIC

/// The kernel set of the transform.
///
/// Kernels are submitted through a [`Queue`] and are strictly ordered by
/// submission. Word buffers hold N balanced `i32` words in natural
/// order; work buffers hold N doubles (N/2 complex points); the carry
/// buffer holds one `i64` slot per complex point.
pub trait Engine
where
    Self: Sized,
{
    // ============================================================
    // REQUIRED

    /// Creates the engine for a plan, building all tables it needs.
    fn new(plan: &Plan) -> Self;

    /// Weighted forward width stage: reads the word buffer, applies the
    /// direct weights, and transforms each width row.
    fn fft_p(&self, queue: &Queue, words: &Buffer<i32>, out: &mut Buffer<f64>);

    /// Width sub-FFT on each row. Used on the inverse path and inside
    /// the fused carry.
    fn fft_w(&self, queue: &Queue, io: &mut Buffer<f64>);

    /// Height sub-FFT on each row. Serves both directions.
    fn fft_h(&self, queue: &Queue, io: &mut Buffer<f64>);

    /// Twiddled transpose, width rows to height rows.
    fn transpose_w(&self, queue: &Queue, input: &Buffer<f64>, out: &mut Buffer<f64>);

    /// Twiddled transpose, height rows back to width rows, writing
    /// through the index-reversed map of the inverse path.
    fn transpose_h(&self, queue: &Queue, input: &Buffer<f64>, out: &mut Buffer<f64>);

    /// Pointwise square in low position.
    fn square(&self, queue: &Queue, io: &mut Buffer<f64>);

    /// Pointwise multiply in low position: `io *= b`.
    fn multiply(&self, queue: &Queue, io: &mut Buffer<f64>, b: &Buffer<f64>);

    /// Pointwise multiply by a difference, in low position:
    /// `io *= (a - b)`.
    fn multiply_delta(
        &self,
        queue: &Queue,
        io: &mut Buffer<f64>,
        a: &Buffer<f64>,
        b: &Buffer<f64>,
    );

    /// Carry stage A: unweight, round to integer words, propagate
    /// carries within each word pair, park the inter-pair carries in
    /// `carry`.
    fn carry_a(
        &self,
        queue: &Queue,
        input: &Buffer<f64>,
        io: &mut Buffer<i32>,
        carry: &mut Buffer<i64>,
    );

    /// Carry stage A with multiplication by 3 before the carry split.
    fn carry_m(
        &self,
        queue: &Queue,
        input: &Buffer<f64>,
        io: &mut Buffer<i32>,
        carry: &mut Buffer<i64>,
    );

    /// Carry stage B: applies the parked inter-pair carries, wrapping
    /// the ring (the carry out of the top word folds onto word 0, since
    /// `2^E == 1`).
    fn carry_b(&self, queue: &Queue, io: &mut Buffer<i32>, carry: &mut Buffer<i64>);

    /// Fused carry: rounds and carries in the transform domain and
    /// feeds the result directly into the next forward width stage,
    /// skipping the round trip through the word buffer.
    fn carry_fused(&self, queue: &Queue, io: &mut Buffer<f64>, carry: &mut Buffer<i64>);

    /// Fused carry with multiplication by 3.
    fn carry_fused_mul(&self, queue: &Queue, io: &mut Buffer<f64>, carry: &mut Buffer<i64>);

    // ============================================================
    // PROVIDED

    /// The tail of the cycle: height transform, pointwise square,
    /// height transform back. `io` is in the height-rows state.
    fn tail_fused(&self, queue: &Queue, io: &mut Buffer<f64>) {
        self.fft_h(queue, io);
        self.square(queue, io);
        self.fft_h(queue, io);
    }

    /// Tail computing `(a - b) * io` instead of a square; `a` and `b`
    /// are in low position. Covers the `(x - y)(x + y)` pair identity of
    /// the stage-2 sweep with one multiply.
    fn tail_fused_mul_delta(
        &self,
        queue: &Queue,
        io: &mut Buffer<f64>,
        a: &Buffer<f64>,
        b: &Buffer<f64>,
    ) {
        self.fft_h(queue, io);
        self.multiply_delta(queue, io, a, b);
        self.fft_h(queue, io);
    }
}

// ======================================================================
// TESTS

// Engines are exercised end-to-end through the `Ibdwt` tests; the
// complex and plan helpers are tested here.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_ops() {
        let a = Complex::new(1.0, 2.0);
        let b = Complex::new(3.0, -1.0);
        assert_eq!(a + b, Complex::new(4.0, 1.0));
        assert_eq!(a - b, Complex::new(-2.0, 3.0));
        assert_eq!(a * b, Complex::new(5.0, 5.0));
        assert_eq!(a.conj(), Complex::new(1.0, -2.0));
        assert_eq!(a.mul_i(), Complex::new(-2.0, 1.0));
        assert_eq!(-a, Complex::new(-1.0, -2.0));
    }

    #[test]
    fn plan_validates_word_size() {
        let tiny = FftConfig::new(4, 4).unwrap();
        assert!(Plan::new(449, tiny).is_ok());

        // 20 bits/word exceeded.
        match Plan::new(1000, tiny) {
            Err(Error::FftSizeTooSmall { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // Below 1.5 bits/word.
        let big = FftConfig::new(256, 256).unwrap();
        match Plan::new(127, big) {
            Err(Error::FftSizeTooLarge { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
