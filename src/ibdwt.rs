//! Transform orchestration: composes kernel invocations into modular
//! squarings, multiplications and exponentiation mod `2^E - 1`.

use tracing::info;

use crate::engine::{Buffer, Engine, Plan, Queue};
use crate::fft::{self, FftConfig};
use crate::words;
use crate::{Args, CarryKind, Error};

// ======================================================================
// Ibdwt - PUBLIC

/// The transform engine for one exponent: owns the plan, the kernel
/// engine, the command queue and the carry buffer, and exposes the
/// modular operations the drivers are built from.
///
/// Word buffers and work buffers are allocated by the caller (see
/// [`alloc_words`] / [`alloc_work`]) and passed into each operation.
///
/// [`alloc_words`]: Ibdwt::alloc_words
/// [`alloc_work`]: Ibdwt::alloc_work
pub struct Ibdwt<E: Engine> {
    plan: Plan,
    use_long_carry: bool,
    pub(crate) engine: E,
    pub(crate) queue: Queue,
    pub(crate) buf_carry: Buffer<i64>,
}

impl<E: Engine> Ibdwt<E> {
    /// Creates the transform for exponent `e`, selecting a configuration
    /// from the registry using `args.fft_size` as hint.
    pub fn make(e: u32, args: &Args) -> Result<Ibdwt<E>, Error> {
        let configs = fft::gen_configs();
        let config = fft::choose(&configs, e, args.fft_size);
        Ibdwt::with_config(e, config, args)
    }

    /// Creates the transform for exponent `e` with an explicit
    /// configuration.
    pub fn with_config(e: u32, config: FftConfig, args: &Args) -> Result<Ibdwt<E>, Error> {
        let plan = Plan::new(e, config)?;
        let bits_per_word = plan.bits_per_word();

        let use_long_carry = bits_per_word < crate::engine::LONG_CARRY_BITS
            || args.carry == CarryKind::Long
            || (args.carry == CarryKind::Auto && config.width >= 2048);

        info!(
            "{} FFT {}: {} ({} words, {:.2} bits/word{})",
            e,
            fft::number_k(plan.n),
            config.spec(),
            plan.n,
            bits_per_word,
            if use_long_carry { ", long carry" } else { "" }
        );

        let engine = E::new(&plan);
        let queue = Queue::new(args.time_kernels);
        let buf_carry = Buffer::new("carry", plan.n as usize / 2);

        Ok(Ibdwt {
            plan,
            use_long_carry,
            engine,
            queue,
            buf_carry,
        })
    }

    /// The exponent under test.
    pub fn exponent(&self) -> u32 {
        self.plan.e
    }

    /// Transform length in balanced words.
    pub fn fft_size(&self) -> u32 {
        self.plan.n
    }

    /// Whether every iteration runs the long (unfused) carry.
    pub fn uses_long_carry(&self) -> bool {
        self.use_long_carry
    }

    /// The command queue, for fencing and reads.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Allocates a word buffer of N balanced words.
    pub fn alloc_words(&self, name: &str) -> Buffer<i32> {
        Buffer::new(name, self.plan.n as usize)
    }

    /// Allocates a work buffer of N doubles.
    pub fn alloc_work(&self, name: &str) -> Buffer<f64> {
        Buffer::new(name, self.plan.n as usize)
    }

    // ============================================================
    // word IO

    /// Writes a packed residue into a word buffer.
    pub fn write_words(&self, packed: &[u32], buf: &mut Buffer<i32>) {
        let expanded = words::expand_bits(packed, self.plan.n, self.plan.e);
        self.queue.write(buf, &expanded);
    }

    /// Reads a word buffer back as the canonical packed residue.
    pub fn read_words(&self, buf: &Buffer<i32>) -> Vec<u32> {
        let raw = self.queue.read(buf, 0);
        words::compact_bits(&raw, self.plan.n, self.plan.e)
    }

    /// The 64-bit residue of a word buffer, from a small leading read.
    pub fn residue(&self, buf: &Buffer<i32>) -> u64 {
        let raw = self.queue.read(buf, 128.min(self.plan.n as usize));
        words::residue_from_raw(self.plan.n, self.plan.e, &raw)
    }

    /// Whether two word buffers hold identical nonzero contents.
    pub fn equal_not_zero(&self, a: &Buffer<i32>, b: &Buffer<i32>) -> bool {
        let va = self.queue.read(a, 0);
        let vb = self.queue.read(b, 0);
        va == vb && va.iter().any(|&w| w != 0)
    }

    // ============================================================
    // modular operations

    /// One squaring step of `io`.
    ///
    /// `lead_in` must reflect whether the previous step left the work
    /// buffer in transform position (`lead_out == false`); the final
    /// step of any sequence must run with `lead_out == true` to leave
    /// `io` in balanced-word form. `mul3` additionally multiplies by 3.
    pub fn core_step(
        &mut self,
        lead_in: bool,
        lead_out: bool,
        mul3: bool,
        buf1: &mut Buffer<f64>,
        buf2: &mut Buffer<f64>,
        io: &mut Buffer<i32>,
    ) {
        if lead_in {
            self.engine.fft_p(&self.queue, io, buf1);
        }
        self.engine.transpose_w(&self.queue, buf1, buf2);
        self.engine.tail_fused(&self.queue, buf2);
        self.engine.transpose_h(&self.queue, buf2, buf1);

        if lead_out {
            self.engine.fft_w(&self.queue, buf1);
            if mul3 {
                self.engine.carry_m(&self.queue, buf1, io, &mut self.buf_carry);
            } else {
                self.engine.carry_a(&self.queue, buf1, io, &mut self.buf_carry);
            }
            self.engine.carry_b(&self.queue, io, &mut self.buf_carry);
        } else if mul3 {
            self.engine.carry_fused_mul(&self.queue, buf1, &mut self.buf_carry);
        } else {
            self.engine.carry_fused(&self.queue, buf1, &mut self.buf_carry);
        }
    }

    /// `reps` squarings of `io`; `mul3` applies to the last squaring
    /// only. Fused carries are used between iterations unless long
    /// carries are forced.
    pub fn mod_sq_loop(
        &mut self,
        reps: u32,
        mul3: bool,
        buf1: &mut Buffer<f64>,
        buf2: &mut Buffer<f64>,
        io: &mut Buffer<i32>,
    ) {
        assert!(reps > 0);
        let mut lead_in = true;
        for i in 0..reps {
            let lead_out = self.use_long_carry || i == reps - 1;
            self.core_step(lead_in, lead_out, mul3 && i == reps - 1, buf1, buf2, io);
            lead_in = lead_out;
        }
    }

    /// The modular multiplication `io *= input`, with optional extra
    /// multiplication by 3.
    pub fn mod_mul(
        &mut self,
        input: &Buffer<i32>,
        mul3: bool,
        buf1: &mut Buffer<f64>,
        buf2: &mut Buffer<f64>,
        buf3: &mut Buffer<f64>,
        io: &mut Buffer<i32>,
    ) {
        self.engine.fft_p(&self.queue, input, buf1);
        self.t_w(buf1, buf3);

        self.engine.fft_p(&self.queue, io, buf1);
        self.t_w(buf1, buf2);

        self.engine.fft_h(&self.queue, buf2);
        self.engine.fft_h(&self.queue, buf3);
        self.engine.multiply(&self.queue, buf2, buf3);
        self.engine.fft_h(&self.queue, buf2);

        self.t_h(buf2, buf1);

        self.engine.fft_w(&self.queue, buf1);
        if mul3 {
            self.engine.carry_m(&self.queue, buf1, io, &mut self.buf_carry);
        } else {
            self.engine.carry_a(&self.queue, buf1, io, &mut self.buf_carry);
        }
        self.engine.carry_b(&self.queue, io, &mut self.buf_carry);
    }

    /// `io *= input`, all buffers in low position.
    pub fn multiply_low(
        &mut self,
        input: &Buffer<f64>,
        tmp: &mut Buffer<f64>,
        io: &mut Buffer<f64>,
    ) {
        self.engine.multiply(&self.queue, io, input);
        self.engine.fft_h(&self.queue, io);
        self.t_h(io, tmp);
        self.engine.carry_fused(&self.queue, tmp, &mut self.buf_carry);
        self.t_w(tmp, io);
        self.engine.fft_h(&self.queue, io);
    }

    /// The top half of the cycle (excluding the bottom tail): carries
    /// `io` through the width stages and back to the height-rows state.
    pub fn top_half(&mut self, tmp: &mut Buffer<f64>, io: &mut Buffer<f64>) {
        self.t_h(io, tmp);
        self.engine.carry_fused(&self.queue, tmp, &mut self.buf_carry);
        self.t_w(tmp, io);
    }

    /// Left-to-right binary exponentiation: `out := base^exp`.
    ///
    /// `base` and `out` are in low position. For `exp == 0` the result
    /// is the transform of 1 and `base` is not read.
    pub fn exponentiate(
        &mut self,
        base: &Buffer<f64>,
        exp: u64,
        tmp: &mut Buffer<f64>,
        out: &mut Buffer<f64>,
    ) {
        if exp == 0 {
            let mut one = self.alloc_words("one");
            self.queue.write(&mut one, &[1]);
            self.engine.fft_p(&self.queue, &one, tmp);
            self.t_w(tmp, out);
        } else {
            self.queue.copy_from_to(base, out);
            if exp == 1 {
                return;
            }

            let mut p = 63;
            while (exp >> p) == 0 {
                p -= 1;
            }
            assert!(p >= 1);

            // Square from low position.
            self.engine.square(&self.queue, out);
            self.engine.fft_h(&self.queue, out);
            self.top_half(tmp, out);

            loop {
                p -= 1;
                if (exp >> p) & 1 != 0 {
                    self.engine.fft_h(&self.queue, out); // to low

                    self.engine.multiply(&self.queue, out, base);
                    self.engine.fft_h(&self.queue, out);
                    self.top_half(tmp, out);
                }
                if p == 0 {
                    break;
                }

                self.engine.tail_fused(&self.queue, out);
                self.top_half(tmp, out);
            }
        }

        self.engine.fft_h(&self.queue, out); // to low
    }

    /// Dumps and clears the per-kernel profile, when profiling.
    pub fn log_time_kernels(&self) {
        if !self.queue.is_profiling() {
            return;
        }
        let profile = self.queue.profile();
        let total: f64 = profile.iter().map(|(info, _)| info.total).sum();
        for (stats, name) in &profile {
            let percent = 100.0 / total * stats.total;
            if percent >= 0.01 {
                info!(
                    "{:5.2}% {:<14}: {:6.0} us/call x {:5} calls",
                    percent,
                    name,
                    stats.total * 1e6 / f64::from(stats.n),
                    stats.n
                );
            }
        }
        info!("Total time {:.3} s", total);
        self.queue.clear_profile();
    }

    // ============================================================
    // private

    pub(crate) fn t_w(&self, input: &Buffer<f64>, out: &mut Buffer<f64>) {
        self.engine.transpose_w(&self.queue, input, out);
    }

    pub(crate) fn t_h(&self, input: &Buffer<f64>, out: &mut Buffer<f64>) {
        self.engine.transpose_h(&self.queue, input, out);
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Cpu;
    use crate::test_util;
    use num_bigint::BigUint;

    fn make(e: u32, width: u32, height: u32) -> Ibdwt<Cpu> {
        let config = FftConfig::new(width, height).unwrap();
        Ibdwt::with_config(e, config, &Args::default()).unwrap()
    }

    #[test]
    fn write_read_roundtrip() {
        let gpu = make(521, 8, 16);
        let mut buf = gpu.alloc_words("data");
        for seed in 0..4 {
            let packed = test_util::random_packed(521, seed);
            gpu.write_words(&packed, &mut buf);
            assert_eq!(gpu.read_words(&buf), packed);
        }
    }

    #[test]
    fn squaring_chain_matches_reference() {
        for (e, w, h, iters) in [(127u32, 8u32, 4u32, 150u32), (521, 8, 16, 80), (241, 8, 8, 80)]
        {
            let mut gpu = make(e, w, h);
            let mut io = gpu.alloc_words("data");
            let mut buf1 = gpu.alloc_work("buf1");
            let mut buf2 = gpu.alloc_work("buf2");

            let mp = words::mersenne(e);
            let mut x = BigUint::from(3u32);
            gpu.write_words(&test_util::packed_from(&x, e), &mut io);

            for i in 0..iters {
                gpu.mod_sq_loop(1, false, &mut buf1, &mut buf2, &mut io);
                x = &x * &x % &mp;
                assert_eq!(
                    gpu.read_words(&io),
                    test_util::packed_from(&x, e),
                    "e={} iter={}",
                    e,
                    i
                );
            }
        }
    }

    #[test]
    fn multi_rep_loop_matches_single_steps() {
        // 17.2 bits/word: short carries, so the 25 squarings chain
        // through the fused kernel without touching the word buffer.
        let e = 2203;
        let mut gpu = make(e, 8, 8);
        assert!(!gpu.uses_long_carry());
        let mut io = gpu.alloc_words("data");
        let mut buf1 = gpu.alloc_work("buf1");
        let mut buf2 = gpu.alloc_work("buf2");

        let mp = words::mersenne(e);
        let mut x = BigUint::from(3u32);
        gpu.write_words(&test_util::packed_from(&x, e), &mut io);

        gpu.mod_sq_loop(25, false, &mut buf1, &mut buf2, &mut io);
        for _ in 0..25 {
            x = &x * &x % &mp;
        }
        assert_eq!(gpu.read_words(&io), test_util::packed_from(&x, e));
    }

    #[test]
    fn mul3_applies_to_last_iteration_only() {
        let e = 127;
        let mut gpu = make(e, 8, 4);
        let mut io = gpu.alloc_words("data");
        let mut buf1 = gpu.alloc_work("buf1");
        let mut buf2 = gpu.alloc_work("buf2");

        let mp = words::mersenne(e);
        let mut x = BigUint::from(3u32);
        gpu.write_words(&test_util::packed_from(&x, e), &mut io);

        gpu.mod_sq_loop(10, true, &mut buf1, &mut buf2, &mut io);
        for _ in 0..10 {
            x = &x * &x % &mp;
        }
        x = x * 3u32 % &mp;
        assert_eq!(gpu.read_words(&io), test_util::packed_from(&x, e));
    }

    #[test]
    fn mod_mul_matches_reference_and_commutes() {
        let e = 241;
        let mut gpu = make(e, 8, 8);
        let mut buf1 = gpu.alloc_work("buf1");
        let mut buf2 = gpu.alloc_work("buf2");
        let mut buf3 = gpu.alloc_work("buf3");

        let mp = words::mersenne(e);
        let a = BigUint::from_slice(&test_util::random_packed(e, 5)) % &mp;
        let b = BigUint::from_slice(&test_util::random_packed(e, 6)) % &mp;

        let mut io = gpu.alloc_words("io");
        let mut other = gpu.alloc_words("other");

        gpu.write_words(&test_util::packed_from(&a, e), &mut io);
        gpu.write_words(&test_util::packed_from(&b, e), &mut other);
        gpu.mod_mul(&other, false, &mut buf1, &mut buf2, &mut buf3, &mut io);
        let ab = gpu.read_words(&io);
        assert_eq!(ab, test_util::packed_from(&(&a * &b % &mp), e));

        // Deterministic kernels: b*a is bit-identical to a*b.
        gpu.write_words(&test_util::packed_from(&b, e), &mut io);
        gpu.write_words(&test_util::packed_from(&a, e), &mut other);
        gpu.mod_mul(&other, false, &mut buf1, &mut buf2, &mut buf3, &mut io);
        assert_eq!(gpu.read_words(&io), ab);
    }

    #[test]
    fn mod_mul_by_one_is_identity() {
        let e = 127;
        let mut gpu = make(e, 8, 4);
        let mut buf1 = gpu.alloc_work("buf1");
        let mut buf2 = gpu.alloc_work("buf2");
        let mut buf3 = gpu.alloc_work("buf3");

        let a = test_util::random_packed(e, 9);
        let mut io = gpu.alloc_words("io");
        let mut one = gpu.alloc_words("one");
        gpu.write_words(&a, &mut io);
        gpu.write_words(&[1u32, 0, 0, 0], &mut one);
        gpu.mod_mul(&one, false, &mut buf1, &mut buf2, &mut buf3, &mut io);
        assert_eq!(gpu.read_words(&io), a);
    }

    #[test]
    fn exponentiate_laws() {
        let e = 241;
        let mut gpu = make(e, 8, 8);
        let mut tmp = gpu.alloc_work("tmp");
        let mut base = gpu.alloc_work("base");
        let mut out = gpu.alloc_work("out");

        let mp = words::mersenne(e);
        let x = BigUint::from(12345u32);

        // Bring x into low position.
        let mut io = gpu.alloc_words("io");
        gpu.write_words(&test_util::packed_from(&x, e), &mut io);
        gpu.engine.fft_p(&gpu.queue, &io, &mut tmp);
        let mut t2 = gpu.alloc_work("t2");
        gpu.t_w(&tmp, &mut base);
        gpu.engine.fft_h(&gpu.queue, &mut base);

        for exp in [0u64, 1, 2, 3, 13, 0xDEAD] {
            gpu.exponentiate(&base, exp, &mut tmp, &mut out);
            let got = test_util::low_to_packed(&mut gpu, &out, &mut t2);
            let expect = x.modpow(&BigUint::from(exp), &mp);
            assert_eq!(got, test_util::packed_from(&expect, e), "exp={}", exp);
        }
    }
}
