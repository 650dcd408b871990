use crate::engine::{
    tables::{self, Weights},
    Buffer, Complex, Engine, Plan, Queue,
};

// ======================================================================
// HELPERS - PRIVATE

#[inline(always)]
fn ld(buf: &[f64], i: usize) -> Complex {
    Complex::new(buf[2 * i], buf[2 * i + 1])
}

#[inline(always)]
fn st(buf: &mut [f64], i: usize, z: Complex) {
    buf[2 * i] = z.re;
    buf[2 * i + 1] = z.im;
}

/// In-place radix-2 DIT transform of one row of `len` complex points
/// starting at complex index `base`. Consumes the radix-2
/// [`tables::small_trig`] layout: the stage-`m` twiddle for butterfly
/// `t` is `trig[m + t]`.
fn fft_row(buf: &mut [f64], base: usize, len: usize, trig: &[Complex]) {
    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..len {
        let mut bit = len >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            let a = ld(buf, base + i);
            let b = ld(buf, base + j);
            st(buf, base + i, b);
            st(buf, base + j, a);
        }
    }

    let mut m = 1usize;
    while m < len {
        let mut r = 0usize;
        while r < len {
            for t in 0..m {
                let tw = if m == 1 { None } else { Some(trig[m + t]) };
                let u = ld(buf, base + r + t);
                let mut v = ld(buf, base + r + t + m);
                if let Some(tw) = tw {
                    v = v * tw;
                }
                st(buf, base + r + t, u + v);
                st(buf, base + r + t + m, u - v);
            }
            r += 2 * m;
        }
        m *= 2;
    }
}

// ======================================================================
// Cpu - PUBLIC

/// Host reference implementation of [`Engine`].
///
/// Executes every kernel on host memory, one kernel at a time, in
/// submission order. Useful to study the kernel contracts, to verify a
/// device engine against, and to run the drivers without a GPU.
pub struct Cpu {
    n: usize,
    c: usize,
    w: usize,
    h: usize,
    weights: Weights,
    bit_len: Vec<u32>,
    trig_w: Vec<Complex>,
    trig_h: Vec<Complex>,
    /// `root1(C, j2*k1)` at `[j2*W + k1]`, applied by the transposes.
    big_trig: Vec<Complex>,
    /// `root1(N, k)` for `k <= C`, the real-packing twist.
    square_trig: Vec<Complex>,
    /// Slot of complex word `j` (and, by the same formula, the slot
    /// holding spectral index `k` after the forward height stage).
    cross: Vec<usize>,
    /// Slot the pointwise kernels write spectral index `k` to; the
    /// height-index reversal that turns the next forward pass into the
    /// inverse transform.
    cross_rev: Vec<usize>,
}

impl Cpu {
    fn spectrum(&self, z: &[Complex]) -> Vec<Complex> {
        // Hermitian split, scale 2: X[k] = (Z[k] + conj(Z[C-k])) +
        // root1(N,k) * -i*(Z[k] - conj(Z[C-k])), for k = 0..=C.
        let c = self.c;
        let mut x = Vec::with_capacity(c + 1);
        for k in 0..c {
            let zk = z[k];
            let zc = z[(c - k) % c].conj();
            let e = zk + zc;
            let o = -((zk - zc).mul_i());
            x.push(e + self.square_trig[k] * o);
        }
        let z0 = z[0];
        let e0 = z0 + z0.conj();
        let o0 = -((z0 - z0.conj()).mul_i());
        x.push(e0 - o0);
        x
    }

    fn merge(&self, y: &[Complex], out: &mut [f64]) {
        // Inverse of the split, scale 2, written through the reversed
        // map so the following forward height pass computes the inverse.
        let c = self.c;
        for k in 0..c {
            let yk = y[k];
            let yc = y[c - k].conj();
            let ep = yk + yc;
            let op = (yk - yc) * self.square_trig[k].conj();
            st(out, self.cross_rev[k], ep + op.mul_i());
        }
    }

    fn load_low(&self, buf: &[f64]) -> Vec<Complex> {
        (0..self.c).map(|k| ld(buf, self.cross[k])).collect()
    }

    fn rows_w(&self, queue: &Queue, name: &str, io: &mut Buffer<f64>) {
        let (w, h) = (self.w, self.h);
        let trig = &self.trig_w;
        let buf = io.as_mut_slice();
        queue.run(name, || {
            for row in 0..h {
                fft_row(buf, row * w, w, trig);
            }
        });
    }

    /// Rounds and carries all words of a work buffer in place, using
    /// the carry buffer as the inter-pair shuttle; re-weights on the
    /// way out.
    fn carry_in_place(&self, buf: &mut [f64], carry: &mut [i64], mul3: bool) {
        let (n, c) = (self.n, self.c);
        let mut words = vec![0i64; n];

        for s in 0..c {
            let j = self.cross[s];
            let v0 = buf[2 * s] * self.weights.i_tab[2 * j];
            let v1 = buf[2 * s + 1] * self.weights.i_tab[2 * j + 1];
            let mut w0 = v0.round_ties_even() as i64;
            let mut w1 = v1.round_ties_even() as i64;
            if mul3 {
                w0 *= 3;
                w1 *= 3;
            }
            let mut pair_carry = 0i64;
            words[2 * j] = self.split(2 * j, w0, &mut pair_carry);
            words[2 * j + 1] = self.split(2 * j + 1, w1 + pair_carry, &mut pair_carry);
            carry[j] = pair_carry;
        }

        for j in 0..c {
            let mut ca = carry[j];
            carry[j] = 0;
            let mut k = (2 * (j + 1)) % n;
            while ca != 0 {
                let t = words[k] + ca;
                words[k] = self.split(k, t, &mut ca);
                k = (k + 1) % n;
            }
        }

        for s in 0..c {
            let j = self.cross[s];
            buf[2 * s] = words[2 * j] as f64 * self.weights.a_tab[2 * j];
            buf[2 * s + 1] = words[2 * j + 1] as f64 * self.weights.a_tab[2 * j + 1];
        }
    }

    /// Splits `t` into a balanced word of index `k` plus outgoing carry.
    #[inline(always)]
    fn split(&self, k: usize, t: i64, carry: &mut i64) -> i64 {
        let bits = self.bit_len[k];
        let c = (t + (1i64 << (bits - 1))) >> bits;
        *carry = c;
        t - (c << bits)
    }

    fn carry_stage_a(
        &self,
        input: &[f64],
        io: &mut [i32],
        carry: &mut [i64],
        mul3: bool,
    ) {
        for s in 0..self.c {
            let j = self.cross[s];
            let v0 = input[2 * s] * self.weights.i_tab[2 * j];
            let v1 = input[2 * s + 1] * self.weights.i_tab[2 * j + 1];
            let mut w0 = v0.round_ties_even() as i64;
            let mut w1 = v1.round_ties_even() as i64;
            if mul3 {
                w0 *= 3;
                w1 *= 3;
            }
            let mut pair_carry = 0i64;
            io[2 * j] = self.split(2 * j, w0, &mut pair_carry) as i32;
            io[2 * j + 1] = self.split(2 * j + 1, w1 + pair_carry, &mut pair_carry) as i32;
            carry[j] = pair_carry;
        }
    }
}

impl Engine for Cpu {
    fn new(plan: &Plan) -> Cpu {
        let e = plan.e;
        let n = plan.n as usize;
        let c = n / 2;
        let w = plan.config.width as usize;
        let h = (plan.config.height * plan.config.middle) as usize;
        assert_eq!(c, w * h);

        let weights = tables::gen_weights(plan.n, e);
        let bit_len = (0..plan.n).map(|k| crate::words::bit_len(plan.n, e, k)).collect();

        let mut big_trig = Vec::with_capacity(c);
        for j2 in 0..h {
            for k1 in 0..w {
                big_trig.push(tables::root1(c as u32, ((j2 * k1) % c) as u32));
            }
        }

        let square_trig = (0..=c)
            .map(|k| tables::root1(n as u32, k as u32))
            .collect();

        let cross = (0..c).map(|x| (x % w) * h + x / w).collect();
        let cross_rev = (0..c)
            .map(|k| (k % w) * h + (h - k / w) % h)
            .collect();

        Cpu {
            n,
            c,
            w,
            h,
            weights,
            bit_len,
            trig_w: tables::small_trig(w as u32, 2),
            trig_h: tables::small_trig(h as u32, 2),
            big_trig,
            square_trig,
            cross,
            cross_rev,
        }
    }

    fn fft_p(&self, queue: &Queue, words: &Buffer<i32>, out: &mut Buffer<f64>) {
        let (c, w, h) = (self.c, self.w, self.h);
        let words = words.as_slice();
        let buf = out.as_mut_slice();
        queue.run("fftP", || {
            for s in 0..c {
                let j = self.cross[s];
                buf[2 * s] = f64::from(words[2 * j]) * self.weights.a_tab[2 * j];
                buf[2 * s + 1] = f64::from(words[2 * j + 1]) * self.weights.a_tab[2 * j + 1];
            }
            for row in 0..h {
                fft_row(buf, row * w, w, &self.trig_w);
            }
        });
    }

    fn fft_w(&self, queue: &Queue, io: &mut Buffer<f64>) {
        self.rows_w(queue, "fftW", io);
    }

    fn fft_h(&self, queue: &Queue, io: &mut Buffer<f64>) {
        let (w, h) = (self.w, self.h);
        let trig = &self.trig_h;
        let buf = io.as_mut_slice();
        queue.run("fftH", || {
            for row in 0..w {
                fft_row(buf, row * h, h, trig);
            }
        });
    }

    fn transpose_w(&self, queue: &Queue, input: &Buffer<f64>, out: &mut Buffer<f64>) {
        let (w, h) = (self.w, self.h);
        let src = input.as_slice();
        let dst = out.as_mut_slice();
        queue.run("transposeW", || {
            for j2 in 0..h {
                for k1 in 0..w {
                    let z = ld(src, j2 * w + k1) * self.big_trig[j2 * w + k1];
                    st(dst, k1 * h + j2, z);
                }
            }
        });
    }

    fn transpose_h(&self, queue: &Queue, input: &Buffer<f64>, out: &mut Buffer<f64>) {
        let (w, h) = (self.w, self.h);
        let src = input.as_slice();
        let dst = out.as_mut_slice();
        queue.run("transposeH", || {
            for k1 in 0..w {
                for j2 in 0..h {
                    let z = ld(src, k1 * h + j2) * self.big_trig[j2 * w + k1].conj();
                    st(dst, j2 * w + (w - k1) % w, z);
                }
            }
        });
    }

    fn square(&self, queue: &Queue, io: &mut Buffer<f64>) {
        queue.run("square", || {
            let z = self.load_low(io.as_slice());
            let x = self.spectrum(&z);
            let y: Vec<Complex> = x.iter().map(|&v| v * v).collect();
            self.merge(&y, io.as_mut_slice());
        });
    }

    fn multiply(&self, queue: &Queue, io: &mut Buffer<f64>, b: &Buffer<f64>) {
        queue.run("multiply", || {
            let za = self.load_low(io.as_slice());
            let zb = self.load_low(b.as_slice());
            let xa = self.spectrum(&za);
            let xb = self.spectrum(&zb);
            let y: Vec<Complex> = xa.iter().zip(&xb).map(|(&a, &b)| a * b).collect();
            self.merge(&y, io.as_mut_slice());
        });
    }

    fn multiply_delta(
        &self,
        queue: &Queue,
        io: &mut Buffer<f64>,
        a: &Buffer<f64>,
        b: &Buffer<f64>,
    ) {
        queue.run("multiplyDelta", || {
            let zt = self.load_low(io.as_slice());
            let za = self.load_low(a.as_slice());
            let zb = self.load_low(b.as_slice());
            let zd: Vec<Complex> = za.iter().zip(&zb).map(|(&x, &y)| x - y).collect();
            let xt = self.spectrum(&zt);
            let xd = self.spectrum(&zd);
            let y: Vec<Complex> = xt.iter().zip(&xd).map(|(&a, &b)| a * b).collect();
            self.merge(&y, io.as_mut_slice());
        });
    }

    fn carry_a(
        &self,
        queue: &Queue,
        input: &Buffer<f64>,
        io: &mut Buffer<i32>,
        carry: &mut Buffer<i64>,
    ) {
        let src = input.as_slice();
        let dst = io.as_mut_slice();
        let carry = carry.as_mut_slice();
        queue.run("carryA", || self.carry_stage_a(src, dst, carry, false));
    }

    fn carry_m(
        &self,
        queue: &Queue,
        input: &Buffer<f64>,
        io: &mut Buffer<i32>,
        carry: &mut Buffer<i64>,
    ) {
        let src = input.as_slice();
        let dst = io.as_mut_slice();
        let carry = carry.as_mut_slice();
        queue.run("carryM", || self.carry_stage_a(src, dst, carry, true));
    }

    fn carry_b(&self, queue: &Queue, io: &mut Buffer<i32>, carry: &mut Buffer<i64>) {
        let (n, c) = (self.n, self.c);
        let words = io.as_mut_slice();
        let carry = carry.as_mut_slice();
        queue.run("carryB", || {
            for j in 0..c {
                let mut ca = carry[j];
                carry[j] = 0;
                let mut k = (2 * (j + 1)) % n;
                while ca != 0 {
                    let t = i64::from(words[k]) + ca;
                    words[k] = self.split(k, t, &mut ca) as i32;
                    k = (k + 1) % n;
                }
            }
        });
    }

    fn carry_fused(&self, queue: &Queue, io: &mut Buffer<f64>, carry: &mut Buffer<i64>) {
        let buf = io.as_mut_slice();
        let carry = carry.as_mut_slice();
        queue.run("carryFused", || {
            for row in 0..self.h {
                fft_row(buf, row * self.w, self.w, &self.trig_w);
            }
            self.carry_in_place(buf, carry, false);
            for row in 0..self.h {
                fft_row(buf, row * self.w, self.w, &self.trig_w);
            }
        });
    }

    fn carry_fused_mul(&self, queue: &Queue, io: &mut Buffer<f64>, carry: &mut Buffer<i64>) {
        let buf = io.as_mut_slice();
        let carry = carry.as_mut_slice();
        queue.run("carryFusedMul", || {
            for row in 0..self.h {
                fft_row(buf, row * self.w, self.w, &self.trig_w);
            }
            self.carry_in_place(buf, carry, true);
            for row in 0..self.h {
                fft_row(buf, row * self.w, self.w, &self.trig_w);
            }
        });
    }
}

// ======================================================================
// TESTS

// The engine is exercised end-to-end (against big-integer reference
// arithmetic) in the `Ibdwt` tests; only the row transform is checked
// directly here.
