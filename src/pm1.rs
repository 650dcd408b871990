//! The P-1 factoring driver.
//!
//! Stage 1 raises 3 to the powersmooth exponent
//! `K = 256 * E * prod(primorial(B1^(1/k)))` by an MSB-first
//! square-and-multiply loop, then dispatches `gcd(3^K - 1, M(E))` to a
//! worker thread. Stage 2 covers every prime in `(B1, B2]` through the
//! pair identity `x^2 - y^2 = (x - y)(x + y)`: with `x = base^((30030*B)^2)`
//! and `y = base^(j^2)`, the product accumulator picks up the factor
//! whenever `30030*B - j` or `30030*B + j` divides the group order. The
//! needed powers advance through quadratic exponent progressions (the
//! squaring sets), two multiplies per step.

use std::time::Instant;

use num_bigint::BigUint;
use tracing::{info, warn};

use crate::checkpoint::{self, P1State, P2State};
use crate::engine::{Buffer, Engine};
use crate::gcd::{gcd_factor, GcdTask};
use crate::{report, Args, Error, Ibdwt, StopToken};

pub mod plan;

// ======================================================================
// CONST - PRIVATE

/// Wall-clock interval between stage-1 saves.
const SAVE_SECS: u64 = 300;

/// Cap on stage-2 offset buffers, half the J-set.
const MAX_BUFS: usize = plan::JSET_SIZE / 2;

// ======================================================================
// FUNCTIONS - PRIVATE - powersmooth

fn primorial(p: u32) -> BigUint {
    let mut result = BigUint::from(1u32);
    for q in plan::primes_in(2, p) {
        result *= q;
    }
    result
}

/// `256 * e * prod(primorial(b1^(1/k)))` for `k = log2(b1) .. 1`.
fn power_smooth(e: u32, b1: u32) -> BigUint {
    let mut a = BigUint::from(e) * 256u32;
    let mut k = (b1 as f64).log2() as i32;
    while k >= 1 {
        a *= primorial((b1 as f64).powf(1.0 / f64::from(k)) as u32);
        k -= 1;
    }
    a
}

/// Most-significant-bit-first bit sequence of the powersmooth exponent.
fn power_smooth_bits_msb(e: u32, b1: u32) -> Vec<bool> {
    let a = power_smooth(e, b1);
    let n_bits = a.bits();
    (0..n_bits).rev().map(|i| a.bit(i)).collect()
}

// ======================================================================
// SquaringSet - PRIVATE

/// A geometric progression over a quadratic exponent sequence: `C`
/// holds `base^(f(i))` for a degree-2 polynomial `f`; one step advances
/// `C *= B; B *= A`. All three buffers are in low position.
struct SquaringSet {
    a: Buffer<f64>,
    b: Buffer<f64>,
    c: Buffer<f64>,
}

impl SquaringSet {
    fn alloc<E: Engine>(gpu: &Ibdwt<E>, name: &str) -> SquaringSet {
        SquaringSet {
            a: gpu.alloc_work(&format!("{}:A", name)),
            b: gpu.alloc_work(&format!("{}:B", name)),
            c: gpu.alloc_work(&format!("{}:C", name)),
        }
    }

    fn init<E: Engine>(
        gpu: &mut Ibdwt<E>,
        base: &Buffer<f64>,
        tmp: &mut Buffer<f64>,
        exponents: [u64; 3],
        name: &str,
    ) -> SquaringSet {
        let mut set = SquaringSet::alloc(gpu, name);
        gpu.exponentiate(base, exponents[0], tmp, &mut set.c);
        gpu.exponentiate(base, exponents[1], tmp, &mut set.b);
        if exponents[2] == exponents[1] {
            gpu.queue().copy_from_to(&set.b, &mut set.a);
        } else {
            gpu.exponentiate(base, exponents[2], tmp, &mut set.a);
        }
        set
    }

    fn copy_from<E: Engine>(&mut self, gpu: &Ibdwt<E>, rhs: &SquaringSet) {
        gpu.queue().copy_from_to(&rhs.a, &mut self.a);
        gpu.queue().copy_from_to(&rhs.b, &mut self.b);
        gpu.queue().copy_from_to(&rhs.c, &mut self.c);
    }

    fn step<E: Engine>(&mut self, gpu: &mut Ibdwt<E>, tmp: &mut Buffer<f64>) {
        gpu.multiply_low(&self.b, tmp, &mut self.c);
        gpu.multiply_low(&self.a, tmp, &mut self.b);
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Runs P-1 with bounds `(b1, b2]` for `gpu`'s exponent. Returns the
/// factor found, if any. Stage state is checkpointed under `args.dir`
/// and removed on completion.
pub fn factor_pm1<E: Engine>(
    gpu: &mut Ibdwt<E>,
    args: &Args,
    b1: u32,
    b2: u32,
    stop: &StopToken,
) -> Result<Option<String>, Error> {
    assert!(b1 >= 13 && b2 >= b1);
    let e = gpu.exponent();
    let n = gpu.fft_size() as usize;

    // The stage-2 sweep sizes its buffer pool from the allocation
    // budget; the host reference engine reports no free memory.
    if args.max_alloc_mb == 0 {
        return Err(Error::MaxAllocRequired);
    }

    let bits = power_smooth_bits_msb(e, b1);
    let k_end = bits.len() as u32;
    assert!(bits[0] && !bits[k_end as usize - 1]);

    let mut buf_tmp = gpu.alloc_work("tmp");
    let mut buf_aux = gpu.alloc_work("aux");
    let mut buf_data = gpu.alloc_words("data");

    // --- Stage 1 ---

    let k_begin = {
        let loaded = P1State::load(&args.dir, e, b1)?;
        if loaded.k > 0 && loaded.n_bits != k_end {
            return Err(Error::CheckpointFormat {
                path: format!("{}.p1", e),
                reason: "powersmooth bit count mismatch".to_string(),
            });
        }
        gpu.write_words(&loaded.data, &mut buf_data);
        loaded.k
    };

    info!(
        "{} P1 B1={}, B2={}; {} bits; starting at {}",
        e, b1, b2, k_end, k_begin
    );

    let mut stats = crate::engine::TimeInfo::default();
    let mut timer = Instant::now();
    let mut save_timer = Instant::now();

    let mut lead_in = true;
    for k in k_begin..k_end - 1 {
        let is_at_end = k == k_end - 2;
        let do_log = (k + 1) % 10000 == 0;
        let do_stop = stop.is_requested();
        let do_save = do_stop || save_timer.elapsed().as_secs() > SAVE_SECS || is_at_end;

        let lead_out = gpu.uses_long_carry() || do_log || do_save;
        gpu.core_step(
            lead_in,
            lead_out,
            bits[k as usize],
            &mut buf_aux,
            &mut buf_tmp,
            &mut buf_data,
        );
        lead_in = lead_out;

        if (k + 1) % 100 == 0 || do_log || do_save {
            gpu.queue().finish();
            stats.add(timer.elapsed().as_secs_f64(), (k + 1) - (k / 100) * 100);
            timer = Instant::now();
            if do_log {
                info!(
                    "{}",
                    report::log_line(
                        e,
                        "P1",
                        k + 1,
                        gpu.residue(&buf_data),
                        stats.total / f64::from(stats.n),
                        k_end
                    )
                );
                stats.clear();
                gpu.log_time_kernels();
            }
            if do_save {
                P1State {
                    e,
                    b1,
                    k: k + 1,
                    n_bits: k_end,
                    data: gpu.read_words(&buf_data),
                }
                .save(&args.dir)?;
                save_timer = Instant::now();
                if do_stop {
                    return Err(Error::StopRequested);
                }
            }
        }
    }

    // Final squaring, split so the pre-carry transform state seeds the
    // stage-2 accumulator.
    if lead_in {
        gpu.engine.fft_p(&gpu.queue, &buf_data, &mut buf_aux);
    }
    gpu.t_w(&buf_aux, &mut buf_tmp);
    gpu.engine.tail_fused(&gpu.queue, &mut buf_tmp);
    gpu.t_h(&buf_tmp, &mut buf_aux);

    let mut buf_acc = gpu.alloc_work("acc");
    gpu.queue().copy_from_to(&buf_aux, &mut buf_acc);

    gpu.engine.fft_w(&gpu.queue, &mut buf_aux);
    gpu.engine
        .carry_a(&gpu.queue, &buf_aux, &mut buf_data, &mut gpu.buf_carry);
    gpu.engine
        .carry_b(&gpu.queue, &mut buf_data, &mut gpu.buf_carry);

    let mut begin_pos = 0u32;
    {
        let loaded = P2State::load(&args.dir, e, b1, b2)?;
        if loaded.k > 0 {
            if loaded.raw.len() != n {
                return Err(Error::CheckpointFormat {
                    path: format!("{}.p2", e),
                    reason: format!("want {} words, file has {}", n, loaded.raw.len()),
                });
            }
            begin_pos = loaded.k;
            gpu.queue().write(&mut buf_acc, &loaded.raw);
            info!("{} P2 B1={}, B2={}, starting at {}", e, b1, b2, begin_pos);
        }
    }

    let mut gcd_task: Option<GcdTask> = None;
    if begin_pos == 0 {
        gcd_task = Some(GcdTask::spawn(e, gpu.read_words(&buf_data), 1));
        info!(
            "{}",
            report::log_line(e, "P1", k_end, gpu.residue(&buf_data), 0.0, k_end)
        );
    }

    // --- Stage 2 ---

    let pm1_plan = plan::make_plan(b1, b2);
    let mut stage2_data: Vec<u32> = Vec::new();

    if pm1_plan.n_primes > 0 {
        let mut buf_base = gpu.alloc_work("base");
        gpu.engine.fft_p(&gpu.queue, &buf_data, &mut buf_aux);
        gpu.t_w(&buf_aux, &mut buf_base);
        gpu.engine.fft_h(&gpu.queue, &mut buf_base);

        let start_block = pm1_plan.start_block;
        let n_blocks = pm1_plan.selected.len() as u32;
        info!(
            "{} P2 using blocks [{} - {}] to cover {} primes",
            e,
            start_block,
            start_block + n_blocks - 1,
            pm1_plan.n_primes
        );

        // Aux := base^(stride^2).
        gpu.exponentiate(
            &buf_base,
            u64::from(plan::BLOCK) * u64::from(plan::BLOCK),
            &mut buf_tmp,
            &mut buf_aux,
        );

        let jset = plan::jset();
        let begin_j = u64::from(jset[begin_pos as usize]);
        let mut little = SquaringSet::init(
            gpu,
            &buf_base,
            &mut buf_tmp,
            [begin_j * begin_j, 4 * (begin_j + 1), 8],
            "little",
        );
        let big_start = SquaringSet::init(
            gpu,
            &buf_aux,
            &mut buf_tmp,
            [
                u64::from(start_block) * u64::from(start_block),
                2 * u64::from(start_block) + 1,
                2,
            ],
            "bigStart",
        );
        let mut big = SquaringSet::alloc(gpu, "big");

        let n_bufs = MAX_BUFS
            .min((u64::from(args.max_alloc_mb) << 20) as usize / (n * 8))
            .min(plan::JSET_SIZE);
        if n_bufs == 0 {
            warn!("{} P2 not enough memory, waiting for stage-1 GCD", e);
        } else {
            info!(
                "{} P2 using {} buffers of {:.1} MB each",
                e,
                n_bufs,
                n as f64 * 8.0 / (1024.0 * 1024.0)
            );
            let mut block_bufs: Vec<Buffer<f64>> = (0..n_bufs)
                .map(|i| Buffer::new(&format!("pm1Block{}", i), n))
                .collect();

            let mut prev_j = jset[begin_pos as usize];
            let mut pos = begin_pos as usize;
            'sweep: while pos < plan::JSET_SIZE {
                let group_timer = Instant::now();
                let n_used = n_bufs.min(plan::JSET_SIZE - pos);
                for i in 0..n_used {
                    let delta = jset[pos + i] - prev_j;
                    prev_j = jset[pos + i];
                    assert!(delta % 2 == 0);
                    for _ in 0..delta / 2 {
                        little.step(gpu, &mut buf_tmp);
                    }
                    gpu.queue().copy_from_to(&little.c, &mut block_bufs[i]);
                }
                gpu.queue().finish();
                let init_secs = group_timer.elapsed().as_secs_f64();

                let mut n_selected = 0u32;
                let mut first = true;
                for selected in &pm1_plan.selected {
                    if first {
                        big.copy_from(gpu, &big_start);
                        first = false;
                    } else {
                        big.step(gpu, &mut buf_tmp);
                    }
                    for (i, buf) in block_bufs[..n_used].iter().enumerate() {
                        if selected.contains(pos + i) {
                            n_selected += 1;
                            gpu.engine
                                .carry_fused(&gpu.queue, &mut buf_acc, &mut gpu.buf_carry);
                            gpu.t_w(&buf_acc, &mut buf_tmp);
                            gpu.engine
                                .tail_fused_mul_delta(&gpu.queue, &mut buf_tmp, &big.c, buf);
                            gpu.t_h(&buf_tmp, &mut buf_acc);
                        }
                    }
                    gpu.queue().finish();
                }

                pos += n_bufs;
                if pos < plan::JSET_SIZE {
                    P2State {
                        e,
                        b1,
                        b2,
                        k: pos as u32,
                        raw: gpu.queue().read(&buf_acc, 0),
                    }
                    .save(&args.dir)?;
                }

                info!(
                    "{} P2 {:4}/{}: setup {:4} ms; {} pairs",
                    e,
                    pos.min(plan::JSET_SIZE),
                    plan::JSET_SIZE,
                    (init_secs * 1000.0 + 0.5) as u64,
                    n_selected
                );
                gpu.log_time_kernels();

                if let Some(task) = gcd_task.as_mut() {
                    if let Some(result) = task.try_result() {
                        gcd_task = None;
                        info!(
                            "{} P1 GCD: {}",
                            e,
                            result.as_deref().unwrap_or("no factor")
                        );
                        if let Some(factor) = result {
                            checkpoint::remove_pm1(&args.dir, e);
                            return Ok(Some(factor));
                        }
                    }
                }
                if stop.is_requested() {
                    break 'sweep;
                }
            }

            gpu.engine.fft_w(&gpu.queue, &mut buf_acc);
            gpu.engine
                .carry_a(&gpu.queue, &buf_acc, &mut buf_data, &mut gpu.buf_carry);
            gpu.engine
                .carry_b(&gpu.queue, &mut buf_data, &mut gpu.buf_carry);
            stage2_data = gpu.read_words(&buf_data);
        }
    }

    if let Some(task) = gcd_task.take() {
        let result = task.wait();
        info!("{} P1 GCD: {}", e, result.as_deref().unwrap_or("no factor"));
        if let Some(factor) = result {
            checkpoint::remove_pm1(&args.dir, e);
            return Ok(Some(factor));
        }
    }

    if stop.is_requested() {
        return Err(Error::StopRequested);
    }

    // The pair terms vanish mod a found factor, so the accumulator
    // itself shares it; no subtraction here (unlike the stage-1 GCD).
    let result = if stage2_data.is_empty() {
        None
    } else {
        gcd_factor(e, &stage2_data, 0)
    };
    if let Some(factor) = &result {
        info!("{} P2 factor: {}", e, factor);
    } else {
        info!("{} P2 no factor", e);
    }
    checkpoint::remove_pm1(&args.dir, e);
    Ok(result)
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Cpu;
    use crate::fft::FftConfig;
    use num_integer::Integer;
    use num_traits::{One, Zero};

    fn test_args(max_alloc_mb: u32) -> (Args, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            max_alloc_mb,
            dir: dir.path().to_path_buf(),
            ..Args::default()
        };
        (args, dir)
    }

    #[test]
    fn power_smooth_shape() {
        let a = power_smooth(997, 1000);
        assert_eq!(a.bits(), 1456);
        // Divisible by 256, the exponent, and small primorials.
        assert!((&a % 256u32).is_zero());
        assert!((&a % 997u32).is_zero());
        assert!((&a % (2u32 * 3 * 5 * 7 * 11)).is_zero());

        let bits = power_smooth_bits_msb(997, 1000);
        assert_eq!(bits.len(), 1456);
        assert!(bits[0]);
        assert!(!bits[bits.len() - 1]);
    }

    #[test]
    fn requires_max_alloc() {
        let (args, _dir) = test_args(0);
        let config = FftConfig::new(8, 4).unwrap();
        let mut gpu = Ibdwt::<Cpu>::with_config(881, config, &args).unwrap();
        match factor_pm1(&mut gpu, &args, 100, 300, &StopToken::new()) {
            Err(Error::MaxAllocRequired) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn stage1_finds_factor_of_m881() {
        // 26431 = 2 * 881 * 15 + 1 with 15 = 3 * 5 smooth below B1.
        let (args, _dir) = test_args(16);
        let config = FftConfig::new(8, 4).unwrap();
        let mut gpu = Ibdwt::<Cpu>::with_config(881, config, &args).unwrap();
        let factor = factor_pm1(&mut gpu, &args, 100, 100, &StopToken::new()).unwrap();
        assert_eq!(factor, Some("26431".to_string()));
    }

    #[test]
    fn stage1_resumes_after_stop() {
        let (args, _dir) = test_args(16);
        let config = FftConfig::new(8, 4).unwrap();
        let mut gpu = Ibdwt::<Cpu>::with_config(881, config, &args).unwrap();

        let stop = StopToken::new();
        stop.request_stop();
        match factor_pm1(&mut gpu, &args, 100, 100, &stop) {
            Err(Error::StopRequested) => {}
            other => panic!("unexpected: {:?}", other),
        }
        let saved = P1State::load(&args.dir, 881, 100).unwrap();
        assert_eq!(saved.k, 1);

        let factor = factor_pm1(&mut gpu, &args, 100, 100, &StopToken::new()).unwrap();
        assert_eq!(factor, Some("26431".to_string()));
    }

    #[test]
    fn stage2_finds_factor_of_m449() {
        // 1256303 = 2 * 449 * 1399 + 1: the prime 1399 lies between the
        // bounds, so only the stage-2 sweep can reach it.
        let (args, _dir) = test_args(16);
        let config = FftConfig::new(4, 4).unwrap();
        let mut gpu = Ibdwt::<Cpu>::with_config(449, config, &args).unwrap();
        let factor = factor_pm1(&mut gpu, &args, 1000, 10000, &StopToken::new()).unwrap();

        assert_eq!(factor, Some("1256303".to_string()));

        // Independent verification: the factor divides M(449).
        let q: BigUint = "1256303".parse().unwrap();
        let mp = crate::words::mersenne(449);
        assert!((&mp % &q).is_zero());
        assert!(q.gcd(&mp) > BigUint::one());
    }
}
