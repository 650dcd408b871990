//! The PRP test driver.
//!
//! Runs E modular squarings of the seed 3 with the Gerbicz error check:
//! alongside the data vector D a check vector C accumulates `C *= D`
//! once per block of `block_size` squarings. Every `block_size^2`
//! iterations the invariant `C * D == 3 * C^(2^block_size)` is verified;
//! on failure the driver rolls back to the last good checkpoint. The
//! test reports PP when the final residue `3^(2^E)` equals 9.

use std::path::Path;
use std::time::Instant;

use tracing::info;

use crate::checkpoint::PrpState;
use crate::engine::{Buffer, Engine, TimeInfo};
use crate::{report, words, Args, Error, Ibdwt, StopToken};

// ======================================================================
// PrpResult - PUBLIC

/// Outcome of a completed PRP test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrpResult {
    /// Whether `M(E)` is a base-3 probable prime.
    pub is_prime: bool,
    /// The final residue after division by 9, truncated to 64 bits.
    pub res64: u64,
    /// Number of check failures seen over the whole run.
    pub n_errors: u32,
}

// ======================================================================
// HELPERS - PRIVATE

struct Timer(Instant);

impl Timer {
    fn new() -> Timer {
        Timer(Instant::now())
    }

    fn delta_secs(&mut self) -> f64 {
        let now = Instant::now();
        let delta = now.duration_since(self.0).as_secs_f64();
        self.0 = now;
        delta
    }
}

fn valid_block_size(block_size: u32) -> bool {
    // The doubling run-up needs an odd factor; powers of two leave it
    // with fewer than 2 blocks.
    block_size > 0 && 10000 % block_size == 0 && (block_size >> block_size.trailing_zeros()) > 1
}

/// The res64 recorded in checkpoints and logs. Computed from the
/// canonical packed form so it is independent of which balanced
/// representative the carry chain settled on; a raw small read could
/// disagree with itself across a save/reload.
fn data_res64<E: Engine>(gpu: &Ibdwt<E>, buf: &Buffer<i32>) -> u64 {
    words::residue_from_compact(&gpu.read_words(buf))
}

/// Seeds the data vector from a check vector: writes C to `buf_check`
/// and runs `buf_data` up to `D = 3 * C^(2^block_size - 1)` via a
/// power-of-two doubling ladder.
#[allow(clippy::too_many_arguments)]
fn write_state<E: Engine>(
    gpu: &mut Ibdwt<E>,
    check: &[u32],
    mut block_size: u32,
    buf1: &mut Buffer<f64>,
    buf2: &mut Buffer<f64>,
    buf3: &mut Buffer<f64>,
    buf_data: &mut Buffer<i32>,
    buf_check: &mut Buffer<i32>,
    buf_aux: &mut Buffer<i32>,
) {
    assert!(block_size > 0);

    gpu.write_words(check, buf_check);
    gpu.queue().copy_from_to(buf_check, buf_data);
    gpu.queue().copy_from_to(buf_check, buf_aux);

    let mut n = 1u32;
    while block_size % (2 * n) == 0 {
        gpu.mod_sq_loop(n, false, buf1, buf2, buf_data);
        gpu.mod_mul(buf_aux, false, buf1, buf2, buf3, buf_data);
        gpu.queue().copy_from_to(buf_data, buf_aux);
        n *= 2;
    }

    assert!(n.is_power_of_two());
    assert!(block_size % n == 0);

    block_size /= n;
    assert!(block_size >= 2);

    for _ in 0..block_size - 2 {
        gpu.mod_sq_loop(n, false, buf1, buf2, buf_data);
        gpu.mod_mul(buf_aux, false, buf1, buf2, buf3, buf_data);
    }

    gpu.mod_sq_loop(n, false, buf1, buf2, buf_data);
    gpu.mod_mul(buf_aux, true, buf1, buf2, buf3, buf_data);
}

fn update_check<E: Engine>(
    gpu: &mut Ibdwt<E>,
    buf1: &mut Buffer<f64>,
    buf2: &mut Buffer<f64>,
    buf3: &mut Buffer<f64>,
    buf_data: &Buffer<i32>,
    buf_check: &mut Buffer<i32>,
) {
    gpu.mod_mul(buf_data, false, buf1, buf2, buf3, buf_check);
}

/// The Gerbicz verification: `C * D == 3 * C^(2^block_size)`.
#[allow(clippy::too_many_arguments)]
fn do_check<E: Engine>(
    gpu: &mut Ibdwt<E>,
    block_size: u32,
    buf1: &mut Buffer<f64>,
    buf2: &mut Buffer<f64>,
    buf3: &mut Buffer<f64>,
    buf_data: &Buffer<i32>,
    buf_check: &mut Buffer<i32>,
    buf_aux: &mut Buffer<i32>,
) -> bool {
    gpu.queue().copy_from_to(buf_check, buf_aux);
    gpu.mod_sq_loop(block_size, true, buf1, buf2, buf_aux);
    update_check(gpu, buf1, buf2, buf3, buf_data, buf_check);
    gpu.equal_not_zero(buf_check, buf_aux)
}

/// Loads (or initializes) the PRP state and seeds the device buffers,
/// verifying the stored res64 against the reconstructed data vector.
#[allow(clippy::too_many_arguments)]
fn load_prp<E: Engine>(
    gpu: &mut Ibdwt<E>,
    dir: &Path,
    e: u32,
    default_block_size: u32,
    buf1: &mut Buffer<f64>,
    buf2: &mut Buffer<f64>,
    buf3: &mut Buffer<f64>,
    buf_data: &mut Buffer<i32>,
    buf_check: &mut Buffer<i32>,
    buf_aux: &mut Buffer<i32>,
) -> Result<PrpState, Error> {
    let loaded = PrpState::load(dir, e, default_block_size)?;
    if !valid_block_size(loaded.block_size) {
        return Err(Error::BlockSizeInvalid {
            block_size: loaded.block_size,
        });
    }

    write_state(
        gpu,
        &loaded.check,
        loaded.block_size,
        buf1,
        buf2,
        buf3,
        buf_data,
        buf_check,
        buf_aux,
    );

    let res64 = data_res64(gpu, buf_data);
    let ok = res64 == loaded.res64;
    update_check(gpu, buf1, buf2, buf3, buf_data, buf_check);
    if !ok {
        info!(
            "{} EE loaded: k {}, blockSize {}, {:016x} (expected {:016x})",
            e, loaded.k, loaded.block_size, res64, loaded.res64
        );
        return Err(Error::CheckpointMismatch {
            e,
            expected: loaded.res64,
            got: res64,
        });
    }
    Ok(loaded)
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Runs the PRP test for `gpu`'s exponent, resuming from checkpoints in
/// `args.dir` and saving new ones as it goes.
pub fn is_prime_prp<E: Engine>(
    gpu: &mut Ibdwt<E>,
    args: &Args,
    stop: &StopToken,
) -> Result<PrpResult, Error> {
    let e = gpu.exponent();
    let mut buf1 = gpu.alloc_work("buf1");
    let mut buf2 = gpu.alloc_work("buf2");
    let mut buf3 = gpu.alloc_work("buf3");
    let mut buf_data = gpu.alloc_words("data");
    let mut buf_check = gpu.alloc_words("check");
    let mut buf_aux = gpu.alloc_words("aux");

    let loaded = load_prp(
        gpu,
        &args.dir,
        e,
        args.block_size,
        &mut buf1,
        &mut buf2,
        &mut buf3,
        &mut buf_data,
        &mut buf_check,
        &mut buf_aux,
    )?;
    let mut k = loaded.k;
    let block_size = loaded.block_size;
    let mut n_errors = loaded.n_errors;

    let k_end = e;
    assert!(k < k_end);
    let check_step = block_size * block_size;
    let start_k = k;
    let n_total_iters = ((k_end - 1) / block_size + 1) * block_size;

    let mut stats = TimeInfo::default();
    let mut timer = Timer::new();
    let mut n_seq_errors = 0u32;

    let mut is_prime = false;
    let mut final_res64 = 0u64;

    loop {
        assert!(k % block_size == 0);

        if k < k_end && k + block_size >= k_end {
            gpu.mod_sq_loop(k_end - k, false, &mut buf1, &mut buf2, &mut buf_data);

            // Round-trip through the packed form to decide and report.
            let mut packed = gpu.read_words(&buf_data);
            gpu.write_words(&packed, &mut buf_data);
            is_prime = words::equals_nine(&packed);
            words::div9(e, &mut packed);
            final_res64 = words::residue_from_compact(&packed);
            info!(
                "{} {} {:8} / {}, {:016x}",
                e,
                if is_prime { "PP" } else { "CC" },
                k_end,
                e,
                final_res64
            );

            let iters_left = block_size - (k_end - k);
            if iters_left > 0 {
                gpu.mod_sq_loop(iters_left, false, &mut buf1, &mut buf2, &mut buf_data);
            }
        } else {
            gpu.mod_sq_loop(block_size, false, &mut buf1, &mut buf2, &mut buf_data);
        }
        k += block_size;

        gpu.queue().finish();
        stats.add(timer.delta_secs(), block_size);

        let mut do_stop = stop.is_requested();
        if args.iters != 0 && k - start_k == args.iters {
            do_stop = true;
        }

        let check_now = k % check_step == 0
            || (k >= k_end && k < k_end + block_size)
            || do_stop
            || k - start_k == 2 * block_size;

        if !check_now {
            update_check(gpu, &mut buf1, &mut buf2, &mut buf3, &buf_data, &mut buf_check);
            if k % args.log_step == 0 {
                info!(
                    "{}",
                    report::log_line(
                        e,
                        "",
                        k,
                        data_res64(gpu, &buf_data),
                        stats.total / f64::from(stats.n),
                        n_total_iters
                    )
                );
                stats.clear();
                gpu.log_time_kernels();
            }
            continue;
        }

        // Renormalize the check vector while reading it for the save.
        let check = gpu.read_words(&buf_check);
        gpu.write_words(&check, &mut buf_check);

        let ok = do_check(
            gpu,
            block_size,
            &mut buf1,
            &mut buf2,
            &mut buf3,
            &buf_data,
            &mut buf_check,
            &mut buf_aux,
        );
        let res64 = data_res64(gpu, &buf_data);

        info!(
            "{} (check {:.2}s){}",
            report::log_line(
                e,
                if ok { "OK" } else { "EE" },
                k,
                res64,
                stats.total / f64::from(stats.n.max(1)),
                n_total_iters
            ),
            timer.delta_secs(),
            if n_errors > 0 {
                format!(" {} errors", n_errors)
            } else {
                String::new()
            }
        );
        stats.clear();

        if ok {
            if k < k_end {
                PrpState {
                    e,
                    k,
                    block_size,
                    res64,
                    n_errors,
                    check,
                }
                .save(&args.dir)?;
            }
            if is_prime || k >= k_end {
                return Ok(PrpResult {
                    is_prime,
                    res64: final_res64,
                    n_errors,
                });
            }
            n_seq_errors = 0;
        } else {
            n_errors += 1;
            n_seq_errors += 1;
            if n_seq_errors > 2 {
                return Err(Error::TooManyErrors {
                    n_errors: n_seq_errors,
                });
            }

            let reloaded = load_prp(
                gpu,
                &args.dir,
                e,
                block_size,
                &mut buf1,
                &mut buf2,
                &mut buf3,
                &mut buf_data,
                &mut buf_check,
                &mut buf_aux,
            )?;
            k = reloaded.k;
            assert_eq!(block_size, reloaded.block_size);
        }
        gpu.log_time_kernels();
        if do_stop {
            return Err(Error::StopRequested);
        }
    }
}

// ======================================================================
// TESTS
