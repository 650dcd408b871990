#![doc = include_str!(concat!(env!("OUT_DIR"), "/README-rustdocified.md"))]
#![deny(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use crate::ibdwt::Ibdwt;
pub use crate::prp::PrpResult;

#[cfg(test)]
mod test_util;

pub mod checkpoint;
pub mod engine;
pub mod fft;
pub mod gcd;
mod ibdwt;
pub mod pm1;
pub mod prp;
pub mod report;
pub mod words;

// ======================================================================
// Error - PUBLIC

/// Represents all possible errors that can occur in this library.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// FFT dimensions are not powers of two in the supported range.
    InvalidFftConfig {
        /// Given width.
        width: u32,
        /// Given height.
        height: u32,
    },

    /// The transform is too small for the exponent (more than 20
    /// bits/word).
    FftSizeTooSmall {
        /// Exponent.
        e: u32,
        /// Transform length in words.
        n: u32,
        /// Resulting word size.
        bits_per_word: f64,
    },

    /// The transform is too large for the exponent (fewer than 1.5
    /// bits/word).
    FftSizeTooLarge {
        /// Exponent.
        e: u32,
        /// Transform length in words.
        n: u32,
        /// Resulting word size.
        bits_per_word: f64,
    },

    /// The PRP block size must divide 10000 and leave the doubling
    /// run-up at least two blocks.
    BlockSizeInvalid {
        /// Given block size.
        block_size: u32,
    },

    /// P-1 needs an allocation budget when the engine reports no free
    /// memory.
    MaxAllocRequired,

    /// A loaded checkpoint did not reproduce its recorded residue.
    CheckpointMismatch {
        /// Exponent.
        e: u32,
        /// Residue recorded in the file.
        expected: u64,
        /// Residue reconstructed from the check vector.
        got: u64,
    },

    /// A checkpoint file is structurally invalid.
    CheckpointFormat {
        /// Offending file.
        path: String,
        /// What was wrong.
        reason: String,
    },

    /// A checkpoint file could not be read or written.
    CheckpointIo {
        /// Offending file.
        path: String,
        /// Underlying error.
        reason: String,
    },

    /// Three consecutive Gerbicz check failures.
    TooManyErrors {
        /// Consecutive failures seen.
        n_errors: u32,
    },

    /// A stop was requested; state has been checkpointed.
    StopRequested,
}

// ======================================================================
// Error - IMPL DISPLAY

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidFftConfig { width, height } => {
                write!(f, "invalid fft config: {}x{}", width, height)
            }

            Error::FftSizeTooSmall { e, n, bits_per_word } => {
                write!(
                    f,
                    "fft size {} too small for exponent {} ({:.2} bits/word)",
                    n, e, bits_per_word
                )
            }

            Error::FftSizeTooLarge { e, n, bits_per_word } => {
                write!(
                    f,
                    "fft size {} too large for exponent {} ({:.2} bits/word)",
                    n, e, bits_per_word
                )
            }

            Error::BlockSizeInvalid { block_size } => {
                write!(f, "invalid block size: {}", block_size)
            }

            Error::MaxAllocRequired => {
                write!(f, "P-1 requires a max-alloc budget on this engine")
            }

            Error::CheckpointMismatch { e, expected, got } => {
                write!(
                    f,
                    "checkpoint mismatch for {}: expected {:016x}, got {:016x}",
                    e, expected, got
                )
            }

            Error::CheckpointFormat { path, reason } => {
                write!(f, "bad checkpoint {}: {}", path, reason)
            }

            Error::CheckpointIo { path, reason } => {
                write!(f, "checkpoint io error {}: {}", path, reason)
            }

            Error::TooManyErrors { n_errors } => {
                write!(f, "{} sequential check errors, giving up", n_errors)
            }

            Error::StopRequested => {
                write!(f, "stop requested")
            }
        }
    }
}

// ======================================================================
// Error - IMPL ERROR

impl std::error::Error for Error {}

// ======================================================================
// CarryKind - PUBLIC

/// Carry-pipeline selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CarryKind {
    /// Long carries below 14.5 bits/word or for wide transforms.
    #[default]
    Auto,
    /// Fused (short) carries wherever the word size allows.
    Short,
    /// Unfused carries on every iteration.
    Long,
}

// ======================================================================
// Args - PUBLIC

/// Runtime options consumed by the drivers. Command-line parsing is the
/// caller's concern; this is the interface the core requires from it.
#[derive(Clone, Debug)]
pub struct Args {
    /// FFT selection hint: below 10, a signed delta from the default
    /// configuration; otherwise a minimum FFT size.
    pub fft_size: i32,
    /// Gerbicz block size; must divide 10000.
    pub block_size: u32,
    /// Iterations between small progress lines.
    pub log_step: u32,
    /// Carry-pipeline selection.
    pub carry: CarryKind,
    /// Bound the run to this many iterations (0 = unbounded); the run
    /// ends with a checkpoint and [`Error::StopRequested`].
    pub iters: u32,
    /// GPU allocation budget in MiB for stage 2 (0 = unspecified).
    pub max_alloc_mb: u32,
    /// Per-kernel profiling.
    pub time_kernels: bool,
    /// Checkpoint directory.
    pub dir: PathBuf,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            fft_size: 0,
            block_size: 1000,
            log_step: 200_000,
            carry: CarryKind::Auto,
            iters: 0,
            max_alloc_mb: 0,
            time_kernels: false,
            dir: PathBuf::from("."),
        }
    }
}

// ======================================================================
// StopToken - PUBLIC

/// Process-wide stop flag. Drivers poll it at block boundaries and shut
/// down cleanly after one final checkpoint.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    /// Creates an unset token.
    pub fn new() -> StopToken {
        StopToken::default()
    }

    /// Requests a clean shutdown.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether a shutdown was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Runs a PRP test of `M(e) = 2^e - 1` on the host reference engine.
///
/// See [`prp::is_prime_prp`] to control the engine and stopping.
pub fn prp_test(e: u32, args: &Args) -> Result<PrpResult, Error> {
    let mut gpu = Ibdwt::<engine::Cpu>::make(e, args)?;
    prp::is_prime_prp(&mut gpu, args, &StopToken::new())
}

/// Runs P-1 factoring of `M(e)` with bounds `(b1, b2]` on the host
/// reference engine, returning the factor found, if any.
///
/// See [`pm1::factor_pm1`] to control the engine and stopping.
pub fn pm1_factor(e: u32, b1: u32, b2: u32, args: &Args) -> Result<Option<String>, Error> {
    let mut gpu = Ibdwt::<engine::Cpu>::make(e, args)?;
    pm1::factor_pm1(&mut gpu, args, b1, b2, &StopToken::new())
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_exponents_below_production_range() {
        // The smallest production transform is far too large for M(127);
        // small exponents go through an explicit FftConfig instead.
        match prp_test(127, &Args::default()) {
            Err(Error::FftSizeTooLarge { n, .. }) => assert_eq!(n, 2 * 256 * 256),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn stop_token_is_shared() {
        let stop = StopToken::new();
        let clone = stop.clone();
        assert!(!clone.is_requested());
        stop.request_stop();
        assert!(clone.is_requested());
    }

    #[test]
    fn errors_display() {
        let err = Error::BlockSizeInvalid { block_size: 16 };
        assert_eq!(err.to_string(), "invalid block size: 16");
        assert_eq!(Error::StopRequested.to_string(), "stop requested");
    }
}
