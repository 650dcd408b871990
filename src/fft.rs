//! FFT plan registry.
//!
//! A plan is a `(width, height, middle)` triple; the transform length in
//! balanced words is `N = width * height * middle * 2` (the factor of 2 is
//! the real-to-complex packing). The registry enumerates the production
//! configurations and selects one for a given exponent; arbitrary
//! power-of-two configurations can also be built directly, which is how
//! small exponents are run in tests.

use crate::Error;

// ======================================================================
// CONST - PRIVATE

/// Production transform dimensions, in increasing order.
const DIMS: &[u32] = &[256, 512, 1024, 2048, 4096];

/// Empirical safe exponent budget per complex point.
const BITS_PER_POINT: u32 = 30;

// ======================================================================
// FUNCTIONS - PUBLIC

/// Formats `n` with a K or M suffix if a multiple of 1024 or 1024*1024.
pub fn number_k(n: u32) -> String {
    if n % (1024 * 1024) == 0 {
        format!("{}M", n / (1024 * 1024))
    } else if n % 1024 == 0 {
        format!("{}K", n / 1024)
    } else {
        format!("{}", n)
    }
}

// ======================================================================
// FftConfig - PUBLIC

/// One transform configuration: `width x height` complex points,
/// `middle` always 1 in the production registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FftConfig {
    /// Length of the width sub-FFT.
    pub width: u32,
    /// Length of the height sub-FFT.
    pub height: u32,
    /// Middle transform factor.
    pub middle: u32,
}

impl FftConfig {
    /// Creates a configuration from explicit dimensions.
    ///
    /// Both dimensions must be powers of two in `[4, 4096]`. This is the
    /// constructor used for exponents below the production range.
    pub fn new(width: u32, height: u32) -> Result<FftConfig, Error> {
        let valid = |d: u32| d.is_power_of_two() && (4..=4096).contains(&d);
        if !valid(width) || !valid(height) {
            return Err(Error::InvalidFftConfig { width, height });
        }
        Ok(FftConfig {
            width,
            height,
            middle: 1,
        })
    }

    /// Number of complex points, `width * height * middle`.
    pub fn fft_size(&self) -> u32 {
        self.width * self.height * self.middle
    }

    /// Largest exponent this configuration is rated for.
    pub fn max_exp(&self) -> u32 {
        self.fft_size() * BITS_PER_POINT
    }

    /// Configuration string, e.g. `1K:1:512`.
    pub fn spec(&self) -> String {
        format!(
            "{}:{}:{}",
            number_k(self.width),
            self.middle,
            number_k(self.height)
        )
    }

    /// Width sub-FFT inner radix: chosen so the sub-group dimensions
    /// divide the carry-group width.
    pub fn nw(&self) -> u32 {
        if self.width == 256 || self.width == 1024 {
            4
        } else {
            8
        }
    }

    /// Height sub-FFT inner radix.
    pub fn nh(&self) -> u32 {
        if self.height == 256 || self.height == 1024 {
            4
        } else {
            8
        }
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC - registry

/// Enumerates the production configurations, in increasing size order.
pub fn gen_configs() -> Vec<FftConfig> {
    let mut configs = Vec::new();
    for &width in DIMS {
        for &height in DIMS {
            if height <= width {
                configs.push(FftConfig {
                    width,
                    height,
                    middle: 1,
                });
            }
        }
    }
    configs.sort_by_key(|c| (c.fft_size(), c.width));
    configs
}

/// Selects a configuration for exponent `e`.
///
/// A `hint` below 10 is a signed delta from the default configuration
/// (the first whose [`max_exp`] covers `e`), clamped to the registry;
/// larger values select the first configuration of at least that size.
///
/// [`max_exp`]: FftConfig::max_exp
pub fn choose(configs: &[FftConfig], e: u32, hint: i32) -> FftConfig {
    assert!(!configs.is_empty());
    let n = configs.len() as i32;
    let mut i: i32 = 0;
    if hint < 10 {
        while i < n - 1 && configs[i as usize].max_exp() < e {
            i += 1;
        }
        i = (i + hint).clamp(0, n - 1);
    } else {
        while i < n - 1 && (hint as u32) > configs[i as usize].fft_size() {
            i += 1;
        }
    }
    configs[i as usize]
}

// ======================================================================
// TESTS
