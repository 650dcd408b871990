use num_bigint::BigUint;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::engine::{Buffer, Cpu, Engine};
use crate::words;
use crate::Ibdwt;

// ======================================================================
// FUNCTIONS - CRATE

/// A random packed residue in `[0, 2^e - 1)`, reproducible by seed.
pub(crate) fn random_packed(e: u32, seed: u8) -> Vec<u32> {
    let mut rng = ChaCha8Rng::from_seed([seed; 32]);
    let mp = words::mersenne(e);
    loop {
        let mut packed: Vec<u32> = (0..words::packed_len(e)).map(|_| rng.gen()).collect();
        let top = e % 32;
        *packed.last_mut().unwrap() &= (1u32 << top) - 1;
        if BigUint::from_slice(&packed) < mp {
            return packed;
        }
    }
}

/// Packs a big integer (must be below `2^e - 1`) into u32 limbs.
pub(crate) fn packed_from(x: &BigUint, e: u32) -> Vec<u32> {
    let mut out = x.to_u32_digits();
    out.resize(words::packed_len(e), 0);
    out
}

/// Brings a low-position buffer back to the canonical packed residue.
pub(crate) fn low_to_packed(
    gpu: &mut Ibdwt<Cpu>,
    low: &Buffer<f64>,
    tmp: &mut Buffer<f64>,
) -> Vec<u32> {
    let mut one_low = gpu.alloc_work("one_low");
    gpu.exponentiate(low, 0, tmp, &mut one_low);

    let mut prod = low.clone();
    gpu.engine.multiply(&gpu.queue, &mut prod, &one_low);
    gpu.engine.fft_h(&gpu.queue, &mut prod);
    gpu.t_h(&prod, tmp);
    gpu.engine.fft_w(&gpu.queue, tmp);

    let mut io = gpu.alloc_words("io");
    gpu.engine
        .carry_a(&gpu.queue, tmp, &mut io, &mut gpu.buf_carry);
    gpu.engine.carry_b(&gpu.queue, &mut io, &mut gpu.buf_carry);
    gpu.read_words(&io)
}
