//! Persistent driver state.
//!
//! Three disjoint file formats keyed on the exponent: `<E>.prp` for the
//! PRP test, `<E>.p1` / `<E>.p2` for the two P-1 stages. Headers are u32
//! sequences, payloads are raw little-endian words (the stage-2 payload
//! is the raw double buffer and is only valid with the FFT configuration
//! it was saved under). Saves go through a temporary file and rename,
//! keeping the previous file as `.bak`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::words;
use crate::Error;

// ======================================================================
// CONST - PRIVATE

const MAGIC_PRP: u32 = 0x5052_5031; // "PRP1"
const MAGIC_P1: u32 = 0x504d_3149; // "PM1I"
const MAGIC_P2: u32 = 0x504d_3249; // "PM2I"

// ======================================================================
// HELPERS - PRIVATE

fn io_err(path: &Path, err: std::io::Error) -> Error {
    Error::CheckpointIo {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

fn format_err(path: &Path, reason: &str) -> Error {
    Error::CheckpointFormat {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn file_path(dir: &Path, e: u32, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", e, ext))
}

fn write_file(path: &Path, header: &[u32], payload: &[u8]) -> Result<(), Error> {
    let mut bytes = Vec::with_capacity(4 * header.len() + payload.len());
    bytes.extend_from_slice(bytemuck::cast_slice(header));
    bytes.extend_from_slice(payload);

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
    if path.exists() {
        let bak = PathBuf::from(format!("{}.bak", path.display()));
        fs::rename(path, &bak).map_err(|e| io_err(path, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Reads a file as `(header of n_header u32s, payload bytes)`.
fn read_file(path: &Path, n_header: usize) -> Result<Option<(Vec<u32>, Vec<u8>)>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    if bytes.len() < 4 * n_header {
        return Err(format_err(path, "truncated header"));
    }
    let header: Vec<u32> = bytes[..4 * n_header]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(Some((header, bytes[4 * n_header..].to_vec())))
}

fn payload_words(path: &Path, payload: &[u8], expect: usize) -> Result<Vec<u32>, Error> {
    if payload.len() != 4 * expect {
        return Err(format_err(path, "payload size mismatch"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

// ======================================================================
// PrpState - PUBLIC

/// PRP test state at a block boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct PrpState {
    /// Exponent.
    pub e: u32,
    /// Iterations completed.
    pub k: u32,
    /// Gerbicz block size.
    pub block_size: u32,
    /// 64-bit residue of the data vector, for load verification.
    pub res64: u64,
    /// Cumulative error count.
    pub n_errors: u32,
    /// The Gerbicz check vector, packed.
    pub check: Vec<u32>,
}

impl PrpState {
    /// The state of a fresh test: the check vector is 1 and the implied
    /// data vector is the seed 3.
    pub fn initial(e: u32, block_size: u32) -> PrpState {
        let mut check = vec![0u32; words::packed_len(e)];
        check[0] = 1;
        PrpState {
            e,
            k: 0,
            block_size,
            res64: 3,
            n_errors: 0,
            check,
        }
    }

    /// Loads the saved state, or the initial state when no file exists.
    pub fn load(dir: &Path, e: u32, default_block_size: u32) -> Result<PrpState, Error> {
        let path = file_path(dir, e, "prp");
        let Some((header, payload)) = read_file(&path, 7)? else {
            return Ok(PrpState::initial(e, default_block_size));
        };
        if header[0] != MAGIC_PRP || header[1] != e {
            return Err(format_err(&path, "bad magic or exponent"));
        }
        let check = payload_words(&path, &payload, words::packed_len(e))?;
        Ok(PrpState {
            e,
            k: header[2],
            block_size: header[3],
            res64: u64::from(header[4]) | (u64::from(header[5]) << 32),
            n_errors: header[6],
            check,
        })
    }

    /// Saves the state.
    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let header = [
            MAGIC_PRP,
            self.e,
            self.k,
            self.block_size,
            self.res64 as u32,
            (self.res64 >> 32) as u32,
            self.n_errors,
        ];
        write_file(
            &file_path(dir, self.e, "prp"),
            &header,
            bytemuck::cast_slice(&self.check),
        )
    }
}

// ======================================================================
// P1State - PUBLIC

/// P-1 stage-1 state.
#[derive(Clone, Debug, PartialEq)]
pub struct P1State {
    /// Exponent.
    pub e: u32,
    /// Stage-1 bound.
    pub b1: u32,
    /// Bits of the powersmooth exponent consumed.
    pub k: u32,
    /// Total bits of the powersmooth exponent.
    pub n_bits: u32,
    /// The accumulator, packed.
    pub data: Vec<u32>,
}

impl P1State {
    /// The state of a fresh run: the accumulator is 1.
    pub fn initial(e: u32, b1: u32) -> P1State {
        let mut data = vec![0u32; words::packed_len(e)];
        data[0] = 1;
        P1State {
            e,
            b1,
            k: 0,
            n_bits: 0,
            data,
        }
    }

    /// Loads the saved state, or the initial state when no file exists.
    pub fn load(dir: &Path, e: u32, b1: u32) -> Result<P1State, Error> {
        let path = file_path(dir, e, "p1");
        let Some((header, payload)) = read_file(&path, 5)? else {
            return Ok(P1State::initial(e, b1));
        };
        if header[0] != MAGIC_P1 || header[1] != e {
            return Err(format_err(&path, "bad magic or exponent"));
        }
        if header[2] != b1 {
            return Err(format_err(&path, "stage-1 bound mismatch"));
        }
        let data = payload_words(&path, &payload, words::packed_len(e))?;
        Ok(P1State {
            e,
            b1,
            k: header[3],
            n_bits: header[4],
            data,
        })
    }

    /// Saves the state.
    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let header = [MAGIC_P1, self.e, self.b1, self.k, self.n_bits];
        write_file(
            &file_path(dir, self.e, "p1"),
            &header,
            bytemuck::cast_slice(&self.data),
        )
    }
}

// ======================================================================
// P2State - PUBLIC

/// P-1 stage-2 state: the accumulator in raw transform-domain form,
/// valid only under the FFT configuration it was saved with.
#[derive(Clone, Debug, PartialEq)]
pub struct P2State {
    /// Exponent.
    pub e: u32,
    /// Stage-1 bound.
    pub b1: u32,
    /// Stage-2 bound.
    pub b2: u32,
    /// J-set position reached.
    pub k: u32,
    /// Raw accumulator buffer, N doubles.
    pub raw: Vec<f64>,
}

impl P2State {
    /// The state of a fresh stage 2.
    pub fn initial(e: u32, b1: u32, b2: u32) -> P2State {
        P2State {
            e,
            b1,
            b2,
            k: 0,
            raw: Vec::new(),
        }
    }

    /// Loads the saved state, or the initial state when no file exists.
    pub fn load(dir: &Path, e: u32, b1: u32, b2: u32) -> Result<P2State, Error> {
        let path = file_path(dir, e, "p2");
        let Some((header, payload)) = read_file(&path, 6)? else {
            return Ok(P2State::initial(e, b1, b2));
        };
        if header[0] != MAGIC_P2 || header[1] != e {
            return Err(format_err(&path, "bad magic or exponent"));
        }
        if header[2] != b1 || header[3] != b2 {
            return Err(format_err(&path, "stage bounds mismatch"));
        }
        let n = header[5] as usize;
        if payload.len() != 8 * n {
            return Err(format_err(&path, "payload size mismatch"));
        }
        let raw = payload
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(P2State {
            e,
            b1,
            b2,
            k: header[4],
            raw,
        })
    }

    /// Saves the state.
    pub fn save(&self, dir: &Path) -> Result<(), Error> {
        let header = [
            MAGIC_P2,
            self.e,
            self.b1,
            self.b2,
            self.k,
            self.raw.len() as u32,
        ];
        write_file(
            &file_path(dir, self.e, "p2"),
            &header,
            bytemuck::cast_slice(&self.raw),
        )
    }
}

// ======================================================================
// FUNCTIONS - PUBLIC

/// Removes the P-1 files of exponent `e`, ignoring missing ones.
pub fn remove_pm1(dir: &Path, e: u32) {
    let _ = fs::remove_file(file_path(dir, e, "p1"));
    let _ = fs::remove_file(file_path(dir, e, "p2"));
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prp_roundtrip_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let e = 127u32;

        let loaded = PrpState::load(dir.path(), e, 500).unwrap();
        assert_eq!(loaded, PrpState::initial(e, 500));
        assert_eq!(loaded.res64, 3);
        assert_eq!(loaded.check[0], 1);

        let state = PrpState {
            e,
            k: 1000,
            block_size: 500,
            res64: 0xdead_beef_1234_5678,
            n_errors: 2,
            check: vec![7; words::packed_len(e)],
        };
        state.save(dir.path()).unwrap();
        assert_eq!(PrpState::load(dir.path(), e, 500).unwrap(), state);

        // Second save rotates the previous file to .bak.
        let mut newer = state.clone();
        newer.k = 1500;
        newer.save(dir.path()).unwrap();
        assert_eq!(PrpState::load(dir.path(), e, 500).unwrap(), newer);
        assert!(dir.path().join("127.prp.bak").exists());
    }

    #[test]
    fn prp_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("127.prp"), b"garbage").unwrap();
        match PrpState::load(dir.path(), 127, 500) {
            Err(Error::CheckpointFormat { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn p1_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let state = P1State {
            e: 881,
            b1: 100,
            k: 55,
            n_bits: 154,
            data: vec![3; words::packed_len(881)],
        };
        state.save(dir.path()).unwrap();
        assert_eq!(P1State::load(dir.path(), 881, 100).unwrap(), state);

        // A different bound rejects the file.
        match P1State::load(dir.path(), 881, 200) {
            Err(Error::CheckpointFormat { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn p2_roundtrip_and_size_check() {
        let dir = tempfile::tempdir().unwrap();
        let state = P2State {
            e: 449,
            b1: 1000,
            b2: 10000,
            k: 128,
            raw: (0..32).map(|i| i as f64 * 0.5).collect(),
        };
        state.save(dir.path()).unwrap();
        assert_eq!(P2State::load(dir.path(), 449, 1000, 10000).unwrap(), state);

        match P2State::load(dir.path(), 449, 1000, 20000) {
            Err(Error::CheckpointFormat { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn remove_pm1_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        P1State::initial(881, 100).save(dir.path()).unwrap();
        remove_pm1(dir.path(), 881);
        remove_pm1(dir.path(), 881);
        assert_eq!(
            P1State::load(dir.path(), 881, 100).unwrap(),
            P1State::initial(881, 100)
        );
    }
}
