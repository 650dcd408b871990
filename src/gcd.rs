//! Host-side GCD against `2^E - 1`, with a one-thread async worker.
//!
//! The worker receives a copied residue vector; there is no shared
//! mutable state. This is the only host-side multi-threading.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};

use crate::words;

// ======================================================================
// FUNCTIONS - PUBLIC

/// `gcd(2^e - 1, value - sub)` as a decimal string, or `None` when the
/// GCD is trivial.
pub fn gcd_factor(e: u32, data: &[u32], sub: u32) -> Option<String> {
    let mp = words::mersenne(e);
    let x = BigUint::from_slice(data) % &mp;
    let x = if x >= BigUint::from(sub) {
        x - sub
    } else {
        x + &mp - sub
    };
    if x.is_zero() {
        return None;
    }
    let g = mp.gcd(&x);
    if g.is_one() {
        None
    } else {
        Some(g.to_string())
    }
}

// ======================================================================
// GcdTask - PUBLIC

/// An asynchronous [`gcd_factor`] computation.
pub struct GcdTask {
    rx: mpsc::Receiver<Option<String>>,
    handle: Option<JoinHandle<()>>,
}

impl GcdTask {
    /// Starts the worker on a copied residue vector.
    pub fn spawn(e: u32, data: Vec<u32>, sub: u32) -> GcdTask {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let _ = tx.send(gcd_factor(e, &data, sub));
        });
        GcdTask {
            rx,
            handle: Some(handle),
        }
    }

    /// Non-blocking poll: `None` while still running, otherwise the
    /// completed result.
    pub fn try_result(&mut self) -> Option<Option<String>> {
        match self.rx.try_recv() {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(_) => None,
        }
    }

    /// Blocks until the worker completes.
    pub fn wait(mut self) -> Option<String> {
        let result = self.rx.recv().unwrap_or(None);
        self.join();
        result
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_factor() {
        // M(11) = 2047 = 23 * 89; 24 - 1 = 23.
        assert_eq!(gcd_factor(11, &[24], 1), Some("23".to_string()));
    }

    #[test]
    fn trivial_gcd_is_none() {
        assert_eq!(gcd_factor(11, &[4], 1), None);
        // value == sub
        assert_eq!(gcd_factor(11, &[1], 1), None);
    }

    #[test]
    fn wraps_below_zero() {
        // value 0, sub 1: gcd(2047, 2046) = 2 * 3 * 11 * 31 / ... = 11? No:
        // 2046 = 2 * 3 * 11 * 31, gcd(2047, 2046) = 1.
        assert_eq!(gcd_factor(11, &[0], 1), None);
    }

    #[test]
    fn async_task_matches_direct() {
        let mut task = GcdTask::spawn(11, vec![24], 1);
        let result = loop {
            if let Some(result) = task.try_result() {
                break result;
            }
            std::thread::yield_now();
        };
        assert_eq!(result, Some("23".to_string()));
    }

    #[test]
    fn wait_blocks_for_result() {
        let task = GcdTask::spawn(11, vec![24], 1);
        assert_eq!(task.wait(), Some("23".to_string()));
    }
}
