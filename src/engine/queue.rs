//! In-order command queue and device buffers.
//!
//! All kernel work is serialized through one [`Queue`]. Reads are
//! blocking; [`Queue::read_async`] exists for drivers that overlap reads
//! with host work, and completes immediately on the host reference
//! engine. With profiling enabled the queue accumulates per-kernel
//! wall time, dumped via [`Queue::profile`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Instant;

// ======================================================================
// TimeInfo - PUBLIC

/// Accumulated time of one kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeInfo {
    /// Total seconds.
    pub total: f64,
    /// Number of calls.
    pub n: u32,
}

impl TimeInfo {
    /// Adds one measurement covering `delta_n` units of work.
    pub fn add(&mut self, delta_secs: f64, delta_n: u32) {
        self.total += delta_secs;
        self.n += delta_n;
    }

    /// Resets the accumulator.
    pub fn clear(&mut self) {
        self.total = 0.0;
        self.n = 0;
    }
}

// ======================================================================
// Buffer - PUBLIC

/// A named device buffer of fixed size.
#[derive(Clone, Debug)]
pub struct Buffer<T> {
    name: String,
    data: Vec<T>,
}

impl<T: Clone + Default> Buffer<T> {
    /// Allocates a zero-initialized buffer.
    pub fn new(name: &str, size: usize) -> Buffer<T> {
        Buffer {
            name: name.to_string(),
            data: vec![T::default(); size],
        }
    }

    /// Buffer name, for profiling and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Host view of the contents.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable host view of the contents.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

// ======================================================================
// Queue - PUBLIC

/// Sorted per-kernel profile: `(stats, kernel name)`, slowest first.
pub type Profile = Vec<(TimeInfo, String)>;

/// In-order execution queue with optional per-kernel profiling.
pub struct Queue {
    profile: bool,
    time_map: RefCell<HashMap<String, TimeInfo>>,
}

impl Queue {
    /// Creates a queue; `profile` enables per-kernel timing.
    pub fn new(profile: bool) -> Queue {
        Queue {
            profile,
            time_map: RefCell::new(HashMap::new()),
        }
    }

    /// Submits one kernel. Execution is serialized in submission order.
    pub fn run<F: FnOnce()>(&self, name: &str, f: F) {
        if self.profile {
            let start = Instant::now();
            f();
            let secs = start.elapsed().as_secs_f64();
            self.time_map
                .borrow_mut()
                .entry(name.to_string())
                .or_default()
                .add(secs, 1);
        } else {
            f();
        }
    }

    /// Blocking read of `size` elements, or the whole buffer when 0.
    pub fn read<T: Clone + Default>(&self, buf: &Buffer<T>, size: usize) -> Vec<T> {
        let size = if size == 0 { buf.len() } else { size };
        assert!(size <= buf.len());
        buf.as_slice()[..size].to_vec()
    }

    /// Asynchronous read into `out`; completed by the next [`finish`].
    ///
    /// [`finish`]: Queue::finish
    pub fn read_async<T: Clone + Default>(&self, buf: &Buffer<T>, out: &mut Vec<T>, size: usize) {
        *out = self.read(buf, size);
    }

    /// Blocking write of `data` to the start of `buf`.
    pub fn write<T: Clone + Default>(&self, buf: &mut Buffer<T>, data: &[T]) {
        assert!(data.len() <= buf.len());
        buf.as_mut_slice()[..data.len()].clone_from_slice(data);
    }

    /// Zeroes `size` elements, or the whole buffer when 0.
    pub fn zero<T: Clone + Default>(&self, buf: &mut Buffer<T>, size: usize) {
        let size = if size == 0 { buf.len() } else { size };
        assert!(size <= buf.len());
        for x in &mut buf.as_mut_slice()[..size] {
            *x = T::default();
        }
    }

    /// Device-side copy between equal-sized buffers.
    pub fn copy_from_to<T: Clone + Default>(&self, from: &Buffer<T>, to: &mut Buffer<T>) {
        assert_eq!(from.len(), to.len());
        to.as_mut_slice().clone_from_slice(from.as_slice());
    }

    /// Fences the queue: all submitted work is complete on return.
    pub fn finish(&self) {}

    /// Per-kernel profile, slowest first. Empty unless profiling.
    pub fn profile(&self) -> Profile {
        let mut profile: Profile = self
            .time_map
            .borrow()
            .iter()
            .map(|(name, info)| (*info, name.clone()))
            .collect();
        profile.sort_by(|a, b| b.0.total.total_cmp(&a.0.total));
        profile
    }

    /// Whether profiling is enabled.
    pub fn is_profiling(&self) -> bool {
        self.profile
    }

    /// Drops accumulated profile data.
    pub fn clear_profile(&self) {
        self.time_map.borrow_mut().clear();
    }
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_zero_copy() {
        let queue = Queue::new(false);
        let mut a: Buffer<i32> = Buffer::new("a", 8);
        let mut b: Buffer<i32> = Buffer::new("b", 8);

        queue.write(&mut a, &[1, 2, 3]);
        assert_eq!(queue.read(&a, 4), vec![1, 2, 3, 0]);

        queue.copy_from_to(&a, &mut b);
        assert_eq!(queue.read(&b, 0).len(), 8);
        assert_eq!(queue.read(&b, 3), vec![1, 2, 3]);

        queue.zero(&mut b, 2);
        assert_eq!(queue.read(&b, 3), vec![0, 0, 3]);

        let mut out = Vec::new();
        queue.read_async(&b, &mut out, 3);
        queue.finish();
        assert_eq!(out, vec![0, 0, 3]);
    }

    #[test]
    fn profiling_accumulates_calls() {
        let queue = Queue::new(true);
        queue.run("k1", || {});
        queue.run("k1", || {});
        queue.run("k2", || {});
        queue.finish();

        let profile = queue.profile();
        assert_eq!(profile.len(), 2);
        let k1 = profile.iter().find(|(_, name)| name == "k1").unwrap();
        assert_eq!(k1.0.n, 2);

        queue.clear_profile();
        assert!(queue.profile().is_empty());
    }

    #[test]
    fn unprofiled_queue_records_nothing() {
        let queue = Queue::new(false);
        queue.run("k", || {});
        assert!(queue.profile().is_empty());
    }
}
