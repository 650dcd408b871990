//! Progress-line formatting.

// ======================================================================
// FUNCTIONS - PUBLIC

/// Remaining time as `<days>d hh:mm`.
pub fn eta(step: u32, total: u32, secs_per_step: f64) -> String {
    let left = total.saturating_sub(step);
    let eta_mins = (f64::from(left) * secs_per_step / 60.0 + 0.5) as u64;
    format!(
        "{}d {:02}:{:02}",
        eta_mins / (24 * 60),
        eta_mins / 60 % 24,
        eta_mins % 60
    )
}

/// One progress line:
/// `<E> <status> <k> <pct>%; <us>/sq; ETA <d hh:mm>; <res64>`.
pub fn log_line(e: u32, status: &str, k: u32, res64: u64, secs_per_it: f64, n_iters: u32) -> String {
    format!(
        "{} {:>2} {:8} {:6.2}%; {:4} us/sq; ETA {}; {:016x}",
        e,
        status,
        k,
        f64::from(k) / f64::from(n_iters) * 100.0,
        (secs_per_it * 1e6 + 0.5) as u64,
        eta(k, n_iters, secs_per_it),
        res64
    )
}

// ======================================================================
// TESTS
