//! Wall-clock millisecond timestamps.
//!
//! Both heartbeat protocols compare epoch milliseconds across processes, so
//! the clock must be the shared system one, not a per-process monotonic.

use chrono::Utc;

/// Current time as epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are past 2020 and before 2100.
        assert!(a > 1_577_836_800_000);
        assert!(a < 4_102_444_800_000);
    }
}
