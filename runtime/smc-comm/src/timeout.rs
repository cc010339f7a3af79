//! Secure-world timeout interpretation

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::layout::{TIME_IMMEDIATE, TIME_INFINITE};

/// What the polling engine does with the timeout the secure side published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPlan {
    /// Return to the secure side without sleeping
    Immediate,
    /// Sleep until woken
    Forever,
    /// Sleep until woken or the duration elapses
    For(Duration),
}

/// Milliseconds since the Unix epoch, the unit of the shared clock registers
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Classify an absolute timeout against `now_ms`
///
/// Differences that do not fit in 32 bits of milliseconds, like any sleep
/// longer than `max_sleep`, are clamped to `max_sleep`.
pub fn classify(timeout_ms: u64, now_ms: u64, max_sleep: Duration) -> SleepPlan {
    match timeout_ms {
        TIME_IMMEDIATE => SleepPlan::Immediate,
        TIME_INFINITE => SleepPlan::Forever,
        t if t <= now_ms => SleepPlan::Immediate,
        t => {
            let delta = t - now_ms;
            if delta >> 32 != 0 {
                SleepPlan::For(max_sleep)
            } else {
                SleepPlan::For(Duration::from_millis(delta).min(max_sleep))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(3600);

    #[test]
    fn test_sentinels() {
        assert_eq!(classify(TIME_IMMEDIATE, 1000, MAX), SleepPlan::Immediate);
        assert_eq!(classify(TIME_INFINITE, 1000, MAX), SleepPlan::Forever);
    }

    #[test]
    fn test_expired_timeout_is_immediate() {
        assert_eq!(classify(999, 1000, MAX), SleepPlan::Immediate);
        assert_eq!(classify(1000, 1000, MAX), SleepPlan::Immediate);
    }

    #[test]
    fn test_relative_sleep() {
        assert_eq!(
            classify(1250, 1000, MAX),
            SleepPlan::For(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_clamping() {
        // Fits in 32 bits but exceeds the maximum sleep
        assert_eq!(classify(1000 + 7_200_000, 1000, MAX), SleepPlan::For(MAX));
        // Does not fit in 32 bits
        assert_eq!(classify(1000 + (1u64 << 33), 1000, MAX), SleepPlan::For(MAX));
    }

    #[test]
    fn test_wall_clock_moves_forward() {
        let a = wall_clock_ms();
        let b = wall_clock_ms();
        assert!(a > 0 && b >= a);
    }
}
