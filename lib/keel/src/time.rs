use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current wall-clock time as (seconds, nanoseconds) since
/// the unix epoch. Used by the ping protocol.
pub fn wallclock() -> (i64, i64) {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised");
    (now.as_secs() as i64, now.subsec_nanos() as i64)
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds elapsed since the first call in this process. Monotonic;
/// used for packet arrival timestamps.
pub fn monotonic_micros() -> i64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_micros_is_monotone() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[test]
    fn test_wallclock_is_plausible() {
        let (sec, nsec) = wallclock();
        // Some time after 2020-01-01 and nanoseconds within range.
        assert!(sec > 1_577_836_800);
        assert!((0..1_000_000_000).contains(&nsec));
    }
}
