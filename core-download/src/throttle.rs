//! Progress throttling.
//!
//! A transfer reports progress when it has advanced by at least
//! `min_step_percent` or when `min_interval` has elapsed since the last
//! report, whichever comes first.

use std::time::{Duration, Instant};

pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    last_percent: u8,
    min_step_percent: u8,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_step_percent: u8, min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            last_percent: 0,
            min_step_percent,
            min_interval,
        }
    }

    pub fn should_emit(&mut self, downloaded: u64, total: Option<u64>) -> bool {
        self.should_emit_at(Instant::now(), downloaded, total)
    }

    fn should_emit_at(&mut self, now: Instant, downloaded: u64, total: Option<u64>) -> bool {
        let percent = percent_of(downloaded, total);
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.duration_since(last) >= self.min_interval
                    || percent >= self.last_percent.saturating_add(self.min_step_percent.max(1))
            }
        };

        if due {
            self.last_emit = Some(now);
            self.last_percent = percent;
        }
        due
    }
}

pub(crate) fn percent_of(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => ((downloaded.min(total) as u128 * 100) / total as u128) as u8,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_always_emits() {
        let mut throttle = ProgressThrottle::new(1, Duration::from_secs(1));
        assert!(throttle.should_emit(0, None));
    }

    #[test]
    fn test_percent_step() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(1, Duration::from_secs(60));
        assert!(throttle.should_emit_at(start, 0, Some(1000)));
        assert!(!throttle.should_emit_at(start, 5, Some(1000)));
        assert!(throttle.should_emit_at(start, 10, Some(1000)));
        assert!(!throttle.should_emit_at(start, 15, Some(1000)));
        assert!(throttle.should_emit_at(start, 500, Some(1000)));
    }

    #[test]
    fn test_interval_elapsed_emits_without_step() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(1, Duration::from_secs(1));
        assert!(throttle.should_emit_at(start, 0, None));
        assert!(!throttle.should_emit_at(start + Duration::from_millis(500), 100, None));
        assert!(throttle.should_emit_at(start + Duration::from_millis(1000), 200, None));
    }
}
