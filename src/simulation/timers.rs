use serde::{Deserialize, Serialize};

/// Fixed-length deadline on the simulation clock (milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub started_ms: u64,
    pub deadline_ms: u64,
}

impl Countdown {
    pub fn start(now_ms: u64, duration_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            deadline_ms: now_ms.saturating_add(duration_ms),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.deadline_ms - self.started_ms
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.deadline_ms.saturating_sub(now_ms)
    }

    /// Fraction of the duration elapsed, in `[0, 1]`.
    pub fn progress(&self, now_ms: u64) -> f64 {
        let duration = self.duration_ms();
        if duration == 0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(self.started_ms) as f64;
        (elapsed / duration as f64).clamp(0.0, 1.0)
    }
}
