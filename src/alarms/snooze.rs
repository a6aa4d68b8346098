use log::info;
use serde::{Deserialize, Serialize};

use crate::simulation::timers::Countdown;

pub const SNOOZE_DURATION_MS: u64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnoozeChange {
    Snoozed,
    CancelledByOperator,
    Expired,
}

/// Silences alarm escalation for a fixed time. The violation set is untouched.
#[derive(Debug, Clone, Default)]
pub struct AlarmSnooze {
    timer: Option<Countdown>,
}

impl AlarmSnooze {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self, now_ms: u64) -> SnoozeChange {
        if self.timer.take().is_some() {
            info!("Alarm snooze cancelled by operator");
            SnoozeChange::CancelledByOperator
        } else {
            self.timer = Some(Countdown::start(now_ms, SNOOZE_DURATION_MS));
            info!("Alarms snoozed for {} s", SNOOZE_DURATION_MS / 1000);
            SnoozeChange::Snoozed
        }
    }

    /// Drops the timer without reporting a change. Returns whether one was running.
    pub fn reset(&mut self) -> bool {
        self.timer.take().is_some()
    }

    /// Clears an elapsed snooze.
    pub fn poll(&mut self, now_ms: u64) -> Option<SnoozeChange> {
        match self.timer {
            Some(timer) if timer.is_expired(now_ms) => {
                self.timer = None;
                info!("Alarm snooze expired");
                Some(SnoozeChange::Expired)
            }
            _ => None,
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        self.timer.map_or(false, |t| !t.is_expired(now_ms))
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.timer.map(|t| t.deadline_ms)
    }

    /// Whole seconds left, rounded up, for the countdown display.
    pub fn remaining_seconds(&self, now_ms: u64) -> Option<u64> {
        self.timer
            .filter(|t| !t.is_expired(now_ms))
            .map(|t| (t.remaining_ms(now_ms) + 999) / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snooze_toggle_and_cancel() {
        let mut snooze = AlarmSnooze::new();
        assert_eq!(snooze.toggle(0), SnoozeChange::Snoozed);
        assert!(snooze.is_active(1_000));
        assert_eq!(snooze.remaining_seconds(1_000), Some(119));
        assert_eq!(snooze.remaining_seconds(1_500), Some(119));
        assert_eq!(snooze.toggle(2_000), SnoozeChange::CancelledByOperator);
        assert!(!snooze.is_active(2_000));
        assert_eq!(snooze.remaining_seconds(2_000), None);
    }

    #[test]
    fn test_snooze_expires() {
        let mut snooze = AlarmSnooze::new();
        snooze.toggle(10_000);
        assert_eq!(snooze.poll(129_999), None);
        assert_eq!(snooze.poll(130_000), Some(SnoozeChange::Expired));
        assert!(!snooze.is_active(130_000));
        assert_eq!(snooze.poll(130_001), None);
    }

    #[test]
    fn test_reset_is_silent() {
        let mut snooze = AlarmSnooze::new();
        assert!(!snooze.reset());
        snooze.toggle(0);
        assert!(snooze.reset());
        assert_eq!(snooze.deadline_ms(), None);
    }
}
