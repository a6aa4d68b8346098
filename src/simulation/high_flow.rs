use log::debug;
use serde::{Deserialize, Serialize};

use crate::snapshot::round_to;
use crate::state::clamp_percent;

pub const TEMPERATURE_RAMP_MS: u64 = 15_000;
/// Target changes smaller than this snap instead of ramping.
const RAMP_THRESHOLD: f64 = 0.05;
/// Water used per L/min of flow in one 2 s tick, in percent of the chamber.
const WATER_PER_LPM_PER_TICK: f64 = 0.0022 / 30.0;
const REFERENCE_TICK_SECONDS: f64 = 2.0;

/// Linear temperature ramp over `TEMPERATURE_RAMP_MS`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRamp {
    pub start: f64,
    pub end: f64,
    pub started_ms: u64,
}

impl TemperatureRamp {
    pub fn progress(&self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.started_ms) as f64;
        (elapsed / TEMPERATURE_RAMP_MS as f64).clamp(0.0, 1.0)
    }

    pub fn is_complete(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_ms) >= TEMPERATURE_RAMP_MS
    }

    /// Displayed value, rounded to 0.1 toward the start so the end value only
    /// shows once the ramp has elapsed.
    pub fn value_at(&self, now_ms: u64) -> f64 {
        if self.is_complete(now_ms) {
            return self.end;
        }
        let raw = self.start + (self.end - self.start) * self.progress(now_ms);
        let (low, high) = if self.end >= self.start {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        let shown = if self.end >= self.start {
            (raw * 10.0).floor() / 10.0
        } else {
            (raw * 10.0).ceil() / 10.0
        };
        shown.clamp(low, high)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HighFlowThermal {
    ramp: Option<TemperatureRamp>,
}

impl HighFlowThermal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ramp(&self) -> Option<&TemperatureRamp> {
        self.ramp.as_ref()
    }

    pub fn reset(&mut self) {
        self.ramp = None;
    }

    /// Delivered temperature at `now_ms`. A new ramp starts from `current`
    /// whenever the target moves away from the running ramp's end.
    pub fn advance(&mut self, current: f64, target: f64, now_ms: u64) -> f64 {
        if let Some(ramp) = self.ramp {
            if (ramp.end - target).abs() < f64::EPSILON {
                let value = ramp.value_at(now_ms);
                if ramp.is_complete(now_ms) {
                    self.ramp = None;
                }
                return value;
            }
        }

        if (target - current).abs() > RAMP_THRESHOLD {
            debug!("Temperature ramp {:.1} -> {:.1} °C", current, target);
            self.ramp = Some(TemperatureRamp {
                start: current,
                end: target,
                started_ms: now_ms,
            });
            current
        } else {
            self.ramp = None;
            target
        }
    }
}

/// Warm-up is over once the displayed temperature matches the rounded target.
pub fn warm_up_reached(delivered: f64, target: f64) -> bool {
    (delivered - round_to(target, 1)).abs() < 1e-9
}

pub fn consume_water(level_percent: f64, fgf: f64, tick_seconds: f64) -> f64 {
    let used = fgf.max(0.0) * WATER_PER_LPM_PER_TICK * tick_seconds.max(0.0) / REFERENCE_TICK_SECONDS;
    clamp_percent(level_percent - used)
}
