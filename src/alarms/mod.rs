pub mod snooze;

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{VentError, VentResult};
use crate::snapshot::{MonitoredSnapshot, Reading};
use crate::state::{OperatingContext, VentilationMode};

pub use snooze::{AlarmSnooze, SnoozeChange, SNOOZE_DURATION_MS};

/// Water level (%) below which the high-flow humidifier asks for a refill.
pub const WATER_LOW_THRESHOLD_PERCENT: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmKey {
    PPeak,
    VolumeMinute,
    Etco2,
    Fio2,
    Peep,
    DeliveredFlow,
    Frequency,
    MeasuredFrequency,
    LeakPercentage,
    InspiratoryCo2,
    EtAgentConcentration,
    CheckWater,
}

impl AlarmKey {
    pub const ALL: [AlarmKey; 12] = [
        AlarmKey::PPeak,
        AlarmKey::VolumeMinute,
        AlarmKey::Etco2,
        AlarmKey::Fio2,
        AlarmKey::Peep,
        AlarmKey::DeliveredFlow,
        AlarmKey::Frequency,
        AlarmKey::MeasuredFrequency,
        AlarmKey::LeakPercentage,
        AlarmKey::InspiratoryCo2,
        AlarmKey::EtAgentConcentration,
        AlarmKey::CheckWater,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AlarmKey::PPeak => "Peak pressure",
            AlarmKey::VolumeMinute => "Minute volume",
            AlarmKey::Etco2 => "EtCO2",
            AlarmKey::Fio2 => "FiO2",
            AlarmKey::Peep => "PEEP",
            AlarmKey::DeliveredFlow => "Delivered flow",
            AlarmKey::Frequency => "Set frequency",
            AlarmKey::MeasuredFrequency => "Measured frequency",
            AlarmKey::LeakPercentage => "Leak",
            AlarmKey::InspiratoryCo2 => "Inspired CO2",
            AlarmKey::EtAgentConcentration => "Et agent",
            AlarmKey::CheckWater => "Check water",
        }
    }

    /// Toggle alarms compare against a fixed threshold and ignore limits.
    pub fn is_toggle(self) -> bool {
        matches!(self, AlarmKey::CheckWater)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmLimits {
    pub low: Option<f64>,
    pub high: Option<f64>,
    pub enabled: bool,
}

impl AlarmLimits {
    pub fn new(low: Option<f64>, high: Option<f64>) -> Self {
        Self {
            low,
            high,
            enabled: true,
        }
    }

    pub fn is_violated(&self, value: f64, check_low: bool) -> bool {
        let below = check_low && self.low.map_or(false, |low| value < low);
        let above = self.high.map_or(false, |high| value > high);
        below || above
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmConfig {
    limits: BTreeMap<AlarmKey, AlarmLimits>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        let limits = AlarmKey::ALL
            .iter()
            .map(|&key| {
                let limits = match key {
                    AlarmKey::PPeak => AlarmLimits::new(Some(10.0), Some(40.0)),
                    AlarmKey::VolumeMinute => AlarmLimits::new(Some(2.0), Some(15.0)),
                    AlarmKey::Etco2 => AlarmLimits::new(Some(25.0), Some(50.0)),
                    AlarmKey::Fio2 => AlarmLimits::new(Some(21.0), Some(99.0)),
                    AlarmKey::Peep => AlarmLimits::new(Some(0.0), Some(20.0)),
                    AlarmKey::DeliveredFlow => AlarmLimits::new(Some(5.0), Some(70.0)),
                    AlarmKey::Frequency => AlarmLimits::new(Some(5.0), Some(35.0)),
                    AlarmKey::MeasuredFrequency => AlarmLimits::new(Some(5.0), Some(35.0)),
                    AlarmKey::LeakPercentage => AlarmLimits::new(None, Some(30.0)),
                    AlarmKey::InspiratoryCo2 => AlarmLimits::new(None, Some(5.0)),
                    AlarmKey::EtAgentConcentration => AlarmLimits::new(Some(0.1), Some(5.0)),
                    AlarmKey::CheckWater => AlarmLimits::new(None, None),
                };
                (key, limits)
            })
            .collect();
        Self { limits }
    }
}

impl AlarmConfig {
    pub fn get(&self, key: AlarmKey) -> Option<&AlarmLimits> {
        self.limits.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AlarmKey, &AlarmLimits)> {
        self.limits.iter()
    }

    /// Replaces the limits of one key. A low limit above the high limit is rejected.
    pub fn set(&mut self, key: AlarmKey, limits: AlarmLimits) -> VentResult<()> {
        if let (Some(low), Some(high)) = (limits.low, limits.high) {
            if low > high {
                return Err(VentError::Validation(format!(
                    "{} alarm low limit {} is above high limit {}",
                    key.label(),
                    low,
                    high
                )));
            }
        }
        let finite = |v: Option<f64>| v.map_or(true, f64::is_finite);
        if !finite(limits.low) || !finite(limits.high) {
            return Err(VentError::Validation(format!("{} alarm limits must be finite", key.label())));
        }
        self.limits.insert(key, limits);
        Ok(())
    }

    pub fn set_enabled(&mut self, key: AlarmKey, enabled: bool) {
        self.limits
            .entry(key)
            .or_insert_with(|| AlarmLimits::new(None, None))
            .enabled = enabled;
    }

    /// Applies overrides on top of the current limits.
    pub fn merge(&mut self, overrides: &BTreeMap<AlarmKey, AlarmLimits>) -> VentResult<()> {
        for (&key, &limits) in overrides {
            self.set(key, limits)?;
        }
        Ok(())
    }
}

/// The value an alarm key watches, or `Unavailable` when it does not apply.
pub fn monitored_value(key: AlarmKey, snapshot: &MonitoredSnapshot, context: &OperatingContext) -> Reading {
    match key {
        AlarmKey::PPeak => snapshot.peak_pressure,
        AlarmKey::VolumeMinute => snapshot.minute_volume,
        AlarmKey::Etco2 => snapshot.etco2,
        AlarmKey::Fio2 => snapshot.fio2,
        AlarmKey::Peep => snapshot.peep,
        AlarmKey::DeliveredFlow if context.is_high_flow() => snapshot.delivered_flow,
        AlarmKey::Frequency => snapshot.set_frequency,
        AlarmKey::MeasuredFrequency => snapshot.measured_frequency,
        AlarmKey::LeakPercentage => snapshot.leak_percent,
        AlarmKey::InspiratoryCo2 => snapshot.inspired_co2,
        AlarmKey::EtAgentConcentration if context.is_anesthesia() && context.anesthesia_active => {
            snapshot.et_agent[0]
        }
        AlarmKey::CheckWater if context.is_high_flow() => snapshot.water_level_percent,
        _ => Reading::Unavailable,
    }
}

/// Alarms run only while the device is on and delivering therapy, and never
/// during self-test, disinfection or a hold maneuver.
pub fn evaluation_enabled(context: &OperatingContext, maneuver_active: bool) -> bool {
    context.powered_on
        && (context.ventilation_active || context.warming_up)
        && (!context.is_anesthesia() || context.mechanical_ventilation)
        && !context.self_test_running
        && !context.disinfecting
        && !maneuver_active
}

/// Pure violation check. Unavailable values never violate.
pub fn violations(
    snapshot: &MonitoredSnapshot,
    config: &AlarmConfig,
    context: &OperatingContext,
    maneuver_active: bool,
) -> BTreeSet<AlarmKey> {
    let mut violated = BTreeSet::new();
    if !evaluation_enabled(context, maneuver_active) {
        return violated;
    }

    for (&key, limits) in config.iter() {
        if !limits.enabled {
            continue;
        }
        let value = match monitored_value(key, snapshot, context).value() {
            Some(v) => v,
            None => continue,
        };

        let is_violated = if key.is_toggle() {
            value < WATER_LOW_THRESHOLD_PERCENT
        } else {
            // low peak pressure is expected in CPAP
            let check_low = !(key == AlarmKey::PPeak && context.ventilation_mode == VentilationMode::Cpap);
            limits.is_violated(value, check_low)
        };

        if is_violated {
            violated.insert(key);
        }
    }

    violated
}

/// Keeps the previous violation set so that newly violated keys can be reported once.
#[derive(Debug, Clone, Default)]
pub struct AlarmEvaluator {
    active: BTreeSet<AlarmKey>,
}

impl AlarmEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluates and returns the keys that fired on this evaluation.
    pub fn evaluate(
        &mut self,
        snapshot: &MonitoredSnapshot,
        config: &AlarmConfig,
        context: &OperatingContext,
        maneuver_active: bool,
    ) -> Vec<AlarmKey> {
        let current = violations(snapshot, config, context, maneuver_active);
        let fired: Vec<AlarmKey> = current.difference(&self.active).copied().collect();
        for key in &fired {
            warn!("Alarm fired: {}", key.label());
        }
        self.active = current;
        fired
    }

    pub fn active(&self) -> &BTreeSet<AlarmKey> {
        &self.active
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}
