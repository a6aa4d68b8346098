use serde::{Deserialize, Serialize};

use crate::models::BreathPattern;
use crate::snapshot::{round_to, MonitoredSnapshot, Reading};
use crate::state::{ControlSettings, PatientPhysiology, VentilationMode};

pub const MANEUVER_HOLD_DURATION_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManeuverKind {
    InspiratoryHold,
    ExpiratoryHold,
}

/// A breath hold in progress. Dropped once the hold duration has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActiveManeuver {
    InspiratoryHold {
        started_ms: u64,
        captured_peak_pressure: Reading,
        /// L/s
        captured_avg_inspiratory_flow: Reading,
        held_volume: f64,
    },
    ExpiratoryHold {
        started_ms: u64,
    },
}

impl ActiveManeuver {
    /// Captures the pre-hold peak pressure, inspired volume and an average
    /// inspiratory flow from the set rate and Ti/Ttot.
    pub fn begin_inspiratory(now_ms: u64, snapshot: &MonitoredSnapshot) -> Self {
        let held_volume = snapshot.inspired_volume.or(0.0).max(0.0);
        let set_frequency = snapshot.set_frequency.or(0.0);
        let ti_ttot = snapshot.ti_ttot.or(0.0);

        let avg_flow = if set_frequency > 0.0 && ti_ttot > 0.0 && held_volume > 0.0 {
            let inspiratory_seconds = (60.0 / set_frequency) * ti_ttot;
            Reading::from_finite((held_volume / 1000.0) / inspiratory_seconds)
        } else {
            Reading::Unavailable
        };

        ActiveManeuver::InspiratoryHold {
            started_ms: now_ms,
            captured_peak_pressure: snapshot.peak_pressure,
            captured_avg_inspiratory_flow: avg_flow,
            held_volume,
        }
    }

    pub fn begin_expiratory(now_ms: u64) -> Self {
        ActiveManeuver::ExpiratoryHold { started_ms: now_ms }
    }

    pub fn kind(&self) -> ManeuverKind {
        match self {
            ActiveManeuver::InspiratoryHold { .. } => ManeuverKind::InspiratoryHold,
            ActiveManeuver::ExpiratoryHold { .. } => ManeuverKind::ExpiratoryHold,
        }
    }

    pub fn started_ms(&self) -> u64 {
        match *self {
            ActiveManeuver::InspiratoryHold { started_ms, .. } => started_ms,
            ActiveManeuver::ExpiratoryHold { started_ms } => started_ms,
        }
    }

    pub fn deadline_ms(&self) -> u64 {
        self.started_ms() + MANEUVER_HOLD_DURATION_MS
    }

    pub fn is_complete(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms()
    }

    pub fn held_volume(&self) -> f64 {
        match *self {
            ActiveManeuver::InspiratoryHold { held_volume, .. } => held_volume,
            ActiveManeuver::ExpiratoryHold { .. } => 0.0,
        }
    }

    /// Airway pressure held during the maneuver.
    pub fn hold_pressure(&self, settings: &ControlSettings, physiology: &PatientPhysiology, mode: VentilationMode) -> f64 {
        match self {
            ActiveManeuver::InspiratoryHold { held_volume, .. } => {
                inspiratory_plateau(settings, physiology, mode, *held_volume)
            }
            ActiveManeuver::ExpiratoryHold { .. } => settings.peep,
        }
    }

    /// Overwrites the breath values of `snapshot` with the held state.
    pub fn freeze(
        &self,
        snapshot: &mut MonitoredSnapshot,
        settings: &ControlSettings,
        physiology: &PatientPhysiology,
        mode: VentilationMode,
    ) {
        let pressure = Reading::Value(round_to(self.hold_pressure(settings, physiology, mode), 1));
        snapshot.peak_pressure = pressure;
        snapshot.plateau_pressure = pressure;
        snapshot.mean_pressure = pressure;
        snapshot.expired_volume = Reading::Value(0.0);
        snapshot.minute_volume = Reading::Value(0.0);
        snapshot.measured_frequency = Reading::Value(0.0);
        snapshot.leak_percent = Reading::Value(0.0);

        match self {
            ActiveManeuver::InspiratoryHold { held_volume, .. } => {
                snapshot.inspired_volume = Reading::Value(held_volume.round());
                snapshot.ti_ttot = Reading::Value(1.0);
            }
            ActiveManeuver::ExpiratoryHold { .. } => {
                snapshot.inspired_volume = Reading::Value(0.0);
                snapshot.ti_ttot = Reading::Value(0.0);
            }
        }
    }

    /// Builds the result package from the frozen snapshot.
    pub fn finish(&self, snapshot: &MonitoredSnapshot, settings: &ControlSettings) -> ManeuverResult {
        let peep = snapshot.peep.or(settings.peep);
        match *self {
            ActiveManeuver::InspiratoryHold {
                captured_peak_pressure,
                captured_avg_inspiratory_flow,
                held_volume,
                ..
            } => {
                let plateau = snapshot.plateau_pressure.or(peep);
                inspiratory_hold_results(
                    captured_peak_pressure,
                    plateau,
                    peep,
                    held_volume,
                    captured_avg_inspiratory_flow,
                )
            }
            ActiveManeuver::ExpiratoryHold { .. } => expiratory_hold_results(peep),
        }
    }
}

fn inspiratory_plateau(
    settings: &ControlSettings,
    physiology: &PatientPhysiology,
    mode: VentilationMode,
    held_volume: f64,
) -> f64 {
    let peep = settings.peep;
    match BreathPattern::resolve(mode, settings.ps_level) {
        Some(BreathPattern::VolumeControl) => peep + held_volume / physiology.effective_compliance(),
        Some(BreathPattern::PressureControl) => peep + settings.pressure_target,
        Some(BreathPattern::PressureSupport) => peep + settings.ps_level,
        Some(BreathPattern::Cpap) | None => peep,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManeuverEntry {
    pub label: String,
    pub value: Reading,
    pub unit: String,
}

impl ManeuverEntry {
    fn new(label: &str, value: Reading, unit: &str) -> Self {
        Self {
            label: label.to_string(),
            value,
            unit: unit.to_string(),
        }
    }
}

/// Ordered result list, kept until the operator clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManeuverResult {
    pub kind: ManeuverKind,
    pub entries: Vec<ManeuverEntry>,
}

impl ManeuverResult {
    pub fn get(&self, label: &str) -> Reading {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map_or(Reading::Unavailable, |e| e.value)
    }
}

pub fn inspiratory_hold_results(
    captured_peak: Reading,
    plateau: f64,
    peep: f64,
    held_volume: f64,
    avg_flow_lps: Reading,
) -> ManeuverResult {
    let peak = captured_peak.or(plateau);
    let driving = plateau - peep;
    let volume_litres = held_volume / 1000.0;

    let mut entries = vec![
        ManeuverEntry::new("Ppeak", Reading::from_finite(round_to(peak, 1)), "cmH2O"),
        ManeuverEntry::new("Pplat", Reading::from_finite(round_to(plateau, 1)), "cmH2O"),
        ManeuverEntry::new("PEEP", Reading::from_finite(round_to(peep, 1)), "cmH2O"),
        ManeuverEntry::new("VTi", Reading::from_finite(held_volume.round()), "mL"),
    ];

    if driving > 0.0 && volume_litres > 0.0 {
        let compliance_litres = volume_litres / driving;
        entries.push(ManeuverEntry::new("Pdrive", Reading::from_finite(round_to(driving, 1)), "cmH2O"));
        entries.push(ManeuverEntry::new(
            "Crs",
            Reading::from_finite(round_to(compliance_litres * 1000.0, 1)),
            "mL/cmH2O",
        ));
        entries.push(ManeuverEntry::new(
            "Elastance",
            Reading::from_finite(round_to(1.0 / compliance_litres, 1)),
            "cmH2O/L",
        ));
    } else {
        entries.push(ManeuverEntry::new("Pdrive", Reading::Unavailable, "cmH2O"));
        entries.push(ManeuverEntry::new("Crs", Reading::Unavailable, "mL/cmH2O"));
        entries.push(ManeuverEntry::new("Elastance", Reading::Unavailable, "cmH2O/L"));
    }

    let resistance = match (captured_peak.value(), avg_flow_lps.value()) {
        (Some(peak), Some(flow)) if flow > 0.0 && peak - plateau >= 0.0 => {
            Reading::from_finite(round_to((peak - plateau) / flow, 1))
        }
        _ => Reading::Unavailable,
    };
    entries.push(ManeuverEntry::new("Resistance", resistance, "cmH2O/L/s"));

    ManeuverResult {
        kind: ManeuverKind::InspiratoryHold,
        entries,
    }
}

pub fn expiratory_hold_results(peep: f64) -> ManeuverResult {
    let mut entries = vec![ManeuverEntry::new(
        "PEEPtot",
        Reading::from_finite(round_to(peep, 1)),
        "cmH2O",
    )];
    for (label, unit) in [
        ("Ppeak", "cmH2O"),
        ("Pplat", "cmH2O"),
        ("Pdrive", "cmH2O"),
        ("Crs", "mL/cmH2O"),
        ("Elastance", "cmH2O/L"),
        ("Resistance", "cmH2O/L/s"),
    ] {
        entries.push(ManeuverEntry::new(label, Reading::Unavailable, unit));
    }
    ManeuverResult {
        kind: ManeuverKind::ExpiratoryHold,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inspiratory_hold_compliance_and_resistance() {
        let result = inspiratory_hold_results(Reading::Value(20.0), 15.0, 5.0, 500.0, Reading::Value(0.5));

        assert_eq!(result.get("Pdrive"), Reading::Value(10.0));
        assert_eq!(result.get("Crs"), Reading::Value(50.0));
        assert_eq!(result.get("Elastance"), Reading::Value(20.0));
        assert_eq!(result.get("Resistance"), Reading::Value(10.0));
        assert_eq!(result.entries[0].label, "Ppeak");
        assert_eq!(result.entries.len(), 8);
    }

    #[test]
    fn test_degenerate_hold_reports_unavailable() {
        let result = inspiratory_hold_results(Reading::Unavailable, 5.0, 5.0, 0.0, Reading::Unavailable);

        assert_eq!(result.get("Ppeak"), Reading::Value(5.0));
        assert_eq!(result.get("Crs"), Reading::Unavailable);
        assert_eq!(result.get("Elastance"), Reading::Unavailable);
        assert_eq!(result.get("Resistance"), Reading::Unavailable);
    }

    #[test]
    fn test_negative_resistance_is_unavailable() {
        let result = inspiratory_hold_results(Reading::Value(12.0), 15.0, 5.0, 500.0, Reading::Value(0.5));
        assert_eq!(result.get("Resistance"), Reading::Unavailable);
        assert_eq!(result.get("Crs"), Reading::Value(50.0));
    }

    #[test]
    fn test_expiratory_hold_only_reports_total_peep() {
        let result = expiratory_hold_results(7.0);
        assert_eq!(result.kind, ManeuverKind::ExpiratoryHold);
        assert_eq!(result.get("PEEPtot"), Reading::Value(7.0));
        assert!(result.entries[1..].iter().all(|e| !e.value.is_available()));
    }

    #[test]
    fn test_begin_inspiratory_captures_flow() {
        let mut snapshot = MonitoredSnapshot::default();
        snapshot.peak_pressure = Reading::Value(20.0);
        snapshot.inspired_volume = Reading::Value(500.0);
        snapshot.set_frequency = Reading::Value(12.0);
        snapshot.ti_ttot = Reading::Value(0.2);

        let maneuver = ActiveManeuver::begin_inspiratory(1_000, &snapshot);
        match maneuver {
            ActiveManeuver::InspiratoryHold {
                captured_avg_inspiratory_flow,
                held_volume,
                ..
            } => {
                // Ti = 5 s * 0.2 = 1 s
                assert_relative_eq!(captured_avg_inspiratory_flow.or(0.0), 0.5);
                assert_relative_eq!(held_volume, 500.0);
            }
            other => panic!("unexpected maneuver {:?}", other),
        }
        assert_eq!(maneuver.deadline_ms(), 3_000);
        assert!(!maneuver.is_complete(2_999));
        assert!(maneuver.is_complete(3_000));
    }

    #[test]
    fn test_freeze_volume_control_hold() {
        let settings = ControlSettings::default();
        let physiology = PatientPhysiology {
            compliance: 50.0,
            ..PatientPhysiology::default()
        };
        let mut snapshot = MonitoredSnapshot::default();
        snapshot.inspired_volume = Reading::Value(500.0);

        let maneuver = ActiveManeuver::begin_inspiratory(0, &snapshot);
        maneuver.freeze(&mut snapshot, &settings, &physiology, VentilationMode::Vc);

        assert_eq!(snapshot.peak_pressure, Reading::Value(15.0));
        assert_eq!(snapshot.plateau_pressure, Reading::Value(15.0));
        assert_eq!(snapshot.mean_pressure, Reading::Value(15.0));
        assert_eq!(snapshot.minute_volume, Reading::Value(0.0));
        assert_eq!(snapshot.inspired_volume, Reading::Value(500.0));

        let expiratory = ActiveManeuver::begin_expiratory(0);
        expiratory.freeze(&mut snapshot, &settings, &physiology, VentilationMode::Pc);
        assert_eq!(snapshot.peak_pressure, Reading::Value(settings.peep));
        assert_eq!(snapshot.inspired_volume, Reading::Value(0.0));
    }

    #[test]
    fn test_hold_plateau_by_mode() {
        let settings = ControlSettings::default();
        let physiology = PatientPhysiology::default();
        let hold = ActiveManeuver::InspiratoryHold {
            started_ms: 0,
            captured_peak_pressure: Reading::Unavailable,
            captured_avg_inspiratory_flow: Reading::Unavailable,
            held_volume: 0.0,
        };
        assert_relative_eq!(hold.hold_pressure(&settings, &physiology, VentilationMode::Pc), 23.0);
        assert_relative_eq!(hold.hold_pressure(&settings, &physiology, VentilationMode::Ps), 15.0);
        assert_relative_eq!(hold.hold_pressure(&settings, &physiology, VentilationMode::Cpap), 5.0);
    }
}
