use serde::{Deserialize, Serialize};

use super::maneuver::{ManeuverKind, ManeuverResult};
use crate::alarms::{AlarmKey, SnoozeChange};
use crate::snapshot::MonitoredSnapshot;
use crate::state::{AnestheticAgent, SettingKey, VentilationMode};

/// Discrete things that happened during a session, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PoweredOn,
    PoweredOff,
    WarmUpStarted,
    VentilationStarted,
    VentilationStopped,
    AnesthesiaStarted,
    AnesthesiaStopped,
    MechanicalVentilationChanged { enabled: bool },
    ModeChanged { from: VentilationMode, to: VentilationMode },
    SettingChanged { key: SettingKey, value: f64 },
    IeRatioChanged { ratio: String },
    AgentSelectionChanged { agents: Vec<AnestheticAgent> },
    PatientChanged,
    HumidifierSwitched { on: bool },
    SelfTestChanged { running: bool },
    DisinfectionChanged { running: bool },
    ManeuverStarted { kind: ManeuverKind },
    ManeuverCompleted { result: ManeuverResult },
    O2FlushStarted,
    O2FlushEnded { fio2_restored: f64 },
    RefillStarted { agents: Vec<AnestheticAgent> },
    RefillCompleted { agents: Vec<AnestheticAgent> },
    SodaLimeReplacementStarted,
    SodaLimeReplaced,
    AlarmFired { key: AlarmKey },
    Snooze { change: SnoozeChange },
    ActionRejected { action: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub time_ms: u64,
    pub event: SessionEvent,
}

/// One stepper tick as seen by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub time_ms: u64,
    pub snapshot: MonitoredSnapshot,
    pub active_alarms: Vec<AlarmKey>,
    pub snooze_remaining_s: Option<u64>,
}

/// One waveform sample at its sweep position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaveformRecord {
    pub time_ms: f64,
    pub pixel: usize,
    pub pressure: f64,
    pub flow: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResult {
    pub ticks: Vec<TickRecord>,
    pub waveform: Vec<WaveformRecord>,
    pub events: Vec<TimedEvent>,
}

impl SessionResult {
    pub fn max_peak_pressure(&self) -> Option<f64> {
        self.ticks
            .iter()
            .filter_map(|t| t.snapshot.peak_pressure.value())
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    pub fn mean_minute_volume(&self) -> Option<f64> {
        mean(self.ticks.iter().filter_map(|t| t.snapshot.minute_volume.value()))
    }

    pub fn alarm_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.event, SessionEvent::AlarmFired { .. }))
            .count()
    }

    pub fn maneuver_results(&self) -> Vec<&ManeuverResult> {
        self.events
            .iter()
            .filter_map(|e| match &e.event {
                SessionEvent::ManeuverCompleted { result } => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn final_snapshot(&self) -> Option<&MonitoredSnapshot> {
        self.ticks.last().map(|t| &t.snapshot)
    }
}

/// Aggregates written next to the raw session files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub duration_s: f64,
    pub tick_count: usize,
    pub waveform_samples: usize,
    pub event_count: usize,
    pub alarms_fired: usize,
    pub maneuvers_completed: usize,
    pub max_peak_pressure: Option<f64>,
    pub mean_minute_volume: Option<f64>,
    pub mean_etco2: Option<f64>,
    pub final_soda_lime_remaining: Option<f64>,
}

impl SessionSummary {
    pub fn from_result(result: &SessionResult, duration_s: f64) -> Self {
        Self {
            duration_s,
            tick_count: result.ticks.len(),
            waveform_samples: result.waveform.len(),
            event_count: result.events.len(),
            alarms_fired: result.alarm_count(),
            maneuvers_completed: result.maneuver_results().len(),
            max_peak_pressure: result.max_peak_pressure(),
            mean_minute_volume: result.mean_minute_volume(),
            mean_etco2: mean(result.ticks.iter().filter_map(|t| t.snapshot.etco2.value())),
            final_soda_lime_remaining: result
                .final_snapshot()
                .and_then(|s| s.soda_lime_remaining_percent.value()),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Reading;
    use approx::assert_relative_eq;

    fn tick(time_ms: u64, peak: Reading, minute: Reading) -> TickRecord {
        TickRecord {
            time_ms,
            snapshot: MonitoredSnapshot {
                peak_pressure: peak,
                minute_volume: minute,
                ..MonitoredSnapshot::default()
            },
            active_alarms: Vec::new(),
            snooze_remaining_s: None,
        }
    }

    #[test]
    fn test_summary_skips_unavailable_values() {
        let result = SessionResult {
            ticks: vec![
                tick(0, Reading::Unavailable, Reading::Unavailable),
                tick(2_000, Reading::Value(18.0), Reading::Value(6.0)),
                tick(4_000, Reading::Value(21.0), Reading::Value(5.0)),
            ],
            waveform: Vec::new(),
            events: vec![TimedEvent {
                time_ms: 2_000,
                event: SessionEvent::AlarmFired { key: AlarmKey::PPeak },
            }],
        };

        let summary = SessionSummary::from_result(&result, 4.0);
        assert_eq!(summary.tick_count, 3);
        assert_eq!(summary.alarms_fired, 1);
        assert_eq!(summary.max_peak_pressure, Some(21.0));
        assert_relative_eq!(summary.mean_minute_volume.unwrap(), 5.5);
        assert_relative_eq!(summary.mean_etco2.unwrap(), 35.0);
    }

    #[test]
    fn test_empty_session_has_no_aggregates() {
        let summary = SessionSummary::from_result(&SessionResult::default(), 0.0);
        assert_eq!(summary.max_peak_pressure, None);
        assert_eq!(summary.mean_minute_volume, None);
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = SessionEvent::ModeChanged {
            from: VentilationMode::Vc,
            to: VentilationMode::Pc,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"mode_changed","from":"VC","to":"PC"}"#);
    }
}
