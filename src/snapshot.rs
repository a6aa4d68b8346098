use serde::{Deserialize, Serialize};
use std::fmt;

/// A monitored value, or the explicit marker for "not applicable in this state".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reading {
    Value(f64),
    #[default]
    Unavailable,
}

impl Reading {
    /// Non-finite input becomes `Unavailable`.
    pub fn from_finite(value: f64) -> Self {
        if value.is_finite() {
            Reading::Value(value)
        } else {
            Reading::Unavailable
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::Unavailable => None,
        }
    }

    pub fn or(self, fallback: f64) -> f64 {
        self.value().unwrap_or(fallback)
    }

    pub fn is_available(self) -> bool {
        matches!(self, Reading::Value(_))
    }

    pub fn map(self, f: impl FnOnce(f64) -> f64) -> Self {
        match self {
            Reading::Value(v) => Reading::from_finite(f(v)),
            Reading::Unavailable => Reading::Unavailable,
        }
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Reading::from_finite(value)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value(v) => match f.precision() {
                Some(p) => write!(f, "{:.*}", p, v),
                None => write!(f, "{}", v),
            },
            Reading::Unavailable => f.write_str("--"),
        }
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Everything the engine derives in one tick. Replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredSnapshot {
    pub peak_pressure: Reading,
    pub plateau_pressure: Reading,
    pub mean_pressure: Reading,
    pub peep: Reading,
    pub inspired_volume: Reading,
    pub expired_volume: Reading,
    pub minute_volume: Reading,
    pub ml_per_kg: Reading,
    pub set_frequency: Reading,
    pub measured_frequency: Reading,
    pub ti_ttot: Reading,
    pub leak_percent: Reading,
    pub etco2: Reading,
    pub spo2: Reading,
    /// End-tidal concentration for the first and second selected agent.
    pub et_agent: [Reading; 2],
    /// Inspired concentration for the first and second selected agent.
    pub fi_agent: [Reading; 2],
    pub inspired_co2: Reading,
    pub fio2: Reading,
    pub delivered_flow: Reading,
    pub soda_lime_remaining_percent: Reading,
    pub water_level_percent: Reading,
    pub delivered_temperature: Reading,
    pub humidifier_temperature: Reading,
}

impl Default for MonitoredSnapshot {
    fn default() -> Self {
        Self {
            peak_pressure: Reading::Unavailable,
            plateau_pressure: Reading::Unavailable,
            mean_pressure: Reading::Unavailable,
            peep: Reading::Unavailable,
            inspired_volume: Reading::Unavailable,
            expired_volume: Reading::Unavailable,
            minute_volume: Reading::Unavailable,
            ml_per_kg: Reading::Unavailable,
            set_frequency: Reading::Unavailable,
            measured_frequency: Reading::Unavailable,
            ti_ttot: Reading::Unavailable,
            leak_percent: Reading::Unavailable,
            etco2: Reading::Value(35.0),
            spo2: Reading::Value(98.0),
            et_agent: [Reading::Unavailable; 2],
            fi_agent: [Reading::Unavailable; 2],
            inspired_co2: Reading::Unavailable,
            fio2: Reading::Unavailable,
            delivered_flow: Reading::Unavailable,
            soda_lime_remaining_percent: Reading::Unavailable,
            water_level_percent: Reading::Unavailable,
            delivered_temperature: Reading::Unavailable,
            humidifier_temperature: Reading::Unavailable,
        }
    }
}

impl MonitoredSnapshot {
    /// Clears every breath-derived value.
    pub fn clear_breath_values(&mut self) {
        self.peak_pressure = Reading::Unavailable;
        self.plateau_pressure = Reading::Unavailable;
        self.mean_pressure = Reading::Unavailable;
        self.inspired_volume = Reading::Unavailable;
        self.expired_volume = Reading::Unavailable;
        self.minute_volume = Reading::Unavailable;
        self.ml_per_kg = Reading::Unavailable;
        self.measured_frequency = Reading::Unavailable;
        self.ti_ttot = Reading::Unavailable;
        self.leak_percent = Reading::Unavailable;
    }

    /// Labelled values in a stable order, for export.
    pub fn fields(&self) -> Vec<(&'static str, Reading)> {
        vec![
            ("PEAK_PRESSURE", self.peak_pressure),
            ("PLATEAU_PRESSURE", self.plateau_pressure),
            ("MEAN_PRESSURE", self.mean_pressure),
            ("PEEP", self.peep),
            ("INSPIRED_VOLUME", self.inspired_volume),
            ("EXPIRED_VOLUME", self.expired_volume),
            ("MINUTE_VOLUME", self.minute_volume),
            ("ML_PER_KG", self.ml_per_kg),
            ("SET_FREQUENCY", self.set_frequency),
            ("MEASURED_FREQUENCY", self.measured_frequency),
            ("TI_TTOT", self.ti_ttot),
            ("LEAK_PERCENT", self.leak_percent),
            ("ETCO2", self.etco2),
            ("SPO2", self.spo2),
            ("ET_AGENT_1", self.et_agent[0]),
            ("ET_AGENT_2", self.et_agent[1]),
            ("FI_AGENT_1", self.fi_agent[0]),
            ("FI_AGENT_2", self.fi_agent[1]),
            ("INSPIRED_CO2", self.inspired_co2),
            ("FIO2", self.fio2),
            ("DELIVERED_FLOW", self.delivered_flow),
            ("SODA_LIME_REMAINING", self.soda_lime_remaining_percent),
            ("WATER_LEVEL", self.water_level_percent),
            ("DELIVERED_TEMPERATURE", self.delivered_temperature),
            ("HUMIDIFIER_TEMPERATURE", self.humidifier_temperature),
        ]
    }
}
