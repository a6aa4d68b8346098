pub mod hold;
pub mod manual;
pub mod pressure_support;
pub mod sampler;
pub mod sweep;
pub mod template;
pub mod volume_control;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::models::FALLBACK_BREATH_PERIOD_MS;
use crate::noise::NoiseSource;
use crate::state::{positive_or, ControlSettings, PatientPhysiology};

pub use sampler::{sample, ui_cycle_ms, WaveformSource};
pub use sweep::{SweepClock, SweepSpeed};

/// Instantaneous airway signal: pressure in cmH2O, flow in L/min, volume in mL.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WaveformPoint {
    pub pressure: f64,
    pub flow: f64,
    pub volume: f64,
}

impl WaveformPoint {
    pub fn new(pressure: f64, flow: f64, volume: f64) -> Self {
        Self {
            pressure,
            flow,
            volume,
        }
    }

    /// Constant pressure, no flow, no volume.
    pub fn baseline(pressure: f64) -> Self {
        Self::new(pressure, 0.0, 0.0)
    }

    /// Replaces every non-finite component: PEEP for pressure, 0 otherwise.
    pub fn guarded(self, peep: f64) -> Self {
        let peep = if peep.is_finite() { peep } else { 0.0 };
        let or = |v: f64, fallback: f64| if v.is_finite() { v } else { fallback };
        Self {
            pressure: or(self.pressure, peep),
            flow: or(self.flow, 0.0),
            volume: or(self.volume, 0.0),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.pressure.is_finite() && self.flow.is_finite() && self.volume.is_finite()
    }
}

/// Everything a waveform model reads for one sample.
#[derive(Debug, Clone)]
pub struct WaveformInputs<'a> {
    pub settings: &'a ControlSettings,
    /// mL/cmH2O, always positive.
    pub compliance: f64,
    /// cmH2O·s/L, always positive.
    pub resistance: f64,
    pub inspiratory_effort: f64,
    pub secretions: f64,
    pub elapsed_ms: f64,
    /// Display breath period the trace repeats on.
    pub cycle_ms: f64,
}

impl<'a> WaveformInputs<'a> {
    pub fn new(settings: &'a ControlSettings, physiology: &PatientPhysiology, elapsed_ms: f64, cycle_ms: f64) -> Self {
        Self {
            settings,
            compliance: physiology.effective_compliance(),
            resistance: physiology.effective_resistance(),
            inspiratory_effort: physiology.inspiratory_effort(),
            secretions: physiology.secretions(),
            elapsed_ms: if elapsed_ms.is_finite() { elapsed_ms.max(0.0) } else { 0.0 },
            cycle_ms: positive_or(cycle_ms, FALLBACK_BREATH_PERIOD_MS),
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_ms / 1000.0
    }

    /// Seconds since the start of the current display cycle.
    pub fn time_in_cycle_s(&self) -> f64 {
        (self.elapsed_ms / 1000.0).rem_euclid(self.cycle_ms / 1000.0)
    }
}

pub trait WaveformModel {
    fn sample(&self, inputs: &WaveformInputs, noise: &mut dyn NoiseSource) -> WaveformPoint;
}

/// Airway noise from secretions: two sines at randomly drawn frequencies.
/// Returns `(pressure, flow)` offsets.
pub(crate) fn secretions_noise(secretions: f64, t_s: f64, noise: &mut dyn NoiseSource) -> (f64, f64) {
    if secretions <= 0.0 {
        return (0.0, 0.0);
    }
    let f1 = 15.0 + noise.unit() * 5.0;
    let f2 = 8.0 + noise.unit() * 3.0;
    let shape = (2.0 * PI * f1 * t_s).sin() + 0.5 * (2.0 * PI * f2 * t_s + PI / 3.0).sin();
    (secretions * 0.5 * shape, secretions * 4.0 * shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::FixedNoise;

    #[test]
    fn test_guard_replaces_non_finite_components() {
        let point = WaveformPoint::new(f64::NAN, f64::INFINITY, f64::NEG_INFINITY).guarded(5.0);
        assert_eq!(point, WaveformPoint::new(5.0, 0.0, 0.0));
        assert_eq!(WaveformPoint::new(f64::NAN, 1.0, 2.0).guarded(f64::NAN).pressure, 0.0);
    }

    #[test]
    fn test_secretions_noise_is_bounded() {
        let mut noise = FixedNoise(0.9);
        for i in 0..200 {
            let (p, f) = secretions_noise(0.6, i as f64 * 0.013, &mut noise);
            assert!(p.abs() <= 0.6 * 0.5 * 1.5 + 1e-12);
            assert!(f.abs() <= 0.6 * 4.0 * 1.5 + 1e-12);
        }
        assert_eq!(secretions_noise(0.0, 1.0, &mut noise), (0.0, 0.0));
    }

    #[test]
    fn test_time_in_cycle_wraps() {
        let settings = ControlSettings::default();
        let physiology = PatientPhysiology::default();
        let inputs = WaveformInputs::new(&settings, &physiology, 12_500.0, 5_000.0);
        assert!((inputs.time_in_cycle_s() - 2.5).abs() < 1e-12);

        let degenerate = WaveformInputs::new(&settings, &physiology, f64::NAN, 0.0);
        assert_eq!(degenerate.elapsed_ms, 0.0);
        assert_eq!(degenerate.cycle_ms, FALLBACK_BREATH_PERIOD_MS);
    }
}
