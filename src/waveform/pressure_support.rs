use std::f64::consts::PI;

use super::{secretions_noise, WaveformInputs, WaveformModel, WaveformPoint};
use crate::noise::NoiseSource;

/// Patient trigger window preceding every supported breath.
pub const TRIGGER_DURATION_S: f64 = 0.1;
/// Peak muscle pressure (cmH2O) at full inspiratory effort.
const MAX_MUSCLE_PRESSURE: f64 = 7.0;
const EXPIRATORY_RC_FACTOR: f64 = 1.2;
const MIN_RISE_TIME_CONSTANT: f64 = 0.01;

/// Pressure-supported breath: trigger dip, exponential rise toward PEEP + PS
/// with a sinusoidal patient effort, flow-cycled into a passive expiration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PressureSupportWaveform;

impl PressureSupportWaveform {
    pub fn new() -> Self {
        Self
    }

    /// Inspiratory time until flow decays to the cycle-off fraction.
    pub fn inspiratory_time_s(inputs: &WaveformInputs) -> f64 {
        let rc = Self::rc_seconds(inputs);
        let cycle_off = (inputs.settings.flow_cycle_off_percent / 100.0).clamp(0.01, 0.99);
        if rc > 0.0 {
            -rc * cycle_off.ln()
        } else {
            1.0
        }
    }

    fn rc_seconds(inputs: &WaveformInputs) -> f64 {
        (inputs.compliance / 1000.0) * inputs.resistance
    }
}

impl WaveformModel for PressureSupportWaveform {
    fn sample(&self, inputs: &WaveformInputs, noise: &mut dyn NoiseSource) -> WaveformPoint {
        let settings = inputs.settings;
        let peep = settings.peep;
        let t = inputs.time_in_cycle_s();

        if t < TRIGGER_DURATION_S {
            let remaining = 1.0 - t / TRIGGER_DURATION_S;
            return WaveformPoint::new(peep - remaining, -settings.trigger_flow * remaining, 0.0);
        }

        let c = inputs.compliance;
        let r = inputs.resistance;
        let rc = Self::rc_seconds(inputs);
        let ti = Self::inspiratory_time_s(inputs);
        let muscle = inputs.inspiratory_effort * MAX_MUSCLE_PRESSURE;
        let target_volume = (settings.ps_level + 0.5 * muscle) * c;
        let t_insp = t - TRIGGER_DURATION_S;

        let mut point = if t_insp < ti {
            let rise_tc = if settings.rise_time_seconds > MIN_RISE_TIME_CONSTANT {
                settings.rise_time_seconds / 3.0
            } else {
                MIN_RISE_TIME_CONSTANT
            };
            let vent_pressure = settings.ps_level * (1.0 - (-t_insp / rise_tc).exp());
            let volume = target_volume * (1.0 - (-t_insp / rc).exp());
            let alveolar = volume / c;
            let effort = muscle * (PI * t_insp / ti).sin();
            let flow_lps = (vent_pressure - alveolar) / r + effort / r;
            WaveformPoint::new(peep + vent_pressure, flow_lps * 60.0, volume)
        } else {
            let te = t_insp - ti;
            let rc_exp = rc * EXPIRATORY_RC_FACTOR;
            if rc_exp > 0.01 {
                let end_volume = target_volume * (1.0 - (-ti / rc).exp());
                let decay = (-te / rc_exp).exp();
                let above_peep = (end_volume / c) * decay;
                WaveformPoint::new(peep + above_peep, -(above_peep / r) * 60.0, end_volume * decay)
            } else {
                WaveformPoint::baseline(peep)
            }
        };

        let (pressure_noise, flow_noise) = secretions_noise(inputs.secretions, t, noise);
        point.pressure += pressure_noise;
        point.flow += flow_noise;
        point
    }
}
