use super::{secretions_noise, WaveformInputs, WaveformModel, WaveformPoint};
use crate::models::{breath_period_ms, inspiratory_fraction};
use crate::noise::NoiseSource;
use crate::state::VentilationMode;

/// Constant-flow inspiration, optional pause, passive exponential expiration.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeControlWaveform;

/// Phase boundaries of one volume-controlled breath, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreathTiming {
    pub inspiratory_s: f64,
    pub flow_s: f64,
    /// L/s during the flow phase.
    pub flow_lps: f64,
}

impl VolumeControlWaveform {
    pub fn new() -> Self {
        Self
    }

    pub fn timing(inputs: &WaveformInputs) -> BreathTiming {
        let settings = inputs.settings;
        let cycle_s = breath_period_ms(settings.frequency) / 1000.0;
        let inspiratory_s = cycle_s * inspiratory_fraction(VentilationMode::Vc, settings);
        let pause_s = inspiratory_s * settings.inspiratory_pause_percent.clamp(0.0, 100.0) / 100.0;
        let flow_s = inspiratory_s - pause_s;
        let flow_lps = if flow_s > 0.0 {
            settings.tidal_volume / 1000.0 / flow_s
        } else {
            0.0
        };
        BreathTiming {
            inspiratory_s,
            flow_s,
            flow_lps,
        }
    }
}

impl WaveformModel for VolumeControlWaveform {
    fn sample(&self, inputs: &WaveformInputs, noise: &mut dyn NoiseSource) -> WaveformPoint {
        let settings = inputs.settings;
        let peep = settings.peep;
        let c = inputs.compliance;
        let r = inputs.resistance;
        let tidal_volume = settings.tidal_volume;
        let timing = Self::timing(inputs);
        let t = inputs.time_in_cycle_s();

        let mut point = if t <= timing.flow_s {
            let volume = timing.flow_lps * t * 1000.0;
            WaveformPoint::new(peep + timing.flow_lps * r + volume / c, timing.flow_lps * 60.0, volume)
        } else if t <= timing.inspiratory_s {
            WaveformPoint::new(peep + tidal_volume / c, 0.0, tidal_volume)
        } else {
            let te = t - timing.inspiratory_s;
            let rc = (c / 1000.0) * r;
            if rc > 0.01 {
                let decay = (-te / rc).exp();
                let volume = tidal_volume * decay;
                WaveformPoint::new(peep + (tidal_volume / c) * decay, -(volume / 1000.0 / rc) * 60.0, volume)
            } else {
                WaveformPoint::baseline(peep)
            }
        };

        let (pressure_noise, flow_noise) = secretions_noise(inputs.secretions, inputs.elapsed_seconds(), noise);
        point.pressure += pressure_noise;
        point.flow += flow_noise;
        point
    }
}
