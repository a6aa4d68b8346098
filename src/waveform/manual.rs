use std::f64::consts::PI;

use super::{WaveformInputs, WaveformModel, WaveformPoint};
use crate::noise::NoiseSource;

/// Hand bagging with the ventilator off: small oscillations around the APL
/// pressure and zero net volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualWaveform;

impl ManualWaveform {
    pub fn new() -> Self {
        Self
    }
}

impl WaveformModel for ManualWaveform {
    fn sample(&self, inputs: &WaveformInputs, noise: &mut dyn NoiseSource) -> WaveformPoint {
        let t = inputs.elapsed_seconds();
        let shape = 0.6 * (2.0 * PI * 7.0 * t).sin() + 0.4 * (2.0 * PI * 2.5 * t).sin();

        let (pressure_amplitude, flow_amplitude) = if inputs.secretions > 0.0 {
            (0.4 + noise.unit() * 0.6, 2.0 + noise.unit() * 3.0)
        } else {
            (0.1 + noise.unit() * 0.2, 0.5 + noise.unit() * 0.5)
        };

        WaveformPoint::new(
            inputs.settings.peep + pressure_amplitude * shape,
            flow_amplitude * shape,
            0.0,
        )
    }
}
