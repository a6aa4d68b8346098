use super::{BreathInputs, BreathMechanics, BreathModel};
use crate::noise::NoiseSource;
use crate::snapshot::{round_to, Reading};

/// Constant-flow volume-controlled breath with an optional inspiratory pause.
#[derive(Debug, Clone, Default)]
pub struct VolumeControlModel;

impl VolumeControlModel {
    pub fn new() -> Self {
        Self
    }

    /// Inspiratory flow time in ms, i.e. Ti without the pause.
    pub fn flow_time_ms(inputs: &BreathInputs) -> f64 {
        let ti = inputs.inspiratory_time_ms();
        ti - ti * (pause_percent(inputs) / 100.0)
    }

    /// Constant inspiratory flow in L/s; 0 when there is no flow time.
    pub fn peak_flow_lps(inputs: &BreathInputs) -> f64 {
        let tif = Self::flow_time_ms(inputs);
        if tif > 0.0 {
            (inputs.settings.tidal_volume / 1000.0) / (tif / 1000.0)
        } else {
            0.0
        }
    }
}

fn pause_percent(inputs: &BreathInputs) -> f64 {
    let pause = inputs.settings.inspiratory_pause_percent;
    if pause.is_finite() && pause > 0.0 {
        pause
    } else {
        0.0
    }
}

impl BreathModel for VolumeControlModel {
    fn compute(&self, inputs: &BreathInputs, _noise: &mut dyn NoiseSource) -> BreathMechanics {
        let peep = inputs.settings.peep;
        let volume = inputs.settings.tidal_volume;

        let plateau = peep + volume / inputs.compliance;
        let peak = plateau + Self::peak_flow_lps(inputs) * inputs.resistance;

        BreathMechanics {
            peak_pressure: round_to(peak, 1).max(peep),
            plateau_pressure: if pause_percent(inputs) > 0.0 {
                Reading::from_finite(round_to(plateau, 1).max(peep))
            } else {
                Reading::Unavailable
            },
            inspired_volume: volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::FixedNoise;
    use crate::state::{ControlSettings, PatientPhysiology, VentilationMode};
    use approx::assert_relative_eq;

    fn physiology() -> PatientPhysiology {
        PatientPhysiology {
            compliance: 50.0,
            resistance: 10.0,
            ..PatientPhysiology::default()
        }
    }

    #[test]
    fn test_plateau_and_peak() {
        let settings = ControlSettings {
            tidal_volume: 500.0,
            peep: 5.0,
            inspiratory_pause_percent: 10.0,
            frequency: 12.0,
            ..ControlSettings::default()
        };
        let inputs = BreathInputs::new(&settings, &physiology(), VentilationMode::Vc, 12.0);
        let result = VolumeControlModel::new().compute(&inputs, &mut FixedNoise::midpoint());

        assert_eq!(result.plateau_pressure, Reading::Value(15.0));
        // Tif = 5000 / 3 * 0.9 = 1500 ms, flow = 0.5 L / 1.5 s
        assert_relative_eq!(VolumeControlModel::peak_flow_lps(&inputs), 1.0 / 3.0, epsilon = 1e-9);
        assert_relative_eq!(result.peak_pressure, 18.3);
        assert!(result.peak_pressure >= 15.0);
    }

    #[test]
    fn test_plateau_unavailable_without_pause() {
        let settings = ControlSettings {
            inspiratory_pause_percent: 0.0,
            ..ControlSettings::default()
        };
        let inputs = BreathInputs::new(&settings, &physiology(), VentilationMode::Vc, 12.0);
        let result = VolumeControlModel::new().compute(&inputs, &mut FixedNoise::midpoint());
        assert_eq!(result.plateau_pressure, Reading::Unavailable);
    }

    #[test]
    fn test_peak_floored_at_peep() {
        let settings = ControlSettings {
            tidal_volume: 0.0,
            peep: 8.0,
            ..ControlSettings::default()
        };
        let inputs = BreathInputs::new(&settings, &physiology(), VentilationMode::Vc, 12.0);
        let result = VolumeControlModel::new().compute(&inputs, &mut FixedNoise::midpoint());
        assert_relative_eq!(result.peak_pressure, 8.0);
    }

    #[test]
    fn test_full_pause_has_no_flow() {
        let settings = ControlSettings {
            inspiratory_pause_percent: 100.0,
            ..ControlSettings::default()
        };
        let inputs = BreathInputs::new(&settings, &physiology(), VentilationMode::Vc, 12.0);
        assert_eq!(VolumeControlModel::peak_flow_lps(&inputs), 0.0);
    }
}
