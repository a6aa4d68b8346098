use super::{WaveformInputs, WaveformModel, WaveformPoint};
use crate::noise::NoiseSource;
use crate::simulation::ActiveManeuver;
use crate::snapshot::Reading;

/// Flat trace while a breath hold is running.
#[derive(Debug, Clone, Copy)]
pub struct HoldWaveform {
    maneuver: ActiveManeuver,
    plateau_pressure: Reading,
}

impl HoldWaveform {
    pub fn new(maneuver: ActiveManeuver, plateau_pressure: Reading) -> Self {
        Self {
            maneuver,
            plateau_pressure,
        }
    }
}

impl WaveformModel for HoldWaveform {
    fn sample(&self, inputs: &WaveformInputs, _noise: &mut dyn NoiseSource) -> WaveformPoint {
        let peep = inputs.settings.peep;
        match self.maneuver {
            ActiveManeuver::InspiratoryHold { held_volume, .. } => {
                let plateau = self.plateau_pressure.or(peep);
                let volume = if held_volume > 0.0 {
                    held_volume
                } else {
                    (plateau - peep) * inputs.compliance
                };
                WaveformPoint::new(plateau, 0.0, volume)
            }
            ActiveManeuver::ExpiratoryHold { .. } => WaveformPoint::baseline(peep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::FixedNoise;
    use crate::state::{ControlSettings, PatientPhysiology};

    #[test]
    fn test_hold_traces_are_flat() {
        let settings = ControlSettings::default();
        let physiology = PatientPhysiology {
            compliance: 50.0,
            ..PatientPhysiology::default()
        };
        let inputs = WaveformInputs::new(&settings, &physiology, 1_234.0, 5_000.0);
        let mut noise = FixedNoise::midpoint();

        let inspiratory = ActiveManeuver::InspiratoryHold {
            started_ms: 0,
            captured_peak_pressure: Reading::Value(20.0),
            captured_avg_inspiratory_flow: Reading::Unavailable,
            held_volume: 0.0,
        };
        let point = HoldWaveform::new(inspiratory, Reading::Value(15.0)).sample(&inputs, &mut noise);
        assert_eq!(point, WaveformPoint::new(15.0, 0.0, 500.0));

        let expiratory = HoldWaveform::new(ActiveManeuver::begin_expiratory(0), Reading::Value(15.0));
        assert_eq!(expiratory.sample(&inputs, &mut noise), WaveformPoint::baseline(5.0));
    }
}
