use super::{BreathInputs, BreathMechanics, BreathModel, PRESSURE_VOLUME_TRANSMISSION};
use crate::noise::NoiseSource;
use crate::snapshot::{round_to, Reading};

/// Pressure-controlled (PC) or pressure-supported (PS, SIMV+PS) breath.
#[derive(Debug, Clone)]
pub struct PressureModel {
    support: bool,
}

impl PressureModel {
    pub fn control() -> Self {
        Self { support: false }
    }

    pub fn support() -> Self {
        Self { support: true }
    }

    pub fn driving_pressure(&self, inputs: &BreathInputs) -> f64 {
        if self.support {
            inputs.settings.ps_level
        } else {
            inputs.settings.pressure_target
        }
    }
}

impl BreathModel for PressureModel {
    fn compute(&self, inputs: &BreathInputs, _noise: &mut dyn NoiseSource) -> BreathMechanics {
        let driving = self.driving_pressure(inputs);
        let peak = round_to(inputs.settings.peep + driving, 1);

        BreathMechanics {
            peak_pressure: peak,
            plateau_pressure: if self.support {
                Reading::Unavailable
            } else {
                Reading::Value(peak)
            },
            inspired_volume: driving * inputs.compliance * PRESSURE_VOLUME_TRANSMISSION,
        }
    }
}
