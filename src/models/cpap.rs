use super::{BreathInputs, BreathMechanics, BreathModel};
use crate::noise::NoiseSource;
use crate::snapshot::Reading;

/// Continuous positive airway pressure: no mandatory breath, only small
/// spontaneous excursions above PEEP.
#[derive(Debug, Clone, Default)]
pub struct CpapModel;

impl CpapModel {
    pub fn new() -> Self {
        Self
    }
}

impl BreathModel for CpapModel {
    fn compute(&self, inputs: &BreathInputs, noise: &mut dyn NoiseSource) -> BreathMechanics {
        let peep = inputs.settings.peep;
        let peak = peep + noise.uniform(0.0, 2.0);

        let inspired_volume = if inputs.measured_frequency > 0.0 {
            (5.0 + noise.uniform(0.0, 5.0)) * inputs.compliance * 0.5
        } else {
            0.0
        };

        BreathMechanics {
            peak_pressure: peak,
            plateau_pressure: Reading::Value(peep),
            inspired_volume,
        }
    }
}
