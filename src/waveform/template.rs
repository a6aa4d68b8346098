use super::{secretions_noise, WaveformInputs, WaveformModel, WaveformPoint};
use crate::config::template::{TemplateDataset, TemplateSample};
use crate::noise::NoiseSource;

/// Pressure target assumed when none is set.
const DEFAULT_PRESSURE_TARGET: f64 = 15.0;
/// PEEP assumed for recordings that do not state one.
const DEFAULT_RECORDED_PEEP: f64 = 5.0;

/// Replays a recorded breath stretched to the current cycle and rescaled to
/// the current pressure target and compliance.
#[derive(Debug, Clone, Copy)]
pub struct TemplateWaveform<'a> {
    dataset: &'a TemplateDataset,
}

impl<'a> TemplateWaveform<'a> {
    pub fn new(dataset: &'a TemplateDataset) -> Self {
        Self { dataset }
    }

    /// Linear interpolation at `time_ms` within the recorded cycle. The last
    /// sample interpolates toward the first one of the next cycle.
    pub fn interpolate(&self, time_ms: f64) -> Option<TemplateSample> {
        let samples = &self.dataset.samples;
        if samples.len() < 2 {
            return None;
        }

        let index = samples
            .iter()
            .rposition(|s| s.time_ms <= time_ms)
            .unwrap_or(0);
        let p1 = samples[index];
        let p2 = samples[(index + 1) % samples.len()];

        let p2_time = if p2.time_ms < p1.time_ms {
            p2.time_ms + self.dataset.cycle_duration_ms
        } else {
            p2.time_ms
        };
        let span = p2_time - p1.time_ms;
        let factor = if span > 0.0 {
            ((time_ms - p1.time_ms) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let lerp = |a: f64, b: f64| a + factor * (b - a);

        Some(TemplateSample {
            time_ms,
            pressure: lerp(p1.pressure, p2.pressure),
            flow: lerp(p1.flow, p2.flow),
            volume: lerp(p1.volume, p2.volume),
        })
    }
}

fn scale_factor(target: f64, reference: f64) -> f64 {
    let factor = target / reference;
    if reference > 0.0 && reference.is_finite() && factor.is_finite() {
        factor
    } else {
        1.0
    }
}

impl WaveformModel for TemplateWaveform<'_> {
    fn sample(&self, inputs: &WaveformInputs, noise: &mut dyn NoiseSource) -> WaveformPoint {
        let settings = inputs.settings;
        let peep = settings.peep;
        let recorded_cycle = self.dataset.cycle_duration_ms;

        let time_in_cycle = inputs.elapsed_ms.rem_euclid(inputs.cycle_ms);
        let stretch = if recorded_cycle > 0.0 {
            inputs.cycle_ms / recorded_cycle
        } else {
            1.0
        };
        let recorded_time = time_in_cycle / stretch;

        let recorded = match self.interpolate(recorded_time) {
            Some(sample) => sample,
            None => return WaveformPoint::baseline(peep),
        };

        let target_pressure = if settings.pressure_target != 0.0 {
            settings.pressure_target
        } else {
            DEFAULT_PRESSURE_TARGET
        };
        let recorded_peep = self.dataset.settings.peep.unwrap_or(DEFAULT_RECORDED_PEEP);
        let peaks = self.dataset.peaks;

        let pressure_scale = scale_factor(target_pressure, peaks.pressure - recorded_peep);
        let volume_scale = scale_factor(target_pressure * inputs.compliance, peaks.volume);

        let mut point = WaveformPoint::new(
            peep + (recorded.pressure - recorded_peep) * pressure_scale,
            recorded.flow * volume_scale,
            recorded.volume * volume_scale,
        );

        let (pressure_noise, flow_noise) = secretions_noise(inputs.secretions, inputs.elapsed_seconds(), noise);
        point.pressure += pressure_noise;
        point.flow += flow_noise;
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::template::{PeakStatistics, RecordedSettings, TemplateBase};
    use crate::noise::FixedNoise;
    use crate::state::{ControlSettings, PatientPhysiology};
    use approx::assert_relative_eq;

    fn dataset(peak_pressure: f64, peak_volume: f64) -> TemplateDataset {
        let sample = |time_ms, pressure, flow, volume| TemplateSample {
            time_ms,
            pressure,
            flow,
            volume,
        };
        TemplateDataset {
            base: TemplateBase::PressureControl,
            settings: RecordedSettings {
                peep: Some(5.0),
                ..RecordedSettings::default()
            },
            samples: vec![
                sample(0.0, 5.0, 0.0, 0.0),
                sample(1_000.0, 20.0, 40.0, 600.0),
                sample(3_000.0, 5.0, -30.0, 0.0),
            ],
            cycle_duration_ms: 4_000.0,
            peaks: PeakStatistics {
                pressure: peak_pressure,
                volume: peak_volume,
                flow: 40.0,
            },
        }
    }

    fn physiology() -> PatientPhysiology {
        PatientPhysiology {
            compliance: 40.0,
            secretions_factor: 0.0,
            ..PatientPhysiology::default()
        }
    }

    #[test]
    fn test_interpolation_wraps_to_cycle_start() {
        let data = dataset(20.0, 600.0);
        let template = TemplateWaveform::new(&data);
        assert_relative_eq!(template.interpolate(500.0).unwrap().pressure, 12.5);
        // 3000 -> 4000 (first sample of the next cycle)
        assert_relative_eq!(template.interpolate(3_500.0).unwrap().flow, -15.0);
    }

    #[test]
    fn test_rescale_to_current_target() {
        let data = dataset(20.0, 600.0);
        let mut settings = ControlSettings::default();
        settings.pressure_target = 10.0;
        settings.peep = 8.0;
        let physiology = physiology();
        // same cycle length as the recording
        let inputs = WaveformInputs::new(&settings, &physiology, 1_000.0, 4_000.0);
        let point = TemplateWaveform::new(&data).sample(&inputs, &mut FixedNoise::midpoint());

        assert_relative_eq!(point.pressure, 18.0);
        // 10 cmH2O * 40 mL/cmH2O
        assert_relative_eq!(point.volume, 400.0);
    }

    #[test]
    fn test_time_base_is_stretched() {
        let data = dataset(20.0, 600.0);
        let settings = ControlSettings::default();
        let physiology = physiology();
        // 8 s display cycle: 2 s maps to the recorded 1 s peak
        let inputs = WaveformInputs::new(&settings, &physiology, 2_000.0, 8_000.0);
        let point = TemplateWaveform::new(&data).sample(&inputs, &mut FixedNoise::midpoint());
        assert_relative_eq!(point.pressure, settings.peep + settings.pressure_target);
    }

    #[test]
    fn test_degenerate_reference_peaks_leave_shape_unscaled() {
        let data = dataset(5.0, 0.0);
        let settings = ControlSettings::default();
        let physiology = physiology();
        let inputs = WaveformInputs::new(&settings, &physiology, 1_000.0, 4_000.0);
        let point = TemplateWaveform::new(&data).sample(&inputs, &mut FixedNoise::midpoint());

        assert!(point.is_finite());
        assert_relative_eq!(point.pressure, settings.peep + 15.0);
        assert_relative_eq!(point.volume, 600.0);
    }
}
