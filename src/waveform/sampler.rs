use super::hold::HoldWaveform;
use super::manual::ManualWaveform;
use super::pressure_support::PressureSupportWaveform;
use super::template::TemplateWaveform;
use super::volume_control::VolumeControlWaveform;
use super::{WaveformInputs, WaveformModel, WaveformPoint};
use crate::config::template::TemplateLibrary;
use crate::models::{BreathPattern, FALLBACK_BREATH_PERIOD_MS};
use crate::noise::NoiseSource;
use crate::simulation::ActiveManeuver;
use crate::snapshot::{MonitoredSnapshot, Reading};
use crate::state::{ControlSettings, OperatingContext, PatientPhysiology};

/// Which trace generator applies in the current state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaveformSource {
    /// Device idle or high-flow: no breath trace.
    Flat,
    Manual,
    Hold(ActiveManeuver),
    PressureSupport,
    VolumeControl,
    Template,
}

impl WaveformSource {
    pub fn select(
        context: &OperatingContext,
        settings: &ControlSettings,
        maneuver: Option<&ActiveManeuver>,
    ) -> Self {
        if !context.is_mechanically_ventilated() {
            return WaveformSource::Manual;
        }
        if !context.breath_delivery_active() {
            return WaveformSource::Flat;
        }
        if let Some(&maneuver) = maneuver {
            return WaveformSource::Hold(maneuver);
        }
        match BreathPattern::resolve(context.ventilation_mode, settings.ps_level) {
            Some(BreathPattern::PressureSupport) => WaveformSource::PressureSupport,
            Some(BreathPattern::VolumeControl) => WaveformSource::VolumeControl,
            Some(BreathPattern::PressureControl) | Some(BreathPattern::Cpap) => WaveformSource::Template,
            None => WaveformSource::Flat,
        }
    }
}

/// Display breath period from the monitored rate.
pub fn ui_cycle_ms(measured_frequency: Reading) -> f64 {
    match measured_frequency.value() {
        Some(f) if f.is_finite() && f > 0.0 => 60_000.0 / f,
        _ => FALLBACK_BREATH_PERIOD_MS,
    }
}

fn create_waveform<'a>(
    source: WaveformSource,
    context: &OperatingContext,
    snapshot: &MonitoredSnapshot,
    templates: &'a TemplateLibrary,
) -> Option<Box<dyn WaveformModel + 'a>> {
    match source {
        WaveformSource::Flat => None,
        WaveformSource::Manual => Some(Box::new(ManualWaveform::new())),
        WaveformSource::Hold(maneuver) => Some(Box::new(HoldWaveform::new(maneuver, snapshot.plateau_pressure))),
        WaveformSource::PressureSupport => Some(Box::new(PressureSupportWaveform::new())),
        WaveformSource::VolumeControl => Some(Box::new(VolumeControlWaveform::new())),
        WaveformSource::Template => Some(Box::new(TemplateWaveform::new(
            templates.for_mode(context.ventilation_mode),
        ))),
    }
}

/// Instantaneous pressure/flow/volume at `elapsed_ms` of simulated display time.
/// Every component of the result is finite.
#[allow(clippy::too_many_arguments)]
pub fn sample(
    elapsed_ms: f64,
    cycle_ms: f64,
    context: &OperatingContext,
    settings: &ControlSettings,
    physiology: &PatientPhysiology,
    maneuver: Option<&ActiveManeuver>,
    snapshot: &MonitoredSnapshot,
    templates: &TemplateLibrary,
    noise: &mut dyn NoiseSource,
) -> WaveformPoint {
    let source = WaveformSource::select(context, settings, maneuver);
    let point = match create_waveform(source, context, snapshot, templates) {
        Some(model) => {
            let inputs = WaveformInputs::new(settings, physiology, elapsed_ms, cycle_ms);
            model.sample(&inputs, noise)
        }
        None => WaveformPoint::default(),
    };
    point.guarded(settings.peep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::RngNoise;
    use crate::state::{IcuSubMode, OperatingMode, VentilationMode};

    const MODES: [VentilationMode; 6] = [
        VentilationMode::Vc,
        VentilationMode::Pc,
        VentilationMode::Ps,
        VentilationMode::Simv,
        VentilationMode::Cpap,
        VentilationMode::HighFlow,
    ];

    #[test]
    fn test_source_selection() {
        let settings = ControlSettings::default();
        let mut context = OperatingContext::new(OperatingMode::Anesthesia, IcuSubMode::Invasive);
        assert_eq!(WaveformSource::select(&context, &settings, None), WaveformSource::Manual);

        context.mechanical_ventilation = true;
        assert_eq!(WaveformSource::select(&context, &settings, None), WaveformSource::Flat);

        context.ventilation_active = true;
        context.ventilation_mode = VentilationMode::Simv;
        assert_eq!(WaveformSource::select(&context, &settings, None), WaveformSource::PressureSupport);
        context.ventilation_mode = VentilationMode::Pc;
        assert_eq!(WaveformSource::select(&context, &settings, None), WaveformSource::Template);

        let hold = ActiveManeuver::begin_expiratory(0);
        assert_eq!(WaveformSource::select(&context, &settings, Some(&hold)), WaveformSource::Hold(hold));
    }

    #[test]
    fn test_ui_cycle_fallback() {
        assert_eq!(ui_cycle_ms(Reading::Value(15.0)), 4_000.0);
        assert_eq!(ui_cycle_ms(Reading::Value(0.0)), FALLBACK_BREATH_PERIOD_MS);
        assert_eq!(ui_cycle_ms(Reading::Unavailable), FALLBACK_BREATH_PERIOD_MS);
    }

    #[test]
    fn test_samples_are_finite_for_degenerate_mechanics() {
        let templates = TemplateLibrary::load_builtin().unwrap();
        let snapshot = MonitoredSnapshot::default();
        let mut noise = RngNoise::new(Some(11));

        for &(compliance, resistance) in &[(0.0, 0.0), (0.0, 10.0), (50.0, 0.0), (1e-9, 1e-9)] {
            let physiology = PatientPhysiology {
                compliance,
                resistance,
                secretions_factor: 1.0,
                inspiratory_effort_strength: 1.0,
                ..PatientPhysiology::default()
            };
            for &mode in &MODES {
                let mut context = OperatingContext::new(OperatingMode::Icu, IcuSubMode::Invasive);
                context.ventilation_mode = mode;
                context.ventilation_active = true;
                let mut settings = ControlSettings::default();
                settings.frequency = 0.0;
                settings.inspiratory_pause_percent = 100.0;
                settings.flow_cycle_off_percent = 0.0;
                settings.rise_time_seconds = 0.0;

                for step in 0..400 {
                    let elapsed = step as f64 * 17.0;
                    for cycle in [0.0, 1_000.0, f64::NAN] {
                        let point = sample(
                            elapsed,
                            cycle,
                            &context,
                            &settings,
                            &physiology,
                            None,
                            &snapshot,
                            &templates,
                            &mut noise,
                        );
                        assert!(point.is_finite(), "{:?} C={} R={} -> {:?}", mode, compliance, resistance, point);
                    }
                }
            }
        }
    }

    #[test]
    fn test_high_flow_trace_is_flat() {
        let templates = TemplateLibrary::load_builtin().unwrap();
        let settings = ControlSettings::default();
        let mut context = OperatingContext::new(OperatingMode::Icu, IcuSubMode::HighFlow);
        context.ventilation_active = true;
        let point = sample(
            1_000.0,
            5_000.0,
            &context,
            &settings,
            &PatientPhysiology::default(),
            None,
            &MonitoredSnapshot::default(),
            &templates,
            &mut RngNoise::new(Some(1)),
        );
        assert_eq!(point, WaveformPoint::default());
    }
}
