pub mod cpap;
pub mod pressure;
pub mod volume_control;

use crate::noise::NoiseSource;
use crate::snapshot::{round_to, MonitoredSnapshot, Reading};
use crate::state::{
    ControlSettings, IcuSubMode, OperatingContext, OperatingMode, PatientPhysiology, VentilationMode,
};

/// Breath period used when no breathing frequency is available.
pub const FALLBACK_BREATH_PERIOD_MS: f64 = 5000.0;
/// Spontaneous rate assumed for PS/CPAP when the patient has none configured.
pub const DEFAULT_SPONTANEOUS_RATE: f64 = 12.0;
/// Fraction of the driving pressure that ends up as delivered volume.
pub const PRESSURE_VOLUME_TRANSMISSION: f64 = 0.9;

pub const DEFAULT_ETCO2: f64 = 35.0;
pub const DEFAULT_SPO2: f64 = 98.0;

/// Breath family that governs the mechanics equations for a ventilation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreathPattern {
    VolumeControl,
    PressureControl,
    PressureSupport,
    Cpap,
}

impl BreathPattern {
    /// SIMV is volume controlled without pressure support and pressure
    /// supported otherwise. High-flow has no breath pattern.
    pub fn resolve(mode: VentilationMode, ps_level: f64) -> Option<Self> {
        match mode {
            VentilationMode::Vc => Some(BreathPattern::VolumeControl),
            VentilationMode::Pc => Some(BreathPattern::PressureControl),
            VentilationMode::Ps => Some(BreathPattern::PressureSupport),
            VentilationMode::Simv if ps_level > 0.0 => Some(BreathPattern::PressureSupport),
            VentilationMode::Simv => Some(BreathPattern::VolumeControl),
            VentilationMode::Cpap => Some(BreathPattern::Cpap),
            VentilationMode::HighFlow => None,
        }
    }
}

/// Everything a breath model reads, with mechanics already guarded.
#[derive(Debug, Clone)]
pub struct BreathInputs<'a> {
    pub settings: &'a ControlSettings,
    pub compliance: f64,
    pub resistance: f64,
    pub measured_frequency: f64,
    pub inspiratory_fraction: f64,
}

impl<'a> BreathInputs<'a> {
    pub fn new(
        settings: &'a ControlSettings,
        physiology: &PatientPhysiology,
        mode: VentilationMode,
        measured_frequency: f64,
    ) -> Self {
        Self {
            settings,
            compliance: physiology.effective_compliance(),
            resistance: physiology.effective_resistance(),
            measured_frequency,
            inspiratory_fraction: inspiratory_fraction(mode, settings),
        }
    }

    pub fn breath_period_ms(&self) -> f64 {
        breath_period_ms(self.measured_frequency)
    }

    pub fn inspiratory_time_ms(&self) -> f64 {
        self.breath_period_ms() * self.inspiratory_fraction
    }
}

/// Pressures and delivered volume of one representative breath.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreathMechanics {
    pub peak_pressure: f64,
    pub plateau_pressure: Reading,
    pub inspired_volume: f64,
}

pub trait BreathModel {
    fn compute(&self, inputs: &BreathInputs, noise: &mut dyn NoiseSource) -> BreathMechanics;
}

pub fn create_model(pattern: BreathPattern) -> Box<dyn BreathModel> {
    match pattern {
        BreathPattern::VolumeControl => Box::new(volume_control::VolumeControlModel::new()),
        BreathPattern::PressureControl => Box::new(pressure::PressureModel::control()),
        BreathPattern::PressureSupport => Box::new(pressure::PressureModel::support()),
        BreathPattern::Cpap => Box::new(cpap::CpapModel::new()),
    }
}

/// Ti/Ttot: fixed at 1/3 for pressure-supported breaths, from the I:E ratio otherwise.
pub fn inspiratory_fraction(mode: VentilationMode, settings: &ControlSettings) -> f64 {
    match BreathPattern::resolve(mode, settings.ps_level) {
        Some(BreathPattern::PressureSupport) => 1.0 / 3.0,
        _ => settings.ie_ratio().inspiratory_fraction(),
    }
}

pub fn breath_period_ms(frequency: f64) -> f64 {
    if frequency.is_finite() && frequency > 0.0 {
        60_000.0 / frequency
    } else {
        FALLBACK_BREATH_PERIOD_MS
    }
}

/// Total breathing rate the monitor reports for a mode.
pub fn measured_frequency(mode: VentilationMode, set_frequency: f64, spontaneous_rate: f64) -> Option<f64> {
    let spontaneous = if spontaneous_rate > 0.0 { spontaneous_rate } else { 0.0 };
    match mode {
        VentilationMode::Vc | VentilationMode::Pc => Some(set_frequency),
        VentilationMode::Ps | VentilationMode::Cpap => Some(if spontaneous > 0.0 {
            spontaneous
        } else {
            DEFAULT_SPONTANEOUS_RATE
        }),
        VentilationMode::Simv => Some(set_frequency + spontaneous),
        VentilationMode::HighFlow => None,
    }
}

fn leaks(context: &OperatingContext, mode: VentilationMode) -> bool {
    context.operating_mode == OperatingMode::Icu
        && matches!(context.icu_sub_mode, IcuSubMode::Invasive | IcuSubMode::NonInvasive)
        && !matches!(mode, VentilationMode::Cpap | VentilationMode::HighFlow)
}

/// Writes every breath-derived value of `next` for the current mode.
///
/// `achieved_mac` is the sum of end-tidal/MAC ratios over the delivered agents
/// and only matters in anesthesia, where it penalises the SpO2 trend.
pub fn apply_breath(
    next: &mut MonitoredSnapshot,
    previous: &MonitoredSnapshot,
    settings: &ControlSettings,
    physiology: &PatientPhysiology,
    context: &OperatingContext,
    achieved_mac: f64,
    noise: &mut dyn NoiseSource,
) {
    let mode = context.ventilation_mode;
    let (pattern, frequency) = match (
        BreathPattern::resolve(mode, settings.ps_level),
        measured_frequency(mode, settings.frequency, physiology.spontaneous_rate),
    ) {
        (Some(pattern), Some(frequency)) => (pattern, frequency),
        _ => {
            next.clear_breath_values();
            return;
        }
    };

    let inputs = BreathInputs::new(settings, physiology, mode, frequency);
    let model = create_model(pattern);
    let mechanics = model.compute(&inputs, noise);
    let peep = settings.peep;

    next.ti_ttot = Reading::from_finite(round_to(inputs.inspiratory_fraction, 2));
    next.measured_frequency = Reading::from_finite(frequency);
    next.peak_pressure = Reading::from_finite(mechanics.peak_pressure);
    next.plateau_pressure = mechanics.plateau_pressure;

    let mean = (mechanics.peak_pressure + peep) / 2.2 + noise.uniform(-0.5, 0.5);
    next.mean_pressure = Reading::from_finite(round_to(mean, 1).max(peep));

    let inspired = mechanics.inspired_volume.max(0.0);
    next.inspired_volume = Reading::from_finite(inspired.round());

    let leak_fraction = if leaks(context, mode) {
        noise.uniform(0.05, 0.25)
    } else {
        0.0
    };
    let (expired, leak_percent) = if inspired > 0.0 {
        (
            (inspired * (1.0 - leak_fraction)).round().max(0.0),
            round_to(leak_fraction * 100.0, 1),
        )
    } else if pattern == BreathPattern::Cpap {
        (0.0, 0.0)
    } else {
        ((noise.unit() * 50.0).round(), 0.0)
    };
    next.expired_volume = Reading::Value(expired);
    next.leak_percent = Reading::Value(leak_percent);

    next.minute_volume = Reading::Value(if frequency > 0.0 && expired > 0.0 {
        round_to(frequency * expired / 1000.0, 1)
    } else {
        0.0
    });

    next.ml_per_kg = if physiology.weight > 0.0 {
        Reading::from_finite(if expired > 0.0 {
            round_to(expired / physiology.weight, 1)
        } else {
            0.0
        })
    } else {
        Reading::Unavailable
    };

    apply_gas_exchange(next, previous, context, achieved_mac, noise);
}

/// EtCO2/SpO2 trend. Fixed defaults outside anesthesia, first-order relaxation
/// toward 38 mmHg / 98 % during anesthesia.
fn apply_gas_exchange(
    next: &mut MonitoredSnapshot,
    previous: &MonitoredSnapshot,
    context: &OperatingContext,
    achieved_mac: f64,
    noise: &mut dyn NoiseSource,
) {
    let etco2 = previous.etco2.value().filter(|v| *v > 0.0);
    let spo2 = previous.spo2.value().filter(|v| *v > 0.0);

    if !context.is_anesthesia() {
        next.etco2 = Reading::Value(etco2.unwrap_or(DEFAULT_ETCO2));
        next.spo2 = Reading::Value(spo2.unwrap_or(DEFAULT_SPO2));
        return;
    }

    let etco2 = etco2.unwrap_or(DEFAULT_ETCO2);
    let spo2 = spo2.unwrap_or(DEFAULT_SPO2);

    let etco2_change = (38.0 - etco2) * 0.1 + noise.uniform(-1.0, 1.0);
    let mut spo2_change = (98.0 - spo2) * 0.1 + noise.uniform(-0.4, 0.4);
    if achieved_mac > 1.5 {
        spo2_change -= 0.2;
    }

    next.etco2 = Reading::Value((etco2 + etco2_change).clamp(20.0, 60.0).round());
    next.spo2 = Reading::Value((spo2 + spo2_change).clamp(85.0, 100.0).round());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::FixedNoise;
    use approx::assert_relative_eq;

    fn icu_context(mode: VentilationMode) -> OperatingContext {
        let mut context = OperatingContext::new(OperatingMode::Icu, IcuSubMode::Invasive);
        context.ventilation_mode = mode;
        context.ventilation_active = true;
        context
    }

    fn physiology(compliance: f64, resistance: f64) -> PatientPhysiology {
        PatientPhysiology {
            compliance,
            resistance,
            spontaneous_rate: 0.0,
            ..PatientPhysiology::default()
        }
    }

    #[test]
    fn test_pattern_resolution() {
        assert_eq!(
            BreathPattern::resolve(VentilationMode::Simv, 0.0),
            Some(BreathPattern::VolumeControl)
        );
        assert_eq!(
            BreathPattern::resolve(VentilationMode::Simv, 8.0),
            Some(BreathPattern::PressureSupport)
        );
        assert_eq!(BreathPattern::resolve(VentilationMode::HighFlow, 8.0), None);
    }

    #[test]
    fn test_inspiratory_fraction() {
        let mut settings = ControlSettings::default();
        settings.ie_ratio = "1:1".to_string();
        assert_relative_eq!(inspiratory_fraction(VentilationMode::Vc, &settings), 0.5);
        assert_relative_eq!(inspiratory_fraction(VentilationMode::Ps, &settings), 1.0 / 3.0);
        settings.ps_level = 0.0;
        assert_relative_eq!(inspiratory_fraction(VentilationMode::Simv, &settings), 0.5);
    }

    #[test]
    fn test_measured_frequency_by_mode() {
        assert_eq!(measured_frequency(VentilationMode::Vc, 14.0, 20.0), Some(14.0));
        assert_eq!(measured_frequency(VentilationMode::Ps, 14.0, 0.0), Some(12.0));
        assert_eq!(measured_frequency(VentilationMode::Cpap, 14.0, 18.0), Some(18.0));
        assert_eq!(measured_frequency(VentilationMode::Simv, 10.0, 6.0), Some(16.0));
        assert_eq!(measured_frequency(VentilationMode::HighFlow, 10.0, 6.0), None);
    }

    #[test]
    fn test_breath_period_guards_zero_frequency() {
        assert_relative_eq!(breath_period_ms(0.0), FALLBACK_BREATH_PERIOD_MS);
        assert_relative_eq!(breath_period_ms(12.0), 5000.0);
    }

    #[test]
    fn test_apply_breath_volume_control() {
        let mut settings = ControlSettings::default();
        settings.inspiratory_pause_percent = 10.0;
        let context = icu_context(VentilationMode::Vc);
        let previous = MonitoredSnapshot::default();
        let mut next = previous.clone();
        let mut noise = FixedNoise::midpoint();

        apply_breath(&mut next, &previous, &settings, &physiology(50.0, 10.0), &context, 0.0, &mut noise);

        assert_eq!(next.plateau_pressure, Reading::Value(15.0));
        assert!(next.peak_pressure.or(0.0) >= 15.0);
        assert_eq!(next.inspired_volume, Reading::Value(500.0));
        // midpoint leak = 15 %
        assert_eq!(next.leak_percent, Reading::Value(15.0));
        assert_eq!(next.expired_volume, Reading::Value(425.0));
        assert_eq!(next.minute_volume, Reading::Value(5.1));
        assert_eq!(next.ti_ttot, Reading::Value(0.33));
    }

    #[test]
    fn test_anesthesia_has_no_leak() {
        let settings = ControlSettings::default();
        let mut context = OperatingContext::new(OperatingMode::Anesthesia, IcuSubMode::Invasive);
        context.mechanical_ventilation = true;
        context.ventilation_active = true;
        let previous = MonitoredSnapshot::default();
        let mut next = previous.clone();
        let mut noise = FixedNoise::midpoint();

        apply_breath(&mut next, &previous, &settings, &physiology(50.0, 10.0), &context, 0.0, &mut noise);

        assert_eq!(next.leak_percent, Reading::Value(0.0));
        assert_eq!(next.expired_volume, Reading::Value(500.0));
    }

    #[test]
    fn test_cpap_spontaneous_volume_has_no_leak() {
        let settings = ControlSettings::default();
        let context = icu_context(VentilationMode::Cpap);
        let previous = MonitoredSnapshot::default();
        let mut next = previous.clone();
        let mut noise = FixedNoise::midpoint();

        apply_breath(&mut next, &previous, &settings, &physiology(50.0, 10.0), &context, 0.0, &mut noise);

        // spontaneous volume = (5 + 2.5) * 50 * 0.5
        assert_eq!(next.inspired_volume, Reading::Value(188.0));
        assert_eq!(next.leak_percent, Reading::Value(0.0));
        assert_eq!(next.plateau_pressure, Reading::Value(settings.peep));
    }

    #[test]
    fn test_degenerate_mechanics_stay_finite() {
        let mut settings = ControlSettings::default();
        settings.frequency = 0.0;
        let context = icu_context(VentilationMode::Vc);
        let previous = MonitoredSnapshot::default();
        let mut next = previous.clone();
        let mut noise = FixedNoise::midpoint();

        apply_breath(&mut next, &previous, &settings, &physiology(0.0, 0.0), &context, 0.0, &mut noise);

        for (name, reading) in next.fields() {
            if let Some(v) = reading.value() {
                assert!(v.is_finite(), "{} not finite", name);
            }
        }
        assert_eq!(next.minute_volume, Reading::Value(0.0));
    }

    #[test]
    fn test_gas_exchange_outside_anesthesia_uses_defaults() {
        let settings = ControlSettings::default();
        let context = icu_context(VentilationMode::Pc);
        let mut previous = MonitoredSnapshot::default();
        previous.etco2 = Reading::Unavailable;
        previous.spo2 = Reading::Value(0.0);
        let mut next = previous.clone();
        let mut noise = FixedNoise::midpoint();

        apply_breath(&mut next, &previous, &settings, &physiology(50.0, 10.0), &context, 0.0, &mut noise);

        assert_eq!(next.etco2, Reading::Value(DEFAULT_ETCO2));
        assert_eq!(next.spo2, Reading::Value(DEFAULT_SPO2));
    }

    #[test]
    fn test_gas_exchange_in_anesthesia_relaxes_and_penalises_deep_mac() {
        let settings = ControlSettings::default();
        let mut context = OperatingContext::new(OperatingMode::Anesthesia, IcuSubMode::Invasive);
        context.mechanical_ventilation = true;
        context.ventilation_active = true;
        let mut previous = MonitoredSnapshot::default();
        previous.etco2 = Reading::Value(28.0);
        previous.spo2 = Reading::Value(98.0);
        let mut noise = FixedNoise::midpoint();

        let mut light = previous.clone();
        apply_breath(&mut light, &previous, &settings, &physiology(50.0, 10.0), &context, 1.0, &mut noise);
        // 28 + (38 - 28) * 0.1
        assert_eq!(light.etco2, Reading::Value(29.0));
        assert_eq!(light.spo2, Reading::Value(98.0));

        previous.spo2 = Reading::Value(90.0);
        let mut deep = previous.clone();
        apply_breath(&mut deep, &previous, &settings, &physiology(50.0, 10.0), &context, 2.0, &mut noise);
        // 90 + 0.8 - 0.2
        assert_eq!(deep.spo2, Reading::Value(91.0));
    }
}
