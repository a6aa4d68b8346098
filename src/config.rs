pub mod template;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::alarms::{AlarmConfig, AlarmKey, AlarmLimits};
use crate::controller::Action;
use crate::error::{VentError, VentResult};
use crate::state::{
    AnestheticAgent, ConsumableState, ControlSettings, HighFlowInterface, IcuSubMode, OperatingContext,
    OperatingMode, PatientPhysiology, PhysiologyPreset, SettingKey, VentilationMode,
};
use crate::waveform::SweepSpeed;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub device: DeviceConfig,
    pub defaults: DeviceDefaults,
    pub settings: SettingOverrides,
    pub patient: PatientConfig,
    pub alarms: BTreeMap<AlarmKey, AlarmLimits>,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub operating_mode: OperatingMode,
    pub icu_sub_mode: IcuSubMode,
    pub high_flow_interface: HighFlowInterface,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            operating_mode: OperatingMode::Icu,
            icu_sub_mode: IcuSubMode::Invasive,
            high_flow_interface: HighFlowInterface::Adult,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VaporizerFill {
    pub agent: AnestheticAgent,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HighFlowDefaults {
    pub fgf_adult: f64,
    pub fgf_junior: f64,
    pub temperature_adult: f64,
    pub temperature_junior: f64,
    pub fio2: f64,
    pub water_level_percent: f64,
}

impl Default for HighFlowDefaults {
    fn default() -> Self {
        Self {
            fgf_adult: 10.0,
            fgf_junior: 2.0,
            temperature_adult: 37.0,
            temperature_junior: 34.0,
            fio2: 60.0,
            water_level_percent: 100.0,
        }
    }
}

/// Machine defaults applied at power on and when the anesthesia machine
/// switches between mechanical and manual ventilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub fgf: f64,
    /// APL valve pressure used as PEEP while bagging by hand.
    pub apl: f64,
    pub target_mac: f64,
    pub fio2: f64,
    pub peep: f64,
    pub mode_icu_invasive: VentilationMode,
    pub mode_icu_non_invasive: VentilationMode,
    pub mode_anesthesia_mechanical: VentilationMode,
    pub vaporizers: Vec<VaporizerFill>,
    pub soda_lime_consumed_percent: f64,
    pub humidifier_on: bool,
    pub humidifier_temperature: f64,
    pub high_flow: HighFlowDefaults,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            fgf: 2.0,
            apl: 10.0,
            target_mac: 1.0,
            fio2: 40.0,
            peep: 5.0,
            mode_icu_invasive: VentilationMode::Vc,
            mode_icu_non_invasive: VentilationMode::Cpap,
            mode_anesthesia_mechanical: VentilationMode::Vc,
            vaporizers: vec![VaporizerFill {
                agent: AnestheticAgent::Sevoflurane,
                level: 100.0,
            }],
            soda_lime_consumed_percent: 0.0,
            humidifier_on: false,
            humidifier_temperature: 37.0,
            high_flow: HighFlowDefaults::default(),
        }
    }
}

impl DeviceDefaults {
    pub fn initial_context(&self, device: &DeviceConfig) -> OperatingContext {
        let mut context = OperatingContext::new(device.operating_mode, device.icu_sub_mode);
        context.high_flow_interface = device.high_flow_interface;
        context.ventilation_mode = match (device.operating_mode, device.icu_sub_mode) {
            (OperatingMode::Anesthesia, _) => self.mode_anesthesia_mechanical,
            (OperatingMode::Icu, IcuSubMode::Invasive) => self.mode_icu_invasive,
            (OperatingMode::Icu, IcuSubMode::NonInvasive) => self.mode_icu_non_invasive,
            (OperatingMode::Icu, IcuSubMode::HighFlow) => VentilationMode::HighFlow,
        };
        // the anesthesia machine starts on the bag
        context.mechanical_ventilation = device.operating_mode == OperatingMode::Icu;
        context
    }

    pub fn initial_settings(&self, context: &OperatingContext) -> ControlSettings {
        let mut settings = ControlSettings {
            fio2: self.fio2,
            humidifier_on: self.humidifier_on,
            humidifier_temperature: self.humidifier_temperature,
            target_mac: self.target_mac,
            ..ControlSettings::default()
        };

        if context.is_anesthesia() {
            settings.fgf = self.fgf;
            settings.peep = if context.mechanical_ventilation { self.peep } else { self.apl };
            settings.selected_agents = self.vaporizers.iter().take(1).map(|v| v.agent).collect();
        } else if context.is_high_flow() {
            let (fgf, temperature) = match context.high_flow_interface {
                HighFlowInterface::Adult => (self.high_flow.fgf_adult, self.high_flow.temperature_adult),
                HighFlowInterface::Junior => (self.high_flow.fgf_junior, self.high_flow.temperature_junior),
            };
            settings.fgf = fgf;
            settings.hf_target_temperature = temperature;
            settings.fio2 = self.high_flow.fio2;
            settings.peep = self.peep;
            settings.selected_agents.clear();
        } else {
            settings.peep = self.peep;
            settings.selected_agents.clear();
        }
        settings
    }

    pub fn initial_consumables(&self) -> ConsumableState {
        let mut consumables = ConsumableState::default();
        for fill in &self.vaporizers {
            consumables.set_agent_level(fill.agent, fill.level);
        }
        consumables.soda_lime_consumed_percent = self.soda_lime_consumed_percent;
        consumables.water_level_percent = self.high_flow.water_level_percent;
        consumables.clamp();
        consumables
    }

    /// Breath settings restored when the anesthesia machine changes between
    /// mechanical and manual ventilation.
    pub fn restore_ventilation_defaults(&self, settings: &mut ControlSettings, mechanical: bool) {
        let factory = ControlSettings::default();
        settings.tidal_volume = factory.tidal_volume;
        settings.frequency = factory.frequency;
        settings.ie_ratio = factory.ie_ratio;
        settings.pressure_target = factory.pressure_target;
        settings.ps_level = factory.ps_level;
        if mechanical {
            settings.peep = self.peep;
            settings.trigger_flow = factory.trigger_flow;
        } else {
            settings.peep = self.apl;
        }
    }

    fn validate(&self) -> VentResult<()> {
        if self.vaporizers.len() > 2 {
            return Err(VentError::InvalidConfig(
                "At most two vaporizers can be mounted".to_string(),
            ));
        }
        for fill in &self.vaporizers {
            if !(0.0..=100.0).contains(&fill.level) {
                return Err(VentError::InvalidConfig(format!(
                    "Vaporizer level for {} must be within 0..=100",
                    fill.agent.label()
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.soda_lime_consumed_percent) {
            return Err(VentError::InvalidConfig(
                "Initial soda lime consumption must be within 0..=100".to_string(),
            ));
        }
        if self.mode_anesthesia_mechanical == VentilationMode::HighFlow
            || self.mode_icu_invasive == VentilationMode::HighFlow
            || self.mode_icu_non_invasive == VentilationMode::HighFlow
        {
            return Err(VentError::InvalidConfig(
                "High flow cannot be a default ventilation mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Operator setting overrides applied on top of the device defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingOverrides {
    pub ie_ratio: Option<String>,
    pub humidifier_on: Option<bool>,
    pub selected_agents: Option<Vec<AnestheticAgent>>,
    #[serde(flatten)]
    pub values: BTreeMap<SettingKey, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientConfig {
    pub preset: PhysiologyPreset,
    pub weight: f64,
    /// Explicit mechanics, replacing the preset entirely.
    pub physiology: Option<PatientPhysiology>,
}

impl Default for PatientConfig {
    fn default() -> Self {
        Self {
            preset: PhysiologyPreset::Normal,
            weight: 70.0,
            physiology: None,
        }
    }
}

impl PatientConfig {
    pub fn physiology(&self) -> PatientPhysiology {
        match &self.physiology {
            Some(physiology) => physiology.clone(),
            None => PatientPhysiology::from_preset(self.preset, self.weight),
        }
    }
}

/// An operator action fired at a fixed session time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedAction {
    pub at_ms: u64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_s: f64,
    pub seed: Option<u64>,
    pub frame_width: usize,
    pub sweep_speed: SweepSpeed,
    /// Display frames per second driving the waveform sampler.
    pub frame_rate: f64,
    pub actions: Vec<ScriptedAction>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_s: 60.0,
            seed: None,
            frame_width: 600,
            sweep_speed: SweepSpeed::default(),
            frame_rate: 30.0,
            actions: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn duration_ms(&self) -> u64 {
        (self.duration_s * 1000.0).round() as u64
    }

    /// Simulated milliseconds between two display frames.
    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.frame_rate
    }
}

impl SimulatorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> VentResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SimulatorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VentResult<()> {
        self.defaults.validate()?;
        self.validate_device()?;

        // Surfaces out-of-range overrides and inverted limits
        self.initial_settings()?;
        self.alarm_config()?;

        self.validate_patient()?;
        self.validate_session()?;

        Ok(())
    }

    pub fn initial_context(&self) -> OperatingContext {
        self.defaults.initial_context(&self.device)
    }

    /// Device defaults for the configured context with the overrides applied.
    pub fn initial_settings(&self) -> VentResult<ControlSettings> {
        let context = self.initial_context();
        let mut settings = self.defaults.initial_settings(&context);

        for (&key, &value) in &self.settings.values {
            settings.apply_edit(key, value, &context)?;
        }
        if let Some(ratio) = &self.settings.ie_ratio {
            settings.set_ie_ratio(ratio)?;
        }
        if let Some(on) = self.settings.humidifier_on {
            settings.humidifier_on = on;
        }
        if let Some(agents) = &self.settings.selected_agents {
            if agents.len() > 2 {
                return Err(VentError::Validation(
                    "At most two anesthetic agents can be selected".to_string(),
                ));
            }
            settings.selected_agents = agents.clone();
        }
        Ok(settings)
    }

    pub fn alarm_config(&self) -> VentResult<AlarmConfig> {
        let mut config = AlarmConfig::default();
        config.merge(&self.alarms)?;
        Ok(config)
    }

    fn validate_device(&self) -> VentResult<()> {
        if self.device.operating_mode == OperatingMode::Anesthesia && self.device.icu_sub_mode != IcuSubMode::Invasive {
            return Err(VentError::InvalidConfig(
                "ICU sub-mode only applies to the ICU operating mode".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_patient(&self) -> VentResult<()> {
        let physiology = self.patient.physiology();
        if physiology.weight < 0.0 || !physiology.weight.is_finite() {
            return Err(VentError::Validation("Patient weight must be non-negative".to_string()));
        }
        if physiology.spontaneous_rate < 0.0 || !physiology.spontaneous_rate.is_finite() {
            return Err(VentError::Validation(
                "Spontaneous rate must be non-negative".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_session(&self) -> VentResult<()> {
        let session = &self.session;
        if !(session.duration_s.is_finite() && session.duration_s > 0.0) {
            return Err(VentError::InvalidConfig(
                "Session duration must be positive".to_string(),
            ));
        }
        if session.frame_width == 0 {
            return Err(VentError::InvalidConfig("Frame width must be at least 1 pixel".to_string()));
        }
        if !(session.frame_rate.is_finite() && session.frame_rate > 0.0) {
            return Err(VentError::InvalidConfig("Frame rate must be positive".to_string()));
        }

        let end = session.duration_ms();
        if let Some(late) = session.actions.iter().find(|a| a.at_ms > end) {
            return Err(VentError::InvalidConfig(format!(
                "Action {} at {} ms is scheduled after the session end ({} ms)",
                late.action.label(),
                late.at_ms,
                end
            )));
        }
        Ok(())
    }
}
