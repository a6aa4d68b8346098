use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{VentError, VentResult};

pub const DEFAULT_COMPLIANCE: f64 = 50.0;
pub const DEFAULT_RESISTANCE: f64 = 10.0;
pub const AMBIENT_TEMPERATURE: f64 = 22.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VentilationMode {
    Vc,
    Pc,
    Ps,
    Simv,
    Cpap,
    HighFlow,
}

impl fmt::Display for VentilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VentilationMode::Vc => "VC",
            VentilationMode::Pc => "PC",
            VentilationMode::Ps => "PS",
            VentilationMode::Simv => "SIMV",
            VentilationMode::Cpap => "CPAP",
            VentilationMode::HighFlow => "HIGH_FLOW",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Anesthesia,
    Icu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IcuSubMode {
    Invasive,
    NonInvasive,
    HighFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighFlowInterface {
    #[default]
    Adult,
    Junior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnestheticAgent {
    Sevoflurane,
    Desflurane,
    Isoflurane,
    #[serde(rename = "n2o")]
    NitrousOxide,
}

impl AnestheticAgent {
    pub const ALL: [AnestheticAgent; 4] = [
        AnestheticAgent::Sevoflurane,
        AnestheticAgent::Desflurane,
        AnestheticAgent::Isoflurane,
        AnestheticAgent::NitrousOxide,
    ];

    /// Minimum alveolar concentration in volume percent.
    pub fn mac(self) -> f64 {
        match self {
            AnestheticAgent::Isoflurane => 1.15,
            AnestheticAgent::Sevoflurane => 2.0,
            AnestheticAgent::Desflurane => 6.0,
            AnestheticAgent::NitrousOxide => 104.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AnestheticAgent::Isoflurane => "ISO",
            AnestheticAgent::Sevoflurane => "SEVO",
            AnestheticAgent::Desflurane => "DES",
            AnestheticAgent::NitrousOxide => "N2O",
        }
    }
}

/// Inspiratory to expiratory time ratio, e.g. `1:2`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IeRatio {
    pub inspiratory: f64,
    pub expiratory: f64,
}

impl Default for IeRatio {
    fn default() -> Self {
        Self {
            inspiratory: 1.0,
            expiratory: 2.0,
        }
    }
}

impl IeRatio {
    /// Parses `I:E`; both parts must be positive numbers.
    pub fn try_parse(text: &str) -> Option<Self> {
        let mut parts = text.split(':').map(|p| p.trim().replace(',', ".").parse::<f64>().ok());
        let inspiratory = parts.next().flatten()?;
        let expiratory = parts.next().flatten()?;
        if parts.next().is_some() {
            return None;
        }
        let valid = |v: f64| v.is_finite() && v > 0.0;
        (valid(inspiratory) && valid(expiratory)).then_some(Self {
            inspiratory,
            expiratory,
        })
    }

    /// Malformed ratios fall back to 1:2.
    pub fn parse(text: &str) -> Self {
        Self::try_parse(text).unwrap_or_default()
    }

    pub fn inspiratory_fraction(&self) -> f64 {
        self.inspiratory / (self.inspiratory + self.expiratory)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub tidal_volume: f64,
    pub pressure_target: f64,
    pub frequency: f64,
    pub peep: f64,
    pub fio2: f64,
    pub ie_ratio: String,
    pub ps_level: f64,
    pub trigger_flow: f64,
    pub inspiratory_pause_percent: f64,
    pub rise_time_seconds: f64,
    pub flow_cycle_off_percent: f64,
    pub fgf: f64,
    pub target_mac: f64,
    pub hf_target_temperature: f64,
    pub humidifier_temperature: f64,
    pub humidifier_on: bool,
    pub selected_agents: Vec<AnestheticAgent>,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            tidal_volume: 500.0,
            pressure_target: 18.0,
            frequency: 12.0,
            peep: 5.0,
            fio2: 40.0,
            ie_ratio: "1:2".to_string(),
            ps_level: 10.0,
            trigger_flow: 2.0,
            inspiratory_pause_percent: 10.0,
            rise_time_seconds: 0.15,
            flow_cycle_off_percent: 25.0,
            fgf: 2.0,
            target_mac: 1.0,
            hf_target_temperature: 37.0,
            humidifier_temperature: 37.0,
            humidifier_on: false,
            selected_agents: vec![AnestheticAgent::Sevoflurane],
        }
    }
}

/// Single-parameter edits accepted from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    TidalVolume,
    PressureTarget,
    Frequency,
    Peep,
    Fio2,
    PsLevel,
    TriggerFlow,
    InspiratoryPausePercent,
    RiseTimeSeconds,
    FlowCycleOffPercent,
    Fgf,
    TargetMac,
    HfTargetTemperature,
    HumidifierTemperature,
}

impl ControlSettings {
    /// Applies one numeric edit after checking it against the operator range
    /// valid for the current context.
    pub fn apply_edit(&mut self, key: SettingKey, value: f64, context: &OperatingContext) -> VentResult<()> {
        let (min, max) = setting_range(key, context);
        if !value.is_finite() || value < min || value > max {
            return Err(VentError::Validation(format!(
                "{:?} must be within {}..={}, got {}",
                key, min, max, value
            )));
        }

        let slot = match key {
            SettingKey::TidalVolume => &mut self.tidal_volume,
            SettingKey::PressureTarget => &mut self.pressure_target,
            SettingKey::Frequency => &mut self.frequency,
            SettingKey::Peep => &mut self.peep,
            SettingKey::Fio2 => &mut self.fio2,
            SettingKey::PsLevel => &mut self.ps_level,
            SettingKey::TriggerFlow => &mut self.trigger_flow,
            SettingKey::InspiratoryPausePercent => &mut self.inspiratory_pause_percent,
            SettingKey::RiseTimeSeconds => &mut self.rise_time_seconds,
            SettingKey::FlowCycleOffPercent => &mut self.flow_cycle_off_percent,
            SettingKey::Fgf => &mut self.fgf,
            SettingKey::TargetMac => &mut self.target_mac,
            SettingKey::HfTargetTemperature => &mut self.hf_target_temperature,
            SettingKey::HumidifierTemperature => &mut self.humidifier_temperature,
        };
        *slot = value;
        Ok(())
    }

    pub fn set_ie_ratio(&mut self, ratio: &str) -> VentResult<()> {
        let parsed = IeRatio::try_parse(ratio)
            .ok_or_else(|| VentError::Validation(format!("Malformed I:E ratio: {}", ratio)))?;
        self.ie_ratio = format!("{}:{}", parsed.inspiratory, parsed.expiratory);
        Ok(())
    }

    pub fn ie_ratio(&self) -> IeRatio {
        IeRatio::parse(&self.ie_ratio)
    }
}

fn setting_range(key: SettingKey, context: &OperatingContext) -> (f64, f64) {
    match key {
        SettingKey::TidalVolume => (50.0, 1500.0),
        SettingKey::PressureTarget => (5.0, 40.0),
        SettingKey::Frequency => (4.0, 60.0),
        SettingKey::Peep => (0.0, 30.0),
        SettingKey::Fio2 => (21.0, 100.0),
        SettingKey::PsLevel => (0.0, 40.0),
        SettingKey::TriggerFlow => (0.5, 10.0),
        SettingKey::InspiratoryPausePercent => (0.0, 30.0),
        SettingKey::RiseTimeSeconds => (0.0, 0.4),
        SettingKey::FlowCycleOffPercent => (5.0, 70.0),
        SettingKey::TargetMac => (0.1, 3.0),
        SettingKey::HumidifierTemperature => (31.0, 39.0),
        SettingKey::Fgf => {
            if context.is_high_flow() {
                match context.high_flow_interface {
                    HighFlowInterface::Adult => (10.0, 60.0),
                    HighFlowInterface::Junior => (2.0, 25.0),
                }
            } else {
                (0.0, 18.0)
            }
        }
        SettingKey::HfTargetTemperature => match context.high_flow_interface {
            HighFlowInterface::Adult => (31.0, 37.0),
            HighFlowInterface::Junior => (31.0, 34.0),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhysiologyPreset {
    Normal,
    Copd,
    Ards,
    Covid,
    Anaphylaxis,
    PulmonaryEdema,
    Pneumonia,
    Fibroscopy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientPhysiology {
    pub compliance: f64,
    pub resistance: f64,
    pub spontaneous_rate: f64,
    pub weight: f64,
    pub inspiratory_effort_strength: f64,
    pub expiratory_effort_factor: f64,
    pub expiratory_flow_limitation: f64,
    pub secretions_factor: f64,
}

impl Default for PatientPhysiology {
    fn default() -> Self {
        Self::from_preset(PhysiologyPreset::Normal, 70.0)
    }
}

impl PatientPhysiology {
    pub fn from_preset(preset: PhysiologyPreset, weight: f64) -> Self {
        // (rate, compliance, resistance, expiratory effort, inspiratory effort, flow limitation, secretions)
        let (rate, c, r, exp_effort, insp_effort, limitation, secretions) = match preset {
            PhysiologyPreset::Normal => (14.0, 60.0, 8.0, 0.0, 0.7, 0.0, 0.0),
            PhysiologyPreset::Copd => (22.0, 70.0, 20.0, 0.0, 0.2, 0.7, 0.3),
            PhysiologyPreset::Ards => (25.0, 30.0, 12.0, 0.0, 0.5, 0.0, 0.0),
            PhysiologyPreset::Covid => (28.0, 35.0, 10.0, 0.0, 0.6, 0.0, 0.0),
            PhysiologyPreset::Anaphylaxis => (28.0, 40.0, 25.0, 0.0, 0.7, 0.4, 0.0),
            PhysiologyPreset::PulmonaryEdema => (26.0, 30.0, 15.0, 0.0, 0.4, 0.0, 0.0),
            PhysiologyPreset::Pneumonia => (24.0, 35.0, 14.0, 0.0, 0.3, 0.0, 0.6),
            PhysiologyPreset::Fibroscopy => (10.0, 40.0, 35.0, 0.5, 0.8, 0.0, 0.0),
        };
        Self {
            compliance: c,
            resistance: r,
            spontaneous_rate: rate,
            weight,
            inspiratory_effort_strength: insp_effort,
            expiratory_effort_factor: exp_effort,
            expiratory_flow_limitation: limitation,
            secretions_factor: secretions,
        }
    }

    /// Compliance in mL/cmH2O; non-positive input falls back to the default.
    pub fn effective_compliance(&self) -> f64 {
        positive_or(self.compliance, DEFAULT_COMPLIANCE)
    }

    /// Resistance in cmH2O·s/L; non-positive input falls back to the default.
    pub fn effective_resistance(&self) -> f64 {
        positive_or(self.resistance, DEFAULT_RESISTANCE)
    }

    pub fn secretions(&self) -> f64 {
        unit_factor(self.secretions_factor)
    }

    pub fn inspiratory_effort(&self) -> f64 {
        unit_factor(self.inspiratory_effort_strength)
    }
}

pub(crate) fn positive_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    }
}

fn unit_factor(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingContext {
    pub operating_mode: OperatingMode,
    pub icu_sub_mode: IcuSubMode,
    pub high_flow_interface: HighFlowInterface,
    pub ventilation_mode: VentilationMode,
    pub mechanical_ventilation: bool,
    pub ventilation_active: bool,
    pub warming_up: bool,
    pub anesthesia_active: bool,
    /// Set on the first anesthesia start and kept until power off.
    pub anesthesia_session_started: bool,
    pub powered_on: bool,
    pub self_test_running: bool,
    pub disinfecting: bool,
}

impl OperatingContext {
    pub fn new(operating_mode: OperatingMode, icu_sub_mode: IcuSubMode) -> Self {
        let ventilation_mode = match (operating_mode, icu_sub_mode) {
            (OperatingMode::Anesthesia, _) => VentilationMode::Vc,
            (OperatingMode::Icu, IcuSubMode::Invasive) => VentilationMode::Vc,
            (OperatingMode::Icu, IcuSubMode::NonInvasive) => VentilationMode::Cpap,
            (OperatingMode::Icu, IcuSubMode::HighFlow) => VentilationMode::HighFlow,
        };
        Self {
            operating_mode,
            icu_sub_mode,
            high_flow_interface: HighFlowInterface::Adult,
            ventilation_mode,
            mechanical_ventilation: operating_mode == OperatingMode::Icu,
            ventilation_active: false,
            warming_up: false,
            anesthesia_active: false,
            anesthesia_session_started: false,
            powered_on: true,
            self_test_running: false,
            disinfecting: false,
        }
    }

    pub fn is_anesthesia(&self) -> bool {
        self.operating_mode == OperatingMode::Anesthesia
    }

    pub fn is_high_flow(&self) -> bool {
        self.operating_mode == OperatingMode::Icu && self.icu_sub_mode == IcuSubMode::HighFlow
    }

    /// ICU ventilation is always machine driven; the anesthesia machine may be bagged by hand.
    pub fn is_mechanically_ventilated(&self) -> bool {
        match self.operating_mode {
            OperatingMode::Anesthesia => self.mechanical_ventilation,
            OperatingMode::Icu => true,
        }
    }

    /// True while the machine is delivering breaths whose values can be derived.
    pub fn breath_delivery_active(&self) -> bool {
        self.ventilation_active && self.is_mechanically_ventilated() && !self.is_high_flow()
    }

    pub fn stepper_enabled(&self) -> bool {
        self.powered_on && !self.self_test_running && !self.disinfecting
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumableState {
    pub agent_levels: BTreeMap<AnestheticAgent, f64>,
    pub soda_lime_consumed_percent: f64,
    pub water_level_percent: f64,
}

impl Default for ConsumableState {
    fn default() -> Self {
        Self {
            agent_levels: AnestheticAgent::ALL.iter().map(|&a| (a, 100.0)).collect(),
            soda_lime_consumed_percent: 0.0,
            water_level_percent: 100.0,
        }
    }
}

impl ConsumableState {
    pub fn agent_level(&self, agent: AnestheticAgent) -> f64 {
        self.agent_levels.get(&agent).copied().unwrap_or(0.0)
    }

    pub fn set_agent_level(&mut self, agent: AnestheticAgent, level: f64) {
        self.agent_levels.insert(agent, clamp_percent(level));
    }

    /// Forces every level back into `[0, 100]`.
    pub fn clamp(&mut self) {
        for level in self.agent_levels.values_mut() {
            *level = clamp_percent(*level);
        }
        self.soda_lime_consumed_percent = clamp_percent(self.soda_lime_consumed_percent);
        self.water_level_percent = clamp_percent(self.water_level_percent);
    }
}

pub(crate) fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
