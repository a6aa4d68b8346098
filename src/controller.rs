use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::alarms::{AlarmConfig, AlarmEvaluator, AlarmKey, AlarmLimits, AlarmSnooze};
use crate::config::template::TemplateLibrary;
use crate::config::{DeviceDefaults, ScriptedAction, SimulatorConfig};
use crate::error::{VentError, VentResult};
use crate::noise::NoiseSource;
use crate::simulation::anesthesia::MAX_SELECTED_AGENTS;
use crate::simulation::{
    ActiveManeuver, ConsumableOperations, ManeuverResult, O2Flush, OperationCompleted, PhysiologyStepper,
    SessionEvent, SessionResult, StepInputs, TickRecord, TimedEvent, WaveformRecord, TICK_MS, TICK_SECONDS,
};
use crate::snapshot::MonitoredSnapshot;
use crate::state::{
    AnestheticAgent, ConsumableState, ControlSettings, OperatingContext, PatientPhysiology, PhysiologyPreset,
    SettingKey, VentilationMode,
};
use crate::waveform::{self, SweepClock, SweepSpeed};

/// Discrete operator triggers, as scripted in a session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    PowerOn,
    PowerOff,
    ToggleVentilation,
    ToggleAnesthesia,
    SetMechanicalVentilation { enabled: bool },
    SelectMode { mode: VentilationMode },
    ToggleAgent { agent: AnestheticAgent },
    EditSetting { key: SettingKey, value: f64 },
    SetIeRatio { ratio: String },
    ToggleHumidifier,
    InspiratoryHold,
    ExpiratoryHold,
    ClearManeuverResult,
    O2Flush,
    RefillAgents,
    ReplaceSodaLime,
    ToggleSnooze,
    SetAlarmLimits { key: AlarmKey, limits: AlarmLimits },
    SetPatientPreset { preset: PhysiologyPreset },
    SetPhysiology { physiology: PatientPhysiology },
    SetSelfTest { running: bool },
    SetDisinfecting { running: bool },
    SetSweepSpeed { speed: SweepSpeed },
    CycleSweepSpeed,
    ResizeDisplay { width: usize },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::PowerOn => "power_on",
            Action::PowerOff => "power_off",
            Action::ToggleVentilation => "toggle_ventilation",
            Action::ToggleAnesthesia => "toggle_anesthesia",
            Action::SetMechanicalVentilation { .. } => "set_mechanical_ventilation",
            Action::SelectMode { .. } => "select_mode",
            Action::ToggleAgent { .. } => "toggle_agent",
            Action::EditSetting { .. } => "edit_setting",
            Action::SetIeRatio { .. } => "set_ie_ratio",
            Action::ToggleHumidifier => "toggle_humidifier",
            Action::InspiratoryHold => "inspiratory_hold",
            Action::ExpiratoryHold => "expiratory_hold",
            Action::ClearManeuverResult => "clear_maneuver_result",
            Action::O2Flush => "o2_flush",
            Action::RefillAgents => "refill_agents",
            Action::ReplaceSodaLime => "replace_soda_lime",
            Action::ToggleSnooze => "toggle_snooze",
            Action::SetAlarmLimits { .. } => "set_alarm_limits",
            Action::SetPatientPreset { .. } => "set_patient_preset",
            Action::SetPhysiology { .. } => "set_physiology",
            Action::SetSelfTest { .. } => "set_self_test",
            Action::SetDisinfecting { .. } => "set_disinfecting",
            Action::SetSweepSpeed { .. } => "set_sweep_speed",
            Action::CycleSweepSpeed => "cycle_sweep_speed",
            Action::ResizeDisplay { .. } => "resize_display",
        }
    }
}

fn ensure(condition: bool, reason: &str) -> VentResult<()> {
    if condition {
        Ok(())
    } else {
        Err(VentError::ActionRejected(reason.to_string()))
    }
}

/// Single owner of the simulation state. Time only moves forward through
/// [`Ventilator::advance_to`]; every accepted action recomputes the snapshot
/// before returning.
pub struct Ventilator<N: NoiseSource> {
    defaults: DeviceDefaults,
    context: OperatingContext,
    settings: ControlSettings,
    physiology: PatientPhysiology,
    consumables: ConsumableState,
    snapshot: MonitoredSnapshot,
    maneuver: Option<ActiveManeuver>,
    maneuver_result: Option<ManeuverResult>,
    alarm_config: AlarmConfig,
    alarms: AlarmEvaluator,
    snooze: AlarmSnooze,
    operations: ConsumableOperations,
    o2_flush: Option<O2Flush>,
    stepper: PhysiologyStepper,
    templates: TemplateLibrary,
    sweep: SweepClock,
    noise: N,
    now_ms: u64,
    next_tick_ms: u64,
    ticks: Vec<TickRecord>,
    events: Vec<TimedEvent>,
}

impl<N: NoiseSource> Ventilator<N> {
    /// Builds a powered-on device from a validated configuration.
    pub fn new(config: &SimulatorConfig, noise: N) -> VentResult<Self> {
        let context = config.initial_context();
        let settings = config.initial_settings()?;
        let alarm_config = config.alarm_config()?;
        let templates = TemplateLibrary::load_builtin()?;

        let mut ventilator = Self {
            defaults: config.defaults.clone(),
            context,
            settings,
            physiology: config.patient.physiology(),
            consumables: config.defaults.initial_consumables(),
            snapshot: MonitoredSnapshot::default(),
            maneuver: None,
            maneuver_result: None,
            alarm_config,
            alarms: AlarmEvaluator::new(),
            snooze: AlarmSnooze::new(),
            operations: ConsumableOperations::new(),
            o2_flush: None,
            stepper: PhysiologyStepper::new(),
            templates,
            sweep: SweepClock::new(config.session.frame_width, config.session.sweep_speed),
            noise,
            now_ms: 0,
            next_tick_ms: TICK_MS,
            ticks: Vec::new(),
            events: Vec::new(),
        };

        info!(
            "Device on: {:?} {:?}, mode {}",
            ventilator.context.operating_mode, ventilator.context.icu_sub_mode, ventilator.context.ventilation_mode
        );
        ventilator.record(SessionEvent::PoweredOn);
        ventilator.run_step(0.0);
        Ok(ventilator)
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn snapshot(&self) -> &MonitoredSnapshot {
        &self.snapshot
    }

    pub fn context(&self) -> &OperatingContext {
        &self.context
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn physiology(&self) -> &PatientPhysiology {
        &self.physiology
    }

    pub fn consumables(&self) -> &ConsumableState {
        &self.consumables
    }

    pub fn alarm_config(&self) -> &AlarmConfig {
        &self.alarm_config
    }

    pub fn active_alarms(&self) -> &BTreeSet<AlarmKey> {
        self.alarms.active()
    }

    pub fn is_snoozed(&self) -> bool {
        self.snooze.is_active(self.now_ms)
    }

    pub fn snooze_remaining_s(&self) -> Option<u64> {
        self.snooze.remaining_seconds(self.now_ms)
    }

    pub fn maneuver(&self) -> Option<&ActiveManeuver> {
        self.maneuver.as_ref()
    }

    pub fn maneuver_result(&self) -> Option<&ManeuverResult> {
        self.maneuver_result.as_ref()
    }

    pub fn is_o2_flush_active(&self) -> bool {
        self.o2_flush.is_some()
    }

    pub fn operations(&self) -> &ConsumableOperations {
        &self.operations
    }

    pub fn sweep(&self) -> &SweepClock {
        &self.sweep
    }

    pub fn drain_events(&mut self) -> Vec<TimedEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn drain_ticks(&mut self) -> Vec<TickRecord> {
        std::mem::take(&mut self.ticks)
    }

    /// Runs every timer deadline and scheduled tick up to `now_ms`, in time order.
    pub fn advance_to(&mut self, now_ms: u64) {
        while let Some(due) = self.next_due_ms().filter(|&t| t <= now_ms) {
            self.now_ms = self.now_ms.max(due);
            self.process_due();
        }
        self.now_ms = self.now_ms.max(now_ms);
        self.update_animations();
    }

    fn next_due_ms(&self) -> Option<u64> {
        let tick = self.context.stepper_enabled().then_some(self.next_tick_ms);
        [
            tick,
            self.maneuver.map(|m| m.deadline_ms()),
            self.o2_flush.map(|f| f.deadline_ms()),
            self.operations.next_deadline_ms(),
            self.snooze.deadline_ms(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn process_due(&mut self) {
        let now = self.now_ms;
        self.update_animations();

        if self.maneuver.map_or(false, |m| m.is_complete(now)) {
            self.complete_maneuver();
        }
        if self.o2_flush.map_or(false, |f| f.is_expired(now)) {
            self.end_o2_flush();
            self.run_step(0.0);
        }
        if let Some(change) = self.snooze.poll(now) {
            self.record(SessionEvent::Snooze { change });
        }
        if self.context.stepper_enabled() && self.next_tick_ms <= now {
            self.run_step(TICK_SECONDS);
            self.ticks.push(TickRecord {
                time_ms: now,
                snapshot: self.snapshot.clone(),
                active_alarms: self.alarms.active().iter().copied().collect(),
                snooze_remaining_s: self.snooze.remaining_seconds(now),
            });
            self.next_tick_ms += TICK_MS;
        }
    }

    fn update_animations(&mut self) {
        let completed = self.operations.advance(self.now_ms, &mut self.consumables);
        if completed.is_empty() {
            return;
        }
        for done in completed {
            self.record_completion(done);
        }
        self.run_step(0.0);
    }

    fn record_completion(&mut self, done: OperationCompleted) {
        let event = match done {
            OperationCompleted::AgentsRefilled(agents) => SessionEvent::RefillCompleted { agents },
            OperationCompleted::SodaLimeReplaced => SessionEvent::SodaLimeReplaced,
        };
        self.record(event);
    }

    fn complete_maneuver(&mut self) {
        if let Some(maneuver) = self.maneuver.take() {
            let result = maneuver.finish(&self.snapshot, &self.settings);
            info!("{:?} complete", maneuver.kind());
            self.record(SessionEvent::ManeuverCompleted { result: result.clone() });
            self.maneuver_result = Some(result);
            self.run_step(0.0);
        }
    }

    fn end_o2_flush(&mut self) {
        if let Some(flush) = self.o2_flush.take() {
            let fio2_restored = flush.pre_flush_fio2();
            flush.restore(&mut self.settings);
            self.record(SessionEvent::O2FlushEnded { fio2_restored });
        }
    }

    /// One stepper invocation. `tick_seconds` is zero for action-forced steps.
    fn run_step(&mut self, tick_seconds: f64) {
        if !self.context.stepper_enabled() {
            return;
        }
        let refilling = self.operations.refilling_agents();
        let inputs = StepInputs {
            settings: &self.settings,
            physiology: &self.physiology,
            context: &self.context,
            consumables: &self.consumables,
            maneuver: self.maneuver.as_ref(),
            refilling: &refilling,
            replacing_soda_lime: self.operations.is_replacing(),
            now_ms: self.now_ms,
            tick_seconds,
        };
        let outcome = self.stepper.step(&self.snapshot, &inputs, &mut self.noise);
        self.snapshot = outcome.snapshot;
        self.consumables = outcome.consumables;

        if outcome.warm_up_complete {
            self.context.warming_up = false;
            self.context.ventilation_active = true;
            info!("High-flow warm-up complete, delivering");
            self.record(SessionEvent::VentilationStarted);
        }

        let fired = self.alarms.evaluate(
            &self.snapshot,
            &self.alarm_config,
            &self.context,
            self.maneuver.is_some(),
        );
        for key in fired {
            self.record(SessionEvent::AlarmFired { key });
        }
    }

    fn record(&mut self, event: SessionEvent) {
        self.events.push(TimedEvent {
            time_ms: self.now_ms,
            event,
        });
    }

    fn require_powered(&self) -> VentResult<()> {
        ensure(self.context.powered_on, "Device is powered off")
    }

    /// Dispatches a scripted action. Refusals are logged and kept in the event stream.
    pub fn apply(&mut self, action: &Action) -> VentResult<()> {
        let result = match action {
            Action::PowerOn => self.power_on(),
            Action::PowerOff => self.power_off(),
            Action::ToggleVentilation => self.toggle_ventilation(),
            Action::ToggleAnesthesia => self.toggle_anesthesia(),
            Action::SetMechanicalVentilation { enabled } => self.set_mechanical_ventilation(*enabled),
            Action::SelectMode { mode } => self.select_mode(*mode),
            Action::ToggleAgent { agent } => self.toggle_agent(*agent),
            Action::EditSetting { key, value } => self.edit_setting(*key, *value),
            Action::SetIeRatio { ratio } => self.set_ie_ratio(ratio),
            Action::ToggleHumidifier => self.toggle_humidifier(),
            Action::InspiratoryHold => self.start_inspiratory_hold(),
            Action::ExpiratoryHold => self.start_expiratory_hold(),
            Action::ClearManeuverResult => {
                self.clear_maneuver_result();
                Ok(())
            }
            Action::O2Flush => self.o2_flush(),
            Action::RefillAgents => self.refill_agents(),
            Action::ReplaceSodaLime => self.replace_soda_lime(),
            Action::ToggleSnooze => self.toggle_snooze(),
            Action::SetAlarmLimits { key, limits } => self.set_alarm_limits(*key, *limits),
            Action::SetPatientPreset { preset } => self.set_patient_preset(*preset),
            Action::SetPhysiology { physiology } => self.set_physiology(physiology.clone()),
            Action::SetSelfTest { running } => self.set_self_test(*running),
            Action::SetDisinfecting { running } => self.set_disinfecting(*running),
            Action::SetSweepSpeed { speed } => {
                self.set_sweep_speed(*speed);
                Ok(())
            }
            Action::CycleSweepSpeed => {
                let speed = self.cycle_sweep_speed();
                debug!("Sweep speed {} mm/s", speed.mm_per_second());
                Ok(())
            }
            Action::ResizeDisplay { width } => {
                self.resize_display(*width);
                Ok(())
            }
        };

        if let Err(e) = &result {
            warn!("{} rejected at {} ms: {}", action.label(), self.now_ms, e);
            self.record(SessionEvent::ActionRejected {
                action: action.label().to_string(),
                reason: e.to_string(),
            });
        }
        result
    }

    pub fn power_on(&mut self) -> VentResult<()> {
        ensure(!self.context.powered_on, "Device is already on")?;
        self.context.powered_on = true;
        self.next_tick_ms = self.now_ms + TICK_MS;
        self.sweep.restart();
        info!("Device powered on");
        self.record(SessionEvent::PoweredOn);
        self.run_step(0.0);
        Ok(())
    }

    /// Stops all therapy and cancels every timer at its terminal position.
    pub fn power_off(&mut self) -> VentResult<()> {
        self.require_powered()?;

        for done in self.operations.cancel(&mut self.consumables) {
            self.record_completion(done);
        }
        self.end_o2_flush();
        self.maneuver = None;
        self.maneuver_result = None;
        self.snooze.reset();
        self.alarms.clear();
        self.stepper.reset();

        self.context.ventilation_active = false;
        self.context.warming_up = false;
        self.context.anesthesia_active = false;
        self.context.anesthesia_session_started = false;
        self.context.self_test_running = false;
        self.context.disinfecting = false;
        self.context.powered_on = false;
        self.snapshot = MonitoredSnapshot::default();

        info!("Device powered off");
        self.record(SessionEvent::PoweredOff);
        Ok(())
    }

    pub fn toggle_ventilation(&mut self) -> VentResult<()> {
        self.require_powered()?;
        ensure(
            !self.context.self_test_running && !self.context.disinfecting,
            "Self-test or disinfection in progress",
        )?;

        if self.context.is_high_flow() {
            if self.context.warming_up || self.context.ventilation_active {
                self.context.warming_up = false;
                self.context.ventilation_active = false;
                self.stepper.reset();
                info!("High flow stopped");
                self.record(SessionEvent::VentilationStopped);
            } else {
                self.context.warming_up = true;
                info!("High-flow warm-up started");
                self.record(SessionEvent::WarmUpStarted);
            }
        } else if self.context.ventilation_active {
            self.context.ventilation_active = false;
            self.maneuver = None;
            info!("Ventilation stopped");
            self.record(SessionEvent::VentilationStopped);
        } else {
            self.context.ventilation_active = true;
            self.maneuver = None;
            self.maneuver_result = None;
            info!("Ventilation started in {}", self.context.ventilation_mode);
            self.record(SessionEvent::VentilationStarted);
        }

        self.run_step(0.0);
        Ok(())
    }

    pub fn toggle_anesthesia(&mut self) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.is_anesthesia(), "Anesthetic gas is only available in anesthesia mode")?;

        if self.context.anesthesia_active {
            self.context.anesthesia_active = false;
            info!("Anesthesia stopped");
            self.record(SessionEvent::AnesthesiaStopped);
        } else {
            ensure(
                self.context.ventilation_active || !self.context.mechanical_ventilation,
                "Start ventilation before delivering anesthetic gas",
            )?;
            self.context.anesthesia_active = true;
            self.context.anesthesia_session_started = true;
            info!("Anesthesia started with {:?}", self.settings.selected_agents);
            self.record(SessionEvent::AnesthesiaStarted);
        }

        self.run_step(0.0);
        Ok(())
    }

    /// Switches the anesthesia machine between the ventilator and the bag,
    /// restoring the breath defaults of the new state.
    pub fn set_mechanical_ventilation(&mut self, enabled: bool) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.is_anesthesia(), "Manual ventilation only exists in anesthesia mode")?;
        if self.context.mechanical_ventilation == enabled {
            return Ok(());
        }

        self.context.mechanical_ventilation = enabled;
        self.maneuver = None;
        self.defaults.restore_ventilation_defaults(&mut self.settings, enabled);
        info!("Ventilation set to {}", if enabled { "mechanical" } else { "manual" });
        self.record(SessionEvent::MechanicalVentilationChanged { enabled });

        let from = self.context.ventilation_mode;
        let to = self.defaults.mode_anesthesia_mechanical;
        if enabled && from != to {
            self.context.ventilation_mode = to;
            self.record(SessionEvent::ModeChanged { from, to });
        }

        self.sweep.restart();
        self.run_step(0.0);
        Ok(())
    }

    pub fn select_mode(&mut self, mode: VentilationMode) -> VentResult<()> {
        self.require_powered()?;
        let high_flow_device = self.context.is_high_flow();
        ensure(
            (mode == VentilationMode::HighFlow) == high_flow_device,
            "High flow is only available as its own ICU sub-mode",
        )?;

        let from = self.context.ventilation_mode;
        self.context.ventilation_mode = mode;
        self.maneuver = None;
        self.maneuver_result = None;

        let factory = ControlSettings::default();
        match mode {
            VentilationMode::Vc => self.settings.pressure_target = factory.pressure_target,
            VentilationMode::Pc => self.settings.tidal_volume = factory.tidal_volume,
            _ => {}
        }

        info!("Mode {} -> {}", from, mode);
        self.record(SessionEvent::ModeChanged { from, to: mode });
        self.sweep.restart();
        self.run_step(0.0);
        Ok(())
    }

    /// Adds or removes an agent. The vaporizer selection is locked while gas is delivered.
    pub fn toggle_agent(&mut self, agent: AnestheticAgent) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.is_anesthesia(), "Agents are only selectable in anesthesia mode")?;
        ensure(!self.context.anesthesia_active, "Stop anesthesia before changing agents")?;

        let selected = &mut self.settings.selected_agents;
        if let Some(index) = selected.iter().position(|&a| a == agent) {
            selected.remove(index);
        } else {
            ensure(selected.len() < MAX_SELECTED_AGENTS, "Two agents are already selected")?;
            selected.push(agent);
        }

        let agents = self.settings.selected_agents.clone();
        info!("Selected agents: {:?}", agents);
        self.record(SessionEvent::AgentSelectionChanged { agents });
        self.run_step(0.0);
        Ok(())
    }

    pub fn edit_setting(&mut self, key: SettingKey, value: f64) -> VentResult<()> {
        self.require_powered()?;
        self.settings.apply_edit(key, value, &self.context)?;
        info!("{:?} set to {}", key, value);
        self.record(SessionEvent::SettingChanged { key, value });
        self.sweep.restart();
        self.run_step(0.0);
        Ok(())
    }

    pub fn set_ie_ratio(&mut self, ratio: &str) -> VentResult<()> {
        self.require_powered()?;
        self.settings.set_ie_ratio(ratio)?;
        let ratio = self.settings.ie_ratio.clone();
        info!("I:E ratio set to {}", ratio);
        self.record(SessionEvent::IeRatioChanged { ratio });
        self.sweep.restart();
        self.run_step(0.0);
        Ok(())
    }

    pub fn toggle_humidifier(&mut self) -> VentResult<()> {
        self.require_powered()?;
        self.settings.humidifier_on = !self.settings.humidifier_on;
        let on = self.settings.humidifier_on;
        self.record(SessionEvent::HumidifierSwitched { on });
        self.run_step(0.0);
        Ok(())
    }

    fn ensure_can_hold(&self) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.breath_delivery_active(), "Holds need active mechanical ventilation")?;
        ensure(self.maneuver.is_none(), "A hold is already running")
    }

    pub fn start_inspiratory_hold(&mut self) -> VentResult<()> {
        self.ensure_can_hold()?;
        self.begin_maneuver(ActiveManeuver::begin_inspiratory(self.now_ms, &self.snapshot));
        Ok(())
    }

    pub fn start_expiratory_hold(&mut self) -> VentResult<()> {
        self.ensure_can_hold()?;
        self.begin_maneuver(ActiveManeuver::begin_expiratory(self.now_ms));
        Ok(())
    }

    fn begin_maneuver(&mut self, maneuver: ActiveManeuver) {
        let kind = maneuver.kind();
        info!("{:?} started", kind);
        self.maneuver = Some(maneuver);
        self.maneuver_result = None;
        self.record(SessionEvent::ManeuverStarted { kind });
        self.run_step(0.0);
    }

    pub fn clear_maneuver_result(&mut self) {
        self.maneuver_result = None;
    }

    pub fn o2_flush(&mut self) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.is_anesthesia(), "O2 flush is only available in anesthesia mode")?;
        ensure(self.context.ventilation_active, "O2 flush needs active ventilation")?;
        ensure(self.o2_flush.is_none(), "O2 flush already running")?;

        self.o2_flush = Some(O2Flush::start(self.now_ms, &mut self.settings));
        self.record(SessionEvent::O2FlushStarted);
        self.run_step(0.0);
        Ok(())
    }

    fn ensure_can_service_consumables(&self) -> VentResult<()> {
        self.require_powered()?;
        ensure(self.context.is_anesthesia(), "Consumables are only serviced in anesthesia mode")?;
        ensure(!self.context.anesthesia_active, "Stop anesthesia before servicing consumables")
    }

    pub fn refill_agents(&mut self) -> VentResult<()> {
        self.ensure_can_service_consumables()?;
        let agents = self
            .operations
            .start_refill(self.now_ms, &self.consumables, &self.settings.selected_agents)?;
        self.record(SessionEvent::RefillStarted { agents });
        Ok(())
    }

    pub fn replace_soda_lime(&mut self) -> VentResult<()> {
        self.ensure_can_service_consumables()?;
        self.operations.start_replacement(self.now_ms, &self.consumables)?;
        self.record(SessionEvent::SodaLimeReplacementStarted);
        Ok(())
    }

    pub fn toggle_snooze(&mut self) -> VentResult<()> {
        self.require_powered()?;
        let change = self.snooze.toggle(self.now_ms);
        self.record(SessionEvent::Snooze { change });
        Ok(())
    }

    pub fn set_alarm_limits(&mut self, key: AlarmKey, limits: AlarmLimits) -> VentResult<()> {
        self.alarm_config.set(key, limits)?;
        info!("{} limits set to {:?}..{:?}", key.label(), limits.low, limits.high);
        self.run_step(0.0);
        Ok(())
    }

    /// Loads a preset, keeping the patient's weight.
    pub fn set_patient_preset(&mut self, preset: PhysiologyPreset) -> VentResult<()> {
        let weight = self.physiology.weight;
        self.set_physiology(PatientPhysiology::from_preset(preset, weight))
    }

    pub fn set_physiology(&mut self, physiology: PatientPhysiology) -> VentResult<()> {
        ensure(
            physiology.weight.is_finite() && physiology.weight >= 0.0,
            "Patient weight must be non-negative",
        )?;
        self.physiology = physiology;
        info!(
            "Patient mechanics C={} R={}",
            self.physiology.compliance, self.physiology.resistance
        );
        self.record(SessionEvent::PatientChanged);
        self.run_step(0.0);
        Ok(())
    }

    pub fn set_self_test(&mut self, running: bool) -> VentResult<()> {
        self.set_service_gate(running, |context| &mut context.self_test_running)?;
        self.record(SessionEvent::SelfTestChanged { running });
        Ok(())
    }

    pub fn set_disinfecting(&mut self, running: bool) -> VentResult<()> {
        self.set_service_gate(running, |context| &mut context.disinfecting)?;
        self.record(SessionEvent::DisinfectionChanged { running });
        Ok(())
    }

    /// Self-test and disinfection pause the stepper and the alarms.
    fn set_service_gate(
        &mut self,
        running: bool,
        flag: impl FnOnce(&mut OperatingContext) -> &mut bool,
    ) -> VentResult<()> {
        self.require_powered()?;
        if running {
            ensure(
                !self.context.ventilation_active && !self.context.warming_up,
                "Stop ventilation first",
            )?;
        }
        *flag(&mut self.context) = running;

        if self.context.stepper_enabled() {
            self.next_tick_ms = self.now_ms + TICK_MS;
            self.run_step(0.0);
        } else {
            self.alarms.clear();
        }
        Ok(())
    }

    pub fn set_sweep_speed(&mut self, speed: SweepSpeed) {
        self.sweep.set_speed(speed);
    }

    /// Cycles 10 → 25 → 50 → 10 mm/s.
    pub fn cycle_sweep_speed(&mut self) -> SweepSpeed {
        let next = match self.sweep.speed() {
            SweepSpeed::Slow => SweepSpeed::Medium,
            SweepSpeed::Medium => SweepSpeed::Fast,
            SweepSpeed::Fast => SweepSpeed::Slow,
        };
        self.sweep.set_speed(next);
        next
    }

    pub fn resize_display(&mut self, width: usize) {
        self.sweep.resize(width);
    }

    /// Samples the waveform for one display frame.
    pub fn sample_frame(&mut self) -> Vec<WaveformRecord> {
        if !self.context.powered_on {
            return Vec::new();
        }
        let cycle_ms = waveform::ui_cycle_ms(self.snapshot.measured_frequency);
        let positions = self.sweep.advance_frame();

        positions
            .into_iter()
            .map(|position| {
                let point = waveform::sample(
                    position.time_ms,
                    cycle_ms,
                    &self.context,
                    &self.settings,
                    &self.physiology,
                    self.maneuver.as_ref(),
                    &self.snapshot,
                    &self.templates,
                    &mut self.noise,
                );
                WaveformRecord {
                    time_ms: position.time_ms,
                    pixel: position.pixel,
                    pressure: point.pressure,
                    flow: point.flow,
                    volume: point.volume,
                }
            })
            .collect()
    }
}

/// Drives a device through a whole scripted session at the configured frame rate.
pub fn run_session<N: NoiseSource>(config: &SimulatorConfig, noise: N) -> VentResult<SessionResult> {
    let mut ventilator = Ventilator::new(config, noise)?;
    let session = &config.session;
    let end_ms = session.duration_ms();
    let frame_interval_ms = session.frame_interval_ms();

    let mut scripted: Vec<&ScriptedAction> = session.actions.iter().collect();
    scripted.sort_by_key(|a| a.at_ms);
    let mut pending = scripted.into_iter().peekable();

    let mut result = SessionResult::default();
    let mut frame = 0u64;
    loop {
        let frame_ms = (frame as f64 * frame_interval_ms).round() as u64;
        if frame_ms > end_ms {
            break;
        }
        while let Some(scripted) = pending.next_if(|a| a.at_ms <= frame_ms) {
            ventilator.advance_to(scripted.at_ms);
            // refusals are already in the event stream
            ventilator.apply(&scripted.action).ok();
        }
        ventilator.advance_to(frame_ms);
        result.waveform.extend(ventilator.sample_frame());
        frame += 1;
    }
    for scripted in pending {
        ventilator.advance_to(scripted.at_ms);
        ventilator.apply(&scripted.action).ok();
    }
    ventilator.advance_to(end_ms);

    result.ticks = ventilator.drain_ticks();
    result.events = ventilator.drain_events();
    debug!(
        "Session finished: {} frames, {} ticks, {} events",
        frame,
        result.ticks.len(),
        result.events.len()
    );
    Ok(result)
}
