pub mod anesthesia;
pub mod high_flow;
pub mod maneuver;
pub mod operations;
pub mod session;
pub mod timers;

use log::debug;
use std::collections::BTreeSet;

use crate::models::apply_breath;
use crate::noise::NoiseSource;
use crate::snapshot::{round_to, MonitoredSnapshot, Reading};
use crate::state::{
    AnestheticAgent, ConsumableState, ControlSettings, OperatingContext, OperatingMode, PatientPhysiology,
    AMBIENT_TEMPERATURE,
};

pub use high_flow::HighFlowThermal;
pub use maneuver::*;
pub use operations::{ConsumableOperations, O2Flush, OperationCompleted};
pub use session::*;
pub use timers::Countdown;

pub const TICK_MS: u64 = 2_000;
pub const TICK_SECONDS: f64 = 2.0;

/// Read-only view of everything one step consumes.
pub struct StepInputs<'a> {
    pub settings: &'a ControlSettings,
    pub physiology: &'a PatientPhysiology,
    pub context: &'a OperatingContext,
    pub consumables: &'a ConsumableState,
    pub maneuver: Option<&'a ActiveManeuver>,
    pub refilling: &'a BTreeSet<AnestheticAgent>,
    pub replacing_soda_lime: bool,
    pub now_ms: u64,
    /// Zero for steps forced by an operator action.
    pub tick_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub snapshot: MonitoredSnapshot,
    pub consumables: ConsumableState,
    /// High-flow warm-up reached its target during this step.
    pub warm_up_complete: bool,
}

/// Advances the slowly varying state by one tick. Only the temperature ramp
/// is carried between steps; everything else comes in through `StepInputs`.
#[derive(Debug, Clone, Default)]
pub struct PhysiologyStepper {
    thermal: HighFlowThermal,
}

impl PhysiologyStepper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.thermal.reset();
    }

    pub fn thermal(&self) -> &HighFlowThermal {
        &self.thermal
    }

    pub fn step(
        &mut self,
        previous: &MonitoredSnapshot,
        inputs: &StepInputs,
        noise: &mut dyn NoiseSource,
    ) -> StepOutcome {
        let settings = inputs.settings;
        let context = inputs.context;
        let mut next = previous.clone();
        let mut consumables = inputs.consumables.clone();

        next.peep = Reading::from_finite(settings.peep);
        next.fio2 = Reading::from_finite(settings.fio2);
        next.set_frequency = if context.is_high_flow() {
            Reading::Unavailable
        } else {
            Reading::from_finite(settings.frequency)
        };

        if context.is_anesthesia() {
            self.step_anesthesia(&mut next, previous, inputs, &mut consumables, noise);
        } else {
            next.et_agent = [Reading::Unavailable; 2];
            next.fi_agent = [Reading::Unavailable; 2];
            next.inspired_co2 = Reading::Unavailable;
            next.soda_lime_remaining_percent = Reading::Unavailable;
        }

        let warm_up_complete = if context.is_high_flow() {
            self.step_high_flow(&mut next, previous, inputs, &mut consumables)
        } else {
            self.thermal.reset();
            next.delivered_temperature = Reading::Unavailable;
            next.delivered_flow = Reading::Unavailable;
            next.water_level_percent = Reading::Unavailable;
            false
        };

        next.humidifier_temperature =
            if context.operating_mode == OperatingMode::Icu && !context.is_high_flow() && settings.humidifier_on {
                Reading::from_finite(settings.humidifier_temperature)
            } else {
                Reading::Unavailable
            };

        if context.breath_delivery_active() {
            match inputs.maneuver {
                Some(maneuver) => {
                    maneuver.freeze(&mut next, settings, inputs.physiology, context.ventilation_mode)
                }
                None => {
                    let mac = anesthesia::achieved_mac(&next.et_agent, &settings.selected_agents);
                    apply_breath(&mut next, previous, settings, inputs.physiology, context, mac, noise);
                }
            }
        } else {
            next.clear_breath_values();
        }

        consumables.clamp();
        debug!(
            "Step at {} ms (dt {} s): Ppeak {:.1} Vte {:.0}",
            inputs.now_ms, inputs.tick_seconds, next.peak_pressure, next.expired_volume
        );

        StepOutcome {
            snapshot: next,
            consumables,
            warm_up_complete,
        }
    }

    fn step_anesthesia(
        &mut self,
        next: &mut MonitoredSnapshot,
        previous: &MonitoredSnapshot,
        inputs: &StepInputs,
        consumables: &mut ConsumableState,
        noise: &mut dyn NoiseSource,
    ) {
        let settings = inputs.settings;
        let context = inputs.context;
        let dt = inputs.tick_seconds;
        let selected = &settings.selected_agents;

        if context.anesthesia_active {
            anesthesia::consume_agents(consumables, selected, settings.fgf, inputs.refilling, dt);
        }

        let previous_et = [previous.et_agent[0].or(0.0), previous.et_agent[1].or(0.0)];
        let channels = anesthesia::relax_end_tidal(
            previous_et,
            selected,
            consumables,
            settings.target_mac,
            context.anesthesia_active,
            settings.fgf,
            dt,
        );
        next.et_agent = channels.end_tidal.map(Reading::from_finite);
        next.fi_agent = channels.inspired.map(Reading::from_finite);

        if context.anesthesia_session_started && !inputs.replacing_soda_lime {
            consumables.soda_lime_consumed_percent =
                anesthesia::consume_soda_lime(consumables.soda_lime_consumed_percent, settings.fgf, dt);
        }
        next.soda_lime_remaining_percent =
            Reading::from_finite(round_to(100.0 - consumables.soda_lime_consumed_percent, 1));

        next.inspired_co2 = Reading::Value(if context.mechanical_ventilation {
            anesthesia::inspired_co2(consumables.soda_lime_consumed_percent, settings.fgf, noise)
        } else {
            0.0
        });
    }

    fn step_high_flow(
        &mut self,
        next: &mut MonitoredSnapshot,
        previous: &MonitoredSnapshot,
        inputs: &StepInputs,
        consumables: &mut ConsumableState,
    ) -> bool {
        let settings = inputs.settings;
        let context = inputs.context;

        let target = if context.warming_up || context.ventilation_active {
            settings.hf_target_temperature
        } else {
            AMBIENT_TEMPERATURE
        };
        let current = previous.delivered_temperature.or(AMBIENT_TEMPERATURE);
        let delivered = self.thermal.advance(current, target, inputs.now_ms);
        next.delivered_temperature = Reading::from_finite(delivered);

        let mut warm_up_complete = false;
        if context.warming_up && high_flow::warm_up_reached(delivered, settings.hf_target_temperature) {
            self.thermal.reset();
            warm_up_complete = true;
        }

        if context.ventilation_active {
            consumables.water_level_percent =
                high_flow::consume_water(consumables.water_level_percent, settings.fgf, inputs.tick_seconds);
        }
        next.water_level_percent = Reading::from_finite(round_to(consumables.water_level_percent, 1));
        next.delivered_flow = Reading::Value(if context.ventilation_active || context.warming_up {
            settings.fgf
        } else {
            0.0
        });
        warm_up_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{FixedNoise, RngNoise};
    use crate::state::{IcuSubMode, VentilationMode};
    use approx::assert_relative_eq;

    struct Fixture {
        settings: ControlSettings,
        physiology: PatientPhysiology,
        context: OperatingContext,
        consumables: ConsumableState,
    }

    impl Fixture {
        fn new(operating_mode: OperatingMode, sub_mode: IcuSubMode) -> Self {
            Self {
                settings: ControlSettings::default(),
                physiology: PatientPhysiology {
                    compliance: 50.0,
                    resistance: 10.0,
                    ..PatientPhysiology::default()
                },
                context: OperatingContext::new(operating_mode, sub_mode),
                consumables: ConsumableState::default(),
            }
        }

        fn inputs<'a>(
            &'a self,
            refilling: &'a BTreeSet<AnestheticAgent>,
            maneuver: Option<&'a ActiveManeuver>,
            now_ms: u64,
            tick_seconds: f64,
        ) -> StepInputs<'a> {
            StepInputs {
                settings: &self.settings,
                physiology: &self.physiology,
                context: &self.context,
                consumables: &self.consumables,
                maneuver,
                refilling,
                replacing_soda_lime: false,
                now_ms,
                tick_seconds,
            }
        }
    }

    #[test]
    fn test_consumables_stay_in_range() {
        let mut fixture = Fixture::new(OperatingMode::Anesthesia, IcuSubMode::Invasive);
        fixture.context.mechanical_ventilation = true;
        fixture.context.ventilation_active = true;
        fixture.context.anesthesia_active = true;
        fixture.context.anesthesia_session_started = true;
        fixture.settings.fgf = 18.0;
        fixture.settings.selected_agents = vec![AnestheticAgent::Sevoflurane, AnestheticAgent::Desflurane];

        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = RngNoise::new(Some(7));
        let mut snapshot = MonitoredSnapshot::default();

        for tick in 0..2_000u64 {
            let outcome = {
                let inputs = fixture.inputs(&refilling, None, tick * TICK_MS, TICK_SECONDS);
                stepper.step(&snapshot, &inputs, &mut noise)
            };
            for level in outcome.consumables.agent_levels.values() {
                assert!((0.0..=100.0).contains(level));
            }
            let soda = outcome.consumables.soda_lime_consumed_percent;
            assert!((0.0..=100.0).contains(&soda));
            assert!(soda >= fixture.consumables.soda_lime_consumed_percent);
            fixture.consumables = outcome.consumables;
            snapshot = outcome.snapshot;
        }
        assert_eq!(fixture.consumables.agent_level(AnestheticAgent::Sevoflurane), 0.0);
        assert_eq!(snapshot.fi_agent[0], Reading::Value(0.0));
    }

    #[test]
    fn test_breath_values_unavailable_when_idle() {
        let fixture = Fixture::new(OperatingMode::Icu, IcuSubMode::Invasive);
        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = FixedNoise::midpoint();

        let outcome = stepper.step(
            &MonitoredSnapshot::default(),
            &fixture.inputs(&refilling, None, 0, TICK_SECONDS),
            &mut noise,
        );
        assert_eq!(outcome.snapshot.peak_pressure, Reading::Unavailable);
        assert_eq!(outcome.snapshot.peep, Reading::Value(5.0));
        assert_eq!(outcome.snapshot.et_agent, [Reading::Unavailable; 2]);
        assert_eq!(outcome.snapshot.etco2, Reading::Value(35.0));
    }

    #[test]
    fn test_volume_control_plateau() {
        let mut fixture = Fixture::new(OperatingMode::Icu, IcuSubMode::Invasive);
        fixture.context.ventilation_active = true;
        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = FixedNoise::midpoint();

        let outcome = stepper.step(
            &MonitoredSnapshot::default(),
            &fixture.inputs(&refilling, None, 0, TICK_SECONDS),
            &mut noise,
        );
        assert_eq!(outcome.snapshot.plateau_pressure, Reading::Value(15.0));
        assert!(outcome.snapshot.peak_pressure.or(0.0) >= 15.0);
    }

    #[test]
    fn test_maneuver_bypasses_breath_model() {
        let mut fixture = Fixture::new(OperatingMode::Icu, IcuSubMode::Invasive);
        fixture.context.ventilation_active = true;
        fixture.context.ventilation_mode = VentilationMode::Pc;
        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = FixedNoise::midpoint();
        let maneuver = ActiveManeuver::begin_expiratory(0);

        let outcome = stepper.step(
            &MonitoredSnapshot::default(),
            &fixture.inputs(&refilling, Some(&maneuver), 0, 0.0),
            &mut noise,
        );
        assert_eq!(outcome.snapshot.peak_pressure, Reading::Value(5.0));
        assert_eq!(outcome.snapshot.minute_volume, Reading::Value(0.0));
    }

    #[test]
    fn test_forced_step_does_not_deplete() {
        let mut fixture = Fixture::new(OperatingMode::Anesthesia, IcuSubMode::Invasive);
        fixture.context.anesthesia_active = true;
        fixture.context.anesthesia_session_started = true;
        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = FixedNoise::midpoint();

        let outcome = stepper.step(
            &MonitoredSnapshot::default(),
            &fixture.inputs(&refilling, None, 0, 0.0),
            &mut noise,
        );
        assert_eq!(outcome.consumables, fixture.consumables);
        assert_eq!(outcome.snapshot.soda_lime_remaining_percent, Reading::Value(100.0));
        // hand ventilation: no inspired CO2
        assert_eq!(outcome.snapshot.inspired_co2, Reading::Value(0.0));
    }

    #[test]
    fn test_high_flow_warm_up_completes_at_ramp_end() {
        let mut fixture = Fixture::new(OperatingMode::Icu, IcuSubMode::HighFlow);
        fixture.context.warming_up = true;
        fixture.settings.fgf = 30.0;
        let refilling = BTreeSet::new();
        let mut stepper = PhysiologyStepper::new();
        let mut noise = FixedNoise::midpoint();
        let mut snapshot = MonitoredSnapshot::default();

        let mut completed_at = None;
        for tick in 0..=10u64 {
            let now = tick * TICK_MS;
            let outcome = stepper.step(&snapshot, &fixture.inputs(&refilling, None, now, TICK_SECONDS), &mut noise);
            snapshot = outcome.snapshot;
            if outcome.warm_up_complete {
                completed_at = Some(now);
                break;
            }
        }
        // first tick at 16 s after the ramp started at 0
        assert_eq!(completed_at, Some(16_000));
        assert_relative_eq!(snapshot.delivered_temperature.or(0.0), 37.0);
        assert_eq!(snapshot.peak_pressure, Reading::Unavailable);
        assert_eq!(snapshot.water_level_percent, Reading::Value(100.0));
    }
}
