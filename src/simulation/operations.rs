use log::info;
use std::collections::{BTreeMap, BTreeSet};

use super::timers::Countdown;
use crate::error::{VentError, VentResult};
use crate::snapshot::round_to;
use crate::state::{AnestheticAgent, ConsumableState, ControlSettings};

pub const CONSUMABLE_ANIMATION_MS: u64 = 10_000;
pub const O2_FLUSH_DURATION_MS: u64 = 30_000;
/// Agents at or above this level are not refilled.
pub const REFILL_THRESHOLD_PERCENT: f64 = 99.9;
/// Replacement needs at least this much absorbent used.
pub const REPLACE_THRESHOLD_PERCENT: f64 = 0.1;

const FLUSH_FIO2: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
struct AgentRefill {
    timer: Countdown,
    start_levels: BTreeMap<AnestheticAgent, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SodaLimeReplacement {
    timer: Countdown,
    start_consumed: f64,
}

/// Finished or cancelled consumable operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationCompleted {
    AgentsRefilled(Vec<AnestheticAgent>),
    SodaLimeReplaced,
}

/// Refill and replacement animations. Levels move linearly and snap to their
/// terminal value when the animation ends or is cancelled.
#[derive(Debug, Clone, Default)]
pub struct ConsumableOperations {
    refill: Option<AgentRefill>,
    replacement: Option<SodaLimeReplacement>,
}

impl ConsumableOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_refill(
        &mut self,
        now_ms: u64,
        consumables: &ConsumableState,
        selected: &[AnestheticAgent],
    ) -> VentResult<Vec<AnestheticAgent>> {
        if self.refill.is_some() {
            return Err(VentError::ActionRejected("A refill is already running".to_string()));
        }
        let start_levels: BTreeMap<AnestheticAgent, f64> = selected
            .iter()
            .map(|&agent| (agent, consumables.agent_level(agent)))
            .filter(|(_, level)| *level < REFILL_THRESHOLD_PERCENT)
            .collect();
        if start_levels.is_empty() {
            return Err(VentError::ActionRejected("Selected agents are already full".to_string()));
        }

        let agents: Vec<AnestheticAgent> = start_levels.keys().copied().collect();
        info!("Refilling {:?}", agents);
        self.refill = Some(AgentRefill {
            timer: Countdown::start(now_ms, CONSUMABLE_ANIMATION_MS),
            start_levels,
        });
        Ok(agents)
    }

    pub fn start_replacement(&mut self, now_ms: u64, consumables: &ConsumableState) -> VentResult<()> {
        if self.replacement.is_some() {
            return Err(VentError::ActionRejected("Soda lime replacement already running".to_string()));
        }
        let consumed = consumables.soda_lime_consumed_percent;
        if consumed <= REPLACE_THRESHOLD_PERCENT {
            return Err(VentError::ActionRejected(format!(
                "Soda lime only {:.1}% consumed",
                consumed
            )));
        }

        info!("Replacing soda lime at {:.1}% consumed", consumed);
        self.replacement = Some(SodaLimeReplacement {
            timer: Countdown::start(now_ms, CONSUMABLE_ANIMATION_MS),
            start_consumed: consumed,
        });
        Ok(())
    }

    pub fn refilling_agents(&self) -> BTreeSet<AnestheticAgent> {
        self.refill
            .as_ref()
            .map(|r| r.start_levels.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_refilling(&self) -> bool {
        self.refill.is_some()
    }

    pub fn is_replacing(&self) -> bool {
        self.replacement.is_some()
    }

    pub fn next_deadline_ms(&self) -> Option<u64> {
        let refill = self.refill.as_ref().map(|r| r.timer.deadline_ms);
        let replacement = self.replacement.map(|r| r.timer.deadline_ms);
        refill.into_iter().chain(replacement).min()
    }

    /// Moves animated levels to their value at `now_ms`.
    pub fn advance(&mut self, now_ms: u64, consumables: &mut ConsumableState) -> Vec<OperationCompleted> {
        let mut completed = Vec::new();

        let refill_expired = match &self.refill {
            Some(refill) => {
                let progress = refill.timer.progress(now_ms);
                for (&agent, &start) in &refill.start_levels {
                    consumables.set_agent_level(agent, round_to(start + (100.0 - start) * progress, 2));
                }
                refill.timer.is_expired(now_ms)
            }
            None => false,
        };
        if refill_expired {
            completed.push(self.finish_refill(consumables));
        }

        if let Some(replacement) = self.replacement {
            let progress = replacement.timer.progress(now_ms);
            consumables.soda_lime_consumed_percent = round_to(replacement.start_consumed * (1.0 - progress), 2);
            if replacement.timer.is_expired(now_ms) {
                completed.push(self.finish_replacement(consumables));
            }
        }

        completed
    }

    /// Ends every running animation at its terminal level.
    pub fn cancel(&mut self, consumables: &mut ConsumableState) -> Vec<OperationCompleted> {
        let mut completed = Vec::new();
        if self.refill.is_some() {
            completed.push(self.finish_refill(consumables));
        }
        if self.replacement.is_some() {
            completed.push(self.finish_replacement(consumables));
        }
        completed
    }

    fn finish_refill(&mut self, consumables: &mut ConsumableState) -> OperationCompleted {
        let agents: Vec<AnestheticAgent> = self
            .refill
            .take()
            .map(|r| r.start_levels.into_keys().collect())
            .unwrap_or_default();
        for &agent in &agents {
            consumables.set_agent_level(agent, 100.0);
        }
        info!("Refill complete: {:?}", agents);
        OperationCompleted::AgentsRefilled(agents)
    }

    fn finish_replacement(&mut self, consumables: &mut ConsumableState) -> OperationCompleted {
        self.replacement = None;
        consumables.soda_lime_consumed_percent = 0.0;
        info!("Soda lime replaced");
        OperationCompleted::SodaLimeReplaced
    }
}

/// FiO2 forced to 100 % for a fixed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct O2Flush {
    timer: Countdown,
    pre_flush_fio2: f64,
}

impl O2Flush {
    pub fn start(now_ms: u64, settings: &mut ControlSettings) -> Self {
        let flush = Self {
            timer: Countdown::start(now_ms, O2_FLUSH_DURATION_MS),
            pre_flush_fio2: settings.fio2,
        };
        settings.fio2 = FLUSH_FIO2;
        info!("O2 flush started, FiO2 {} -> {}", flush.pre_flush_fio2, FLUSH_FIO2);
        flush
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.timer.is_expired(now_ms)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.timer.deadline_ms
    }

    pub fn pre_flush_fio2(&self) -> f64 {
        self.pre_flush_fio2
    }

    pub fn restore(self, settings: &mut ControlSettings) {
        settings.fio2 = self.pre_flush_fio2;
        info!("O2 flush ended, FiO2 restored to {}", self.pre_flush_fio2);
    }
}
