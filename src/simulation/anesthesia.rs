use std::collections::BTreeSet;

use crate::noise::NoiseSource;
use crate::snapshot::{round_to, Reading};
use crate::state::{clamp_percent, AnestheticAgent, ConsumableState};

/// FGF (L/min) at which a full vaporizer empties in `AGENT_CONSUMPTION_REFERENCE_SECONDS`.
pub const AGENT_CONSUMPTION_REFERENCE_FGF: f64 = 10.0;
pub const AGENT_CONSUMPTION_REFERENCE_SECONDS: f64 = 3600.0;

pub const SODA_LIME_MAX_LIFETIME_HOURS: f64 = 8.0;
pub const SODA_LIME_MIN_LIFETIME_HOURS: f64 = 2.0;
pub const SODA_LIME_FGF_LOW_THRESHOLD: f64 = 0.5;
pub const SODA_LIME_FGF_HIGH_THRESHOLD: f64 = 6.0;
/// Consumption rate (%/s) used when the lifetime degenerates to zero.
const SODA_LIME_FALLBACK_RATE: f64 = 0.1;

pub const ET_AGENT_TIME_CONSTANT_FACTOR: f64 = 0.05;
pub const ET_AGENT_MIN_FGF_EFFECT: f64 = 0.5;

/// Nominal stepper interval the relaxation constants were tuned for.
const REFERENCE_TICK_SECONDS: f64 = 2.0;

/// At most this many agents are delivered at once.
pub const MAX_SELECTED_AGENTS: usize = 2;

/// End-tidal and inspired agent concentration per channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentChannels {
    pub end_tidal: [f64; MAX_SELECTED_AGENTS],
    pub inspired: [f64; MAX_SELECTED_AGENTS],
}

/// Depletes every selected agent that still has liquid and is not being refilled.
/// Levels are stored unrounded.
pub fn consume_agents(
    consumables: &mut ConsumableState,
    selected: &[AnestheticAgent],
    fgf: f64,
    refilling: &BTreeSet<AnestheticAgent>,
    tick_seconds: f64,
) {
    if fgf <= 0.0 || tick_seconds <= 0.0 {
        return;
    }
    let per_second = (fgf / AGENT_CONSUMPTION_REFERENCE_FGF) * (100.0 / AGENT_CONSUMPTION_REFERENCE_SECONDS);

    for &agent in selected.iter().take(MAX_SELECTED_AGENTS) {
        let level = consumables.agent_level(agent);
        if level > 0.0 && !refilling.contains(&agent) {
            consumables.set_agent_level(agent, (level - per_second * tick_seconds).max(0.0));
        }
    }
}

/// First-order gain of the end-tidal relaxation for one step.
pub fn et_agent_gain(fgf: f64, tick_seconds: f64) -> f64 {
    let per_tick = fgf.max(ET_AGENT_MIN_FGF_EFFECT) * ET_AGENT_TIME_CONSTANT_FACTOR;
    (per_tick * tick_seconds / REFERENCE_TICK_SECONDS).clamp(0.0, 1.0)
}

/// Moves each end-tidal channel toward its target. Channel `i` follows the
/// `i`-th selected agent; the delivered MAC is split evenly over the agents
/// that still have liquid. Unused channels and inactive anesthesia relax to 0.
pub fn relax_end_tidal(
    previous: [f64; MAX_SELECTED_AGENTS],
    selected: &[AnestheticAgent],
    consumables: &ConsumableState,
    target_mac: f64,
    anesthesia_active: bool,
    fgf: f64,
    tick_seconds: f64,
) -> AgentChannels {
    let gain = et_agent_gain(fgf, tick_seconds);
    let delivering: Vec<AnestheticAgent> = if anesthesia_active {
        selected
            .iter()
            .take(MAX_SELECTED_AGENTS)
            .copied()
            .filter(|&a| consumables.agent_level(a) > 0.0)
            .collect()
    } else {
        Vec::new()
    };
    let mac_per_agent = if delivering.is_empty() {
        0.0
    } else {
        target_mac.max(0.0) / delivering.len() as f64
    };

    let mut channels = AgentChannels {
        end_tidal: [0.0; MAX_SELECTED_AGENTS],
        inspired: [0.0; MAX_SELECTED_AGENTS],
    };
    for slot in 0..MAX_SELECTED_AGENTS {
        let target = selected
            .get(slot)
            .filter(|agent| delivering.contains(agent))
            .map_or(0.0, |agent| mac_per_agent * agent.mac());

        let current = previous[slot].max(0.0);
        channels.end_tidal[slot] = round_to((current + (target - current) * gain).max(0.0), 2);
        channels.inspired[slot] = round_to(target, 2);
    }
    channels
}

/// Sum of end-tidal/MAC over the selected agents.
pub fn achieved_mac(end_tidal: &[Reading; MAX_SELECTED_AGENTS], selected: &[AnestheticAgent]) -> f64 {
    selected
        .iter()
        .zip(end_tidal.iter())
        .map(|(agent, et)| et.or(0.0) / agent.mac())
        .sum()
}

/// Share of exhaled gas rebreathed through the absorber: 1 at low FGF, 0 at high FGF.
pub fn rebreathing_factor(fgf: f64) -> f64 {
    if fgf < SODA_LIME_FGF_LOW_THRESHOLD {
        1.0
    } else if fgf < SODA_LIME_FGF_HIGH_THRESHOLD {
        1.0 - (fgf - SODA_LIME_FGF_LOW_THRESHOLD) / (SODA_LIME_FGF_HIGH_THRESHOLD - SODA_LIME_FGF_LOW_THRESHOLD)
    } else {
        0.0
    }
}

pub fn soda_lime_lifetime_hours(fgf: f64) -> f64 {
    SODA_LIME_MAX_LIFETIME_HOURS
        - rebreathing_factor(fgf) * (SODA_LIME_MAX_LIFETIME_HOURS - SODA_LIME_MIN_LIFETIME_HOURS)
}

/// Consumption rate in percent per second.
pub fn soda_lime_rate(fgf: f64) -> f64 {
    let lifetime = soda_lime_lifetime_hours(fgf);
    if lifetime > 0.0 {
        100.0 / (lifetime * 3600.0)
    } else {
        SODA_LIME_FALLBACK_RATE
    }
}

/// Unrounded consumed percent after one step; callers round for display.
pub fn consume_soda_lime(consumed_percent: f64, fgf: f64, tick_seconds: f64) -> f64 {
    if consumed_percent >= 100.0 {
        return 100.0;
    }
    clamp_percent(consumed_percent + soda_lime_rate(fgf) * tick_seconds.max(0.0))
}

/// Inspired CO2 (mmHg) from absorber saturation and FGF.
pub fn inspired_co2(consumed_percent: f64, fgf: f64, noise: &mut dyn NoiseSource) -> f64 {
    let fluctuation = noise.uniform(-0.15, 0.15);
    let base = if consumed_percent > 85.0 {
        5.0 + noise.uniform(0.0, 5.0)
    } else if consumed_percent > 50.0 && fgf < 1.0 {
        2.0 + noise.uniform(0.0, 2.0)
    } else if fgf < 0.75 && consumed_percent > 20.0 {
        1.0 + noise.uniform(0.0, 1.0)
    } else if fgf < 1.5 && consumed_percent > 10.0 {
        0.5 + noise.uniform(0.0, 0.5)
    } else {
        0.1 + noise.uniform(0.0, 0.2)
    };
    round_to((base + fluctuation).clamp(0.0, 20.0), 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::FixedNoise;
    use approx::assert_relative_eq;

    #[test]
    fn test_agent_consumption_rate() {
        let mut consumables = ConsumableState::default();
        let selected = [AnestheticAgent::Sevoflurane, AnestheticAgent::Desflurane];
        // reference FGF empties the vaporizer in one hour: 100 % / 1800 ticks
        consume_agents(&mut consumables, &selected, 10.0, &BTreeSet::new(), 2.0);
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Sevoflurane), 100.0 - 100.0 / 1800.0, epsilon = 1e-9);
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Desflurane), 100.0 - 100.0 / 1800.0, epsilon = 1e-9);
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Isoflurane), 100.0);
    }

    #[test]
    fn test_reference_flow_empties_vaporizer_in_one_hour() {
        let mut consumables = ConsumableState::default();
        let selected = [AnestheticAgent::Sevoflurane];
        for _ in 0..900 {
            consume_agents(&mut consumables, &selected, 10.0, &BTreeSet::new(), 2.0);
        }
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Sevoflurane), 50.0, epsilon = 1e-6);
        for _ in 0..900 {
            consume_agents(&mut consumables, &selected, 10.0, &BTreeSet::new(), 2.0);
        }
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Sevoflurane), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_low_flow_depletion_accumulates() {
        let mut consumables = ConsumableState::default();
        let selected = [AnestheticAgent::Sevoflurane];
        // 30 minutes at 0.8 L/min: 0.08 * 50 %
        for _ in 0..900 {
            consume_agents(&mut consumables, &selected, 0.8, &BTreeSet::new(), 2.0);
        }
        let level = consumables.agent_level(AnestheticAgent::Sevoflurane);
        assert!(level < 100.0);
        assert_relative_eq!(level, 96.0, epsilon = 1e-6);
    }

    #[test]
    fn test_soda_lime_lasts_its_lifetime() {
        // FGF above the high threshold gives the 8 h lifetime: 14400 ticks of 2 s
        let mut consumed = 0.0;
        for _ in 0..14_399 {
            consumed = consume_soda_lime(consumed, 8.0, 2.0);
        }
        assert!(consumed < 100.0);
        assert_relative_eq!(consumed, 100.0 - 100.0 / 14_400.0, epsilon = 1e-6);

        consumed = consume_soda_lime(consumed, 8.0, 2.0);
        assert_relative_eq!(consumed, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_refilling_agent_is_not_consumed() {
        let mut consumables = ConsumableState::default();
        let refilling: BTreeSet<_> = [AnestheticAgent::Sevoflurane].into_iter().collect();
        consume_agents(&mut consumables, &[AnestheticAgent::Sevoflurane], 10.0, &refilling, 2.0);
        assert_relative_eq!(consumables.agent_level(AnestheticAgent::Sevoflurane), 100.0);
    }

    #[test]
    fn test_agent_level_never_negative() {
        let mut consumables = ConsumableState::default();
        consumables.set_agent_level(AnestheticAgent::Sevoflurane, 0.01);
        consume_agents(&mut consumables, &[AnestheticAgent::Sevoflurane], 18.0, &BTreeSet::new(), 2.0);
        assert_eq!(consumables.agent_level(AnestheticAgent::Sevoflurane), 0.0);
    }

    #[test]
    fn test_end_tidal_relaxation_split_between_agents() {
        let consumables = ConsumableState::default();
        let selected = [AnestheticAgent::Sevoflurane, AnestheticAgent::Desflurane];
        let channels = relax_end_tidal([0.0, 0.0], &selected, &consumables, 1.0, true, 2.0, 2.0);

        // gain = 2 * 0.05 = 0.1, targets 0.5 MAC each
        assert_relative_eq!(channels.inspired[0], 1.0);
        assert_relative_eq!(channels.inspired[1], 3.0);
        assert_relative_eq!(channels.end_tidal[0], 0.1);
        assert_relative_eq!(channels.end_tidal[1], 0.3);
    }

    #[test]
    fn test_exhausted_agent_relaxes_to_zero() {
        let mut consumables = ConsumableState::default();
        consumables.set_agent_level(AnestheticAgent::Sevoflurane, 0.0);
        let selected = [AnestheticAgent::Sevoflurane, AnestheticAgent::Desflurane];
        let channels = relax_end_tidal([2.0, 2.0], &selected, &consumables, 1.0, true, 0.0, 2.0);

        // min FGF effect gives a gain of 0.025; the remaining agent gets the whole MAC
        assert_relative_eq!(channels.end_tidal[0], 1.95);
        assert_relative_eq!(channels.inspired[0], 0.0);
        assert_relative_eq!(channels.inspired[1], 6.0);
        assert_relative_eq!(channels.end_tidal[1], 2.1);
    }

    #[test]
    fn test_inactive_anesthesia_washes_out() {
        let consumables = ConsumableState::default();
        let channels = relax_end_tidal([2.0, 0.0], &[AnestheticAgent::Sevoflurane], &consumables, 1.0, false, 10.0, 2.0);
        assert_relative_eq!(channels.end_tidal[0], 1.0);
        assert_eq!(channels.inspired, [0.0, 0.0]);
    }

    #[test]
    fn test_zero_step_does_not_relax() {
        let consumables = ConsumableState::default();
        let channels = relax_end_tidal([1.5, 0.0], &[AnestheticAgent::Sevoflurane], &consumables, 1.0, true, 2.0, 0.0);
        assert_relative_eq!(channels.end_tidal[0], 1.5);
    }

    #[test]
    fn test_rebreathing_factor_interpolation() {
        assert_relative_eq!(rebreathing_factor(0.3), 1.0);
        assert_relative_eq!(rebreathing_factor(3.25), 0.5);
        assert_relative_eq!(rebreathing_factor(6.0), 0.0);
        assert_relative_eq!(soda_lime_lifetime_hours(0.3), 2.0);
        assert_relative_eq!(soda_lime_lifetime_hours(8.0), 8.0);
    }

    #[test]
    fn test_low_flow_consumes_soda_lime_faster() {
        assert!(soda_lime_rate(0.3) >= soda_lime_rate(8.0));
        let low = consume_soda_lime(10.0, 0.3, 2.0);
        let high = consume_soda_lime(10.0, 8.0, 2.0);
        assert!(low >= high);
        assert_eq!(consume_soda_lime(99.999, 0.3, 3600.0), 100.0);
    }

    #[test]
    fn test_inspired_co2_bands() {
        let mut low = FixedNoise(0.0);
        assert_relative_eq!(inspired_co2(0.0, 2.0, &mut low), 0.0);
        let mut mid = FixedNoise::midpoint();
        assert_relative_eq!(inspired_co2(90.0, 2.0, &mut mid), 7.5);
        assert_relative_eq!(inspired_co2(60.0, 0.8, &mut mid), 3.0);
        assert_relative_eq!(inspired_co2(30.0, 0.5, &mut mid), 1.5);
        assert_relative_eq!(inspired_co2(15.0, 1.0, &mut mid), 0.8);
    }

    #[test]
    fn test_achieved_mac() {
        let et = [Reading::Value(2.0), Reading::Value(3.0)];
        let selected = [AnestheticAgent::Sevoflurane, AnestheticAgent::Desflurane];
        assert_relative_eq!(achieved_mac(&et, &selected), 1.5);
        assert_relative_eq!(achieved_mac(&[Reading::Unavailable; 2], &selected), 0.0);
    }
}
