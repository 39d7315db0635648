//! The tick loop: advance the clock, draw a world event, run every agent in
//! roster order and stream each result as soon as it is ready.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cognition::{AgentTurn, Pipeline, TurnStatus};
use crate::world::World;

/// Town-wide happening shared by every agent for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldEvent {
    None,
    Rain,
    Festival,
    PowerOutage,
    StrangerArrives,
    MarketRush,
}

impl WorldEvent {
    pub const ALL: [WorldEvent; 6] = [
        WorldEvent::None,
        WorldEvent::Rain,
        WorldEvent::Festival,
        WorldEvent::PowerOutage,
        WorldEvent::StrangerArrives,
        WorldEvent::MarketRush,
    ];

    /// Uniform draw over [`WorldEvent::ALL`]
    pub fn draw<R: rand::Rng>(rng: &mut R) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&WorldEvent::None)
    }

    /// Prompt phrasing
    pub fn description(&self) -> &'static str {
        match self {
            WorldEvent::None => "nothing unusual",
            WorldEvent::Rain => "a sudden rain shower",
            WorldEvent::Festival => "a street festival is starting",
            WorldEvent::PowerOutage => "the power just went out",
            WorldEvent::StrangerArrives => "a stranger just arrived in town",
            WorldEvent::MarketRush => "the market is packed with shoppers",
        }
    }
}

/// Per-tick inputs threaded into every agent's prompts
#[derive(Debug, Clone, PartialEq)]
pub struct TickContext {
    pub tick: u64,
    pub time_label: String,
    pub event: WorldEvent,
}

/// `HH:MM:SS` of simulated time elapsed after `tick` periods
pub fn time_label(tick: u64, period: Duration) -> String {
    let total = tick.saturating_mul(period.as_secs());
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

#[derive(Debug, Clone)]
pub struct TickSummary {
    pub tick: u64,
    pub event: WorldEvent,
    pub turns: Vec<AgentTurn>,
}

impl TickSummary {
    pub fn turn(&self, agent_id: &str) -> Option<&AgentTurn> {
        self.turns.iter().find(|t| t.agent_id == agent_id)
    }
}

pub struct TickScheduler {
    world: Arc<World>,
    pipeline: Pipeline,
    period: Duration,
    tick: u64,
    rng: StdRng,
}

impl TickScheduler {
    pub fn new(world: Arc<World>, pipeline: Pipeline, period: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            world,
            pipeline,
            period,
            tick: 0,
            rng,
        }
    }

    /// Run one full iteration over the roster.
    ///
    /// Each agent's turn runs while holding the world state, so a concurrent
    /// reset lands between agents and never inside one.
    pub async fn tick(&mut self) -> TickSummary {
        self.tick += 1;
        let ctx = TickContext {
            tick: self.tick,
            time_label: time_label(self.tick, self.period),
            event: WorldEvent::draw(&mut self.rng),
        };
        info!(tick = ctx.tick, time = %ctx.time_label, event = ?ctx.event, "tick started");

        let mut turns = Vec::with_capacity(self.world.roster().len());
        for character in self.world.roster() {
            // Turn messages go out under the state lock, ordered against reset notices.
            let (turn, delivery) = {
                let mut state = self.world.lock_state().await;
                let turn = self.pipeline.run(character, &ctx, &mut state).await;
                let delivery = self
                    .world
                    .broadcaster()
                    .broadcast(&turn.agent_id, &turn.marker, turn.zone_change.as_deref())
                    .await;
                (turn, delivery)
            };
            debug!(
                agent_id = %turn.agent_id,
                delivered = delivery.delivered,
                pruned = delivery.pruned,
                "turn broadcast"
            );

            {
                let mut metrics = self.world.metrics().await;
                metrics.record_turn(&turn);
                metrics.record_delivery(delivery);
            }
            turns.push(turn);
        }

        let failed = turns
            .iter()
            .filter(|t| t.status() == TurnStatus::Failed)
            .count();
        let metrics = {
            let mut metrics = self.world.metrics().await;
            metrics.record_tick();
            metrics.clone()
        };
        info!(
            tick = ctx.tick,
            agents = turns.len(),
            failed,
            success_rate = metrics.success_rate(),
            "tick finished"
        );

        TickSummary {
            tick: ctx.tick,
            event: ctx.event,
            turns,
        }
    }

    /// Tick forever at the configured period. Only process shutdown stops it.
    pub async fn run(mut self) {
        info!(period_secs = self.period.as_secs(), "scheduler running");
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_label() {
        let period = Duration::from_secs(5);
        assert_eq!(time_label(0, period), "00:00:00");
        assert_eq!(time_label(1, period), "00:00:05");
        assert_eq!(time_label(12, period), "00:01:00");
        assert_eq!(time_label(721, period), "01:00:05");
    }

    #[test]
    fn test_event_draw_is_seeded() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let left: Vec<WorldEvent> = (0..20).map(|_| WorldEvent::draw(&mut a)).collect();
        let right: Vec<WorldEvent> = (0..20).map(|_| WorldEvent::draw(&mut b)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_event_draw_covers_set() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(WorldEvent::draw(&mut rng));
        }
        assert_eq!(seen.len(), WorldEvent::ALL.len());
    }

    #[test]
    fn test_event_descriptions_distinct() {
        let mut descriptions: Vec<&str> = WorldEvent::ALL.iter().map(|e| e.description()).collect();
        descriptions.sort();
        descriptions.dedup();
        assert_eq!(descriptions.len(), WorldEvent::ALL.len());
    }
}
