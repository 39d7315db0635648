use serde::{Deserialize, Serialize};

use crate::broadcast::Delivery;
use crate::cognition::{AgentTurn, TurnStatus};

/// Running counters for the tick engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TickMetrics {
    pub ticks_total: u64,
    pub turns_total: u64,
    pub turns_degraded: u64,
    pub turns_failed: u64,
    pub plans_written: u64,
    pub observations_written: u64,
    pub zone_transitions: u64,
    pub messages_delivered: u64,
    pub subscribers_pruned: u64,
    pub resets: u64,
}

impl TickMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&mut self) {
        self.ticks_total += 1;
    }

    /// Fold one agent's turn into the counters
    pub fn record_turn(&mut self, turn: &AgentTurn) {
        self.turns_total += 1;
        match turn.status() {
            TurnStatus::Clean => {}
            TurnStatus::Degraded => self.turns_degraded += 1,
            TurnStatus::Failed => self.turns_failed += 1,
        }
        if turn.wrote_plan() {
            self.plans_written += 1;
        }
        if turn.wrote_observation() {
            self.observations_written += 1;
        }
        if turn.zone_change.is_some() {
            self.zone_transitions += 1;
        }
    }

    pub fn record_delivery(&mut self, delivery: Delivery) {
        self.messages_delivered += delivery.delivered as u64;
        self.subscribers_pruned += delivery.pruned as u64;
    }

    pub fn record_reset(&mut self) {
        self.resets += 1;
    }

    /// Share of turns that produced an observation, as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.turns_total == 0 {
            return 100.0;
        }
        let ok = self.turns_total - self.turns_failed;
        (ok as f64 / self.turns_total as f64) * 100.0
    }
}
