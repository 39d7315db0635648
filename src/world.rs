//! Shared simulation state and the operations exposed to the API layer.
//!
//! [`World`] owns the planned-set and position cache behind one async mutex.
//! The scheduler holds it for the whole of one agent's turn; reset and
//! manual moves take the same lock, so an agent sees either the state from
//! before a reset or the one after it, never a mix.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::agent::{self, Character};
use crate::broadcast::Broadcaster;
use crate::cognition::bounded;
use crate::llm::{Generative, GenerativeError};
use crate::metrics::TickMetrics;
use crate::store::{
    AgentState, MemoryKind, MemoryMatch, MemoryRecord, MemoryStore, NewMemory, StoreError,
};
use crate::zones::ZoneMap;

/// Default number of matches returned for an external observation
pub const OBSERVE_MATCH_LIMIT: usize = 5;

/// Scheduler-lifetime memory: who has planned, and where everyone is
#[derive(Debug, Default)]
pub struct SimState {
    planned: HashSet<String>,
    positions: HashMap<String, String>,
}

impl SimState {
    pub fn is_planned(&self, agent_id: &str) -> bool {
        self.planned.contains(agent_id)
    }

    pub fn mark_planned(&mut self, agent_id: &str) {
        self.planned.insert(agent_id.to_string());
    }

    pub fn planned_count(&self) -> usize {
        self.planned.len()
    }

    pub fn current_zone(&self, agent_id: &str) -> Option<&str> {
        self.positions.get(agent_id).map(String::as_str)
    }

    pub fn set_zone(&mut self, agent_id: &str, zone: &str) {
        self.positions.insert(agent_id.to_string(), zone.to_string());
    }

    fn clear(&mut self) {
        self.planned.clear();
        self.positions.clear();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("unknown zone '{0}'")]
    UnknownZone(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Generative(#[from] GenerativeError),
}

/// Reset stopped part way; the store may be partially reset
#[derive(Debug, thiserror::Error)]
#[error("reset failed while {stage}: {source}")]
pub struct ResetError {
    pub stage: &'static str,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ResetReport {
    pub agents: usize,
    pub seed_memories: usize,
    pub notified: usize,
}

pub struct World {
    roster: Vec<Character>,
    zones: Arc<ZoneMap>,
    store: Arc<dyn MemoryStore>,
    generative: Arc<dyn Generative>,
    broadcaster: Arc<Broadcaster>,
    state: Mutex<SimState>,
    metrics: Mutex<TickMetrics>,
    call_timeout: Duration,
}

impl World {
    pub fn new(
        roster: Vec<Character>,
        zones: Arc<ZoneMap>,
        store: Arc<dyn MemoryStore>,
        generative: Arc<dyn Generative>,
        broadcaster: Arc<Broadcaster>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            roster,
            zones,
            store,
            generative,
            broadcaster,
            state: Mutex::new(SimState::default()),
            metrics: Mutex::new(TickMetrics::new()),
            call_timeout,
        }
    }

    /// Load positions from the store, placing unseen agents in the default zone.
    ///
    /// Called once before the scheduler starts; an unreachable store here is fatal.
    pub async fn init(&self) -> Result<(), StoreError> {
        let rows = bounded(self.call_timeout, self.store.all_agent_states()).await?;
        let mut state = self.state.lock().await;
        for character in &self.roster {
            let row = rows.iter().find(|r| r.agent_id == character.id);
            let zone = match row.and_then(|r| self.zones.get(&r.zone)) {
                Some(zone) => zone,
                None => {
                    let zone = self.zones.default_zone();
                    bounded(
                        self.call_timeout,
                        self.store
                            .upsert_agent_state(AgentState::at_zone(&character.id, zone)),
                    )
                    .await?;
                    zone
                }
            };
            state.set_zone(&character.id, &zone.name);
        }
        info!(agents = self.roster.len(), "world positions loaded");
        Ok(())
    }

    pub fn roster(&self) -> &[Character] {
        &self.roster
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub async fn lock_state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().await
    }

    pub async fn metrics(&self) -> MutexGuard<'_, TickMetrics> {
        self.metrics.lock().await
    }

    fn character(&self, agent_id: &str) -> Result<&Character, WorldError> {
        agent::find(&self.roster, agent_id)
            .ok_or_else(|| WorldError::UnknownAgent(agent_id.to_string()))
    }

    /// Record something an agent noticed from outside the tick loop.
    ///
    /// Returns the agent's closest prior memories, searched before the new
    /// observation is stored so it never matches itself. Without an embedding
    /// the observation is still stored and the match list is empty.
    pub async fn observe(
        &self,
        agent_id: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<MemoryMatch>, WorldError> {
        self.character(agent_id)?;
        let (embedding, matches) =
            match bounded(self.call_timeout, self.generative.embed(text)).await {
                Ok(embedding) => {
                    let matches = bounded(
                        self.call_timeout,
                        self.store.similarity_search(&embedding, limit, agent_id),
                    )
                    .await?;
                    (embedding, matches)
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "embedding unavailable, storing observation without vector");
                    (Vec::new(), Vec::new())
                }
            };
        let memory = NewMemory::new(agent_id, MemoryKind::Observation, text.trim())
            .with_embedding(embedding);
        bounded(self.call_timeout, self.store.insert_memory(memory)).await?;
        Ok(matches)
    }

    pub async fn recent_memories(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, WorldError> {
        self.character(agent_id)?;
        Ok(bounded(self.call_timeout, self.store.recent_memories(agent_id, limit)).await?)
    }

    pub async fn agent_state(&self, agent_id: &str) -> Result<AgentState, WorldError> {
        self.character(agent_id)?;
        let row = bounded(self.call_timeout, self.store.agent_state(agent_id)).await?;
        Ok(row.unwrap_or_else(|| AgentState::at_zone(agent_id, self.zones.default_zone())))
    }

    pub async fn agent_states(&self) -> Result<Vec<AgentState>, WorldError> {
        Ok(bounded(self.call_timeout, self.store.all_agent_states()).await?)
    }

    /// Place an agent in a zone by hand; coordinates snap to the zone anchor
    pub async fn move_agent(&self, agent_id: &str, zone: &str) -> Result<AgentState, WorldError> {
        self.character(agent_id)?;
        let zone = self
            .zones
            .get(zone)
            .ok_or_else(|| WorldError::UnknownZone(zone.to_string()))?;
        let row = AgentState::at_zone(agent_id, zone);

        let mut state = self.state.lock().await;
        bounded(self.call_timeout, self.store.upsert_agent_state(row.clone())).await?;
        state.set_zone(agent_id, &zone.name);
        info!(agent_id = %agent_id, zone = %zone.name, "agent placed");
        Ok(row)
    }

    /// Wipe and reseed the world, then tell every viewer.
    ///
    /// Viewers stay subscribed across a reset. On error the store may be
    /// partially reset; calling reset again is the way out.
    pub async fn reset(&self) -> Result<ResetReport, ResetError> {
        let mut state = self.state.lock().await;
        info!("world reset started");

        bounded(self.call_timeout, self.store.wipe())
            .await
            .map_err(|source| ResetError {
                stage: "wiping the store",
                source,
            })?;
        // The store is empty from here on, whether or not reseeding succeeds
        state.clear();

        let default_zone = self.zones.default_zone();
        let seeds: Vec<NewMemory> = self
            .roster
            .iter()
            .map(|c| NewMemory::new(&c.id, MemoryKind::Plan, c.seed_plan_text()))
            .collect();
        let rows: Vec<AgentState> = self
            .roster
            .iter()
            .map(|c| AgentState::at_zone(&c.id, default_zone))
            .collect();
        let seed_memories = seeds.len();

        bounded(self.call_timeout, self.store.reseed(seeds, rows))
            .await
            .map_err(|source| {
                warn!(error = %source, "reseed failed, world left empty");
                ResetError {
                    stage: "reseeding",
                    source,
                }
            })?;

        for character in &self.roster {
            state.set_zone(&character.id, &default_zone.name);
        }

        let delivery = self.broadcaster.broadcast_reset().await;
        drop(state);

        {
            let mut metrics = self.metrics.lock().await;
            metrics.record_reset();
            metrics.record_delivery(delivery);
        }

        info!(
            agents = self.roster.len(),
            notified = delivery.delivered,
            "world reset complete"
        );
        Ok(ResetReport {
            agents: self.roster.len(),
            seed_memories,
            notified: delivery.delivered,
        })
    }
}
