//! Per-agent cognition: plan once, observe, parse, embed, remember, move.
//!
//! Every step reports a [`StepOutcome`] instead of an error. A failed step is
//! logged and the turn carries on with whatever it has, so one agent's bad
//! call never reaches the scheduler loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::Character;
use crate::config::SchedulerConfig;
use crate::llm::{Generative, GenerativeError};
use crate::scheduler::TickContext;
use crate::store::{AgentState, MemoryKind, MemoryRecord, MemoryStore, NewMemory, StoreError};
use crate::templates::{self, Templates};
use crate::world::SimState;
use crate::zones::ZoneMap;

/// Marker used when the reply has no leading `[token]`
pub const DEFAULT_MARKER: &str = "💭";

/// How many recent memories are threaded into the observe prompt
pub const RECALL_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Plan,
    Recall,
    Observe,
    Embed,
    Persist,
    Zone,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Ok,
    Skipped,
    /// Step ran with a fallback value
    Degraded(String),
    /// Step did not take effect
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Clean,
    Degraded,
    Failed,
}

/// What one agent did in one tick
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTurn {
    pub agent_id: String,
    pub marker: String,
    /// New zone name when the agent moved this tick
    pub zone_change: Option<String>,
    pub steps: Vec<(Step, StepOutcome)>,
}

impl AgentTurn {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            marker: DEFAULT_MARKER.to_string(),
            zone_change: None,
            steps: Vec::new(),
        }
    }

    fn record(&mut self, step: Step, outcome: StepOutcome) {
        self.steps.push((step, outcome));
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    /// Failed when no observation was produced, degraded when any step fell back
    pub fn status(&self) -> TurnStatus {
        if matches!(self.outcome(Step::Observe), Some(StepOutcome::Failed(_))) {
            return TurnStatus::Failed;
        }
        let degraded = self.steps.iter().any(|(_, o)| {
            matches!(o, StepOutcome::Degraded(_) | StepOutcome::Failed(_))
        });
        if degraded {
            TurnStatus::Degraded
        } else {
            TurnStatus::Clean
        }
    }

    pub fn wrote_plan(&self) -> bool {
        self.outcome(Step::Plan) == Some(&StepOutcome::Ok)
    }

    pub fn wrote_observation(&self) -> bool {
        self.outcome(Step::Persist) == Some(&StepOutcome::Ok)
    }
}

/// Marker and thought split out of a model reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub marker: String,
    pub thought: String,
}

/// Split `[marker] thought`. Anything else becomes the default marker with
/// the whole trimmed reply as the thought.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let marker = rest[..end].trim();
            if !marker.is_empty() && !marker.contains(|c: char| c == '[' || c == '\n') {
                return ParsedReply {
                    marker: marker.to_string(),
                    thought: rest[end + 1..].trim().to_string(),
                };
            }
        }
    }
    ParsedReply {
        marker: DEFAULT_MARKER.to_string(),
        thought: trimmed.to_string(),
    }
}

/// Errors that can stand in for a timed-out external call
pub trait TimedOut {
    fn timed_out(after: Duration) -> Self;
}

impl TimedOut for GenerativeError {
    fn timed_out(after: Duration) -> Self {
        GenerativeError::Timeout(after)
    }
}

impl TimedOut for StoreError {
    fn timed_out(after: Duration) -> Self {
        StoreError::Timeout(after)
    }
}

/// Run an external call with a deadline
pub async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, E>
where
    E: TimedOut,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(E::timed_out(limit)),
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub call_timeout: Duration,
    pub observe_max_tokens: u32,
    pub plan_max_tokens: u32,
    pub temperature: f32,
}

impl From<&SchedulerConfig> for PipelineSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            call_timeout: config.call_timeout(),
            observe_max_tokens: config.observe_max_tokens,
            plan_max_tokens: config.plan_max_tokens,
            temperature: config.temperature,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn MemoryStore>,
    generative: Arc<dyn Generative>,
    zones: Arc<ZoneMap>,
    templates: Templates,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        generative: Arc<dyn Generative>,
        zones: Arc<ZoneMap>,
        templates: Templates,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            generative,
            zones,
            templates,
            settings,
        }
    }

    /// Produce one tick of behavior for `character`.
    ///
    /// `state` is the caller's exclusive view of the planned-set and position
    /// cache for the duration of the turn.
    pub async fn run(
        &self,
        character: &Character,
        ctx: &TickContext,
        state: &mut SimState,
    ) -> AgentTurn {
        let mut turn = AgentTurn::new(&character.id);

        let plan = self.plan_once(character, state).await;
        turn.record(Step::Plan, plan);

        let (recent, recall) = self.recall(&character.id).await;
        turn.record(Step::Recall, recall);

        let current_zone = state
            .current_zone(&character.id)
            .unwrap_or(self.zones.default_zone().name.as_str())
            .to_string();

        let reply = match self.observe(character, ctx, &current_zone, &recent).await {
            Ok(reply) => {
                turn.record(Step::Observe, StepOutcome::Ok);
                reply
            }
            Err(reason) => {
                warn!(agent_id = %character.id, tick = ctx.tick, error = %reason, "observation failed");
                turn.record(Step::Observe, StepOutcome::Failed(reason));
                return turn;
            }
        };

        let parsed = parse_reply(&reply);
        turn.marker = parsed.marker.clone();

        let (embedding, embed) = self.embed(&character.id, &parsed.thought).await;
        turn.record(Step::Embed, embed);

        let content = format!("{} {}", parsed.marker, parsed.thought)
            .trim_end()
            .to_string();
        let memory = NewMemory::new(&character.id, MemoryKind::Observation, content)
            .with_embedding(embedding);
        let persist = match bounded(self.settings.call_timeout, self.store.insert_memory(memory)).await {
            Ok(_) => StepOutcome::Ok,
            Err(e) => {
                warn!(agent_id = %character.id, error = %e, "failed to store observation");
                StepOutcome::Failed(e.to_string())
            }
        };
        turn.record(Step::Persist, persist);

        let zone = self
            .transition(&character.id, &parsed.thought, &current_zone, state, &mut turn)
            .await;
        turn.record(Step::Zone, zone);

        debug!(
            agent_id = %character.id,
            marker = %turn.marker,
            thought = %parsed.thought,
            "turn complete"
        );
        turn
    }

    async fn plan_once(&self, character: &Character, state: &mut SimState) -> StepOutcome {
        if state.is_planned(&character.id) {
            return StepOutcome::Skipped;
        }

        let prompt = match self.templates.render(
            templates::PLAN,
            &[
                ("name", &character.name),
                ("traits", &character.traits),
                ("daily_goal", &character.daily_goal),
            ],
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(agent_id = %character.id, error = %e, "plan template unavailable, retrying next tick");
                return StepOutcome::Failed(e.to_string());
            }
        };

        let plan = match bounded(
            self.settings.call_timeout,
            self.generative.complete(
                &prompt,
                self.settings.plan_max_tokens,
                self.settings.temperature,
            ),
        )
        .await
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(agent_id = %character.id, error = %e, "plan generation failed, retrying next tick");
                return StepOutcome::Failed(e.to_string());
            }
        };

        let memory = NewMemory::new(&character.id, MemoryKind::Plan, plan.trim());
        match bounded(self.settings.call_timeout, self.store.insert_memory(memory)).await {
            Ok(_) => {
                state.mark_planned(&character.id);
                info!(agent_id = %character.id, "plan written");
                StepOutcome::Ok
            }
            Err(e) => {
                warn!(agent_id = %character.id, error = %e, "failed to store plan, retrying next tick");
                StepOutcome::Failed(e.to_string())
            }
        }
    }

    async fn recall(&self, agent_id: &str) -> (Vec<MemoryRecord>, StepOutcome) {
        match bounded(
            self.settings.call_timeout,
            self.store.recent_memories(agent_id, RECALL_LIMIT),
        )
        .await
        {
            Ok(recent) => (recent, StepOutcome::Ok),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "recall failed, observing without memories");
                (Vec::new(), StepOutcome::Degraded(e.to_string()))
            }
        }
    }

    async fn observe(
        &self,
        character: &Character,
        ctx: &TickContext,
        current_zone: &str,
        recent: &[MemoryRecord],
    ) -> Result<String, String> {
        let recent_memories = format_memories(recent);
        let prompt = self
            .templates
            .render(
                templates::OBSERVE,
                &[
                    ("name", &character.name),
                    ("traits", &character.traits),
                    ("time_label", &ctx.time_label),
                    ("current_zone", current_zone),
                    ("current_event", ctx.event.description()),
                    ("recent_memories", &recent_memories),
                ],
            )
            .map_err(|e| e.to_string())?;

        bounded(
            self.settings.call_timeout,
            self.generative.complete(
                &prompt,
                self.settings.observe_max_tokens,
                self.settings.temperature,
            ),
        )
        .await
        .map_err(|e| e.to_string())
    }

    async fn embed(&self, agent_id: &str, thought: &str) -> (Vec<f32>, StepOutcome) {
        if thought.is_empty() {
            return (Vec::new(), StepOutcome::Skipped);
        }
        match bounded(self.settings.call_timeout, self.generative.embed(thought)).await {
            Ok(vector) => (vector, StepOutcome::Ok),
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "embedding unavailable, storing without vector");
                (Vec::new(), StepOutcome::Degraded(e.to_string()))
            }
        }
    }

    async fn transition(
        &self,
        agent_id: &str,
        thought: &str,
        current_zone: &str,
        state: &mut SimState,
        turn: &mut AgentTurn,
    ) -> StepOutcome {
        let Some(zone) = self.zones.extract_zone(thought) else {
            return StepOutcome::Ok;
        };
        if zone.name == current_zone {
            return StepOutcome::Ok;
        }

        let row = AgentState::at_zone(agent_id, zone);
        match bounded(self.settings.call_timeout, self.store.upsert_agent_state(row)).await {
            Ok(()) => {
                info!(agent_id = %agent_id, from = %current_zone, to = %zone.name, "agent moved");
                state.set_zone(agent_id, &zone.name);
                turn.zone_change = Some(zone.name.clone());
                StepOutcome::Ok
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "failed to record zone change");
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}

fn format_memories(recent: &[MemoryRecord]) -> String {
    if recent.is_empty() {
        return "(nothing yet)".to_string();
    }
    recent
        .iter()
        .map(|m| format!("- {}", m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockGenerative;
    use crate::scheduler::WorldEvent;
    use crate::store::LocalStore;

    fn ctx() -> TickContext {
        TickContext {
            tick: 1,
            time_label: "00:00:05".to_string(),
            event: WorldEvent::Festival,
        }
    }

    fn mara() -> Character {
        Character::new("mara", "Mara", "warm", "sell bread")
    }

    fn pipeline(store: Arc<LocalStore>, generative: MockGenerative) -> Pipeline {
        Pipeline::new(
            store,
            Arc::new(generative),
            Arc::new(ZoneMap::town()),
            Templates::builtin(),
            PipelineSettings {
                call_timeout: Duration::from_millis(200),
                observe_max_tokens: 120,
                plan_max_tokens: 300,
                temperature: 0.8,
            },
        )
    }

    #[test]
    fn test_parse_reply_with_marker() {
        let parsed = parse_reply("  [🎸] Time to play on the stage!  ");
        assert_eq!(parsed.marker, "🎸");
        assert_eq!(parsed.thought, "Time to play on the stage!");
    }

    #[test]
    fn test_parse_reply_without_marker_falls_back() {
        for raw in ["just rambling", "  no brackets here \n", "", "thinking [🎸] later", "[] empty"] {
            let parsed = parse_reply(raw);
            assert_eq!(parsed.marker, DEFAULT_MARKER);
            assert_eq!(parsed.thought, raw.trim());
        }
    }

    #[test]
    fn test_parse_reply_unclosed_bracket_falls_back() {
        let parsed = parse_reply("[🎸 never closed");
        assert_eq!(parsed.marker, DEFAULT_MARKER);
        assert_eq!(parsed.thought, "[🎸 never closed");
    }

    #[test]
    fn test_parse_reply_marker_only() {
        let parsed = parse_reply("[☕]");
        assert_eq!(parsed.marker, "☕");
        assert_eq!(parsed.thought, "");
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), StoreError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_first_turn_plans_observes_and_moves() {
        let store = Arc::new(LocalStore::ephemeral());
        let mut generative = MockGenerative::new();
        generative
            .expect_complete()
            .withf(|_, max_tokens, _| *max_tokens == 300)
            .times(1)
            .returning(|_, _, _| Ok("Bake, then sell at the market.".to_string()));
        generative
            .expect_complete()
            .withf(|prompt, max_tokens, _| *max_tokens == 120 && prompt.contains("a street festival"))
            .times(1)
            .returning(|_, _, _| Ok("[🍞] Off to the cafe with fresh loaves".to_string()));
        generative
            .expect_embed()
            .returning(|_| Ok(vec![0.1, 0.2]));

        let pipeline = pipeline(store.clone(), generative);
        let mut state = SimState::default();
        let turn = pipeline.run(&mara(), &ctx(), &mut state).await;

        assert_eq!(turn.marker, "🍞");
        assert_eq!(turn.zone_change.as_deref(), Some("CAFE"));
        assert_eq!(turn.status(), TurnStatus::Clean);
        assert!(state.is_planned("mara"));
        assert_eq!(state.current_zone("mara"), Some("CAFE"));

        let recent = store.recent_memories("mara", 5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, MemoryKind::Observation);
        assert_eq!(recent[0].content, "🍞 Off to the cafe with fresh loaves");
        assert_eq!(recent[0].embedding, vec![0.1, 0.2]);
        assert_eq!(recent[1].kind, MemoryKind::Plan);

        let row = store.agent_state("mara").await.unwrap().unwrap();
        assert_eq!((row.x, row.y, row.zone.as_str()), (150.0, 300.0, "CAFE"));
    }

    #[tokio::test]
    async fn test_plan_failure_keeps_agent_unplanned() {
        let store = Arc::new(LocalStore::ephemeral());
        let mut generative = MockGenerative::new();
        generative
            .expect_complete()
            .withf(|_, max_tokens, _| *max_tokens == 300)
            .returning(|_, _, _| {
                Err(GenerativeError::Api {
                    status: 500,
                    message: "overloaded".to_string(),
                })
            });
        generative
            .expect_complete()
            .withf(|_, max_tokens, _| *max_tokens == 120)
            .returning(|_, _, _| Ok("[🙂] Quiet morning".to_string()));
        generative.expect_embed().returning(|_| Ok(vec![1.0]));

        let pipeline = pipeline(store.clone(), generative);
        let mut state = SimState::default();
        let turn = pipeline.run(&mara(), &ctx(), &mut state).await;

        assert!(matches!(turn.outcome(Step::Plan), Some(StepOutcome::Failed(_))));
        assert!(turn.wrote_observation());
        assert_eq!(turn.status(), TurnStatus::Degraded);
        assert!(!state.is_planned("mara"));
    }

    #[tokio::test]
    async fn test_missing_plan_template_fails_plan_step_only() {
        let store = Arc::new(LocalStore::ephemeral());
        let mut generative = MockGenerative::new();
        generative
            .expect_complete()
            .withf(|_, max_tokens, _| *max_tokens == 120)
            .times(1)
            .returning(|_, _, _| Ok("[📚] Reading at the library".to_string()));
        generative.expect_embed().returning(|_| Ok(vec![0.5]));

        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(generative),
            Arc::new(ZoneMap::town()),
            Templates::builtin().without(templates::PLAN),
            PipelineSettings {
                call_timeout: Duration::from_millis(200),
                observe_max_tokens: 120,
                plan_max_tokens: 300,
                temperature: 0.8,
            },
        );
        let mut state = SimState::default();
        let turn = pipeline.run(&mara(), &ctx(), &mut state).await;

        assert!(matches!(turn.outcome(Step::Plan), Some(StepOutcome::Failed(_))));
        assert!(!state.is_planned("mara"));
        assert!(turn.wrote_observation());
        assert_eq!(turn.zone_change.as_deref(), Some("LIBRARY"));
    }

    #[tokio::test]
    async fn test_observe_failure_ends_turn_with_default_marker() {
        let store = Arc::new(LocalStore::ephemeral());
        let mut generative = MockGenerative::new();
        generative
            .expect_complete()
            .returning(|_, _, _| Err(GenerativeError::Timeout(Duration::from_secs(1))));
        generative.expect_embed().never();

        let pipeline = pipeline(store.clone(), generative);
        let mut state = SimState::default();
        state.mark_planned("mara");
        let turn = pipeline.run(&mara(), &ctx(), &mut state).await;

        assert_eq!(turn.marker, DEFAULT_MARKER);
        assert_eq!(turn.status(), TurnStatus::Failed);
        assert!(turn.zone_change.is_none());
        assert!(state.is_planned("mara"));
        assert!(store.recent_memories("mara", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_failure_still_persists() {
        let store = Arc::new(LocalStore::ephemeral());
        let mut generative = MockGenerative::new();
        generative
            .expect_complete()
            .returning(|_, _, _| Ok("no marker, staying at the plaza".to_string()));
        generative
            .expect_embed()
            .returning(|_| Err(GenerativeError::Decode("bad".to_string())));

        let pipeline = pipeline(store.clone(), generative);
        let mut state = SimState::default();
        state.mark_planned("mara");
        let turn = pipeline.run(&mara(), &ctx(), &mut state).await;

        assert_eq!(turn.marker, DEFAULT_MARKER);
        assert!(matches!(turn.outcome(Step::Embed), Some(StepOutcome::Degraded(_))));
        assert!(turn.wrote_observation());
        // Already at the default zone, so no transition
        assert!(turn.zone_change.is_none());

        let recent = store.recent_memories("mara", 1).await.unwrap();
        assert_eq!(recent[0].content, "💭 no marker, staying at the plaza");
        assert!(recent[0].embedding.is_empty());
    }

    #[test]
    fn test_format_memories() {
        assert_eq!(format_memories(&[]), "(nothing yet)");
    }
}
