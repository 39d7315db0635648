//! Memory and agent-position persistence.
//!
//! [`MemoryStore`] is the boundary the tick engine talks to. [`LocalStore`]
//! keeps rows in process and, when opened on a directory, mirrors them to
//! disk: memories as append-only JSONL (`memories.jsonl`) and agent rows as a
//! JSON snapshot rewritten on every upsert (`agents.json`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::zones::Zone;

const MEMORIES_FILE: &str = "memories.jsonl";
const AGENTS_FILE: &str = "agents.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Plan,
    Observation,
}

/// A memory as handed to the store, before id and timestamp are assigned
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemory {
    pub agent_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub embedding: Vec<f32>,
}

impl NewMemory {
    pub fn new(agent_id: &str, kind: MemoryKind, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            kind,
            content: content.into(),
            embedding: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub agent_id: String,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A memory returned by similarity search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMatch {
    pub content: String,
    pub kind: MemoryKind,
    pub similarity: f32,
    pub created_at: DateTime<Utc>,
}

/// Spatial row for one agent. Coordinates are always the zone's anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub x: f64,
    pub y: f64,
    pub zone: String,
}

impl AgentState {
    pub fn at_zone(agent_id: &str, zone: &Zone) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            x: zone.x,
            y: zone.y,
            zone: zone.name.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn insert_memory(&self, memory: NewMemory) -> Result<MemoryRecord, StoreError>;

    /// Up to `limit` memories for the agent, newest first
    async fn recent_memories(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Up to `limit` of the agent's memories ranked by cosine similarity, best first
    async fn similarity_search(
        &self,
        vector: &[f32],
        limit: usize,
        agent_id: &str,
    ) -> Result<Vec<MemoryMatch>, StoreError>;

    async fn upsert_agent_state(&self, state: AgentState) -> Result<(), StoreError>;

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StoreError>;

    async fn all_agent_states(&self) -> Result<Vec<AgentState>, StoreError>;

    /// Delete every memory and every agent row
    async fn wipe(&self) -> Result<(), StoreError>;

    async fn reseed(
        &self,
        memories: Vec<NewMemory>,
        states: Vec<AgentState>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Rows {
    memories: Vec<MemoryRecord>,
    agents: BTreeMap<String, AgentState>,
}

/// In-process store, optionally mirrored to a data directory
pub struct LocalStore {
    rows: RwLock<Rows>,
    dir: Option<PathBuf>,
}

impl LocalStore {
    /// Store that lives only as long as the process
    pub fn ephemeral() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            dir: None,
        }
    }

    /// Open (or create) a store under `dir`, loading any existing rows
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let memories = load_memories(&dir.join(MEMORIES_FILE))?;
        let agents_path = dir.join(AGENTS_FILE);
        let agents: BTreeMap<String, AgentState> = if agents_path.exists() {
            let data = fs::read_to_string(&agents_path)?;
            serde_json::from_str(&data)?
        } else {
            BTreeMap::new()
        };

        info!(
            dir = %dir.display(),
            memories = memories.len(),
            agents = agents.len(),
            "memory store opened"
        );

        Ok(Self {
            rows: RwLock::new(Rows { memories, agents }),
            dir: Some(dir.to_path_buf()),
        })
    }

    fn append_memory(&self, record: &MemoryRecord) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(MEMORIES_FILE))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    fn persist_agents(&self, agents: &BTreeMap<String, AgentState>) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        fs::write(dir.join(AGENTS_FILE), serde_json::to_string_pretty(agents)?)?;
        Ok(())
    }

    fn rewrite_memories(&self, memories: &[MemoryRecord]) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut file = File::create(dir.join(MEMORIES_FILE))?;
        for record in memories {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }
}

fn load_memories(path: &Path) -> Result<Vec<MemoryRecord>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut memories = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        memories.push(serde_json::from_str(trimmed)?);
    }
    Ok(memories)
}

fn record_from(memory: NewMemory) -> MemoryRecord {
    MemoryRecord {
        id: Uuid::new_v4().to_string(),
        agent_id: memory.agent_id,
        kind: memory.kind,
        content: memory.content,
        embedding: memory.embedding,
        created_at: Utc::now(),
    }
}

/// Cosine similarity; `None` when dimensions differ or either vector is empty or zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

#[async_trait]
impl MemoryStore for LocalStore {
    async fn insert_memory(&self, memory: NewMemory) -> Result<MemoryRecord, StoreError> {
        let record = record_from(memory);
        let mut rows = self.rows.write().await;
        self.append_memory(&record)?;
        rows.memories.push(record.clone());
        Ok(record)
    }

    async fn recent_memories(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let rows = self.rows.read().await;
        // Rows are appended in creation order, so reverse iteration is newest first.
        Ok(rows
            .memories
            .iter()
            .rev()
            .filter(|m| m.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn similarity_search(
        &self,
        vector: &[f32],
        limit: usize,
        agent_id: &str,
    ) -> Result<Vec<MemoryMatch>, StoreError> {
        let rows = self.rows.read().await;
        let mut matches: Vec<MemoryMatch> = rows
            .memories
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .filter_map(|m| {
                cosine_similarity(vector, &m.embedding).map(|similarity| MemoryMatch {
                    content: m.content.clone(),
                    kind: m.kind,
                    similarity,
                    created_at: m.created_at,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn upsert_agent_state(&self, state: AgentState) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let mut agents = rows.agents.clone();
        agents.insert(state.agent_id.clone(), state);
        self.persist_agents(&agents)?;
        rows.agents = agents;
        Ok(())
    }

    async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>, StoreError> {
        Ok(self.rows.read().await.agents.get(agent_id).cloned())
    }

    async fn all_agent_states(&self) -> Result<Vec<AgentState>, StoreError> {
        Ok(self.rows.read().await.agents.values().cloned().collect())
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        self.rewrite_memories(&[])?;
        self.persist_agents(&BTreeMap::new())?;
        *rows = Rows::default();
        Ok(())
    }

    async fn reseed(
        &self,
        memories: Vec<NewMemory>,
        states: Vec<AgentState>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let mut seeded = rows.memories.clone();
        seeded.extend(memories.into_iter().map(record_from));
        let mut agents = rows.agents.clone();
        for state in states {
            agents.insert(state.agent_id.clone(), state);
        }
        self.rewrite_memories(&seeded)?;
        self.persist_agents(&agents)?;
        *rows = Rows {
            memories: seeded,
            agents,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZoneMap;
    use tempfile::tempdir;
    use tokio_test::assert_ok;

    fn obs(agent: &str, content: &str, embedding: Vec<f32>) -> NewMemory {
        NewMemory::new(agent, MemoryKind::Observation, content).with_embedding(embedding)
    }

    #[tokio::test]
    async fn test_recent_memories_newest_first() {
        let store = LocalStore::ephemeral();
        for i in 0..5 {
            assert_ok!(store.insert_memory(obs("a", &format!("m{}", i), vec![])).await);
        }
        assert_ok!(store.insert_memory(obs("b", "other", vec![])).await);

        let recent = store.recent_memories("a", 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);
        assert!(store.recent_memories("nobody", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_similarity_search_ranks_and_skips_unembedded() {
        let store = LocalStore::ephemeral();
        store.insert_memory(obs("a", "close", vec![1.0, 0.1])).await.unwrap();
        store.insert_memory(obs("a", "far", vec![-1.0, 0.0])).await.unwrap();
        store.insert_memory(obs("a", "no embedding", vec![])).await.unwrap();
        store.insert_memory(obs("a", "wrong dims", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.insert_memory(obs("b", "other agent", vec![1.0, 0.0])).await.unwrap();

        let matches = store.similarity_search(&[1.0, 0.0], 5, "a").await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].content, "close");
        assert_eq!(matches[1].content, "far");
        assert!(matches[0].similarity > matches[1].similarity);

        let top = store.similarity_search(&[1.0, 0.0], 1, "a").await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_is_last_writer_wins() {
        let store = LocalStore::ephemeral();
        let zones = ZoneMap::town();
        store
            .upsert_agent_state(AgentState::at_zone("a", zones.get("PARK").unwrap()))
            .await
            .unwrap();
        store
            .upsert_agent_state(AgentState::at_zone("a", zones.get("STAGE").unwrap()))
            .await
            .unwrap();

        let state = store.agent_state("a").await.unwrap().unwrap();
        assert_eq!(state.zone, "STAGE");
        assert_eq!((state.x, state.y), (400.0, 120.0));
        assert_eq!(store.all_agent_states().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_and_reseed() {
        let store = LocalStore::ephemeral();
        let zones = ZoneMap::town();
        store.insert_memory(obs("a", "old", vec![])).await.unwrap();
        store
            .upsert_agent_state(AgentState::at_zone("a", zones.get("CAFE").unwrap()))
            .await
            .unwrap();

        assert_ok!(store.wipe().await);
        assert!(store.recent_memories("a", 10).await.unwrap().is_empty());
        assert!(store.all_agent_states().await.unwrap().is_empty());

        store
            .reseed(
                vec![NewMemory::new("a", MemoryKind::Plan, "seed plan")],
                vec![AgentState::at_zone("a", zones.default_zone())],
            )
            .await
            .unwrap();
        let recent = store.recent_memories("a", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, MemoryKind::Plan);
        assert_eq!(store.agent_state("a").await.unwrap().unwrap().zone, "PLAZA");
    }

    #[tokio::test]
    async fn test_file_backed_store_reloads() {
        let dir = tempdir().unwrap();
        let zones = ZoneMap::town();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.insert_memory(obs("a", "first", vec![0.5])).await.unwrap();
            store.insert_memory(obs("a", "second", vec![])).await.unwrap();
            store
                .upsert_agent_state(AgentState::at_zone("a", zones.get("LIBRARY").unwrap()))
                .await
                .unwrap();
        }

        let reopened = LocalStore::open(dir.path()).unwrap();
        let recent = reopened.recent_memories("a", 5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "second");
        assert_eq!(recent[1].embedding, vec![0.5]);
        assert_eq!(reopened.agent_state("a").await.unwrap().unwrap().zone, "LIBRARY");

        reopened.wipe().await.unwrap();
        let wiped = LocalStore::open(dir.path()).unwrap();
        assert!(wiped.recent_memories("a", 5).await.unwrap().is_empty());
        assert!(wiped.all_agent_states().await.unwrap().is_empty());
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[test]
    fn test_memory_kind_serialization() {
        assert_eq!(serde_json::to_string(&MemoryKind::Plan).unwrap(), "\"plan\"");
        assert_eq!(
            serde_json::to_string(&MemoryKind::Observation).unwrap(),
            "\"observation\""
        );
    }
}
