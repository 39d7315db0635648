use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::agent::{default_roster, Character};

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Directory with `plan.txt` / `observe.txt` overriding the built-in prompts
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    /// Roster override; the built-in town is used when empty
    #[serde(default)]
    pub characters: Vec<Character>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_period")]
    pub period_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_observe_max_tokens")]
    pub observe_max_tokens: u32,
    #[serde(default = "default_plan_max_tokens")]
    pub plan_max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Fixed seed for world event draws (random when unset)
    #[serde(default)]
    pub event_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Persist memories and agent rows here; in-memory only when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_period() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    20
}

fn default_observe_max_tokens() -> u32 {
    120
}

fn default_plan_max_tokens() -> u32 {
    300
}

fn default_temperature() -> f32 {
    0.8
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_send_timeout_ms() -> u64 {
    250
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period(),
            call_timeout_secs: default_call_timeout(),
            observe_max_tokens: default_observe_max_tokens(),
            plan_max_tokens: default_plan_max_tokens(),
            temperature: default_temperature(),
            event_seed: None,
        }
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            embedding_url: None,
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BroadcastConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            llm: LlmConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
            broadcast: BroadcastConfig::default(),
            templates_dir: None,
            characters: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        if config.scheduler.period_secs == 0 {
            return Err("scheduler.period_secs must be at least 1".into());
        }
        info!(
            period_secs = config.scheduler.period_secs,
            characters = config.characters.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Configured roster, or the built-in town when none is given
    pub fn roster(&self) -> Vec<Character> {
        if self.characters.is_empty() {
            default_roster()
        } else {
            self.characters.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.period(), Duration::from_secs(5));
        assert_eq!(config.broadcast.send_timeout(), Duration::from_millis(250));
        assert!(config.store.data_dir.is_none());
        assert_eq!(config.roster().len(), 3);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[scheduler]
period_secs = 2
event_seed = 7

[server]
bind = "127.0.0.1:9000"

[[characters]]
id = "otto"
name = "Otto"
traits = "grumpy fountain keeper"
daily_goal = "fix the fountain"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.scheduler.period_secs, 2);
        assert_eq!(config.scheduler.event_seed, Some(7));
        assert_eq!(config.scheduler.call_timeout_secs, 20);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.llm.model, "claude-3-5-haiku-latest");
        let roster = config.roster();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "otto");
    }

    #[test]
    fn test_from_file_rejects_zero_period() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[scheduler]\nperiod_secs = 0\n").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/npc-learn.toml").is_err());
    }
}
