use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodConfig {
    #[serde(default = "default_max_step")]
    pub max_step: f32,
    #[serde(default = "default_neutral_threshold")]
    pub neutral_threshold: f32,
    #[serde(default = "default_decay_bucket_secs")]
    pub decay_bucket_secs: i64,
    #[serde(default = "default_decay_per_bucket")]
    pub decay_per_bucket: f32,
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    #[serde(default = "default_contagion_min_samples")]
    pub contagion_min_samples: usize,
    #[serde(default = "default_contagion_threshold")]
    pub contagion_threshold: f32,
}

fn default_max_step() -> f32 {
    0.1
}

fn default_neutral_threshold() -> f32 {
    0.3
}

fn default_decay_bucket_secs() -> i64 {
    30 * 60
}

fn default_decay_per_bucket() -> f32 {
    0.2
}

fn default_history_len() -> usize {
    10
}

fn default_contagion_min_samples() -> usize {
    5
}

fn default_contagion_threshold() -> f32 {
    0.3
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self {
            max_step: default_max_step(),
            neutral_threshold: default_neutral_threshold(),
            decay_bucket_secs: default_decay_bucket_secs(),
            decay_per_bucket: default_decay_per_bucket(),
            history_len: default_history_len(),
            contagion_min_samples: default_contagion_min_samples(),
            contagion_threshold: default_contagion_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuriosityConfig {
    #[serde(default = "default_curiosity_cooldown_secs")]
    pub cooldown_secs: i64,
    #[serde(default = "default_curiosity_window_secs")]
    pub window_secs: i64,
    #[serde(default = "default_curiosity_max_per_window")]
    pub max_per_window: usize,
    #[serde(default = "default_recent_topic_capacity")]
    pub recent_topic_capacity: usize,
    #[serde(default = "default_curiosity_min_confidence")]
    pub min_confidence: f32,
}

fn default_curiosity_cooldown_secs() -> i64 {
    5 * 60
}

fn default_curiosity_window_secs() -> i64 {
    15 * 60
}

fn default_curiosity_max_per_window() -> usize {
    3
}

fn default_recent_topic_capacity() -> usize {
    20
}

fn default_curiosity_min_confidence() -> f32 {
    0.1
}

impl Default for CuriosityConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_curiosity_cooldown_secs(),
            window_secs: default_curiosity_window_secs(),
            max_per_window: default_curiosity_max_per_window(),
            recent_topic_capacity: default_recent_topic_capacity(),
            min_confidence: default_curiosity_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    #[serde(default = "default_escalation_step")]
    pub escalation_step: f32,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_escalation_step() -> f32 {
    0.2
}

fn default_decay_factor() -> f32 {
    0.1
}

fn default_tick_interval_secs() -> u64 {
    3600
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            escalation_step: default_escalation_step(),
            decay_factor: default_decay_factor(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_quiet_fraction")]
    pub quiet_fraction: f64,
    #[serde(default = "default_peak_fraction")]
    pub peak_fraction: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_quiet_multiplier")]
    pub quiet_multiplier: f64,
    #[serde(default = "default_peak_multiplier")]
    pub peak_multiplier: f64,
}

fn default_window_days() -> i64 {
    7
}

fn default_quiet_fraction() -> f64 {
    0.5
}

fn default_peak_fraction() -> f64 {
    1.5
}

fn default_min_samples() -> u64 {
    10
}

fn default_quiet_multiplier() -> f64 {
    1.5
}

fn default_peak_multiplier() -> f64 {
    0.2
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            quiet_fraction: default_quiet_fraction(),
            peak_fraction: default_peak_fraction(),
            min_samples: default_min_samples(),
            quiet_multiplier: default_quiet_multiplier(),
            peak_multiplier: default_peak_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiMentionMode {
    /// First-named persona answers and addresses the others; they are picked
    /// up when that reply comes back through the router.
    Chain,
    /// Every named persona is returned in one payload, in mention order.
    Ordered,
}

impl MultiMentionMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "chain" => Some(MultiMentionMode::Chain),
            "ordered" => Some(MultiMentionMode::Ordered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_multi_mention_mode")]
    pub multi_mention_mode: MultiMentionMode,
    #[serde(default = "default_sticky_window_secs")]
    pub sticky_window_secs: i64,
    #[serde(default = "default_sticky_probability")]
    pub sticky_probability: f64,
    #[serde(default = "default_ambient_probability")]
    pub ambient_probability: f64,
    #[serde(default = "default_chain_base_probability")]
    pub chain_base_probability: f64,
    #[serde(default = "default_chain_decay")]
    pub chain_decay: f64,
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: u32,
    #[serde(default = "default_decision_budget_ms")]
    pub decision_budget_ms: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_multi_mention_mode() -> MultiMentionMode {
    MultiMentionMode::Chain
}

fn default_sticky_window_secs() -> i64 {
    120
}

fn default_sticky_probability() -> f64 {
    0.8
}

fn default_ambient_probability() -> f64 {
    0.08
}

fn default_chain_base_probability() -> f64 {
    1.0
}

fn default_chain_decay() -> f64 {
    0.5
}

fn default_max_chain_depth() -> u32 {
    10
}

fn default_decision_budget_ms() -> u64 {
    50
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            multi_mention_mode: default_multi_mention_mode(),
            sticky_window_secs: default_sticky_window_secs(),
            sticky_probability: default_sticky_probability(),
            ambient_probability: default_ambient_probability(),
            chain_base_probability: default_chain_base_probability(),
            chain_decay: default_chain_decay(),
            max_chain_depth: default_max_chain_depth(),
            decision_budget_ms: default_decision_budget_ms(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Sqlite,
    Files,
    Memory,
}

impl StorageKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Some(StorageKind::Sqlite),
            "files" | "file" | "json" => Some(StorageKind::Files),
            "memory" | "none" => Some(StorageKind::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageKind,
    /// SQLite database file, or the root directory for `files` storage.
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Pending writes that trigger a flush before the next interval; 0 never does.
    #[serde(default = "default_wake_threshold")]
    pub wake_threshold: usize,
}

fn default_storage() -> StorageKind {
    StorageKind::Sqlite
}

fn default_data_path() -> String {
    "chorus_state.db".to_string()
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_wake_threshold() -> usize {
    256
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            data_path: default_data_path(),
            flush_interval_ms: default_flush_interval_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
            wake_threshold: default_wake_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_channel_idle_secs")]
    pub channel_idle_secs: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_channel_idle_secs() -> i64 {
    6 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            channel_idle_secs: default_channel_idle_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub mood: MoodConfig,
    #[serde(default)]
    pub curiosity: CuriosityConfig,
    #[serde(default)]
    pub relationship: RelationshipConfig,
    #[serde(default)]
    pub activity: ActivityConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Directory of persona definition files (`*.toml` / `*.json`).
    #[serde(default)]
    pub personas_dir: Option<String>,
    /// Inline persona definitions, kept loosely typed so one bad field
    /// cannot sink the whole config.
    #[serde(default)]
    pub personas: Vec<serde_json::Value>,
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `CHORUS_CONFIG` if set, else chorus_config.toml next to the executable
    pub fn config_path() -> PathBuf {
        match env::var("CHORUS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("chorus_config.toml"),
        }
    }

    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<EngineConfig>(contents).context("Invalid engine config TOML")
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = env::var("CHORUS_PERSONAS_DIR") {
            if !dir.trim().is_empty() {
                self.personas_dir = Some(dir);
            }
        }

        if let Ok(raw) = env::var("CHORUS_STORAGE") {
            match StorageKind::parse(&raw) {
                Some(kind) => self.persistence.storage = kind,
                None => tracing::warn!("Ignoring unknown CHORUS_STORAGE '{}'", raw),
            }
        }

        if let Ok(path) = env::var("CHORUS_DATA_PATH") {
            if !path.trim().is_empty() {
                self.persistence.data_path = path;
            }
        }

        if let Ok(seed) = env::var("CHORUS_SEED") {
            if let Ok(seed) = seed.trim().parse() {
                self.router.seed = Some(seed);
            }
        }

        if let Ok(raw) = env::var("CHORUS_MULTI_MENTION_MODE") {
            match MultiMentionMode::parse(&raw) {
                Some(mode) => self.router.multi_mention_mode = mode,
                None => tracing::warn!("Ignoring unknown CHORUS_MULTI_MENTION_MODE '{}'", raw),
            }
        }

        self
    }
}
