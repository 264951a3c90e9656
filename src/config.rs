use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub passages: PassagesConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory where uploaded blobs are written. Refs stay opaque to callers.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Delay between progress steps of the built-in scanner (per page).
    #[serde(default = "default_scan_step_millis")]
    pub step_millis: u64,
    /// Budget for a whole scan before it is marked aborted.
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient scanner failures (timeouts) before rejecting.
    #[serde(default = "default_scan_max_retries")]
    pub max_retries: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            step_millis: default_scan_step_millis(),
            timeout_secs: default_scan_timeout_secs(),
            max_retries: default_scan_max_retries(),
        }
    }
}

fn default_scan_step_millis() -> u64 {
    10
}
fn default_scan_timeout_secs() -> u64 {
    120
}
fn default_scan_max_retries() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PassagesConfig {
    /// Maximum characters per indexed passage.
    #[serde(default = "default_passage_max_chars")]
    pub max_chars: usize,
}

impl Default for PassagesConfig {
    fn default() -> Self {
        Self {
            max_chars: default_passage_max_chars(),
        }
    }
}

fn default_passage_max_chars() -> usize {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Final number of passages returned per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates handed to the scorer before truncation.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Budget for one scorer call.
    #[serde(default = "default_scorer_timeout_secs")]
    pub scorer_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            scorer_timeout_secs: default_scorer_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_candidate_k() -> usize {
    64
}
fn default_scorer_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Overall budget for one chat turn (retrieval + composition).
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Passages offered to the composer per turn.
    #[serde(default = "default_max_context_passages")]
    pub max_context_passages: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            turn_timeout_secs: default_turn_timeout_secs(),
            max_context_passages: default_max_context_passages(),
        }
    }
}

fn default_turn_timeout_secs() -> u64 {
    30
}
fn default_max_context_passages() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.passages.max_chars == 0 {
        anyhow::bail!("passages.max_chars must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.top_k {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.top_k");
    }
    if config.scan.timeout_secs == 0 || config.chat.turn_timeout_secs == 0 {
        anyhow::bail!("scan.timeout_secs and chat.turn_timeout_secs must be > 0");
    }

    Ok(config)
}
