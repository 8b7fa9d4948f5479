//! Configuration Module - Pipeline settings from ~/.docswarm/config.toml
//!
//! Supports:
//! - Chunk window and relationship tuning
//! - Embedder backend for capability routing
//! - Coordinator retry and load thresholds
//! - Evaluation thresholds, delivery retry and batching
//! - The default worker roster

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryConfig;
use crate::evaluate::EvaluationConfig;
use crate::swarm::{ChunkConfig, CoordinatorConfig, EmbedderConfig, WorkerSpec};

/// Docswarm Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Chunk windows
    pub chunking: ChunkConfig,
    /// Capability vectors
    pub routing: EmbedderConfig,
    /// Messaging retry and load balancing
    pub coordination: CoordinatorConfig,
    /// Validation thresholds
    pub evaluation: EvaluationConfig,
    /// Delivery retry and batching
    pub delivery: DeliveryConfig,
    /// Workers registered by the CLI
    pub workers: Vec<WorkerSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            chunking: ChunkConfig::default(),
            routing: EmbedderConfig::default(),
            coordination: CoordinatorConfig::default(),
            evaluation: EvaluationConfig::default(),
            delivery: DeliveryConfig::default(),
            workers: default_workers(),
        }
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// One worker per content type plus a generalist for mixed chunks
pub fn default_workers() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new("text-analyst", &["text", "analysis", "summarization"], 4),
        WorkerSpec::new("code-reviewer", &["code", "programming", "review"], 2),
        WorkerSpec::new("data-analyst", &["data", "statistics", "table"], 2),
        WorkerSpec::new("generalist", &["mixed", "text", "code", "data"], 2),
    ]
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        let path = Self::default_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config at {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        config
            .chunking
            .validate()
            .with_context(|| format!("Invalid [chunking] section in {}", path.display()))?;

        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("dev", "docswarm", "docswarm")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".docswarm")
                    .join("config.toml")
            })
    }

    /// Check if config file exists
    pub fn exists() -> bool {
        Self::default_path().exists()
    }
}

/// Generate a sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# Docswarm Configuration
# Location: ~/.config/docswarm/config.toml (or %APPDATA%\docswarm\config.toml on Windows)

[general]
# Log level: trace, debug, info, warn, error
log_level = "info"

# Emit JSON log lines instead of the compact format
log_json = false

[chunking]
# New words per chunk
max_chunk_size = 500

# Words repeated from the previous chunk
overlap_size = 50

# Related chunk ids kept per chunk, and the keyword Jaccard they must exceed
related_top_k = 5
similarity_threshold = 0.2

keywords_per_chunk = 10
summary_sentences = 2

[routing]
# "hash" (deterministic, offline) or "ollama"
backend = "hash"
dimension = 512
projections = 4
model = "nomic-embed-text"
ollama_endpoint = "http://localhost:11434"
timeout_secs = 30

[coordination]
# Message retries after the first attempt, with exponential backoff
max_retries = 3
initial_delay_ms = 100
max_delay_ms = 5000

# Load ratios that mark a worker overloaded / underloaded
overload_threshold = 0.8
underload_threshold = 0.3

# Weight of the load ratio when scoring candidates
load_weight = 0.5

# Per-dimension noise for specialist capability vectors
mutation_rate = 0.05

rebalance_interval_ms = 30000

[evaluation]
# Words per evaluator chunk
chunk_size = 500
required_sections = ["introduction", "conclusion"]
accuracy_threshold = 0.7
consistency_threshold = 0.8
completeness_threshold = 0.8

[delivery]
# Total send attempts per delivery
max_attempts = 3
initial_delay_ms = 200
max_delay_ms = 5000

# A batch flushes when it holds batch_size results or batch_timeout_ms passes
batch_size = 5
batch_timeout_ms = 60000

output_dir = "docswarm-output"

[[workers]]
name = "text-analyst"
capabilities = ["text", "analysis", "summarization"]
capacity = 4

[[workers]]
name = "code-reviewer"
capabilities = ["code", "programming", "review"]
capacity = 2

[[workers]]
name = "data-analyst"
capabilities = ["data", "statistics", "table"]
capacity = 2

[[workers]]
name = "generalist"
capabilities = ["mixed", "text", "code", "data"]
capacity = 2
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.chunking.max_chunk_size, 500);
        assert_eq!(config.routing.dimension, 512);
        assert_eq!(config.coordination.overload_threshold, 0.8);
        assert_eq!(config.delivery.batch_size, 5);
        assert_eq!(config.workers.len(), 4);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("test_config.toml");

        let mut config = Config::default();
        config.chunking.overlap_size = 25;
        config.workers.truncate(1);
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.chunking.overlap_size, 25);
        assert_eq!(loaded.workers.len(), 1);
        assert_eq!(loaded.workers[0].name, "text-analyst");
        assert_eq!(loaded.delivery.output_dir, config.delivery.output_dir);
    }

    #[test]
    fn test_parse_sample_config() {
        let sample = generate_sample_config();
        let config: Config = toml::from_str(&sample).unwrap();
        assert_eq!(config.workers.len(), default_workers().len());
        assert_eq!(config.evaluation.required_sections, vec!["introduction", "conclusion"]);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[chunking]\nmax_chunk_size = 400\n").unwrap();
        assert_eq!(config.chunking.max_chunk_size, 400);
        assert_eq!(config.chunking.overlap_size, 50);
        assert_eq!(config.workers.len(), 4);
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[chunking]\nmax_chunk_size = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
