//! Run configuration: thresholds, collaborator endpoints, and resource limits.
//!
//! Loaded from an optional TOML file and overlaid with `Default` for any
//! field the file omits, mirroring the documented-default contract of
//! spec.md §6 "Environment".

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MatchEngineError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub weights: WeightConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            collaborators: CollaboratorConfig::default(),
            thresholds: ThresholdConfig::default(),
            weights: WeightConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Path to the SQLite database file (relational store).
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("llpg_match.db"),
        }
    }
}

/// Vector store and embedding service endpoints. Both are optional
/// collaborators (§1): when disabled, Tier C is skipped rather than failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub vector_store_enabled: bool,
    #[serde(default = "CollaboratorConfig::default_vector_store_url")]
    pub vector_store_url: String,
    #[serde(default = "CollaboratorConfig::default_embedding_service_url")]
    pub embedding_service_url: String,
    #[serde(default = "CollaboratorConfig::default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "CollaboratorConfig::default_embedding_dim")]
    pub embedding_dim: usize,
}

impl CollaboratorConfig {
    fn default_vector_store_url() -> String {
        "http://localhost:6333".to_string()
    }
    fn default_embedding_service_url() -> String {
        "http://localhost:8081".to_string()
    }
    fn default_embedding_model() -> String {
        "local-minilm".to_string()
    }
    fn default_embedding_dim() -> usize {
        384
    }
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            vector_store_enabled: false,
            vector_store_url: Self::default_vector_store_url(),
            embedding_service_url: Self::default_embedding_service_url(),
            embedding_model: Self::default_embedding_model(),
            embedding_dim: Self::default_embedding_dim(),
        }
    }
}

/// Decision and candidate-generation thresholds — spec.md §4.3/§4.5/§4.6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    #[serde(default = "ThresholdConfig::default_auto_accept_high")]
    pub auto_accept_high: f64,
    #[serde(default = "ThresholdConfig::default_auto_accept_medium")]
    pub auto_accept_medium: f64,
    #[serde(default = "ThresholdConfig::default_needs_review")]
    pub needs_review: f64,
    #[serde(default = "ThresholdConfig::default_min_threshold")]
    pub min_threshold: f64,
    #[serde(default = "ThresholdConfig::default_winner_margin")]
    pub winner_margin: f64,
    #[serde(default = "ThresholdConfig::default_rerun_improvement")]
    pub rerun_improvement: f64,
    #[serde(default = "ThresholdConfig::default_trigram_floor")]
    pub trigram_floor: f64,
    #[serde(default = "ThresholdConfig::default_trigram_phonetic_floor")]
    pub trigram_phonetic_floor: f64,
    #[serde(default = "ThresholdConfig::default_trigram_limit")]
    pub trigram_limit: usize,
    #[serde(default = "ThresholdConfig::default_vector_top_k")]
    pub vector_top_k: usize,
    #[serde(default = "ThresholdConfig::default_vector_min_cosine")]
    pub vector_min_cosine: f64,
    #[serde(default = "ThresholdConfig::default_spatial_radius_m")]
    pub spatial_radius_m: f64,
    #[serde(default = "ThresholdConfig::default_spatial_decay_m")]
    pub spatial_decay_m: f64,
    /// Conservative layer (spec.md §4.6 layer 5) overrides.
    #[serde(default = "ThresholdConfig::default_conservative_min_trigram")]
    pub conservative_min_trigram: f64,
    #[serde(default = "ThresholdConfig::default_conservative_min_jaro")]
    pub conservative_min_jaro: f64,
    #[serde(default = "ThresholdConfig::default_conservative_max_distance_m")]
    pub conservative_max_distance_m: f64,
}

impl ThresholdConfig {
    fn default_auto_accept_high() -> f64 {
        0.92
    }
    fn default_auto_accept_medium() -> f64 {
        0.88
    }
    fn default_needs_review() -> f64 {
        0.80
    }
    fn default_min_threshold() -> f64 {
        0.70
    }
    fn default_winner_margin() -> f64 {
        0.05
    }
    fn default_rerun_improvement() -> f64 {
        0.02
    }
    fn default_trigram_floor() -> f64 {
        0.30
    }
    fn default_trigram_phonetic_floor() -> f64 {
        0.85
    }
    fn default_trigram_limit() -> usize {
        50
    }
    fn default_vector_top_k() -> usize {
        10
    }
    fn default_vector_min_cosine() -> f64 {
        0.75
    }
    fn default_spatial_radius_m() -> f64 {
        200.0
    }
    fn default_spatial_decay_m() -> f64 {
        100.0
    }
    fn default_conservative_min_trigram() -> f64 {
        0.90
    }
    fn default_conservative_min_jaro() -> f64 {
        0.92
    }
    fn default_conservative_max_distance_m() -> f64 {
        50.0
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            auto_accept_high: Self::default_auto_accept_high(),
            auto_accept_medium: Self::default_auto_accept_medium(),
            needs_review: Self::default_needs_review(),
            min_threshold: Self::default_min_threshold(),
            winner_margin: Self::default_winner_margin(),
            rerun_improvement: Self::default_rerun_improvement(),
            trigram_floor: Self::default_trigram_floor(),
            trigram_phonetic_floor: Self::default_trigram_phonetic_floor(),
            trigram_limit: Self::default_trigram_limit(),
            vector_top_k: Self::default_vector_top_k(),
            vector_min_cosine: Self::default_vector_min_cosine(),
            spatial_radius_m: Self::default_spatial_radius_m(),
            spatial_decay_m: Self::default_spatial_decay_m(),
            conservative_min_trigram: Self::default_conservative_min_trigram(),
            conservative_min_jaro: Self::default_conservative_min_jaro(),
            conservative_max_distance_m: Self::default_conservative_max_distance_m(),
        }
    }
}

/// Meta-score weights — spec.md §4.4. Configuration, not a hard-coded contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightConfig {
    #[serde(default = "WeightConfig::default_trigram")]
    pub trigram: f64,
    #[serde(default = "WeightConfig::default_jaro")]
    pub jaro: f64,
    #[serde(default = "WeightConfig::default_cosine")]
    pub cosine: f64,
    #[serde(default = "WeightConfig::default_locality")]
    pub locality: f64,
    #[serde(default = "WeightConfig::default_street")]
    pub street: f64,
    #[serde(default = "WeightConfig::default_house_number")]
    pub house_number: f64,
    #[serde(default = "WeightConfig::default_alpha_suffix")]
    pub alpha_suffix: f64,
    #[serde(default = "WeightConfig::default_phonetic")]
    pub phonetic: f64,
    #[serde(default = "WeightConfig::default_spatial")]
    pub spatial: f64,
    #[serde(default = "WeightConfig::default_descriptor_mismatch")]
    pub descriptor_mismatch: f64,
    #[serde(default = "WeightConfig::default_phonetic_miss")]
    pub phonetic_miss: f64,
    #[serde(default = "WeightConfig::default_status_live")]
    pub status_live: f64,
    #[serde(default = "WeightConfig::default_valid_uprn")]
    pub valid_uprn: f64,
}

impl WeightConfig {
    fn default_trigram() -> f64 {
        0.45
    }
    fn default_jaro() -> f64 {
        0.25
    }
    fn default_cosine() -> f64 {
        0.10
    }
    fn default_locality() -> f64 {
        0.05
    }
    fn default_street() -> f64 {
        0.05
    }
    fn default_house_number() -> f64 {
        0.08
    }
    fn default_alpha_suffix() -> f64 {
        0.02
    }
    fn default_phonetic() -> f64 {
        0.02
    }
    fn default_spatial() -> f64 {
        0.10
    }
    fn default_descriptor_mismatch() -> f64 {
        0.05
    }
    fn default_phonetic_miss() -> f64 {
        0.03
    }
    fn default_status_live() -> f64 {
        0.03
    }
    fn default_valid_uprn() -> f64 {
        0.20
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            trigram: Self::default_trigram(),
            jaro: Self::default_jaro(),
            cosine: Self::default_cosine(),
            locality: Self::default_locality(),
            street: Self::default_street(),
            house_number: Self::default_house_number(),
            alpha_suffix: Self::default_alpha_suffix(),
            phonetic: Self::default_phonetic(),
            spatial: Self::default_spatial(),
            descriptor_mismatch: Self::default_descriptor_mismatch(),
            phonetic_miss: Self::default_phonetic_miss(),
            status_live: Self::default_status_live(),
            valid_uprn: Self::default_valid_uprn(),
        }
    }
}

/// Worker pool and cache sizing — spec.md §5.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// `None` means derive from available parallelism at start-up.
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default = "RuntimeConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "RuntimeConfig::default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "RuntimeConfig::default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "RuntimeConfig::default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "RuntimeConfig::default_document_timeout_secs")]
    pub document_timeout_secs: u64,
    #[serde(default = "RuntimeConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RuntimeConfig::default_pool_max_open")]
    pub pool_max_open: usize,
    #[serde(default = "RuntimeConfig::default_pool_max_idle")]
    pub pool_max_idle: usize,
}

impl RuntimeConfig {
    fn default_batch_size() -> usize {
        500
    }
    fn default_cache_size() -> usize {
        10_000
    }
    fn default_channel_capacity() -> usize {
        256
    }
    fn default_query_timeout_secs() -> u64 {
        30
    }
    fn default_document_timeout_secs() -> u64 {
        5
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_pool_max_open() -> usize {
        20
    }
    fn default_pool_max_idle() -> usize {
        10
    }

    /// `max(2, min(16, cpu_count - 1))` per spec.md §5.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) if n > 0 => n,
            _ => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                (cpus.saturating_sub(1)).clamp(2, 16)
            }
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            batch_size: Self::default_batch_size(),
            cache_size: Self::default_cache_size(),
            channel_capacity: Self::default_channel_capacity(),
            query_timeout_secs: Self::default_query_timeout_secs(),
            document_timeout_secs: Self::default_document_timeout_secs(),
            max_retries: Self::default_max_retries(),
            pool_max_open: Self::default_pool_max_open(),
            pool_max_idle: Self::default_pool_max_idle(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        match resolved {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p).map_err(|e| {
                    MatchEngineError::Configuration(format!(
                        "failed to read config at {}: {e}",
                        p.display()
                    ))
                })?;
                let config: Config = toml::from_str(&content).map_err(|e| {
                    MatchEngineError::Configuration(format!("invalid config TOML: {e}"))
                })?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MatchEngineError::Configuration(format!("failed to create config dir: {e}"))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MatchEngineError::Configuration(format!("failed to serialise: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| MatchEngineError::Configuration(format!("failed to write config: {e}")))?;
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("LLPG_MATCH_CONFIG") {
        return Some(PathBuf::from(p));
    }
    dirs::config_dir().map(|d| d.join("llpg-match").join("config.toml"))
}
