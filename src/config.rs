//! Runtime configuration for kv-block-sched.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All capacity and scheduling knobs are static for the
//! lifetime of the engine.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::TokenId;
use crate::scheduler::PreemptionMode;

/// Command-line arguments for the demo driver.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-block-sched", about = "Paged KV-cache scheduling demo driver")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Number of synthetic requests to submit.
    #[arg(long, default_value_t = 8)]
    pub num_requests: usize,

    /// Stop after this many engine steps even if requests remain.
    #[arg(long, default_value_t = 512)]
    pub max_steps: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("watermark must lie in [0, 1], got {0}")]
    InvalidWatermark(f64),
    #[error("block_size must be positive")]
    ZeroBlockSize,
    #[error("sliding window ({0}) must be a multiple of block_size ({1})")]
    MisalignedSlidingWindow(usize, usize),
    #[error("max_model_len must be positive")]
    ZeroModelLen,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Block pool sizing and caching behavior.
    pub cache: CacheConfig,

    /// Batching caps and queue policy knobs.
    pub scheduler: SchedulerConfig,

    /// Engine-level settings.
    pub engine: EngineConfig,
}

/// KV block pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tokens per KV block.
    pub block_size: usize,

    /// Physical blocks on the GPU tier.
    pub num_gpu_blocks: usize,

    /// Physical blocks on the CPU (swap) tier.
    pub num_cpu_blocks: usize,

    /// Fraction of GPU blocks held back at admission to damp
    /// cache-eviction thrash.
    pub watermark: f64,

    /// Attention sliding window in tokens, if the model uses one.
    pub sliding_window: Option<usize>,

    /// Content-addressed reuse of full blocks across sequences.
    pub enable_prefix_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_gpu_blocks: 512,
            num_cpu_blocks: 256,
            watermark: 0.01,
            sliding_window: None,
            enable_prefix_caching: false,
        }
    }
}

impl CacheConfig {
    /// GPU blocks reserved by the admission watermark.
    pub fn watermark_blocks(&self) -> usize {
        (self.watermark * self.num_gpu_blocks as f64) as usize
    }
}

/// Scheduler batching caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on tokens in one batch, after right-padding.
    pub max_num_batched_tokens: usize,

    /// Upper bound on concurrently running sequences.
    pub max_num_seqs: usize,

    /// Upper bound on padding slack in a prompt batch.
    pub max_paddings: usize,

    /// Model context length; longer prompts are ignored at admission.
    pub max_model_len: usize,

    /// When set, prompts prefill in chunks of at most this many tokens.
    pub max_chunked_prefill_len: Option<usize>,

    /// Prompt groups admitted per step when chunked prefill is on.
    pub max_num_prompt_seqs: usize,

    /// Force a preemption mode instead of picking per group.
    pub preemption_mode: Option<PreemptionMode>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_batched_tokens: 2560,
            max_num_seqs: 256,
            max_paddings: 256,
            max_model_len: 2048,
            max_chunked_prefill_len: None,
            max_num_prompt_seqs: 256,
            preemption_mode: None,
        }
    }
}

/// Engine-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// End-of-sequence token; sampling it finishes a sequence unless the
    /// request sets `ignore_eos`.
    pub eos_token_id: Option<TokenId>,

    /// Emit a system stats log line every this many steps.
    pub log_stats_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            eos_token_id: Some(2),
            log_stats_interval: 64,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if
    /// the file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if !(0.0..=1.0).contains(&self.cache.watermark) {
            return Err(ConfigError::InvalidWatermark(self.cache.watermark));
        }
        if let Some(window) = self.cache.sliding_window {
            if window % self.cache.block_size != 0 {
                return Err(ConfigError::MisalignedSlidingWindow(
                    window,
                    self.cache.block_size,
                ));
            }
        }
        if self.scheduler.max_model_len == 0 {
            return Err(ConfigError::ZeroModelLen);
        }
        Ok(())
    }
}
