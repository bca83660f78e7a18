//! Engine configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv_cache::DEFAULT_BLOCK_SIZE;

/// Environment variable overriding [`EngineConfig::num_blocks`]
pub const ENV_NUM_BLOCKS: &str = "MINIVLLM_NUM_BLOCKS";
/// Environment variable overriding [`EngineConfig::block_size`]
pub const ENV_BLOCK_SIZE: &str = "MINIVLLM_BLOCK_SIZE";
/// Environment variable overriding [`EngineConfig::max_batch_size`]
pub const ENV_MAX_BATCH_SIZE: &str = "MINIVLLM_MAX_BATCH_SIZE";

/// Errors raised while building or validating a configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A capacity, block size or batch size that is not positive
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An environment variable that does not parse as a count
    #[error("invalid value '{value}' for {var}")]
    Env { var: String, value: String },
}

impl ConfigError {
    /// Create an invalid-configuration error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Construction-time settings shared by the allocator, scheduler and engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total number of blocks in the pool
    pub num_blocks: usize,

    /// Tokens per block
    pub block_size: usize,

    /// Maximum number of requests in the running batch
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { num_blocks: 100, block_size: DEFAULT_BLOCK_SIZE, max_batch_size: 4 }
    }
}

impl EngineConfig {
    /// Create a config, validating every field
    pub fn new(
        num_blocks: usize,
        block_size: usize,
        max_batch_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { num_blocks, block_size, max_batch_size };
        config.validate()?;
        Ok(config)
    }

    /// Create config optimized for low latency
    pub fn low_latency() -> Self {
        Self { num_blocks: 256, block_size: DEFAULT_BLOCK_SIZE, max_batch_size: 1 }
    }

    /// Create config optimized for high throughput
    pub fn high_throughput() -> Self {
        Self { num_blocks: 4096, block_size: DEFAULT_BLOCK_SIZE, max_batch_size: 64 }
    }

    /// Check that every field is positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_blocks == 0 {
            return Err(ConfigError::invalid("num_blocks must be greater than 0"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::invalid("block_size must be greater than 0"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("max_batch_size must be greater than 0"));
        }
        Ok(())
    }

    /// Total number of tokens the pool can hold
    pub fn token_capacity(&self) -> usize {
        self.num_blocks * self.block_size
    }

    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_var(&lookup, ENV_NUM_BLOCKS)? {
            config.num_blocks = n;
        }
        if let Some(n) = parse_var(&lookup, ENV_BLOCK_SIZE)? {
            config.block_size = n;
        }
        if let Some(n) = parse_var(&lookup, ENV_MAX_BATCH_SIZE)? {
            config.max_batch_size = n;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F>(lookup: &F, var: &str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var: var.to_string(), value }),
        None => Ok(None),
    }
}
