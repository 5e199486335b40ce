//! Runtime configuration
//!
//! `ConveneConfig::default()` reads `CONVENE_*` environment variables and falls
//! back to built-in values for anything unset or unparsable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaboration::session::SynthesisStrategy;

/// Built-in generation defaults, the lowest-precedence layer.
pub const DEFAULT_MODEL: &str = "default";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Wait timing knobs shared by every waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Timeout used when a caller does not pass one
    pub default_timeout_ms: u64,
    /// Fallback re-check interval; notification makes this a staleness bound only
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        WaitConfig {
            default_timeout_ms: env_or("CONVENE_WAIT_TIMEOUT_MS", 300_000),
            poll_interval_ms: env_or("CONVENE_POLL_INTERVAL_MS", 1_000),
        }
    }
}

impl WaitConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero interval would spin.
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Top-level configuration for the scheduler and tool surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveneConfig {
    /// System-level model when neither participant nor session sets one
    pub default_model: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub wait: WaitConfig,
    /// Per-turn handle deadline
    pub turn_timeout_ms: u64,
    /// How long resolved handles are kept before they may be purged
    pub retention_ms: u64,
    pub synthesis: SynthesisStrategy,
}

impl Default for ConveneConfig {
    fn default() -> Self {
        ConveneConfig {
            default_model: std::env::var("CONVENE_DEFAULT_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            default_temperature: env_or("CONVENE_DEFAULT_TEMPERATURE", DEFAULT_TEMPERATURE),
            default_max_tokens: env_or("CONVENE_DEFAULT_MAX_TOKENS", DEFAULT_MAX_TOKENS),
            wait: WaitConfig::default(),
            turn_timeout_ms: env_or("CONVENE_TURN_TIMEOUT_MS", 120_000),
            retention_ms: env_or("CONVENE_RETENTION_MS", 3_600_000),
            synthesis: SynthesisStrategy::default(),
        }
    }
}

impl ConveneConfig {
    /// Create a config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_synthesis(mut self, synthesis: SynthesisStrategy) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}
