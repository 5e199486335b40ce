//! Boundary to the text generator that performs a participant's turn.
//!
//! The scheduler only knows the [`Generator`] trait. Production code wires it
//! to a language-model client; tests and the CLI use deterministic stubs such
//! as [`EchoGenerator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use convene_state::HandleFailure;

/// Effective generation parameters for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Token accounting reported by the generator, when it has any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Output of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Generation {
            text: text.into(),
            usage: None,
        }
    }
}

/// Errors a generator may report. Any of them is a turn failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<GenerationError> for HandleFailure {
    fn from(err: GenerationError) -> Self {
        HandleFailure::work(err.to_string())
    }
}

/// Produces text for a prompt.
///
/// Implementations should fail with a descriptive error on provider failure.
/// Cancellation is cooperative: the dispatcher drops the returned future when
/// the turn is cancelled or times out.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generation, GenerationError>;
}

/// Deterministic generator: replies `"<role> says: <prompt-tail>"`.
///
/// The role is read from the prompt's `Role:` line (see
/// [`crate::collaboration::prompt`]); the tail is the last `tail_chars`
/// characters of the prompt with newlines flattened.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    tail_chars: usize,
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self { tail_chars: 60 }
    }
}

impl EchoGenerator {
    pub fn new(tail_chars: usize) -> Self {
        Self { tail_chars }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<Generation, GenerationError> {
        let role = prompt
            .lines()
            .find_map(|l| l.strip_prefix("Role:"))
            .map(str::trim)
            .unwrap_or("assistant");
        let flat: Vec<char> = prompt.replace('\n', " ").chars().collect();
        let tail: String = flat[flat.len().saturating_sub(self.tail_chars)..]
            .iter()
            .collect();
        Ok(Generation {
            text: format!("{role} says: {}", tail.trim()),
            usage: Some(Usage {
                prompt_tokens: prompt.split_whitespace().count() as u32,
                completion_tokens: 0,
            }),
        })
    }
}
