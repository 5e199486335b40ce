//! Participants and generation-parameter precedence.

use serde::{Deserialize, Serialize};

use crate::config::ConveneConfig;
use crate::error::ValidationError;
use crate::generator::GenerationConfig;

/// One collaborator in a session.
///
/// `model`, `temperature` and `max_tokens` override the session defaults,
/// which in turn override the system defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSpec {
    pub id: String,
    /// Persona description; falls back to `id` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// A failed turn by a fatal participant aborts the whole session
    #[serde(default)]
    pub fatal: bool,
}

impl ParticipantSpec {
    pub fn new(id: &str) -> Self {
        ParticipantSpec {
            id: id.to_string(),
            role: None,
            model: None,
            temperature: None,
            max_tokens: None,
            fatal: false,
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// The persona text used in prompts.
    pub fn persona(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.id)
    }
}

/// Session-level generation defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Effective parameters for a participant: participant > session > system.
pub fn resolve_generation(
    participant: &ParticipantSpec,
    session: &GenerationDefaults,
    config: &ConveneConfig,
) -> GenerationConfig {
    GenerationConfig {
        model: participant
            .model
            .clone()
            .or_else(|| session.model.clone())
            .unwrap_or_else(|| config.default_model.clone()),
        temperature: participant
            .temperature
            .or(session.temperature)
            .unwrap_or(config.default_temperature),
        max_tokens: participant
            .max_tokens
            .or(session.max_tokens)
            .unwrap_or(config.default_max_tokens),
    }
}

/// Parameters for scheduler-internal calls (selection, synthesis).
pub fn resolve_session_generation(
    session: &GenerationDefaults,
    config: &ConveneConfig,
) -> GenerationConfig {
    GenerationConfig {
        model: session
            .model
            .clone()
            .unwrap_or_else(|| config.default_model.clone()),
        temperature: session.temperature.unwrap_or(config.default_temperature),
        max_tokens: session.max_tokens.unwrap_or(config.default_max_tokens),
    }
}

pub(crate) fn check_temperature(scope: &str, value: Option<f32>) -> Result<(), ValidationError> {
    match value {
        Some(t) if !(0.0..=2.0).contains(&t) => Err(ValidationError::TemperatureOutOfRange {
            scope: scope.to_string(),
            value: t,
        }),
        _ => Ok(()),
    }
}
