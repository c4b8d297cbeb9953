//! Shared types for generation requests and responses.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Parameters forwarded to the execution service.
///
/// Only `max_tokens`, `min_tokens` and `max_retries` are read by the exchange;
/// everything else travels through `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: Option<String>,
    /// Output volume requested from the budget.
    pub max_tokens: u32,
    /// Smallest output volume the task can still make use of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tokens: Option<u32>,
    /// Per-task override of the configured retry limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 150,
            min_tokens: None,
            max_retries: None,
            temperature: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl GenerationParams {
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_min_tokens(mut self, min_tokens: u32) -> Self {
        self.min_tokens = Some(min_tokens);
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Output volume the budget must allow before the task may run.
    ///
    /// A `min_tokens` floor lowers the bar, but never above `max_tokens`.
    #[must_use]
    pub fn budget_threshold(&self) -> u64 {
        let requested = u64::from(self.max_tokens);
        match self.min_tokens {
            Some(floor) => requested.min(u64::from(floor)),
            None => requested,
        }
    }
}

/// How the host wants the generation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Background,
    Blocking,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl Choice {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            index: 0,
            text: text.into(),
            finish_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub choices: Vec<Choice>,
}

impl GenerationResponse {
    /// Text of the first choice, or an empty string.
    #[must_use]
    pub fn text(&self) -> &str {
        self.choices.first().map_or("", |c| c.text.as_str())
    }
}

/// One streamed update from the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub choices: Vec<Choice>,
    pub is_final: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_threshold_without_floor() {
        let params = GenerationParams::default().with_max_tokens(200);
        assert_eq!(params.budget_threshold(), 200);
    }

    #[test]
    fn test_budget_threshold_uses_floor() {
        let params = GenerationParams::default()
            .with_max_tokens(200)
            .with_min_tokens(40);
        assert_eq!(params.budget_threshold(), 40);
    }

    #[test]
    fn test_budget_threshold_floor_capped_at_request() {
        let params = GenerationParams::default()
            .with_max_tokens(20)
            .with_min_tokens(40);
        assert_eq!(params.budget_threshold(), 20);
    }

    #[test]
    fn test_params_keep_opaque_fields() {
        let json = r#"{"model":"kayra","max_tokens":60,"top_p":0.9,"stop":["\n\n"]}"#;
        let params: GenerationParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.model.as_deref(), Some("kayra"));
        assert_eq!(params.max_tokens, 60);
        assert_eq!(params.extra.get("top_p"), Some(&serde_json::json!(0.9)));

        let back = serde_json::to_value(&params).unwrap();
        assert_eq!(back["stop"], serde_json::json!(["\n\n"]));
    }
}
