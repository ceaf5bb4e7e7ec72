//! Wire models for the two client-facing APIs, the Gemini upstream, and the
//! admin endpoints, plus the format-agnostic request the translator works on.

pub mod admin;
pub mod anthropic;
pub mod chat;
pub mod gemini;

use serde::{Deserialize, Serialize};

/// Which client-facing wire format a call speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientFormat {
    OpenAi,
    Anthropic,
}

impl ClientFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientFormat::OpenAi => "openai",
            ClientFormat::Anthropic => "anthropic",
        }
    }

    /// Roles this format lets a caller send inside `messages`.
    pub fn accepts(&self, role: Role) -> bool {
        match self {
            ClientFormat::OpenAi => true,
            ClientFormat::Anthropic => matches!(role, Role::User | Role::Assistant),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversation turn after client-format parsing. Order is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Per-call request in the translator's own terms.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRequest {
    pub messages: Vec<ChatMessage>,
    /// Upstream model id, already resolved from the client's model name.
    pub target_model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub streaming: bool,
}

/// Text carried by a message `content` field: a plain string, an array of
/// typed parts, or null.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
}

impl MessageContent {
    /// Flatten to plain text; only `{"type":"text","text":..}` parts count.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_content_keeps_only_text() {
        let content: MessageContent = serde_json::from_value(json!([
            {"type": "text", "text": "first"},
            {"type": "image_url", "image_url": {"url": "http://x"}},
            {"type": "text", "text": "second"}
        ]))
        .unwrap();
        assert_eq!(content.to_text(), "first\nsecond");
    }

    #[test]
    fn anthropic_rejects_system_role_in_messages() {
        assert!(!ClientFormat::Anthropic.accepts(Role::System));
        assert!(ClientFormat::OpenAi.accepts(Role::System));
    }
}
