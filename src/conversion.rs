use crate::error::{ProxyError, Result};
use crate::models::anthropic::{self, ContentBlock, MessagesRequest, MessagesResponse};
use crate::models::chat::{
    self, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatResponseMessage,
};
use crate::models::gemini::{
    GeminiContent, GeminiPart, GeminiRequest, GeminiResponse, GeminiRole, GenerationConfig,
};
use crate::models::{ChatMessage, ClientFormat, MessageContent, Role, TranslationRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Client request → internal messages
// ============================================================================

/// A validated client request plus the model name to echo back.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub request: TranslationRequest,
    pub client_model: String,
}

fn require_messages_array(body: &Value) -> Result<()> {
    match body.get("messages") {
        Some(Value::Array(_)) => Ok(()),
        _ => Err(ProxyError::InvalidRequest(
            "messages is required and must be an array".to_string(),
        )),
    }
}

fn invalid_body(err: serde_json::Error) -> ProxyError {
    ProxyError::InvalidRequest(format!("Invalid request body: {err}"))
}

/// Validate an OpenAI chat body and translate it.
pub fn parse_chat_request(
    body: Value,
    models: &ModelSelector,
    route: RouteModel,
) -> Result<ParsedRequest> {
    require_messages_array(&body)?;
    let req: ChatCompletionRequest = serde_json::from_value(body).map_err(invalid_body)?;
    let client_model = req.model_name().to_string();
    Ok(ParsedRequest {
        request: TranslationRequest {
            messages: messages_from_chat(&req),
            target_model: models.pick(route, &client_model).to_string(),
            max_tokens: req.output_limit(),
            temperature: req.temperature,
            streaming: req.stream.unwrap_or(false),
        },
        client_model,
    })
}

/// Validate an Anthropic messages body and translate it.
///
/// `max_tokens` is mandatory in this format; absent, null and zero are rejected.
pub fn parse_anthropic_request(
    body: Value,
    models: &ModelSelector,
    route: RouteModel,
) -> Result<ParsedRequest> {
    require_messages_array(&body)?;
    let req: MessagesRequest = serde_json::from_value(body).map_err(invalid_body)?;
    let max_tokens = req
        .max_tokens
        .filter(|n| *n > 0)
        .ok_or_else(|| ProxyError::InvalidRequest("max_tokens is required".to_string()))?;
    let client_model = req.model_name().to_string();
    Ok(ParsedRequest {
        request: TranslationRequest {
            messages: messages_from_anthropic(&req),
            target_model: models.pick(route, &client_model).to_string(),
            max_tokens: Some(max_tokens),
            temperature: req.temperature,
            streaming: req.stream.unwrap_or(false),
        },
        client_model,
    })
}

/// Parse OpenAI `messages` into ordered turns, dropping unknown roles.
pub fn messages_from_chat(req: &ChatCompletionRequest) -> Vec<ChatMessage> {
    collect_messages(
        ClientFormat::OpenAi,
        req.messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_ref())),
    )
}

/// Parse Anthropic `system` + `messages` into ordered turns.
///
/// A top-level `system` becomes the leading system turn; system roles inside
/// `messages` are not part of the Anthropic format and are dropped.
pub fn messages_from_anthropic(req: &MessagesRequest) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = req.system.as_ref() {
        let text = system.to_text();
        if !text.is_empty() {
            out.push(ChatMessage::new(Role::System, text));
        }
    }
    out.extend(collect_messages(
        ClientFormat::Anthropic,
        req.messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_ref())),
    ));
    out
}

fn collect_messages<'a>(
    format: ClientFormat,
    raw: impl Iterator<Item = (&'a str, Option<&'a MessageContent>)>,
) -> Vec<ChatMessage> {
    raw.filter_map(|(role, content)| {
        match Role::parse(role).filter(|r| format.accepts(*r)) {
            Some(role) => Some(ChatMessage::new(
                role,
                content.map(MessageContent::to_text).unwrap_or_default(),
            )),
            None => {
                tracing::debug!(format = format.as_str(), role, "Dropping unsupported role");
                None
            }
        }
    })
    .collect()
}

// ============================================================================
// Internal request → Gemini request
// ============================================================================

/// Structured turns: `assistant` → `model`, every other role → `user`.
pub fn to_gemini_request(req: &TranslationRequest) -> GeminiRequest {
    let contents = req
        .messages
        .iter()
        .map(|m| GeminiContent {
            role: gemini_role(m.role),
            parts: vec![GeminiPart {
                text: m.content.clone(),
            }],
        })
        .collect();

    GeminiRequest {
        contents,
        generation_config: generation_config(req),
    }
}

/// Flattened transcript: one user turn holding `role: content` lines.
pub fn to_gemini_transcript_request(req: &TranslationRequest) -> GeminiRequest {
    GeminiRequest {
        contents: vec![GeminiContent {
            role: GeminiRole::User,
            parts: vec![GeminiPart {
                text: flatten_transcript(&req.messages),
            }],
        }],
        generation_config: generation_config(req),
    }
}

pub fn flatten_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn gemini_role(role: Role) -> GeminiRole {
    match role {
        Role::Assistant => GeminiRole::Model,
        Role::System | Role::User => GeminiRole::User,
    }
}

/// Only parameters the client actually sent; `None` when there are none.
fn generation_config(req: &TranslationRequest) -> Option<GenerationConfig> {
    let cfg = GenerationConfig {
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
    };
    if cfg.is_empty() {
        None
    } else {
        Some(cfg)
    }
}

// ============================================================================
// Gemini response → client response
// ============================================================================

/// First candidate's first text part, or "" when any level is missing.
pub fn extract_text(resp: &GeminiResponse) -> String {
    resp.first_text().unwrap_or_default().to_string()
}

/// Wrap upstream output in the envelope of `format`.
pub fn from_upstream_response(raw: &GeminiResponse, client_model: &str, format: ClientFormat) -> Value {
    let text = extract_text(raw);
    let body = match format {
        ClientFormat::OpenAi => serde_json::to_value(to_chat_response(&text, client_model)),
        ClientFormat::Anthropic => {
            serde_json::to_value(to_anthropic_response(&text, client_model))
        }
    };
    body.unwrap_or(Value::Null)
}

pub fn to_chat_response(text: &str, client_model: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: client_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".to_string(),
                content: text.to_string(),
            },
            finish_reason: "stop".to_string(),
        }],
        usage: chat::ChatUsage::default(),
    }
}

pub fn to_anthropic_response(text: &str, client_model: &str) -> MessagesResponse {
    MessagesResponse {
        id: message_id(),
        object_type: "message".to_string(),
        role: "assistant".to_string(),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        model: client_model.to_string(),
        stop_reason: Some("end_turn".to_string()),
        stop_sequence: None,
        usage: anthropic::AnthropicUsage::default(),
    }
}

// ============================================================================
// Identifiers
// ============================================================================

static LAST_STAMP_MS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds, bumped so no two calls in this process collide.
fn next_stamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut prev = LAST_STAMP_MS.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(prev + 1);
        match LAST_STAMP_MS.compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", next_stamp())
}

pub fn message_id() -> String {
    format!("msg_{}", next_stamp())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Model selection
// ============================================================================

/// How `/v1/*` routes pick an upstream model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelPolicy {
    /// Client model names containing "flash" get the light model.
    Heuristic,
    /// Always the default model.
    Fixed,
}

/// Explicit model binding for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Default,
    Light,
}

/// How a particular route chooses its upstream model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteModel {
    Policy,
    Bound(ModelVariant),
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub policy: ModelPolicy,
    pub default_model: String,
    pub light_model: String,
}

impl ModelSelector {
    pub fn new(policy: ModelPolicy, default_model: &str, light_model: &str) -> Self {
        Self {
            policy,
            default_model: default_model.to_string(),
            light_model: light_model.to_string(),
        }
    }

    /// Resolve from the client's model name according to the policy.
    pub fn resolve(&self, client_model: &str) -> &str {
        match self.policy {
            ModelPolicy::Fixed => &self.default_model,
            ModelPolicy::Heuristic => {
                if client_model.to_ascii_lowercase().contains("flash") {
                    &self.light_model
                } else {
                    &self.default_model
                }
            }
        }
    }

    pub fn bound(&self, variant: ModelVariant) -> &str {
        match variant {
            ModelVariant::Default => &self.default_model,
            ModelVariant::Light => &self.light_model,
        }
    }

    pub fn pick(&self, route: RouteModel, client_model: &str) -> &str {
        match route {
            RouteModel::Policy => self.resolve(client_model),
            RouteModel::Bound(variant) => self.bound(variant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Vec<ChatMessage>) -> TranslationRequest {
        TranslationRequest {
            messages,
            target_model: "gemini-2.5-pro".into(),
            max_tokens: None,
            temperature: None,
            streaming: false,
        }
    }

    #[test]
    fn structured_roles_map_assistant_to_model() {
        let req = request(vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Assistant, "hello"),
            ChatMessage::new(Role::User, "again"),
        ]);
        let v = serde_json::to_value(to_gemini_request(&req)).unwrap();
        assert_eq!(
            v,
            json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "be brief"}]},
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "again"}]}
                ]
            })
        );
    }

    #[test]
    fn transcript_flattens_in_order() {
        let mut req = request(vec![
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Assistant, "hello"),
        ]);
        req.max_tokens = Some(64);
        let v = serde_json::to_value(to_gemini_transcript_request(&req)).unwrap();
        assert_eq!(v["contents"].as_array().unwrap().len(), 1);
        assert_eq!(v["contents"][0]["role"], "user");
        assert_eq!(
            v["contents"][0]["parts"][0]["text"],
            "user: hi\nassistant: hello"
        );
        assert_eq!(v["generationConfig"], json!({"maxOutputTokens": 64}));
    }

    #[test]
    fn generation_params_pass_through_only_when_present() {
        let mut req = request(vec![ChatMessage::new(Role::User, "x")]);
        req.temperature = Some(0.0);
        let v = serde_json::to_value(to_gemini_request(&req)).unwrap();
        assert_eq!(v["generationConfig"], json!({"temperature": 0.0}));

        req.temperature = None;
        let v = serde_json::to_value(to_gemini_request(&req)).unwrap();
        assert!(v.get("generationConfig").is_none());
    }

    #[test]
    fn chat_messages_drop_unknown_roles_and_keep_order() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "system", "content": "sys"},
                {"role": "tool", "content": "ignored"},
                {"role": "user", "content": [{"type": "text", "text": "part"}]},
                {"role": "assistant", "content": null}
            ]
        }))
        .unwrap();
        let msgs = messages_from_chat(&req);
        assert_eq!(
            msgs,
            vec![
                ChatMessage::new(Role::System, "sys"),
                ChatMessage::new(Role::User, "part"),
                ChatMessage::new(Role::Assistant, ""),
            ]
        );
    }

    #[test]
    fn anthropic_system_field_leads_and_inline_system_is_dropped() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "max_tokens": 10,
            "system": "rules",
            "messages": [
                {"role": "system", "content": "nope"},
                {"role": "user", "content": "q"}
            ]
        }))
        .unwrap();
        let msgs = messages_from_anthropic(&req);
        assert_eq!(
            msgs,
            vec![
                ChatMessage::new(Role::System, "rules"),
                ChatMessage::new(Role::User, "q"),
            ]
        );
    }

    #[test]
    fn responses_carry_placeholders() {
        let raw: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "hello"}]}}]
        }))
        .unwrap();

        let openai = from_upstream_response(&raw, "gpt-4o", ClientFormat::OpenAi);
        assert_eq!(openai["object"], "chat.completion");
        assert_eq!(openai["model"], "gpt-4o");
        assert_eq!(openai["choices"][0]["message"]["content"], "hello");
        assert_eq!(openai["choices"][0]["finish_reason"], "stop");
        assert_eq!(openai["usage"]["total_tokens"], 0);
        assert!(openai["id"].as_str().unwrap().starts_with("chatcmpl-"));

        let claude = from_upstream_response(&raw, "claude-3", ClientFormat::Anthropic);
        assert_eq!(claude["type"], "message");
        assert_eq!(claude["content"][0], json!({"type": "text", "text": "hello"}));
        assert_eq!(claude["stop_reason"], "end_turn");
        assert!(claude["stop_sequence"].is_null());
        assert_eq!(claude["usage"], json!({"input_tokens": 0, "output_tokens": 0}));
        assert!(claude["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn missing_candidates_yield_empty_text() {
        let raw = GeminiResponse::default();
        let v = from_upstream_response(&raw, "m", ClientFormat::OpenAi);
        assert_eq!(v["choices"][0]["message"]["content"], "");
    }

    #[test]
    fn ids_are_unique_within_process() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(completion_id()));
        }
    }

    fn selector() -> ModelSelector {
        ModelSelector::new(ModelPolicy::Heuristic, "gemini-2.5-pro", "gemini-2.5-flash")
    }

    #[test]
    fn chat_body_without_messages_array_is_rejected() {
        for body in [json!({}), json!({"messages": "hi"}), json!({"messages": null})] {
            let err = parse_chat_request(body, &selector(), RouteModel::Policy).unwrap_err();
            assert!(matches!(err, ProxyError::InvalidRequest(_)));
            assert_eq!(err.status(), 400);
        }
    }

    #[test]
    fn chat_body_defaults_model_and_reads_params() {
        let parsed = parse_chat_request(
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "max_completion_tokens": 32,
                "temperature": 0.5,
                "stream": true
            }),
            &selector(),
            RouteModel::Policy,
        )
        .unwrap();
        assert_eq!(parsed.client_model, "gpt-3.5-turbo");
        assert_eq!(parsed.request.target_model, "gemini-2.5-pro");
        assert_eq!(parsed.request.max_tokens, Some(32));
        assert_eq!(parsed.request.temperature, Some(0.5));
        assert!(parsed.request.streaming);
    }

    #[test]
    fn anthropic_body_requires_positive_max_tokens() {
        for body in [
            json!({"messages": [{"role": "user", "content": "q"}]}),
            json!({"messages": [], "max_tokens": null}),
            json!({"messages": [], "max_tokens": 0}),
        ] {
            let err = parse_anthropic_request(body, &selector(), RouteModel::Policy).unwrap_err();
            assert_eq!(err.client_message(), "max_tokens is required");
        }
    }

    #[test]
    fn bound_routes_ignore_client_model() {
        let body = json!({
            "model": "claude-3-flash-imaginary",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "q"}]
        });
        let pro = parse_anthropic_request(
            body.clone(),
            &selector(),
            RouteModel::Bound(ModelVariant::Default),
        )
        .unwrap();
        assert_eq!(pro.request.target_model, "gemini-2.5-pro");
        assert_eq!(pro.client_model, "claude-3-flash-imaginary");

        let policy = parse_anthropic_request(body, &selector(), RouteModel::Policy).unwrap();
        assert_eq!(policy.request.target_model, "gemini-2.5-flash");
    }

    #[test]
    fn heuristic_selection_is_case_insensitive() {
        let sel = ModelSelector::new(ModelPolicy::Heuristic, "gemini-2.5-pro", "gemini-2.5-flash");
        assert_eq!(sel.resolve("Gemini-FLASH-latest"), "gemini-2.5-flash");
        assert_eq!(sel.resolve("gpt-4o"), "gemini-2.5-pro");
        assert_eq!(sel.resolve(""), "gemini-2.5-pro");

        let fixed = ModelSelector::new(ModelPolicy::Fixed, "gemini-2.5-pro", "gemini-2.5-flash");
        assert_eq!(fixed.resolve("flash"), "gemini-2.5-pro");
        assert_eq!(fixed.bound(ModelVariant::Light), "gemini-2.5-flash");
    }
}
