//! ModelPool worker protocol
//!
//! Line-delimited JSON spoken over an inference worker's stdin/stdout.
//! The coordinator writes one [`GenerateRequest`] per line; the worker
//! answers with [`WorkerEvent`] lines tagged `stream`, `complete` or
//! `error`. Before serving anything the worker prints a literal
//! readiness line (see [`DEFAULT_READY_LINE`]).
//!
//! Anything on the output stream that is not a well-formed event is noise
//! and must be ignored by readers, never treated as a protocol error.

use serde::{Deserialize, Serialize};

/// Readiness line a worker prints once its model is resident
pub const DEFAULT_READY_LINE: &str = "MODEL_READY";

/// Message author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Per-session generation settings, forwarded verbatim to the worker.
///
/// Serialized camelCase on the wire; snake_case is accepted as well so
/// the same struct can be read from YAML configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on generated tokens
    #[serde(default = "default_max_tokens", alias = "max_tokens")]
    pub max_tokens: u32,

    /// How many prior turns are sent as context (most recent N)
    #[serde(default = "default_memory_length", alias = "memory_length")]
    pub memory_length: usize,

    /// Persona the fine-tuned model should adopt
    #[serde(default = "default_personality_mode", alias = "personality_mode")]
    pub personality_mode: String,

    /// Style hint (e.g. "conversational", "concise")
    #[serde(default = "default_response_style", alias = "response_style")]
    pub response_style: String,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

fn default_memory_length() -> usize {
    10
}

fn default_personality_mode() -> String {
    "supportive".to_string()
}

fn default_response_style() -> String {
    "conversational".to_string()
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            memory_length: default_memory_length(),
            personality_mode: default_personality_mode(),
            response_style: default_response_style(),
        }
    }
}

/// One prior turn sent as context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

/// Request line written to a worker's stdin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// Correlation id; workers may echo it on their events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// The new user message
    pub message: String,

    /// Trailing conversation context, chronological
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,

    #[serde(default)]
    pub settings: ChatSettings,
}

impl GenerateRequest {
    /// Encode as a single protocol line (no trailing newline)
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Metadata a worker attaches to its `complete` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional_tone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Event line read from a worker's stdout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    /// Incremental text
    Stream {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,

        #[serde(alias = "delta", alias = "token")]
        content: String,
    },

    /// Generation finished; `content` is the full reply when present
    Complete {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,

        #[serde(default)]
        metadata: CompletionMetadata,
    },

    /// Generation failed inside the worker
    Error {
        #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,

        #[serde(alias = "error")]
        message: String,
    },
}

impl WorkerEvent {
    /// Correlation id echoed by the worker, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WorkerEvent::Stream { request_id, .. }
            | WorkerEvent::Complete { request_id, .. }
            | WorkerEvent::Error { request_id, .. } => request_id.as_deref(),
        }
    }

    /// Encode as a single protocol line (no trailing newline)
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Parse one output line. Returns `None` for blank lines, non-JSON noise
/// and JSON objects that are not recognised events.
pub fn parse_event(line: &str) -> Option<WorkerEvent> {
    let line = line.trim();
    if line.is_empty() || !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Whether `line` is the worker's readiness announcement
pub fn is_ready_line(line: &str, ready_line: &str) -> bool {
    line.trim() == ready_line
}
