//! Reply composition

use modelpool_proto::{GenerateRequest, Role};

/// A composed reply before it is streamed
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub emotional_tone: String,
    pub confidence: f32,
}

impl Reply {
    /// Whitespace-separated words
    pub fn token_count(&self) -> u32 {
        self.text.split_whitespace().count() as u32
    }
}

/// Builds replies from the personality and style settings
#[derive(Debug, Clone, Default)]
pub struct Responder {
    user_id: String,
}

impl Responder {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn reply(&self, request: &GenerateRequest) -> Reply {
        let settings = &request.settings;
        let (opener, tone) = match settings.personality_mode.as_str() {
            "supportive" => ("I hear you.", "warm"),
            "playful" => ("Oh, fun one!", "cheerful"),
            "professional" => ("Understood.", "neutral"),
            "curious" => ("Interesting.", "inquisitive"),
            _ => ("Okay.", "neutral"),
        };

        let topic = summarize(&request.message);
        let mut text = match settings.response_style.as_str() {
            "concise" => format!("{} {}", opener, topic),
            "detailed" => {
                let earlier = request
                    .context_messages
                    .iter()
                    .filter(|m| m.role == Role::User)
                    .count();
                format!(
                    "{} You said: {}. This is the model tuned for {}, and we have covered {} earlier points.",
                    opener, topic, self.user_id, earlier
                )
            }
            _ => format!("{} You said: {}.", opener, topic),
        };

        let limit = settings.max_tokens as usize;
        if limit > 0 && text.split_whitespace().count() > limit {
            text = text.split_whitespace().take(limit).collect::<Vec<_>>().join(" ");
        }

        // More context means a better grounded reply
        let confidence = (0.6 + 0.05 * request.context_messages.len() as f32).min(0.95);

        Reply {
            text,
            emotional_tone: tone.to_string(),
            confidence,
        }
    }
}

/// Collapse whitespace and drop trailing punctuation
fn summarize(message: &str) -> String {
    let words: Vec<&str> = message.split_whitespace().collect();
    words
        .join(" ")
        .trim_end_matches(['.', '!', '?'])
        .to_string()
}
