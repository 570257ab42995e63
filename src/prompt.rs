//! Request payloads for the chat completion endpoint.

use serde::Serialize;

use crate::input::{truncate_chars, MAX_TEXT_CHARS};

/// Output cap for the summary-only call; the expected answer is a two-field
/// JSON object.
pub const FAST_SUMMARY_MAX_TOKENS: u32 = 20;

pub const PREFERRED_LABELS: [&str; 9] = [
    "Arbitration",
    "Class-Action Waiver",
    "Limitation of Liability",
    "Unilateral ToS Changes",
    "Data Sharing",
    "Tracking/Profiling",
    "Indemnification",
    "Auto-Renewal",
    "IP/Content License",
];

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub temperature: u8,
    pub response_format: ResponseFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub messages: Vec<ChatMessage>,
}

fn full_system_prompt(max_labels: u32) -> String {
    format!(
        "You are a contract reviewer for Terms of Service. \
         Extract risky clauses as character spans over the ORIGINAL input text and return ONLY JSON:\n\
         {{\"spans\":[{{\"label\":str,\"severity\":\"LOW|MED|HIGH\",\"start\":int,\"end\":int,\"explanation\":str}}],\
         \"summary\":{{\"risk_count\":int,\"highest_severity\":\"LOW|MED|HIGH\"}}}}\n\
         Rules: start/end are 0-based offsets into the ORIGINAL text; merge adjacent same-label spans; \
         return at most {} spans; prefer labels from: {}. Be conservative.",
        max_labels,
        PREFERRED_LABELS.join(", ")
    )
}

const FAST_SYSTEM_PROMPT: &str = "You are a contract reviewer for Terms of Service. \
     Count the risky clauses in the user's text and return ONLY JSON: \
     {\"risk_count\":int,\"highest_severity\":\"LOW|MED|HIGH\"}. Be conservative.";

fn build(model: &str, system: String, text: &str, max_tokens: Option<u32>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        temperature: 0,
        response_format: ResponseFormat {
            kind: "json_object",
        },
        max_tokens,
        messages: vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: truncate_chars(text, MAX_TEXT_CHARS).to_string(),
            },
        ],
    }
}

/// Payload asking for labeled spans plus the aggregate summary.
pub fn full_analysis_payload(model: &str, text: &str, max_labels: u32) -> ChatCompletionRequest {
    build(model, full_system_prompt(max_labels), text, None)
}

/// Payload asking only for `{risk_count, highest_severity}`.
pub fn fast_summary_payload(model: &str, text: &str) -> ChatCompletionRequest {
    build(
        model,
        FAST_SYSTEM_PROMPT.to_string(),
        text,
        Some(FAST_SUMMARY_MAX_TOKENS),
    )
}
