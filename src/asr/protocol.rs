//! Streaming Protocol Messages
//!
//! Builds the handshake payload and wraps server replies. The helpers at the bottom
//! read common reply shapes for display; the session itself never interprets replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio_tungstenite::tungstenite::Message;

use super::constants::SERVER_READY;

/// What the server should do with the audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    #[default]
    Transcribe,
    Translate,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(format!("unknown task: {}", other)),
        }
    }
}

/// Session configuration, sent once as the handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub uid: String,
    pub model: String,
    pub language: String,
    pub task: Task,
    pub use_vad: bool,
}

impl SessionConfig {
    pub fn new(
        uid: impl Into<String>,
        model: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            model: model.into(),
            language: language.into(),
            task: Task::Transcribe,
            use_vad: false,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.task = task;
        self
    }

    pub fn with_vad(mut self, use_vad: bool) -> Self {
        self.use_vad = use_vad;
        self
    }

    /// Encode as the handshake JSON text
    pub fn to_handshake(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A message received from the server while draining
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ResponseMessage {
    /// Convert a data frame. Control frames carry no response and map to `None`.
    pub(crate) fn from_ws(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Binary(data) => Some(Self::Binary(data)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Binary(data) => write!(f, "<{} bytes>", data.len()),
        }
    }
}

/// Check whether a reply announces that the server is ready for audio
pub fn is_server_ready(raw: &str) -> bool {
    if raw.contains(SERVER_READY) {
        return true;
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => {
            obj.get("message").and_then(|v| v.as_str()) == Some(SERVER_READY)
                || obj.get("status").and_then(|v| v.as_str()) == Some(SERVER_READY)
        }
        _ => false,
    }
}

const TEXT_KEYS: &[&str] = &[
    "text",
    "transcript",
    "sentence",
    "utterance",
    "raw_text",
    "partial",
    "final",
];

const SKIP_KEYS: &[&str] = &[
    "start",
    "end",
    "uid",
    "id",
    "status",
    "message",
    "model",
    "language",
    "task",
    "completed",
    "completion",
    "duration",
    "prob",
    "avg_logprob",
    "no_speech_prob",
    "temperature",
];

const PROMPT_ECHOES: &[&str] = &[
    "transcribe the audio",
    "transcribe natural conversation",
    "transcribe conversational tagalog and english",
];

const MAX_DEPTH: usize = 8;

/// Pull transcript text out of a server reply, if it carries any
pub fn extract_transcript(raw: &str) -> Option<String> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return clean(raw),
    };
    let obj = parsed.as_object()?;

    if let Some(Value::Array(segments)) = obj.get("segments") {
        let mut parts = Vec::new();
        for seg in segments {
            collect_text(seg, &mut parts, 0);
        }
        if let Some(joined) = join_parts(&parts) {
            return Some(joined);
        }
    }

    let candidates = [
        obj.get("text"),
        obj.get("transcript"),
        obj.get("result").and_then(|r| r.get("text")),
        obj.get("data").and_then(|d| d.get("text")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(text) = candidate.as_str().and_then(clean) {
            return Some(text);
        }
    }

    let mut parts = Vec::new();
    collect_text(&parsed, &mut parts, 0);
    join_parts(&parts)
}

fn collect_text(node: &Value, out: &mut Vec<String>, depth: usize) {
    if depth > MAX_DEPTH {
        return;
    }

    match node {
        Value::String(s) => {
            if let Some(t) = clean(s) {
                out.push(t);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_text(item, out, depth + 1);
            }
        }
        Value::Object(obj) => {
            for (key, value) in obj {
                if SKIP_KEYS.contains(&key.as_str()) || !TEXT_KEYS.contains(&key.as_str()) {
                    continue;
                }
                match value.as_str().and_then(clean) {
                    Some(t) => out.push(t),
                    None => collect_text(value, out, depth + 1),
                }
            }
            for (key, value) in obj {
                if SKIP_KEYS.contains(&key.as_str()) || TEXT_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if value.is_object() || value.is_array() {
                    collect_text(value, out, depth + 1);
                }
            }
        }
        _ => {}
    }
}

fn join_parts(parts: &[String]) -> Option<String> {
    let joined = parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() || is_prompt_echo(&joined) || !has_letters(&joined) {
        return None;
    }
    Some(joined)
}

fn clean(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || is_prompt_echo(t) {
        return None;
    }
    if !has_letters(t) && looks_like_only_numbers(t) {
        return None;
    }
    Some(t.to_string())
}

fn is_prompt_echo(text: &str) -> bool {
    let low = text.to_lowercase();
    PROMPT_ECHOES.iter().any(|p| low.contains(p))
}

fn has_letters(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

fn looks_like_only_numbers(text: &str) -> bool {
    text.split_whitespace().all(is_plain_number)
}

/// Optional `-`, digits, then optionally `.` and more digits
fn is_plain_number(tok: &str) -> bool {
    let unsigned = tok.strip_prefix('-').unwrap_or(tok);
    let (whole, frac) = match unsigned.split_once('.') {
        Some((whole, frac)) => (whole, Some(frac)),
        None => (unsigned, None),
    };
    let is_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    is_digits(whole) && frac.map_or(true, is_digits)
}
