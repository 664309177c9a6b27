//! Vendor wire-format ("style") codecs.
//!
//! Each style converts between its wire bytes and AIL programs in six
//! directions: request parse/emit, response parse/emit, and stream-chunk
//! parse/emit. Cross-style streaming goes through [`StreamConverter`],
//! which owns the state needed to re-frame one vendor's delta stream as
//! another's.

mod anthropic;
mod chat_completions;
mod convert;
mod google;

pub use convert::StreamConverter;

use crate::error::Error;
use crate::program::Program;

/// A vendor wire format with full codec support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    /// OpenAI `/chat/completions`.
    ChatCompletions,
    /// Anthropic `/v1/messages`.
    Anthropic,
    /// Google GenAI `models/{model}:generateContent`.
    GoogleGenAi,
}

impl Style {
    pub fn as_str(self) -> &'static str {
        match self {
            Style::ChatCompletions => "openai-chat-completions",
            Style::Anthropic => "anthropic-messages",
            Style::GoogleGenAi => "google-genai",
        }
    }
}

impl std::fmt::Display for Style {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bidirectional converter between one wire format and AIL.
pub trait StyleCodec: Send + Sync {
    fn parse_request(&self, data: &[u8]) -> Result<Program, Error>;
    fn emit_request(&self, prog: &Program) -> Result<Vec<u8>, Error>;
    fn parse_response(&self, data: &[u8]) -> Result<Program, Error>;
    fn parse_stream_chunk(&self, data: &[u8]) -> Result<Program, Error>;
    fn emit_response(&self, prog: &Program) -> Result<Vec<u8>, Error>;
    fn emit_stream_chunk(&self, prog: &Program) -> Result<Vec<u8>, Error>;
}

/// The codec for a style.
pub fn codec_for(style: Style) -> &'static dyn StyleCodec {
    match style {
        Style::ChatCompletions => &chat_completions::ChatCompletionsCodec,
        Style::Anthropic => &anthropic::AnthropicCodec,
        Style::GoogleGenAi => &google::GoogleGenAiCodec,
    }
}

/// Canonical shape of a `StreamToolDelta` operand, shared by every codec:
/// `{"index": n, "id": …, "name": …, "arguments": "<partial json>"}` with
/// all but `index` optional.
pub(crate) mod tool_delta {
    use serde_json::{json, Value};

    pub fn build(
        index: i64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Value {
        let mut delta = json!({ "index": index });
        if let Some(id) = id {
            delta["id"] = json!(id);
        }
        if let Some(name) = name {
            delta["name"] = json!(name);
        }
        if let Some(arguments) = arguments {
            delta["arguments"] = json!(arguments);
        }
        delta
    }

    pub fn index(delta: &Value) -> i64 {
        delta.get("index").and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn id(delta: &Value) -> Option<&str> {
        delta.get("id").and_then(Value::as_str)
    }

    pub fn name(delta: &Value) -> Option<&str> {
        delta.get("name").and_then(Value::as_str)
    }

    pub fn arguments(delta: &Value) -> Option<&str> {
        delta.get("arguments").and_then(Value::as_str)
    }
}
