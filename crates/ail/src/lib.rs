//! AIL, the AI Intermediate Language.
//!
//! An AIL [`Program`] is a flat instruction stream describing a chat
//! inference request or response: model selection, tool definitions,
//! messages with text / thinking / tool-call / tool-result bodies, and
//! streaming deltas. Vendor wire formats (OpenAI chat completions,
//! Anthropic messages, Google GenAI) are converted to and from AIL by the
//! codecs in [`styles`], so everything between the wire boundaries
//! operates on a single representation.
//!
//! Programs also round-trip through a compact binary encoding (magic
//! `AIL\x00`, see [`Program::encode`]) and a line-oriented textual
//! disassembly (see [`Program::disasm`] / [`Program::asm`]).

mod binary;
mod error;
mod op;
mod program;
mod text;

pub mod styles;

pub use binary::MAGIC;
pub use error::Error;
pub use op::{Op, OperandKind, Role};
pub use program::{CallSpan, DefSpan, Instruction, MessageSpan, Program, ResultSpan};
pub use styles::{codec_for, Style, StyleCodec, StreamConverter};
