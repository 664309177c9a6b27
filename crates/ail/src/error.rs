use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing or invalid AIL magic header")]
    BadMagic,

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("corrupt program: {0}")]
    Corrupt(&'static str),

    #[error("invalid json operand: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid utf-8 in operand: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("malformed {style} payload: {message}")]
    Wire { style: &'static str, message: String },
}

impl Error {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        Error::Syntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn wire(style: &'static str, message: impl Into<String>) -> Self {
        Error::Wire {
            style,
            message: message.into(),
        }
    }
}
