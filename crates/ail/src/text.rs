//! Textual disassembly: one instruction per line, mnemonic followed by the
//! operand (JSON-escaped string or compact JSON). The assembler skips
//! blank lines and `;` / `#` comments, so annotated disassembly (chunk
//! markers, sampler phase notes) assembles back cleanly.

use base64::Engine;
use serde_json::Value;

use crate::error::Error;
use crate::op::OperandKind;
use crate::op::Op;
use crate::program::{Instruction, Program};

const BUFFER_DIRECTIVE: &str = ".buffer";

impl Program {
    /// Renders the program as line-oriented text that [`Program::asm`]
    /// parses back.
    pub fn disasm(&self) -> String {
        let mut out = String::new();
        for inst in &self.code {
            out.push_str(inst.op.mnemonic());
            match inst.op.operand() {
                OperandKind::None => {}
                OperandKind::Text => {
                    out.push(' ');
                    // serde_json renders the escaped, quoted form.
                    out.push_str(&serde_json::to_string(&inst.text).unwrap_or_default());
                }
                OperandKind::Json => {
                    out.push(' ');
                    let json = inst.json.clone().unwrap_or(Value::Null);
                    out.push_str(&serde_json::to_string(&json).unwrap_or_default());
                }
            }
            out.push('\n');
        }
        for buf in &self.buffers {
            out.push_str(BUFFER_DIRECTIVE);
            out.push(' ');
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(buf));
            out.push('\n');
        }
        out
    }

    /// Parses disassembly text back into a program.
    pub fn asm(text: &str) -> Result<Program, Error> {
        let mut prog = Program::new();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            let (head, rest) = match line.split_once(char::is_whitespace) {
                Some((head, rest)) => (head, rest.trim_start()),
                None => (line, ""),
            };

            if head == BUFFER_DIRECTIVE {
                let buf = base64::engine::general_purpose::STANDARD
                    .decode(rest)
                    .map_err(|e| Error::syntax(line_no, format!("bad buffer payload: {e}")))?;
                prog.buffers.push(buf);
                continue;
            }

            let op = Op::from_mnemonic(head)
                .ok_or_else(|| Error::syntax(line_no, format!("unknown mnemonic {head:?}")))?;
            let inst = match op.operand() {
                OperandKind::None => {
                    if !rest.is_empty() {
                        return Err(Error::syntax(line_no, "unexpected operand"));
                    }
                    Instruction::new(op)
                }
                OperandKind::Text => {
                    let text: String = serde_json::from_str(rest)
                        .map_err(|e| Error::syntax(line_no, format!("bad string operand: {e}")))?;
                    Instruction::with_text(op, text)
                }
                OperandKind::Json => {
                    let json: Value = serde_json::from_str(rest)
                        .map_err(|e| Error::syntax(line_no, format!("bad json operand: {e}")))?;
                    Instruction::with_json(op, json)
                }
            };
            prog.code.push(inst);
        }
        Ok(prog)
    }
}
