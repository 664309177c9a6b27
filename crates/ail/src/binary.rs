use std::io::{Read, Write};

use serde_json::Value;

use crate::error::Error;
use crate::op::Op;
use crate::program::{Instruction, Program};

/// Four-byte header of binary AIL.
pub const MAGIC: &[u8; 4] = b"AIL\x00";

/// Upper bound on a single operand / buffer, to reject corrupt headers
/// before allocating.
const MAX_FIELD: u32 = 64 * 1024 * 1024;

const FLAG_TEXT: u8 = 0b01;
const FLAG_JSON: u8 = 0b10;

impl Program {
    /// Writes the compact binary encoding: magic, instruction count, then
    /// per instruction an opcode byte, a flags byte, and length-prefixed
    /// operands; then the buffer table.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_all(MAGIC)?;
        write_u32(w, self.code.len() as u32)?;
        for inst in &self.code {
            w.write_all(&[inst.op as u8])?;
            let mut flags = 0u8;
            if !inst.text.is_empty() {
                flags |= FLAG_TEXT;
            }
            if inst.json.is_some() {
                flags |= FLAG_JSON;
            }
            w.write_all(&[flags])?;
            if flags & FLAG_TEXT != 0 {
                write_bytes(w, inst.text.as_bytes())?;
            }
            if let Some(json) = &inst.json {
                write_bytes(w, &serde_json::to_vec(json)?)?;
            }
        }
        write_u32(w, self.buffers.len() as u32)?;
        for buf in &self.buffers {
            write_bytes(w, buf)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Program, Error> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }

        let count = read_u32(r)?;
        if count > MAX_FIELD {
            return Err(Error::Corrupt("instruction count out of range"));
        }
        let mut code = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            let mut head = [0u8; 2];
            r.read_exact(&mut head)?;
            let op = Op::from_u8(head[0]).ok_or(Error::UnknownOpcode(head[0]))?;
            let flags = head[1];
            let mut inst = Instruction::new(op);
            if flags & FLAG_TEXT != 0 {
                inst.text = String::from_utf8(read_bytes(r)?)?;
            }
            if flags & FLAG_JSON != 0 {
                inst.json = Some(serde_json::from_slice::<Value>(&read_bytes(r)?)?);
            }
            code.push(inst);
        }

        let buffer_count = read_u32(r)?;
        if buffer_count > MAX_FIELD {
            return Err(Error::Corrupt("buffer count out of range"));
        }
        let mut buffers = Vec::with_capacity(buffer_count.min(64) as usize);
        for _ in 0..buffer_count {
            buffers.push(read_bytes(r)?);
        }

        Ok(Program { code, buffers })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Program, Error> {
        let mut cursor = data;
        Program::decode(&mut cursor)
    }

    /// True when the data starts with the binary AIL magic.
    pub fn is_binary(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() && &data[..MAGIC.len()] == MAGIC
    }
}

fn write_u32<W: Write>(w: &mut W, value: u32) -> std::io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

fn write_bytes<W: Write>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    write_u32(w, data.len() as u32)?;
    w.write_all(data)
}

fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let len = read_u32(r)?;
    if len > MAX_FIELD {
        return Err(Error::Corrupt("field length out of range"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_round_trip() {
        let mut p = Program::new();
        p.emit_text(Op::SetModel, "prov/m");
        p.emit(Op::SetStream);
        p.emit(Op::MsgStart);
        p.emit(Op::RoleUser);
        p.emit_text(Op::TxtChunk, "hí ✓ multi\nline");
        p.emit(Op::MsgEnd);
        p.emit(Op::MsgStart);
        p.emit(Op::RoleAssistant);
        p.emit_text(Op::CallStart, "call_1");
        p.emit_text(Op::CallName, "lookup");
        p.emit_json(Op::CallArgs, json!({"q": "x", "n": 3}));
        p.emit(Op::CallEnd);
        p.emit(Op::MsgEnd);
        p.buffers.push(vec![0, 1, 2, 255]);

        let bytes = p.to_bytes().unwrap();
        assert!(Program::is_binary(&bytes));
        let decoded = Program::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            Program::from_bytes(b"NOPE\x00\x00\x00\x00"),
            Err(Error::BadMagic)
        ));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0]);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            Program::from_bytes(&bytes),
            Err(Error::UnknownOpcode(0xff))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let mut p = Program::new();
        p.emit_text(Op::SetModel, "m");
        let bytes = p.to_bytes().unwrap();
        assert!(Program::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }
}
