/// Operand payload carried by an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Text,
    Json,
}

macro_rules! opcodes {
    ($( $variant:ident = $byte:literal, $mnemonic:literal, $operand:ident; )*) => {
        /// An AIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $( $variant = $byte, )*
        }

        impl Op {
            pub fn from_u8(byte: u8) -> Option<Op> {
                match byte {
                    $( $byte => Some(Op::$variant), )*
                    _ => None,
                }
            }

            /// Mnemonic used by the textual disassembly.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Op::$variant => $mnemonic, )*
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Op> {
                match name {
                    $( $mnemonic => Some(Op::$variant), )*
                    _ => None,
                }
            }

            pub fn operand(self) -> OperandKind {
                match self {
                    $( Op::$variant => OperandKind::$operand, )*
                }
            }
        }
    };
}

opcodes! {
    // Configuration.
    SetModel = 0x01, "set_model", Text;
    SetStream = 0x02, "set_stream", None;

    // Response metadata.
    RespId = 0x08, "resp_id", Text;
    RespModel = 0x09, "resp_model", Text;
    RespDone = 0x0a, "resp_done", Text;

    // Tool definitions.
    DefStart = 0x10, "def_start", None;
    DefName = 0x11, "def_name", Text;
    DefDesc = 0x12, "def_desc", Text;
    DefSchema = 0x13, "def_schema", Json;
    DefEnd = 0x14, "def_end", None;

    // Messages.
    MsgStart = 0x20, "msg_start", None;
    MsgEnd = 0x21, "msg_end", None;
    RoleSystem = 0x22, "role_system", None;
    RoleUser = 0x23, "role_user", None;
    RoleAssistant = 0x24, "role_assistant", None;
    RoleTool = 0x25, "role_tool", None;

    // Message body.
    TxtChunk = 0x30, "txt_chunk", Text;
    ThinkStart = 0x31, "think_start", None;
    ThinkChunk = 0x32, "think_chunk", Text;
    ThinkEnd = 0x33, "think_end", None;
    CallStart = 0x40, "call_start", Text;
    CallName = 0x41, "call_name", Text;
    CallArgs = 0x42, "call_args", Json;
    CallEnd = 0x43, "call_end", None;
    ResultStart = 0x48, "result_start", Text;
    ResultData = 0x49, "result_data", Text;
    ResultEnd = 0x4a, "result_end", None;

    // Streaming deltas.
    StreamStart = 0x60, "stream_start", None;
    StreamDelta = 0x61, "stream_delta", Text;
    StreamThinkDelta = 0x62, "stream_think_delta", Text;
    StreamToolDelta = 0x63, "stream_tool_delta", Json;
}

/// A message role marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn op(self) -> Op {
        match self {
            Role::System => Op::RoleSystem,
            Role::User => Op::RoleUser,
            Role::Assistant => Op::RoleAssistant,
            Role::Tool => Op::RoleTool,
        }
    }

    pub fn from_op(op: Op) -> Option<Role> {
        match op {
            Op::RoleSystem => Some(Role::System),
            Op::RoleUser => Some(Role::User),
            Op::RoleAssistant => Some(Role::Assistant),
            Op::RoleTool => Some(Role::Tool),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn from_str(name: &str) -> Option<Role> {
        match name {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" | "model" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Op::from_u8(byte) {
                assert_eq!(op as u8, byte);
                assert_eq!(Op::from_mnemonic(op.mnemonic()), Some(op));
            }
        }
    }

    #[test]
    fn role_markers_map_both_ways() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::from_op(role.op()), Some(role));
            assert_eq!(Role::from_str(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_op(Op::TxtChunk), None);
    }
}
