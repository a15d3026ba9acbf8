//! Operation codes for the binary protocol.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Helo = 0x1f,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    Observe = 0x92,
    GetAndLock = 0x94,
    Unlock = 0x95,
    GetCidByName = 0xbb,
    SubDocMultiLookup = 0xd0,
    SubDocMultiMutation = 0xd1,
    GetErrorMap = 0xfe,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x00 => OpCode::Get,
            0x01 => OpCode::Set,
            0x02 => OpCode::Add,
            0x03 => OpCode::Replace,
            0x04 => OpCode::Delete,
            0x05 => OpCode::Increment,
            0x06 => OpCode::Decrement,
            0x0e => OpCode::Append,
            0x0f => OpCode::Prepend,
            0x1c => OpCode::Touch,
            0x1d => OpCode::GetAndTouch,
            0x1f => OpCode::Helo,
            0x83 => OpCode::GetReplica,
            0x89 => OpCode::SelectBucket,
            0x92 => OpCode::Observe,
            0x94 => OpCode::GetAndLock,
            0x95 => OpCode::Unlock,
            0xbb => OpCode::GetCidByName,
            0xd0 => OpCode::SubDocMultiLookup,
            0xd1 => OpCode::SubDocMultiMutation,
            0xfe => OpCode::GetErrorMap,
            _ => return None,
        })
    }

    /// Pure reads and CID lookups may be retried without side effects.
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OpCode::Get
                | OpCode::GetReplica
                | OpCode::Observe
                | OpCode::GetCidByName
                | OpCode::SubDocMultiLookup
                | OpCode::GetErrorMap
                | OpCode::Helo
        )
    }

    /// Whether the server may change document state executing this opcode.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            OpCode::Set
                | OpCode::Add
                | OpCode::Replace
                | OpCode::Delete
                | OpCode::Increment
                | OpCode::Decrement
                | OpCode::Append
                | OpCode::Prepend
                | OpCode::Touch
                | OpCode::GetAndTouch
                | OpCode::GetAndLock
                | OpCode::Unlock
                | OpCode::SubDocMultiMutation
        )
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02x})", self.as_u8())
    }
}
