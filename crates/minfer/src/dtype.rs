use serde::{Deserialize, Serialize};

/// Enumerates the scalar element types tensors can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    Bf16,
    I64,
    I32,
    I8,
    U8,
}

impl DataType {
    /// Storage size of one scalar in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 | DataType::Bf16 => 2,
            DataType::I64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16 | DataType::Bf16)
    }

    /// Returns `true` when the dtype is a signed or unsigned integer.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::I64 | DataType::I32 | DataType::I8 | DataType::U8
        )
    }
}
