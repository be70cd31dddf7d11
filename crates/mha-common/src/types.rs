//! Element types, memory formats and operator kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element data type of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Fp32,
    Bf16,
    S32,
    U8,
    S8,
    /// Slot unused; the operand is absent.
    Undef,
}

impl DataType {
    /// Size of one element in bytes (`0` for [`DataType::Undef`]).
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Fp32 | Self::S32 => 4,
            Self::Bf16 => 2,
            Self::U8 | Self::S8 => 1,
            Self::Undef => 0,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::Fp32 | Self::Bf16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Fp32 => write!(f, "fp32"),
            DataType::Bf16 => write!(f, "bf16"),
            DataType::S32 => write!(f, "s32"),
            DataType::U8 => write!(f, "u8"),
            DataType::S8 => write!(f, "s8"),
            DataType::Undef => write!(f, "undef"),
        }
    }
}

/// Axis ordering of a tensor in memory. Letters name logical axes in
/// row-major order, so `Abcd` is a plain contiguous 4-D tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    Undef,
    A,
    Ab,
    Abc,
    Abcd,
}

impl FormatType {
    /// Number of axes the format describes (`None` for `Undef`).
    pub const fn rank(self) -> Option<usize> {
        match self {
            Self::Undef => None,
            Self::A => Some(1),
            Self::Ab => Some(2),
            Self::Abc => Some(3),
            Self::Abcd => Some(4),
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatType::Undef => write!(f, "undef"),
            FormatType::A => write!(f, "a"),
            FormatType::Ab => write!(f, "ab"),
            FormatType::Abc => write!(f, "abc"),
            FormatType::Abcd => write!(f, "abcd"),
        }
    }
}

/// Operation family of an operator descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum KernelKind {
    /// Dense multi-head attention.
    MhaDense,
}

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum KernelProp {
    ForwardInference,
}

/// Target engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EngineKind {
    Cpu,
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelKind::MhaDense => write!(f, "mha_dense"),
        }
    }
}

impl fmt::Display for KernelProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelProp::ForwardInference => write!(f, "forward_inference"),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Cpu => write!(f, "cpu"),
        }
    }
}
