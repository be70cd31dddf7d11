//! Operator descriptors and the role enumeration of dense attention operands.

use crate::{EngineKind, KernelKind, KernelProp, TensorDesc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Fixed operand roles of a dense multi-head attention operator.
///
/// The discriminant is the slot index in both the tensor-descriptor list and
/// the runtime buffer array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum MhaDenseIo {
    SrcQ = 0,
    SrcK = 1,
    SrcV = 2,
    Dst = 3,
    AttScale = 4,
    BinaryAdd = 5,
    Mask = 6,
    Workspace = 7,
}

impl MhaDenseIo {
    /// Number of role slots.
    pub const COUNT: usize = 8;

    pub const ALL: [MhaDenseIo; Self::COUNT] = [
        Self::SrcQ,
        Self::SrcK,
        Self::SrcV,
        Self::Dst,
        Self::AttScale,
        Self::BinaryAdd,
        Self::Mask,
        Self::Workspace,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// Roles the kernel writes to; every other role is read-only.
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Dst | Self::Workspace)
    }
}

impl fmt::Display for MhaDenseIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MhaDenseIo::SrcQ => "SRC_Q",
            MhaDenseIo::SrcK => "SRC_K",
            MhaDenseIo::SrcV => "SRC_V",
            MhaDenseIo::Dst => "DST",
            MhaDenseIo::AttScale => "ATT_SCALE",
            MhaDenseIo::BinaryAdd => "BINARY_ADD",
            MhaDenseIo::Mask => "MASK",
            MhaDenseIo::Workspace => "WORKSPACE",
        };
        f.write_str(name)
    }
}

/// Well-known attribute keys.
pub mod attr {
    /// Use the polynomial exponential approximation inside softmax.
    pub const APPROX_EXP: &str = "approx_exp";
    /// Subtract the row maximum before exponentiating.
    pub const STABLE_SOFTMAX: &str = "stable_softmax";
    /// Instruction tier requested for the dense kernel (`auto` by default).
    pub const ISA: &str = "isa";
    /// Optional cross-check that the BINARY_ADD role is populated.
    pub const HAS_BADD: &str = "has_badd";
    /// Optional cross-check that the MASK role is populated.
    pub const HAS_PMASK: &str = "has_pmask";
}

/// Immutable description of one operator instance.
///
/// Construction stores its inputs and nothing more; consistency between the
/// roles is checked when a kernel descriptor is created from it.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorDesc {
    kind: KernelKind,
    prop: KernelProp,
    engine: EngineKind,
    tensor_descs: Vec<TensorDesc>,
    attrs: HashMap<String, String>,
}

impl OperatorDesc {
    pub fn new(
        kind: KernelKind,
        prop: KernelProp,
        engine: EngineKind,
        mut tensor_descs: Vec<TensorDesc>,
        attrs: HashMap<String, String>,
    ) -> Self {
        if tensor_descs.len() < MhaDenseIo::COUNT {
            tensor_descs.resize(MhaDenseIo::COUNT, TensorDesc::undef());
        }
        Self { kind, prop, engine, tensor_descs, attrs }
    }

    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    pub fn prop(&self) -> KernelProp {
        self.prop
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn tensor_descs(&self) -> &[TensorDesc] {
        &self.tensor_descs
    }

    pub fn tensor_desc(&self, role: MhaDenseIo) -> &TensorDesc {
        &self.tensor_descs[role.index()]
    }

    pub fn attrs(&self) -> &HashMap<String, String> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Boolean attribute lookup. Unparseable values fall back to `default`.
    pub fn attr_bool(&self, key: &str, default: bool) -> bool {
        self.attr(key).and_then(parse_bool).unwrap_or(default)
    }

    /// Typed attribute lookup. Unparseable values fall back to `default`.
    pub fn attr_parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.attr(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    }
}

/// Parse the boolean spellings used in attribute maps ("True", "false", "1", ...).
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
