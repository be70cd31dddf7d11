//! Tensor descriptors: shape, element type and memory format of one operand.

use crate::{DataType, FormatType};
use serde::{Deserialize, Serialize};

/// Describes one operand without owning any data.
///
/// A descriptor with [`DataType::Undef`] marks an unused role slot; its size
/// is zero and the matching buffer must never be dereferenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    shape: Vec<usize>,
    dtype: DataType,
    format: FormatType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DataType, format: FormatType) -> Self {
        Self { shape: shape.into(), dtype, format }
    }

    /// The "slot unused" descriptor.
    pub fn undef() -> Self {
        Self { shape: Vec::new(), dtype: DataType::Undef, format: FormatType::Undef }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn format(&self) -> FormatType {
        self.format
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements, or `None` when the product overflows `usize`.
    /// An empty shape on a defined dtype is a scalar.
    pub fn checked_elem_count(&self) -> Option<usize> {
        if self.is_undef() || self.shape.contains(&0) {
            return Some(0);
        }
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Total size in bytes, or `None` when it overflows `usize`.
    pub fn checked_size(&self) -> Option<usize> {
        self.checked_elem_count()?.checked_mul(self.dtype.size_in_bytes())
    }

    /// Number of elements, saturating at `usize::MAX`.
    pub fn elem_count(&self) -> usize {
        self.checked_elem_count().unwrap_or(usize::MAX)
    }

    /// Total size in bytes, saturating at `usize::MAX`.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    pub fn is_undef(&self) -> bool {
        self.dtype == DataType::Undef
    }

    /// True when the descriptor names an operand that actually holds data.
    pub fn is_present(&self) -> bool {
        !self.is_undef() && self.size() > 0
    }
}

impl Default for TensorDesc {
    fn default() -> Self {
        Self::undef()
    }
}
