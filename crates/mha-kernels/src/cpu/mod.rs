//! CPU attention kernels

pub mod mha_dense;
pub mod reference;
pub mod simd_math;

pub use mha_dense::{DenseKernel, TILE_M, TILE_N};
pub use reference::RefKernel;
pub use simd_math::{SimdOps, approx_exp};

use crate::kernel_desc::{KernelDesc, MhaDenseShape};
use crate::runtime::{Inputs, RuntimeData};
use mha_common::{MhaDenseIo, Result};
use std::sync::Arc;

/// Interface shared by every attention implementation.
pub trait AttentionKernel: Send + Sync {
    fn desc(&self) -> &Arc<KernelDesc>;

    /// Scratch bytes the caller must bind to `Workspace`.
    fn workspace_size(&self) -> usize;

    fn execute(&self, data: &mut RuntimeData<'_>) -> Result<()>;
}

/// Scale, bias and mask operands, validated against the descriptor shape.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AuxOperands<'a> {
    pub scale: f32,
    /// `[sl_m, sl_n]` row-major.
    pub bias: Option<&'a [f32]>,
    /// One valid key length per batch.
    pub mask: Option<&'a [i32]>,
}

impl<'a> AuxOperands<'a> {
    pub fn read(inputs: &Inputs<'a>, shape: &MhaDenseShape) -> Result<Self> {
        let scale = inputs.typed::<f32>(MhaDenseIo::AttScale, 1)?[0];
        let bias = if shape.has_badd {
            Some(inputs.typed::<f32>(MhaDenseIo::BinaryAdd, shape.bias_elems())?)
        } else {
            None
        };
        let mask =
            if shape.has_pmask { Some(inputs.typed::<i32>(MhaDenseIo::Mask, shape.bs)?) } else { None };
        Ok(Self { scale, bias, mask })
    }

    /// Keys of batch `b` that take part in softmax, `clamp(mask[b], 0, sl_n)`.
    pub fn valid_len(&self, b: usize, sl_n: usize) -> usize {
        match self.mask {
            Some(mask) => mask[b].clamp(0, sl_n.min(i32::MAX as usize) as i32) as usize,
            None => sl_n,
        }
    }
}

/// Offset of `[b, pos, h, 0]` in a `[bs, seq, head_num, head_size]` tensor.
#[inline]
pub(crate) fn head_offset(shape: &MhaDenseShape, seq: usize, b: usize, pos: usize, h: usize) -> usize {
    ((b * seq + pos) * shape.head_num + h) * shape.head_size
}
