//! Reference dense attention.
//!
//! Materialises every score row, applies softmax and reduces against V in
//! the most direct order possible. It is single-threaded, needs no
//! workspace, and serves as the oracle the tiled kernel is checked against.

use super::simd_math::exp_fn;
use super::{AttentionKernel, AuxOperands, head_offset};
use crate::kernel_desc::KernelDesc;
use crate::runtime::{Inputs, RuntimeData, cast_prefix_mut};
use half::bf16;
use half::slice::HalfFloatSliceExt;
use mha_common::{DataType, ExecutionError, MhaDenseIo, Result};
use std::sync::Arc;

#[derive(Debug)]
pub struct RefKernel {
    desc: Arc<KernelDesc>,
}

impl RefKernel {
    pub fn new(desc: Arc<KernelDesc>) -> Self {
        Self { desc }
    }
}

fn load_f32(inputs: &Inputs<'_>, role: MhaDenseIo, dtype: DataType, elems: usize) -> Result<Vec<f32>> {
    match dtype {
        DataType::Bf16 => {
            let src = inputs.typed::<bf16>(role, elems)?;
            let mut out = vec![0.0f32; elems];
            src.convert_to_f32_slice(&mut out);
            Ok(out)
        }
        _ => Ok(inputs.typed::<f32>(role, elems)?.to_vec()),
    }
}

impl AttentionKernel for RefKernel {
    fn desc(&self) -> &Arc<KernelDesc> {
        &self.desc
    }

    fn workspace_size(&self) -> usize {
        0
    }

    fn execute(&self, data: &mut RuntimeData<'_>) -> Result<()> {
        let s = *self.desc.shape();
        let policy = self.desc.softmax();
        let exp = exp_fn(policy.approx_exp);

        let inputs = data.inputs();
        let q = load_f32(&inputs, MhaDenseIo::SrcQ, s.src_dtype, s.q_elems())?;
        let k = load_f32(&inputs, MhaDenseIo::SrcK, s.src_dtype, s.kv_elems())?;
        let v = load_f32(&inputs, MhaDenseIo::SrcV, s.src_dtype, s.kv_elems())?;
        let aux = AuxOperands::read(&inputs, &s)?;

        let hs = s.head_size;
        let mut out = vec![0.0f32; s.q_elems()];
        let mut probs = vec![0.0f32; s.sl_n];

        for b in 0..s.bs {
            let valid = aux.valid_len(b, s.sl_n);
            if valid == 0 {
                continue;
            }
            for h in 0..s.head_num {
                for i in 0..s.sl_m {
                    let qo = head_offset(&s, s.sl_m, b, i, h);
                    let q_row = &q[qo..qo + hs];

                    for (j, p) in probs[..valid].iter_mut().enumerate() {
                        let ko = head_offset(&s, s.sl_n, b, j, h);
                        let dot: f32 = q_row.iter().zip(&k[ko..ko + hs]).map(|(x, y)| x * y).sum();
                        *p = aux.scale * dot + aux.bias.map_or(0.0, |bias| bias[i * s.sl_n + j]);
                    }

                    let shift = if policy.stable {
                        probs[..valid].iter().copied().fold(f32::NEG_INFINITY, f32::max)
                    } else {
                        0.0
                    };
                    // Fully masked row: leave it zero.
                    if shift == f32::NEG_INFINITY {
                        continue;
                    }
                    let mut sum = 0.0f32;
                    for p in &mut probs[..valid] {
                        *p = exp(*p - shift);
                        sum += *p;
                    }
                    if sum <= 0.0 {
                        continue;
                    }
                    let inv = 1.0 / sum;

                    let out_row = &mut out[qo..qo + hs];
                    for (j, &p) in probs[..valid].iter().enumerate() {
                        let vo = head_offset(&s, s.sl_n, b, j, h);
                        let w = p * inv;
                        for (o, &x) in out_row.iter_mut().zip(&v[vo..vo + hs]) {
                            *o += w * x;
                        }
                    }
                }
            }
        }

        let dst = data.dst_mut().ok_or(ExecutionError::MissingBuffer { role: MhaDenseIo::Dst })?;
        match s.dst_dtype {
            DataType::Bf16 => {
                cast_prefix_mut::<bf16>(MhaDenseIo::Dst, dst, s.q_elems())?.convert_from_f32_slice(&out)
            }
            _ => cast_prefix_mut::<f32>(MhaDenseIo::Dst, dst, s.q_elems())?.copy_from_slice(&out),
        }
        Ok(())
    }
}
