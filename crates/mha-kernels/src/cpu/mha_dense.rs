//! Tiled multi-threaded dense attention for bf16 operands.
//!
//! The output is cut into `(batch, query tile)` units of [`TILE_M`] rows.
//! Each unit walks every head: it converts its Q tile to f32 (pre-scaled),
//! streams K/V through in [`TILE_N`]-key blocks up to the batch's valid
//! length, and keeps a running softmax so the full score matrix is never
//! materialised.
//!
//! Units are dealt round-robin to `n_threads` workers of a private rayon
//! pool. Every worker owns one slice of the caller's workspace, and every
//! unit owns a contiguous slice of DST, so the only synchronisation is the
//! join at the end of `execute`.

use super::simd_math::{SimdOps, exp_fn};
use super::{AttentionKernel, AuxOperands, head_offset};
use crate::kernel_desc::{KernelDesc, MhaDenseShape, SoftmaxPolicy};
use crate::runtime::{RuntimeData, cast_prefix_mut};
use crate::workspace::WORKSPACE_ALIGN;
use half::bf16;
use half::slice::HalfFloatSliceExt;
use mha_common::{ConstructionError, ExecutionError, MhaDenseIo, Result};
use rayon::prelude::*;
use std::sync::Arc;

/// Query rows per work unit.
pub const TILE_M: usize = 32;
/// Keys per streamed K/V block.
pub const TILE_N: usize = 32;

const ALIGN_FLOATS: usize = WORKSPACE_ALIGN / std::mem::size_of::<f32>();

fn pad(n: usize) -> usize {
    n.div_ceil(ALIGN_FLOATS) * ALIGN_FLOATS
}

/// Per-worker scratch layout, every section 64-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScratchLayout {
    q: usize,
    kv: usize,
    scores: usize,
    acc: usize,
    stats: usize,
}

impl ScratchLayout {
    fn new(head_size: usize) -> Self {
        Self {
            q: pad(TILE_M * head_size),
            kv: pad(TILE_N * head_size),
            scores: pad(TILE_M * TILE_N),
            acc: pad(TILE_M * head_size),
            stats: pad(TILE_M),
        }
    }

    /// Floats in one worker's block.
    fn floats(&self) -> usize {
        self.q + 2 * self.kv + self.scores + self.acc + 2 * self.stats
    }

    fn split<'a>(&self, block: &'a mut [f32]) -> Scratch<'a> {
        let (q, rest) = block.split_at_mut(self.q);
        let (k, rest) = rest.split_at_mut(self.kv);
        let (v, rest) = rest.split_at_mut(self.kv);
        let (scores, rest) = rest.split_at_mut(self.scores);
        let (acc, rest) = rest.split_at_mut(self.acc);
        let (row_max, rest) = rest.split_at_mut(self.stats);
        let (row_sum, _) = rest.split_at_mut(self.stats);
        Scratch { q, k, v, scores, acc, row_max, row_sum }
    }
}

struct Scratch<'a> {
    /// `[TILE_M, head_size]`, already multiplied by the attention scale.
    q: &'a mut [f32],
    k: &'a mut [f32],
    v: &'a mut [f32],
    /// `[TILE_M, TILE_N]`; holds scores, then softmax numerators.
    scores: &'a mut [f32],
    acc: &'a mut [f32],
    row_max: &'a mut [f32],
    row_sum: &'a mut [f32],
}

/// Output rows `[row0, row0 + rows)` of batch `b`, all heads.
struct TileUnit<'a> {
    b: usize,
    row0: usize,
    dst: &'a mut [bf16],
}

/// Read-only state shared by every worker during one `execute`.
struct TileCtx<'a> {
    shape: MhaDenseShape,
    softmax: SoftmaxPolicy,
    ops: SimdOps,
    q: &'a [bf16],
    k: &'a [bf16],
    v: &'a [bf16],
    aux: AuxOperands<'a>,
}

#[derive(Debug)]
pub struct DenseKernel {
    desc: Arc<KernelDesc>,
    ops: SimdOps,
    layout: ScratchLayout,
    pool: Option<rayon::ThreadPool>,
}

impl DenseKernel {
    /// Bind to `desc`, spawning a pool of `desc.n_threads()` workers when
    /// more than one is requested.
    pub fn new(desc: Arc<KernelDesc>) -> Result<Self> {
        let n_threads = desc.n_threads();
        let pool = if n_threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .thread_name(|i| format!("mha-dense-{i}"))
                .build()
                .map_err(|e| ConstructionError::ThreadPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        let ops = SimdOps::new(desc.isa());
        let layout = ScratchLayout::new(desc.shape().head_size);
        Ok(Self { desc, ops, layout, pool })
    }

    fn worker_bytes(&self) -> usize {
        self.layout.floats() * std::mem::size_of::<f32>()
    }

    fn run_worker(ctx: &TileCtx<'_>, layout: &ScratchLayout, units: Vec<TileUnit<'_>>, block: &mut [f32]) {
        let mut scratch = layout.split(block);
        for unit in units {
            run_unit(ctx, unit, &mut scratch);
        }
    }
}

impl AttentionKernel for DenseKernel {
    fn desc(&self) -> &Arc<KernelDesc> {
        &self.desc
    }

    fn workspace_size(&self) -> usize {
        self.desc.n_threads() * self.worker_bytes()
    }

    fn execute(&self, data: &mut RuntimeData<'_>) -> Result<()> {
        let shape = *self.desc.shape();
        let inputs = data.inputs();
        let ctx = TileCtx {
            shape,
            softmax: self.desc.softmax(),
            ops: self.ops,
            q: inputs.typed::<bf16>(MhaDenseIo::SrcQ, shape.q_elems())?,
            k: inputs.typed::<bf16>(MhaDenseIo::SrcK, shape.kv_elems())?,
            v: inputs.typed::<bf16>(MhaDenseIo::SrcV, shape.kv_elems())?,
            aux: AuxOperands::read(&inputs, &shape)?,
        };

        let required = self.workspace_size();
        let (dst, workspace) = data.outputs_mut();
        let dst = dst.ok_or(ExecutionError::MissingBuffer { role: MhaDenseIo::Dst })?;
        let dst = cast_prefix_mut::<bf16>(MhaDenseIo::Dst, dst, shape.q_elems())?;
        let workspace = workspace.ok_or(ExecutionError::MissingBuffer { role: MhaDenseIo::Workspace })?;
        if workspace.len() < required {
            return Err(ExecutionError::WorkspaceTooSmall { required, actual: workspace.len() }.into());
        }
        let workspace = cast_prefix_mut::<f32>(
            MhaDenseIo::Workspace,
            workspace,
            required / std::mem::size_of::<f32>(),
        )?;

        let row_elems = shape.row_elems();
        let mut units = Vec::with_capacity(shape.bs * shape.sl_m.div_ceil(TILE_M));
        for (b, batch_dst) in dst.chunks_mut(shape.sl_m * row_elems).enumerate() {
            for (t, tile_dst) in batch_dst.chunks_mut(TILE_M * row_elems).enumerate() {
                units.push(TileUnit { b, row0: t * TILE_M, dst: tile_dst });
            }
        }

        let n_workers = self.desc.n_threads().min(units.len()).max(1);
        let mut buckets: Vec<Vec<TileUnit<'_>>> = (0..n_workers).map(|_| Vec::new()).collect();
        let n_units = units.len();
        for (i, unit) in units.into_iter().enumerate() {
            buckets[i % n_workers].push(unit);
        }
        let blocks: Vec<&mut [f32]> = workspace.chunks_mut(self.layout.floats()).take(n_workers).collect();
        log::trace!("{}: {n_units} tile units over {n_workers} workers", self.desc.name());

        let layout = &self.layout;
        match &self.pool {
            Some(pool) if n_workers > 1 => pool.install(|| {
                buckets
                    .into_par_iter()
                    .zip(blocks)
                    .for_each(|(bucket, block)| Self::run_worker(&ctx, layout, bucket, block));
            }),
            _ => {
                for (bucket, block) in buckets.into_iter().zip(blocks) {
                    Self::run_worker(&ctx, layout, bucket, block);
                }
            }
        }
        Ok(())
    }
}

fn run_unit(ctx: &TileCtx<'_>, unit: TileUnit<'_>, sc: &mut Scratch<'_>) {
    let s = &ctx.shape;
    let ops = &ctx.ops;
    let hs = s.head_size;
    let row_elems = s.row_elems();
    let rows = unit.dst.len() / row_elems;
    let valid = ctx.aux.valid_len(unit.b, s.sl_n);
    let approx = ctx.softmax.approx_exp;
    let exp = exp_fn(approx);

    for h in 0..s.head_num {
        if valid == 0 {
            for i in 0..rows {
                unit.dst[i * row_elems + h * hs..][..hs].fill(bf16::ZERO);
            }
            continue;
        }

        for i in 0..rows {
            let qo = head_offset(s, s.sl_m, unit.b, unit.row0 + i, h);
            let q_row = &mut sc.q[i * hs..(i + 1) * hs];
            ctx.q[qo..qo + hs].convert_to_f32_slice(q_row);
            ops.scale(ctx.aux.scale, q_row);
        }
        sc.acc[..rows * hs].fill(0.0);
        sc.row_max[..rows].fill(f32::NEG_INFINITY);
        sc.row_sum[..rows].fill(0.0);

        let mut j0 = 0;
        while j0 < valid {
            let kn = TILE_N.min(valid - j0);
            for j in 0..kn {
                let ko = head_offset(s, s.sl_n, unit.b, j0 + j, h);
                ctx.k[ko..ko + hs].convert_to_f32_slice(&mut sc.k[j * hs..(j + 1) * hs]);
                ctx.v[ko..ko + hs].convert_to_f32_slice(&mut sc.v[j * hs..(j + 1) * hs]);
            }

            for i in 0..rows {
                let q_row = &sc.q[i * hs..(i + 1) * hs];
                let scores = &mut sc.scores[i * TILE_N..i * TILE_N + kn];
                for (j, score) in scores.iter_mut().enumerate() {
                    *score = ops.dot(q_row, &sc.k[j * hs..(j + 1) * hs]);
                }
                if let Some(bias) = ctx.aux.bias {
                    let bo = (unit.row0 + i) * s.sl_n + j0;
                    for (score, &b) in scores.iter_mut().zip(&bias[bo..bo + kn]) {
                        *score += b;
                    }
                }

                let acc = &mut sc.acc[i * hs..(i + 1) * hs];
                let shift = if ctx.softmax.stable {
                    let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    // Every key in this block is masked out for row i.
                    if block_max == f32::NEG_INFINITY {
                        continue;
                    }
                    let prev = sc.row_max[i];
                    let next = prev.max(block_max);
                    if prev != f32::NEG_INFINITY && next > prev {
                        let rescale = exp(prev - next);
                        sc.row_sum[i] *= rescale;
                        ops.scale(rescale, acc);
                    }
                    sc.row_max[i] = next;
                    next
                } else {
                    0.0
                };
                sc.row_sum[i] += ops.exp_shift_sum(approx, scores, shift);

                for (j, &w) in scores.iter().enumerate() {
                    ops.axpy(w, &sc.v[j * hs..(j + 1) * hs], acc);
                }
            }
            j0 += kn;
        }

        for i in 0..rows {
            let acc = &mut sc.acc[i * hs..(i + 1) * hs];
            let sum = sc.row_sum[i];
            ops.scale(if sum > 0.0 { 1.0 / sum } else { 0.0 }, acc);
            unit.dst[i * row_elems + h * hs..][..hs].convert_from_f32_slice(acc);
        }
    }
}
