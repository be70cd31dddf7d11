//! Kernel descriptors: validated, immutable views of an operator for one
//! implementation.
//!
//! [`KernelDesc::create`] is the first phase of kernel construction. It runs
//! every shape, data-type, configuration and hardware check up front so that
//! a descriptor that exists can always be turned into a runnable kernel.

use mha_common::{
    ConstructionError, DataType, EngineKind, KernelKind, KernelProp, MhaDenseIo, MhaError,
    OperatorDesc, Result, TensorDesc, attr, current_n_thread, parse_bool, warn_once_fn,
};
use mha_device_probe::{CapabilityProbe, CpuCapabilities, HostProbe, SimdLevel};
use std::fmt;
use std::sync::Arc;

/// Largest head size the dense kernel's scratch layout is sized for.
pub const MAX_HEAD_SIZE: usize = 512;

/// Closed set of attention implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelImpl {
    /// Straightforward single-threaded oracle.
    Reference,
    /// Tiled, multi-threaded, SIMD implementation.
    Dense,
}

impl fmt::Display for KernelImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelImpl::Reference => write!(f, "reference"),
            KernelImpl::Dense => write!(f, "dense"),
        }
    }
}

/// Problem dimensions and optional-operand flags derived from an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MhaDenseShape {
    pub bs: usize,
    pub sl_m: usize,
    pub sl_n: usize,
    pub head_num: usize,
    pub head_size: usize,
    pub has_badd: bool,
    pub has_pmask: bool,
    pub src_dtype: DataType,
    pub dst_dtype: DataType,
}

impl MhaDenseShape {
    /// Elements in Q or DST. Saturates; a shape from a validated descriptor
    /// never reaches `usize::MAX`.
    pub fn q_elems(&self) -> usize {
        self.bs.saturating_mul(self.sl_m).saturating_mul(self.row_elems())
    }

    /// Elements in K or V.
    pub fn kv_elems(&self) -> usize {
        self.bs.saturating_mul(self.sl_n).saturating_mul(self.row_elems())
    }

    pub fn bias_elems(&self) -> usize {
        self.sl_m.saturating_mul(self.sl_n)
    }

    /// Elements in one sequence position across all heads.
    pub fn row_elems(&self) -> usize {
        self.head_num.saturating_mul(self.head_size)
    }

    fn from_op_desc(op: &OperatorDesc) -> Result<Self> {
        for role in [MhaDenseIo::SrcQ, MhaDenseIo::SrcK, MhaDenseIo::SrcV, MhaDenseIo::Dst, MhaDenseIo::AttScale] {
            if op.tensor_desc(role).is_undef() {
                return Err(MhaError::unsupported_shape(format!("required operand {role} is missing")));
            }
        }
        // Element counts below multiply shape dims freely.
        for role in MhaDenseIo::ALL {
            let desc = op.tensor_desc(role);
            if desc.checked_size().is_none() {
                return Err(MhaError::unsupported_shape(format!(
                    "{role} {:?} overflows the addressable size",
                    desc.shape()
                )));
            }
        }

        let q = op.tensor_desc(MhaDenseIo::SrcQ);
        let k = op.tensor_desc(MhaDenseIo::SrcK);
        let v = op.tensor_desc(MhaDenseIo::SrcV);
        let dst = op.tensor_desc(MhaDenseIo::Dst);
        for (role, desc) in [
            (MhaDenseIo::SrcQ, q),
            (MhaDenseIo::SrcK, k),
            (MhaDenseIo::SrcV, v),
            (MhaDenseIo::Dst, dst),
        ] {
            if desc.ndim() != 4 {
                return Err(MhaError::unsupported_shape(format!(
                    "{role} must be rank 4 [batch, seq, heads, head_size], got {:?}",
                    desc.shape()
                )));
            }
            if desc.shape().contains(&0) {
                return Err(MhaError::unsupported_shape(format!(
                    "{role} has a zero dimension: {:?}",
                    desc.shape()
                )));
            }
        }

        let (qs, ks, vs) = (q.shape(), k.shape(), v.shape());
        let (bs, sl_m, head_num, head_size) = (qs[0], qs[1], qs[2], qs[3]);
        let sl_n = ks[1];
        if ks[0] != bs || ks[2] != head_num || ks[3] != head_size {
            return Err(MhaError::unsupported_shape(format!(
                "SRC_K {ks:?} does not match SRC_Q {qs:?} in batch/heads/head_size"
            )));
        }
        if vs != ks {
            return Err(MhaError::unsupported_shape(format!(
                "SRC_V {vs:?} must equal SRC_K {ks:?}"
            )));
        }
        if dst.shape() != qs {
            return Err(MhaError::unsupported_shape(format!(
                "DST {:?} must equal SRC_Q {qs:?}",
                dst.shape()
            )));
        }

        let scale = op.tensor_desc(MhaDenseIo::AttScale);
        if scale.dtype() != DataType::Fp32 {
            return Err(unsupported_dtype(MhaDenseIo::AttScale, scale));
        }
        if scale.elem_count() != 1 {
            return Err(MhaError::unsupported_shape(format!(
                "ATT_SCALE must hold exactly one element, got {:?}",
                scale.shape()
            )));
        }

        let badd = op.tensor_desc(MhaDenseIo::BinaryAdd);
        let has_badd = badd.is_present();
        if has_badd {
            if badd.ndim() != 4 {
                return Err(MhaError::unsupported_shape(format!(
                    "BINARY_ADD must be rank 4 [1, 1, sl_m, sl_n], got {:?}",
                    badd.shape()
                )));
            }
            if badd.dtype() != DataType::Fp32 {
                return Err(unsupported_dtype(MhaDenseIo::BinaryAdd, badd));
            }
            let bshape = badd.shape();
            if bshape[2] != sl_m || bshape[3] != sl_n {
                return Err(MhaError::unsupported_shape(format!(
                    "BINARY_ADD {bshape:?} must end in [{sl_m}, {sl_n}]"
                )));
            }
            if bshape[0] != 1 || bshape[1] != 1 {
                return Err(MhaError::unsupported_shape(format!(
                    "BINARY_ADD {bshape:?}: broadcasting over batch or heads is not implemented"
                )));
            }
        }

        let mask = op.tensor_desc(MhaDenseIo::Mask);
        let has_pmask = mask.is_present();
        if has_pmask {
            if mask.dtype() != DataType::S32 {
                return Err(unsupported_dtype(MhaDenseIo::Mask, mask));
            }
            if mask.elem_count() != bs {
                return Err(MhaError::unsupported_shape(format!(
                    "MASK must hold one length per batch ({bs}), got {:?}",
                    mask.shape()
                )));
            }
        }

        check_flag(op, attr::HAS_BADD, has_badd, MhaDenseIo::BinaryAdd)?;
        check_flag(op, attr::HAS_PMASK, has_pmask, MhaDenseIo::Mask)?;

        Ok(Self {
            bs,
            sl_m,
            sl_n,
            head_num,
            head_size,
            has_badd,
            has_pmask,
            src_dtype: q.dtype(),
            dst_dtype: dst.dtype(),
        })
    }
}

fn unsupported_dtype(role: MhaDenseIo, desc: &TensorDesc) -> MhaError {
    ConstructionError::UnsupportedDataType { role, dtype: desc.dtype() }.into()
}

fn check_flag(op: &OperatorDesc, key: &str, present: bool, role: MhaDenseIo) -> Result<()> {
    let Some(raw) = op.attr(key) else {
        return Ok(());
    };
    match parse_bool(raw) {
        Some(flag) if flag == present => Ok(()),
        Some(flag) => Err(MhaError::illegal_configuration(format!(
            "attribute {key}={flag} but {role} is {}",
            if present { "populated" } else { "absent" }
        ))),
        None => Err(MhaError::illegal_configuration(format!("attribute {key}={raw:?} is not a boolean"))),
    }
}

/// How softmax exponentiates a score row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxPolicy {
    /// Polynomial `exp` instead of `f32::exp`.
    pub approx_exp: bool,
    /// Subtract the row maximum before exponentiating.
    pub stable: bool,
}

impl Default for SoftmaxPolicy {
    fn default() -> Self {
        Self { approx_exp: false, stable: true }
    }
}

impl SoftmaxPolicy {
    fn from_op_desc(op: &OperatorDesc) -> Self {
        let d = Self::default();
        Self {
            approx_exp: op.attr_bool(attr::APPROX_EXP, d.approx_exp),
            stable: op.attr_bool(attr::STABLE_SOFTMAX, d.stable),
        }
    }
}

/// Validated operator bound to one implementation.
#[derive(Debug)]
pub struct KernelDesc {
    impl_kind: KernelImpl,
    op_desc: OperatorDesc,
    shape: MhaDenseShape,
    softmax: SoftmaxPolicy,
    n_threads: usize,
    isa: SimdLevel,
}

impl KernelDesc {
    /// Validate `op` for `impl_kind` against the host CPU.
    pub fn create(impl_kind: KernelImpl, op: &OperatorDesc) -> Result<Arc<Self>> {
        Self::create_with_probe(impl_kind, op, &HostProbe)
    }

    /// Validate `op` for `impl_kind` against the capabilities `probe` reports.
    pub fn create_with_probe(
        impl_kind: KernelImpl,
        op: &OperatorDesc,
        probe: &dyn CapabilityProbe,
    ) -> Result<Arc<Self>> {
        if op.kind() != KernelKind::MhaDense
            || op.prop() != KernelProp::ForwardInference
            || op.engine() != EngineKind::Cpu
        {
            return Err(MhaError::illegal_configuration(format!(
                "operator {}/{}/{} is not a CPU dense attention inference operator",
                op.kind(),
                op.prop(),
                op.engine()
            )));
        }
        let n_threads = current_n_thread().max(1);

        let shape = MhaDenseShape::from_op_desc(op)?;
        check_data_types(impl_kind, op)?;

        let isa = match impl_kind {
            KernelImpl::Reference => SimdLevel::Scalar,
            KernelImpl::Dense => {
                if shape.head_size > MAX_HEAD_SIZE {
                    return Err(MhaError::unsupported_shape(format!(
                        "head_size {} exceeds the dense kernel limit of {MAX_HEAD_SIZE}",
                        shape.head_size
                    )));
                }
                select_isa(op, &probe.cpu())?
            }
        };

        let desc = Self {
            impl_kind,
            op_desc: op.clone(),
            shape,
            softmax: SoftmaxPolicy::from_op_desc(op),
            n_threads,
            isa,
        };
        log::debug!(
            "created {} for bs={} sl_m={} sl_n={} heads={} head_size={} badd={} pmask={} threads={}",
            desc.name(),
            shape.bs,
            shape.sl_m,
            shape.sl_n,
            shape.head_num,
            shape.head_size,
            shape.has_badd,
            shape.has_pmask,
            n_threads
        );
        Ok(Arc::new(desc))
    }

    pub fn impl_kind(&self) -> KernelImpl {
        self.impl_kind
    }

    pub fn op_desc(&self) -> &OperatorDesc {
        &self.op_desc
    }

    pub fn shape(&self) -> &MhaDenseShape {
        &self.shape
    }

    pub fn softmax(&self) -> SoftmaxPolicy {
        self.softmax
    }

    /// Worker count captured from the thread-count scope at creation.
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn isa(&self) -> SimdLevel {
        self.isa
    }

    /// `mha_dense_ref`, `mha_dense_avx2`, ...
    pub fn name(&self) -> String {
        match self.impl_kind {
            KernelImpl::Reference => "mha_dense_ref".to_string(),
            KernelImpl::Dense => format!("mha_dense_{}", self.isa),
        }
    }
}

fn check_data_types(impl_kind: KernelImpl, op: &OperatorDesc) -> Result<()> {
    let q = op.tensor_desc(MhaDenseIo::SrcQ);
    let dst = op.tensor_desc(MhaDenseIo::Dst);
    let float_src = |dt: DataType| matches!(dt, DataType::Bf16 | DataType::Fp32);

    for role in [MhaDenseIo::SrcQ, MhaDenseIo::SrcK, MhaDenseIo::SrcV] {
        let desc = op.tensor_desc(role);
        let ok = match impl_kind {
            KernelImpl::Reference => float_src(desc.dtype()) && desc.dtype() == q.dtype(),
            KernelImpl::Dense => desc.dtype() == DataType::Bf16,
        };
        if !ok {
            return Err(unsupported_dtype(role, desc));
        }
    }
    let dst_ok = match impl_kind {
        KernelImpl::Reference => float_src(dst.dtype()),
        KernelImpl::Dense => dst.dtype() == DataType::Bf16,
    };
    if !dst_ok {
        return Err(unsupported_dtype(MhaDenseIo::Dst, dst));
    }
    Ok(())
}

fn select_isa(op: &OperatorDesc, caps: &CpuCapabilities) -> Result<SimdLevel> {
    let requested = op.attr(attr::ISA).map(str::trim).unwrap_or("auto");
    if requested.eq_ignore_ascii_case("auto") {
        let best = caps.best_simd_level();
        log::debug!("dense kernel isa auto-selected: {best} (available {})", caps.summary());
        if best == SimdLevel::Scalar {
            warn_once_fn(
                "mha_dense_scalar_fallback",
                "no SIMD tier available, dense attention runs the scalar tile path",
            );
        }
        return Ok(best);
    }

    let level: SimdLevel = requested
        .parse()
        .map_err(|e| MhaError::illegal_configuration(format!("attribute {}: {e}", attr::ISA)))?;
    if !caps.supports(level) {
        return Err(ConstructionError::UnsupportedHardware {
            required: level.to_string(),
            available: caps.summary(),
        }
        .into());
    }
    Ok(level)
}
