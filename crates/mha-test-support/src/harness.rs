//! Reference-vs-dense comparison harness.
//!
//! [`gen_data`] builds an operator and two physically distinct, bit-identical
//! operand sets from a seeded RNG. [`check_result`] runs the reference kernel
//! on one set and the dense kernel on the other, then compares the two DST
//! buffers with [`compare_data`].

use half::bf16;
use mha_common::{
    DataType, EngineKind, FormatType, KernelKind, KernelProp, MhaDenseIo, OperatorDesc, Result,
    TensorDesc, attr, with_n_thread,
};
use mha_device_probe::{CpuCapabilities, FixedProbe};
use mha_kernels::{AlignedBuffer, Kernel, KernelDesc, KernelImpl, RuntimeData};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Seed for every generated operand set.
pub const DEFAULT_SEED: u64 = 1;

/// Accepted deviation between dense and reference bf16 output.
pub const BF16_TOLERANCE: f32 = 5e-2;

/// One comparison case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestParams {
    pub bs: usize,
    pub sl_m: usize,
    pub sl_n: usize,
    pub head_num: usize,
    pub head_size: usize,
    pub has_pmask: bool,
    pub has_badd: bool,
    /// Thread count for the dense kernel; `0` is the default, negative is illegal.
    pub nthr: i32,
    pub expect_to_fail: bool,
    pub approx_exp: bool,
    pub stable_softmax: bool,
    /// Value of the `isa` attribute, if pinned.
    pub isa: Option<String>,
    /// Capabilities reported to the dense descriptor instead of the host's.
    pub probe: Option<CpuCapabilities>,
    pub seed: u64,
}

impl TestParams {
    /// Case in the driver's column order:
    /// `bs sl_m sl_n head_num head_size has_pmask has_badd nthr expect_to_fail`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bs: usize,
        sl_m: usize,
        sl_n: usize,
        head_num: usize,
        head_size: usize,
        has_pmask: bool,
        has_badd: bool,
        nthr: i32,
        expect_to_fail: bool,
    ) -> Self {
        Self {
            bs,
            sl_m,
            sl_n,
            head_num,
            head_size,
            has_pmask,
            has_badd,
            nthr,
            expect_to_fail,
            approx_exp: true,
            stable_softmax: false,
            isa: None,
            probe: None,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_softmax(mut self, approx_exp: bool, stable_softmax: bool) -> Self {
        self.approx_exp = approx_exp;
        self.stable_softmax = stable_softmax;
        self
    }

    pub fn with_isa(mut self, isa: &str) -> Self {
        self.isa = Some(isa.to_string());
        self
    }

    pub fn with_probe(mut self, caps: CpuCapabilities) -> Self {
        self.probe = Some(caps);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// `c{nthr}_{bs}_{sl_m}_{sl_n}_{head_num}_{head_size}[_pmask][_badd]`.
    pub fn name(&self) -> String {
        let mut parts = vec![
            format!("c{}", self.nthr),
            self.bs.to_string(),
            self.sl_m.to_string(),
            self.sl_n.to_string(),
            self.head_num.to_string(),
            self.head_size.to_string(),
        ];
        if self.has_pmask {
            parts.push("pmask".into());
        }
        if self.has_badd {
            parts.push("badd".into());
        }
        parts.join("_")
    }

    /// Tensor descriptors for every role, `undef` where unused.
    pub fn tensor_descs(&self) -> Vec<TensorDesc> {
        let mut descs = vec![TensorDesc::undef(); MhaDenseIo::COUNT];
        let q = [self.bs, self.sl_m, self.head_num, self.head_size];
        let kv = [self.bs, self.sl_n, self.head_num, self.head_size];
        descs[MhaDenseIo::SrcQ.index()] = TensorDesc::new(q, DataType::Bf16, FormatType::Abcd);
        descs[MhaDenseIo::SrcK.index()] = TensorDesc::new(kv, DataType::Bf16, FormatType::Abcd);
        descs[MhaDenseIo::SrcV.index()] = TensorDesc::new(kv, DataType::Bf16, FormatType::Abcd);
        descs[MhaDenseIo::Dst.index()] = TensorDesc::new(q, DataType::Bf16, FormatType::Abcd);
        descs[MhaDenseIo::AttScale.index()] = TensorDesc::new([1], DataType::Fp32, FormatType::A);
        if self.has_badd {
            descs[MhaDenseIo::BinaryAdd.index()] =
                TensorDesc::new([1, 1, self.sl_m, self.sl_n], DataType::Fp32, FormatType::Abcd);
        }
        if self.has_pmask {
            descs[MhaDenseIo::Mask.index()] = TensorDesc::new([self.bs], DataType::S32, FormatType::A);
        }
        descs
    }

    pub fn attrs(&self) -> HashMap<String, String> {
        let flag = |b: bool| if b { "True" } else { "False" }.to_string();
        let mut attrs = HashMap::new();
        attrs.insert(attr::APPROX_EXP.to_string(), flag(self.approx_exp));
        attrs.insert(attr::STABLE_SOFTMAX.to_string(), flag(self.stable_softmax));
        if let Some(isa) = &self.isa {
            attrs.insert(attr::ISA.to_string(), isa.clone());
        }
        attrs
    }

    pub fn op_desc(&self) -> OperatorDesc {
        OperatorDesc::new(
            KernelKind::MhaDense,
            KernelProp::ForwardInference,
            EngineKind::Cpu,
            self.tensor_descs(),
            self.attrs(),
        )
    }
}

/// Owned, aligned buffers indexed by role.
#[derive(Debug, Clone)]
pub struct OperandSet {
    bufs: Vec<Option<AlignedBuffer>>,
}

impl Default for OperandSet {
    fn default() -> Self {
        Self { bufs: (0..MhaDenseIo::COUNT).map(|_| None).collect() }
    }
}

impl OperandSet {
    pub fn insert(&mut self, role: MhaDenseIo, buf: AlignedBuffer) {
        self.bufs[role.index()] = Some(buf);
    }

    pub fn remove(&mut self, role: MhaDenseIo) -> Option<AlignedBuffer> {
        self.bufs[role.index()].take()
    }

    pub fn get(&self, role: MhaDenseIo) -> Option<&AlignedBuffer> {
        self.bufs[role.index()].as_ref()
    }

    /// Typed view of `role`; empty if unbound or not a whole number of `T`.
    pub fn typed<T: bytemuck::Pod>(&self, role: MhaDenseIo) -> &[T] {
        self.get(role).and_then(AlignedBuffer::as_typed::<T>).unwrap_or(&[])
    }

    pub fn typed_mut<T: bytemuck::Pod>(&mut self, role: MhaDenseIo) -> &mut [T] {
        match self.bufs[role.index()].as_mut().and_then(AlignedBuffer::as_typed_mut::<T>) {
            Some(s) => s,
            None => &mut [],
        }
    }

    /// Borrow every bound buffer as runtime data, plus an optional workspace.
    pub fn runtime_data<'a>(&'a mut self, workspace: Option<&'a mut [u8]>) -> RuntimeData<'a> {
        let mut data = RuntimeData::new();
        for (role, slot) in MhaDenseIo::ALL.into_iter().zip(self.bufs.iter_mut()) {
            let Some(buf) = slot.as_mut() else { continue };
            if role.is_output() {
                if role == MhaDenseIo::Dst {
                    data = data.with_dst(&mut buf[..]);
                }
            } else {
                let shared: &'a AlignedBuffer = buf;
                data.set_input(role, shared);
            }
        }
        if let Some(ws) = workspace {
            data = data.with_workspace(ws);
        }
        data
    }
}

/// Operator plus independent operand sets for the dense and reference kernels.
#[derive(Debug, Clone)]
pub struct TestData {
    pub op_desc: OperatorDesc,
    pub kern: OperandSet,
    pub refr: OperandSet,
}

/// Fill a buffer for `desc` uniformly in `[min, max]`; all zeros when both are 0.
pub fn make_tensor_obj(
    desc: &TensorDesc,
    min: f32,
    max: f32,
    rng: &mut ChaCha8Rng,
) -> Result<(AlignedBuffer, AlignedBuffer)> {
    let n = desc.elem_count();
    let buf = if min == 0.0 && max == 0.0 {
        AlignedBuffer::zeroed(desc.size())?
    } else {
        match desc.dtype() {
            DataType::Fp32 => {
                let v: Vec<f32> = (0..n).map(|_| rng.gen_range(min..=max)).collect();
                AlignedBuffer::from_slice(&v)?
            }
            DataType::Bf16 => {
                let v: Vec<bf16> = (0..n).map(|_| bf16::from_f32(rng.gen_range(min..=max))).collect();
                AlignedBuffer::from_slice(&v)?
            }
            DataType::S32 => {
                let (lo, hi) = (min as i32, max as i32);
                let v: Vec<i32> = (0..n).map(|_| rng.gen_range(lo..=hi)).collect();
                AlignedBuffer::from_slice(&v)?
            }
            DataType::U8 => {
                let (lo, hi) = (min as u8, max as u8);
                let v: Vec<u8> = (0..n).map(|_| rng.gen_range(lo..=hi)).collect();
                AlignedBuffer::from_slice(&v)?
            }
            DataType::S8 => {
                let (lo, hi) = (min as i8, max as i8);
                let v: Vec<i8> = (0..n).map(|_| rng.gen_range(lo..=hi)).collect();
                AlignedBuffer::from_slice(&v)?
            }
            DataType::Undef => AlignedBuffer::zeroed(0)?,
        }
    };
    let copy = buf.clone();
    Ok((buf, copy))
}

/// Operator and operands following the driver's conventions: Q/K/V and bias
/// in `[-1, 1]`, mask lengths in `[1, sl_n]`, `att_scale = 1/sqrt(sl_n)`,
/// DST zeroed.
pub fn gen_data(p: &TestParams) -> Result<TestData> {
    let op_desc = p.op_desc();
    let mut rng = ChaCha8Rng::seed_from_u64(p.seed);
    let mut kern = OperandSet::default();
    let mut refr = OperandSet::default();

    let att_scale = 1.0 / (p.sl_n as f32).sqrt();
    let mut ranges = vec![
        (MhaDenseIo::SrcQ, -1.0, 1.0),
        (MhaDenseIo::SrcK, -1.0, 1.0),
        (MhaDenseIo::SrcV, -1.0, 1.0),
        (MhaDenseIo::Dst, 0.0, 0.0),
        (MhaDenseIo::AttScale, att_scale, att_scale),
    ];
    if p.has_badd {
        ranges.push((MhaDenseIo::BinaryAdd, -1.0, 1.0));
    }
    if p.has_pmask {
        ranges.push((MhaDenseIo::Mask, 1.0, p.sl_n as f32));
    }

    for (role, min, max) in ranges {
        let (a, b) = make_tensor_obj(op_desc.tensor_desc(role), min, max, &mut rng)?;
        kern.insert(role, a);
        refr.insert(role, b);
    }
    Ok(TestData { op_desc, kern, refr })
}

/// Build and run `impl_kind` on `operands`, allocating its workspace.
pub fn run_kernel(
    impl_kind: KernelImpl,
    op_desc: &OperatorDesc,
    operands: &mut OperandSet,
    probe: Option<&CpuCapabilities>,
) -> Result<()> {
    let desc = match probe {
        Some(caps) => KernelDesc::create_with_probe(impl_kind, op_desc, &FixedProbe(caps.clone()))?,
        None => KernelDesc::create(impl_kind, op_desc)?,
    };
    let kernel = Kernel::create(desc)?;
    let mut workspace = AlignedBuffer::zeroed(kernel.workspace_size())?;
    let mut data = operands.runtime_data(Some(&mut workspace[..]));
    kernel.execute(&mut data)
}

fn run_pair(p: &TestParams, d: &mut TestData) -> Result<()> {
    run_kernel(KernelImpl::Reference, &d.op_desc, &mut d.refr, None)?;
    let _nthr = with_n_thread(p.nthr)?;
    run_kernel(KernelImpl::Dense, &d.op_desc, &mut d.kern, p.probe.as_ref())
}

/// Run both kernels and compare. Returns `expect_to_fail` when either fails
/// to build or run, otherwise whether the outputs agree.
pub fn check_result(p: &TestParams, d: &mut TestData) -> bool {
    if let Err(e) = run_pair(p, d) {
        log::error!("{}: {e}", p.name());
        return p.expect_to_fail;
    }
    if p.expect_to_fail {
        return false;
    }

    let (Some(kern_dst), Some(ref_dst)) = (d.kern.get(MhaDenseIo::Dst), d.refr.get(MhaDenseIo::Dst)) else {
        log::error!("{}: DST buffer missing", p.name());
        return false;
    };
    compare_dst(&p.name(), d.op_desc.tensor_desc(MhaDenseIo::Dst).dtype(), kern_dst, ref_dst)
}

/// Compare two DST buffers of `dtype`. Aliased buffers never count as a match.
fn compare_dst(name: &str, dtype: DataType, kern_dst: &[u8], ref_dst: &[u8]) -> bool {
    if std::ptr::eq(kern_dst.as_ptr(), ref_dst.as_ptr()) {
        log::error!("{name}: kernel and reference DST alias the same buffer");
        return false;
    }
    match dtype {
        DataType::Bf16 => compare_data::<bf16>(kern_dst, ref_dst, BF16_TOLERANCE),
        DataType::Fp32 => compare_data::<f32>(kern_dst, ref_dst, BF16_TOLERANCE),
        other => {
            log::error!("{name}: unexpected dst type {other}");
            false
        }
    }
}

/// Element types [`compare_data`] can widen to f32.
pub trait CompareElem: bytemuck::Pod {
    fn widen(self) -> f32;
}

impl CompareElem for f32 {
    fn widen(self) -> f32 {
        self
    }
}

impl CompareElem for bf16 {
    fn widen(self) -> f32 {
        self.to_f32()
    }
}

impl CompareElem for i32 {
    fn widen(self) -> f32 {
        self as f32
    }
}

/// Whether two buffers of `T` agree element-wise: each pair must be within
/// `eps` absolutely or relative to `expected`. NaN never matches.
pub fn compare_data<T: CompareElem>(actual: &[u8], expected: &[u8], eps: f32) -> bool {
    let (Ok(a), Ok(b)) =
        (bytemuck::try_cast_slice::<u8, T>(actual), bytemuck::try_cast_slice::<u8, T>(expected))
    else {
        log::error!("compare_data: buffers are not valid element slices");
        return false;
    };
    if a.len() != b.len() {
        log::error!("compare_data: length mismatch {} vs {}", a.len(), b.len());
        return false;
    }
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        let (x, y) = (x.widen(), y.widen());
        if x.is_nan() || y.is_nan() {
            log::error!("compare_data: NaN at {i} ({x} vs {y})");
            return false;
        }
        let diff = (x - y).abs();
        if diff > eps && diff > eps * y.abs() {
            log::error!("compare_data: mismatch at {i}: {x} vs {y} (diff {diff})");
            return false;
        }
    }
    true
}
