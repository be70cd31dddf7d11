//! Vector primitives shared by the attention kernels.
//!
//! [`approx_exp`] is the polynomial exponential used whenever an operator
//! sets `approx_exp`; the reference kernel calls the scalar form and the
//! dense kernel the vector form, and both evaluate the same polynomial in
//! the same order. [`SimdOps`] dispatches dot/axpy/scale to the instruction
//! tier chosen at descriptor creation.

use mha_device_probe::{CpuCapabilities, SimdLevel, probe_cpu};
use std::sync::OnceLock;

#[cfg(target_arch = "x86_64")]
#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
#[allow(clippy::wildcard_imports)]
use std::arch::aarch64::*;

// Cody-Waite split of ln(2)
const LN2_HI: f32 = 6.931_457_5e-1;
const LN2_LO: f32 = 1.428_606_8e-6;
// Keeps n within the normal f32 exponent range
const EXP_CLAMP_LO: f32 = -87.3;
const EXP_CLAMP_HI: f32 = 88.3;
const C3: f32 = 1.0 / 6.0;
const C4: f32 = 1.0 / 24.0;
const C5: f32 = 1.0 / 120.0;
const C6: f32 = 1.0 / 720.0;

/// Fast `exp` approximation: range reduction to `|r| <= ln2/2`, a 6th-order
/// Taylor polynomial, and `2^n` assembled from exponent bits.
///
/// Relative error stays below `1e-5` over the clamped range. NaN passes
/// through, `-inf` maps to `0` and `+inf` to `+inf`.
pub fn approx_exp(x: f32) -> f32 {
    if x.is_nan() {
        return x;
    }
    if x == f32::NEG_INFINITY {
        return 0.0;
    }
    if x == f32::INFINITY {
        return x;
    }
    let xc = x.clamp(EXP_CLAMP_LO, EXP_CLAMP_HI);
    let n = (xc * std::f32::consts::LOG2_E).round_ties_even();
    let r = (xc - n * LN2_HI) - n * LN2_LO;

    let p = C6;
    let p = p * r + C5;
    let p = p * r + C4;
    let p = p * r + C3;
    let p = p * r + 0.5;
    let p = p * r + 1.0;
    let p = p * r + 1.0;

    let pow2n = f32::from_bits(((n as i32 + 127) as u32) << 23);
    p * pow2n
}

/// Exponential selected by the `approx_exp` attribute.
pub fn exp_fn(approx: bool) -> fn(f32) -> f32 {
    if approx { approx_exp } else { f32::exp }
}

fn host_caps() -> &'static CpuCapabilities {
    static HOST: OnceLock<CpuCapabilities> = OnceLock::new();
    HOST.get_or_init(probe_cpu)
}

// ── Scalar fallbacks (all platforms) ────────────────────────────────

fn scalar_dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

fn scalar_axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

fn scalar_scale(alpha: f32, y: &mut [f32]) {
    for yi in y {
        *yi *= alpha;
    }
}

fn scalar_exp_shift_sum(exp: fn(f32) -> f32, row: &mut [f32], shift: f32) -> f32 {
    let mut sum = 0.0;
    for v in row {
        *v = exp(*v - shift);
        sum += *v;
    }
    sum
}

// ── AVX2 + FMA (x86_64 only) ────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn hsum_avx2(v: __m256) -> f32 {
    let hi = _mm256_extractf128_ps::<1>(v);
    let lo = _mm256_castps256_ps128(v);
    let sum4 = _mm_add_ps(hi, lo);
    let hi2 = _mm_movehl_ps(sum4, sum4);
    let sum2 = _mm_add_ps(sum4, hi2);
    let hi1 = _mm_shuffle_ps::<0x01>(sum2, sum2);
    _mm_cvtss_f32(_mm_add_ss(sum2, hi1))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_dot(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let chunks = len / 8;
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let off = i * 8;
        // SAFETY: off + 8 <= len for both slices.
        unsafe {
            let va = _mm256_loadu_ps(a.as_ptr().add(off));
            let vb = _mm256_loadu_ps(b.as_ptr().add(off));
            acc = _mm256_fmadd_ps(va, vb, acc);
        }
    }
    // SAFETY: avx2 is enabled on this function.
    let mut sum = unsafe { hsum_avx2(acc) };
    for i in chunks * 8..len {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    let len = y.len();
    let chunks = len / 8;
    let va = _mm256_set1_ps(alpha);
    for i in 0..chunks {
        let off = i * 8;
        // SAFETY: off + 8 <= len for both slices.
        unsafe {
            let vx = _mm256_loadu_ps(x.as_ptr().add(off));
            let vy = _mm256_loadu_ps(y.as_ptr().add(off));
            _mm256_storeu_ps(y.as_mut_ptr().add(off), _mm256_fmadd_ps(va, vx, vy));
        }
    }
    scalar_axpy(alpha, &x[chunks * 8..], &mut y[chunks * 8..]);
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn avx2_scale(alpha: f32, y: &mut [f32]) {
    let len = y.len();
    let chunks = len / 8;
    let va = _mm256_set1_ps(alpha);
    for i in 0..chunks {
        let off = i * 8;
        // SAFETY: off + 8 <= len.
        unsafe {
            let vy = _mm256_loadu_ps(y.as_ptr().add(off));
            _mm256_storeu_ps(y.as_mut_ptr().add(off), _mm256_mul_ps(va, vy));
        }
    }
    scalar_scale(alpha, &mut y[chunks * 8..]);
}

/// Eight-lane [`approx_exp`]; identical constants and evaluation order.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn avx2_approx_exp_ps(x: __m256) -> __m256 {
    let ln2_hi = _mm256_set1_ps(LN2_HI);
    let ln2_lo = _mm256_set1_ps(LN2_LO);
    let log2e = _mm256_set1_ps(std::f32::consts::LOG2_E);
    let one = _mm256_set1_ps(1.0);
    let half = _mm256_set1_ps(0.5);

    let nan_mask = _mm256_cmp_ps::<{ _CMP_UNORD_Q }>(x, x);
    let pos_inf = _mm256_set1_ps(f32::INFINITY);
    let inf_mask = _mm256_cmp_ps::<{ _CMP_EQ_OQ }>(x, pos_inf);
    let ninf_mask = _mm256_cmp_ps::<{ _CMP_EQ_OQ }>(x, _mm256_set1_ps(f32::NEG_INFINITY));

    let xc = _mm256_max_ps(_mm256_min_ps(x, _mm256_set1_ps(EXP_CLAMP_HI)), _mm256_set1_ps(EXP_CLAMP_LO));

    // Round to nearest even under the default MXCSR mode
    let n_i = _mm256_cvtps_epi32(_mm256_mul_ps(xc, log2e));
    let n_f = _mm256_cvtepi32_ps(n_i);
    let r = _mm256_sub_ps(_mm256_sub_ps(xc, _mm256_mul_ps(n_f, ln2_hi)), _mm256_mul_ps(n_f, ln2_lo));

    let p = _mm256_set1_ps(C6);
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), _mm256_set1_ps(C5));
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), _mm256_set1_ps(C4));
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), _mm256_set1_ps(C3));
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), half);
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), one);
    let p = _mm256_add_ps(_mm256_mul_ps(p, r), one);

    let pow2n =
        _mm256_castsi256_ps(_mm256_slli_epi32::<23>(_mm256_add_epi32(n_i, _mm256_set1_epi32(127))));
    let result = _mm256_mul_ps(p, pow2n);

    let result = _mm256_blendv_ps(result, x, nan_mask);
    let result = _mm256_blendv_ps(result, pos_inf, inf_mask);
    _mm256_blendv_ps(result, _mm256_setzero_ps(), ninf_mask)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn avx2_approx_exp_shift_sum(row: &mut [f32], shift: f32) -> f32 {
    let len = row.len();
    let chunks = len / 8;
    let vs = _mm256_set1_ps(shift);
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let off = i * 8;
        // SAFETY: off + 8 <= len.
        unsafe {
            let v = _mm256_sub_ps(_mm256_loadu_ps(row.as_ptr().add(off)), vs);
            let e = avx2_approx_exp_ps(v);
            _mm256_storeu_ps(row.as_mut_ptr().add(off), e);
            acc = _mm256_add_ps(acc, e);
        }
    }
    // SAFETY: avx2 is enabled on this function.
    let sum = unsafe { hsum_avx2(acc) };
    sum + scalar_exp_shift_sum(approx_exp, &mut row[chunks * 8..], shift)
}

// ── AVX-512F (x86_64 only) ──────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f")]
unsafe fn avx512_dot(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let chunks = len / 16;
    let mut acc = _mm512_setzero_ps();
    for i in 0..chunks {
        let off = i * 16;
        // SAFETY: off + 16 <= len for both slices.
        unsafe {
            let va = _mm512_loadu_ps(a.as_ptr().add(off));
            let vb = _mm512_loadu_ps(b.as_ptr().add(off));
            acc = _mm512_fmadd_ps(va, vb, acc);
        }
    }
    let mut lanes = [0.0f32; 16];
    // SAFETY: `lanes` holds exactly 16 floats.
    unsafe { _mm512_storeu_ps(lanes.as_mut_ptr(), acc) };
    let mut sum: f32 = lanes.iter().sum();
    for i in chunks * 16..len {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx512f")]
unsafe fn avx512_axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    let len = y.len();
    let chunks = len / 16;
    let va = _mm512_set1_ps(alpha);
    for i in 0..chunks {
        let off = i * 16;
        // SAFETY: off + 16 <= len for both slices.
        unsafe {
            let vx = _mm512_loadu_ps(x.as_ptr().add(off));
            let vy = _mm512_loadu_ps(y.as_ptr().add(off));
            _mm512_storeu_ps(y.as_mut_ptr().add(off), _mm512_fmadd_ps(va, vx, vy));
        }
    }
    scalar_axpy(alpha, &x[chunks * 16..], &mut y[chunks * 16..]);
}

// ── NEON (aarch64 only) ─────────────────────────────────────────────

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn neon_dot(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len();
    let chunks = len / 4;
    let mut acc = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let off = i * 4;
        // SAFETY: off + 4 <= len for both slices.
        unsafe {
            let va = vld1q_f32(a.as_ptr().add(off));
            let vb = vld1q_f32(b.as_ptr().add(off));
            acc = vfmaq_f32(acc, va, vb);
        }
    }
    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..len {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn neon_axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    let len = y.len();
    let chunks = len / 4;
    let va = vdupq_n_f32(alpha);
    for i in 0..chunks {
        let off = i * 4;
        // SAFETY: off + 4 <= len for both slices.
        unsafe {
            let vx = vld1q_f32(x.as_ptr().add(off));
            let vy = vld1q_f32(y.as_ptr().add(off));
            vst1q_f32(y.as_mut_ptr().add(off), vfmaq_f32(vy, va, vx));
        }
    }
    scalar_axpy(alpha, &x[chunks * 4..], &mut y[chunks * 4..]);
}

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn neon_scale(alpha: f32, y: &mut [f32]) {
    let len = y.len();
    let chunks = len / 4;
    for i in 0..chunks {
        let off = i * 4;
        // SAFETY: off + 4 <= len.
        unsafe {
            let vy = vld1q_f32(y.as_ptr().add(off));
            vst1q_f32(y.as_mut_ptr().add(off), vmulq_n_f32(vy, alpha));
        }
    }
    scalar_scale(alpha, &mut y[chunks * 4..]);
}

// ── Dispatch ────────────────────────────────────────────────────────

/// Vector routines bound to one instruction tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimdOps {
    level: SimdLevel,
}

impl SimdOps {
    /// Bind to `level`, lowered to what the executing CPU really supports.
    ///
    /// A capability probe may report more than the host has (fixed probes in
    /// tests); the intrinsics paths are only ever taken when the host
    /// detection agrees.
    pub fn new(level: SimdLevel) -> Self {
        let host = host_caps();
        let level = if host.supports(level) {
            level
        } else {
            let lowered = SimdLevel::ALL
                .into_iter()
                .rev()
                .find(|&l| l <= level && host.supports(l))
                .unwrap_or(SimdLevel::Scalar);
            log::debug!("host lacks {level}, simd ops lowered to {lowered}");
            lowered
        };
        Self { level }
    }

    pub const fn scalar() -> Self {
        Self { level: SimdLevel::Scalar }
    }

    pub fn level(&self) -> SimdLevel {
        self.level
    }

    /// `sum(a[i] * b[i])` over the common prefix.
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (a, b) = (&a[..n], &b[..n]);
        match self.level {
            // SAFETY: `new` verified the host supports this tier.
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 => unsafe { avx512_dot(a, b) },
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 => unsafe { avx2_dot(a, b) },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe { neon_dot(a, b) },
            _ => scalar_dot(a, b),
        }
    }

    /// `y += alpha * x` over the common prefix.
    pub fn axpy(&self, alpha: f32, x: &[f32], y: &mut [f32]) {
        let n = x.len().min(y.len());
        let (x, y) = (&x[..n], &mut y[..n]);
        match self.level {
            // SAFETY: `new` verified the host supports this tier.
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 => unsafe { avx512_axpy(alpha, x, y) },
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx2 => unsafe { avx2_axpy(alpha, x, y) },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe { neon_axpy(alpha, x, y) },
            _ => scalar_axpy(alpha, x, y),
        }
    }

    /// `y *= alpha`.
    pub fn scale(&self, alpha: f32, y: &mut [f32]) {
        match self.level {
            // SAFETY: `new` verified the host supports this tier; AVX-512 implies AVX2.
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 | SimdLevel::Avx2 => unsafe { avx2_scale(alpha, y) },
            #[cfg(target_arch = "aarch64")]
            SimdLevel::Neon => unsafe { neon_scale(alpha, y) },
            _ => scalar_scale(alpha, y),
        }
    }

    /// Replace every `v` in `row` with `exp(v - shift)` and return the sum.
    /// A `-inf` shift (all scores masked) gives every entry zero weight.
    pub fn exp_shift_sum(&self, approx: bool, row: &mut [f32], shift: f32) -> f32 {
        if shift == f32::NEG_INFINITY {
            row.fill(0.0);
            return 0.0;
        }
        match self.level {
            // SAFETY: `new` verified the host supports this tier; AVX-512 implies AVX2.
            #[cfg(target_arch = "x86_64")]
            SimdLevel::Avx512 | SimdLevel::Avx2 if approx => unsafe {
                avx2_approx_exp_shift_sum(row, shift)
            },
            _ => scalar_exp_shift_sum(exp_fn(approx), row, shift),
        }
    }
}
