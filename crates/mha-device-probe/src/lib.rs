//! CPU capability probing for the dense attention kernels.
//!
//! Kernel-descriptor validation asks a [`CapabilityProbe`] which instruction
//! tiers the current machine supports. [`HostProbe`] inspects the real CPU
//! (optionally capped through `MHA_FORCE_ISA`); [`FixedProbe`] reports a
//! hand-written capability set for deterministic tests.

use mha_common::RuntimeConfig;
use std::fmt;
use std::str::FromStr;

/// SIMD instruction tier, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimdLevel {
    /// No SIMD; portable scalar loops.
    Scalar,
    /// ARM NEON (128-bit).
    Neon,
    /// x86 AVX2 + FMA (256-bit).
    Avx2,
    /// x86 AVX-512F (512-bit).
    Avx512,
}

impl SimdLevel {
    pub const ALL: [SimdLevel; 4] =
        [SimdLevel::Scalar, SimdLevel::Neon, SimdLevel::Avx2, SimdLevel::Avx512];

    /// Number of f32 lanes in one vector register.
    pub const fn lanes(self) -> usize {
        match self {
            SimdLevel::Scalar => 1,
            SimdLevel::Neon => 4,
            SimdLevel::Avx2 => 8,
            SimdLevel::Avx512 => 16,
        }
    }
}

impl fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimdLevel::Scalar => write!(f, "scalar"),
            SimdLevel::Neon => write!(f, "neon"),
            SimdLevel::Avx2 => write!(f, "avx2"),
            SimdLevel::Avx512 => write!(f, "avx512"),
        }
    }
}

/// Error returned when a string does not name a [`SimdLevel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSimdLevelError(pub String);

impl fmt::Display for ParseSimdLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown SIMD level '{}'", self.0)
    }
}

impl std::error::Error for ParseSimdLevelError {}

impl FromStr for SimdLevel {
    type Err = ParseSimdLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scalar" | "none" => Ok(SimdLevel::Scalar),
            "neon" => Ok(SimdLevel::Neon),
            "avx2" => Ok(SimdLevel::Avx2),
            "avx512" | "avx512f" | "avx-512" => Ok(SimdLevel::Avx512),
            other => Err(ParseSimdLevelError(other.to_string())),
        }
    }
}

/// CPU capabilities relevant to kernel selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// Logical cores available to the process (always >= 1).
    pub core_count: usize,
    pub has_avx2: bool,
    pub has_fma: bool,
    pub has_avx512f: bool,
    /// Always `true` on `aarch64`, `false` elsewhere.
    pub has_neon: bool,
}

impl CpuCapabilities {
    /// A machine with no vector extensions.
    pub const fn scalar_only(core_count: usize) -> Self {
        Self { core_count, has_avx2: false, has_fma: false, has_avx512f: false, has_neon: false }
    }

    /// Whether the kernels' `level` code path can run on this CPU.
    pub fn supports(&self, level: SimdLevel) -> bool {
        match level {
            SimdLevel::Scalar => true,
            SimdLevel::Neon => self.has_neon,
            SimdLevel::Avx2 => self.has_avx2 && self.has_fma,
            SimdLevel::Avx512 => self.has_avx512f && self.has_avx2 && self.has_fma,
        }
    }

    /// Strongest supported tier.
    pub fn best_simd_level(&self) -> SimdLevel {
        SimdLevel::ALL.iter().rev().copied().find(|&l| self.supports(l)).unwrap_or(SimdLevel::Scalar)
    }

    /// Drop every capability above `cap`.
    pub fn capped(mut self, cap: SimdLevel) -> Self {
        if cap < SimdLevel::Avx512 {
            self.has_avx512f = false;
        }
        if cap < SimdLevel::Avx2 {
            self.has_avx2 = false;
            self.has_fma = false;
        }
        if cap < SimdLevel::Neon {
            self.has_neon = false;
        }
        self
    }

    /// Short `+`-joined feature list for error messages.
    pub fn summary(&self) -> String {
        let feats: Vec<String> =
            SimdLevel::ALL.iter().filter(|&&l| self.supports(l)).map(ToString::to_string).collect();
        feats.join("+")
    }
}

/// Probe the current CPU.
pub fn probe_cpu() -> CpuCapabilities {
    let core_count = std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1);

    #[cfg(target_arch = "x86_64")]
    let (has_avx2, has_fma, has_avx512f, has_neon) = (
        is_x86_feature_detected!("avx2"),
        is_x86_feature_detected!("fma"),
        is_x86_feature_detected!("avx512f"),
        false,
    );

    #[cfg(target_arch = "aarch64")]
    let (has_avx2, has_fma, has_avx512f, has_neon) = (false, false, false, true);

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let (has_avx2, has_fma, has_avx512f, has_neon) = (false, false, false, false);

    CpuCapabilities { core_count, has_avx2, has_fma, has_avx512f, has_neon }
}

/// Source of CPU capability information for kernel validation.
pub trait CapabilityProbe: Send + Sync {
    fn cpu(&self) -> CpuCapabilities;
}

/// Probes the real host, honouring `MHA_FORCE_ISA` unless `MHA_STRICT_PROBE=1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl CapabilityProbe for HostProbe {
    fn cpu(&self) -> CpuCapabilities {
        let caps = probe_cpu();
        let config = RuntimeConfig::from_env();
        match config.effective_isa_cap().map(str::parse::<SimdLevel>) {
            Some(Ok(cap)) => {
                log::debug!("capping detected ISA at {cap} (MHA_FORCE_ISA)");
                caps.capped(cap)
            }
            Some(Err(e)) => {
                log::warn!("ignoring MHA_FORCE_ISA: {e}");
                caps
            }
            None => caps,
        }
    }
}

/// Reports a fixed capability set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedProbe(pub CpuCapabilities);

impl CapabilityProbe for FixedProbe {
    fn cpu(&self) -> CpuCapabilities {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(SimdLevel::Scalar < SimdLevel::Neon);
        assert!(SimdLevel::Neon < SimdLevel::Avx2);
        assert!(SimdLevel::Avx2 < SimdLevel::Avx512);
    }

    #[test]
    fn parse_levels() {
        assert_eq!("AVX2".parse::<SimdLevel>().unwrap(), SimdLevel::Avx2);
        assert_eq!("avx512f".parse::<SimdLevel>().unwrap(), SimdLevel::Avx512);
        assert_eq!("none".parse::<SimdLevel>().unwrap(), SimdLevel::Scalar);
        assert!("sve".parse::<SimdLevel>().is_err());
    }

    #[test]
    fn avx2_requires_fma() {
        let caps = CpuCapabilities { has_avx2: true, ..CpuCapabilities::scalar_only(4) };
        assert!(!caps.supports(SimdLevel::Avx2));
        assert_eq!(caps.best_simd_level(), SimdLevel::Scalar);

        let caps = CpuCapabilities { has_fma: true, ..caps };
        assert_eq!(caps.best_simd_level(), SimdLevel::Avx2);
    }

    #[test]
    fn capping_removes_higher_tiers() {
        let full = CpuCapabilities {
            core_count: 8,
            has_avx2: true,
            has_fma: true,
            has_avx512f: true,
            has_neon: false,
        };
        assert_eq!(full.best_simd_level(), SimdLevel::Avx512);
        assert_eq!(full.clone().capped(SimdLevel::Avx2).best_simd_level(), SimdLevel::Avx2);
        assert_eq!(full.capped(SimdLevel::Scalar).best_simd_level(), SimdLevel::Scalar);
    }

    #[test]
    fn probe_reports_at_least_one_core() {
        let caps = probe_cpu();
        assert!(caps.core_count >= 1);
        assert!(!(caps.has_avx2 && caps.has_neon));
        assert!(caps.supports(SimdLevel::Scalar));
    }

    #[test]
    fn fixed_probe_is_verbatim() {
        let caps = CpuCapabilities::scalar_only(2);
        assert_eq!(FixedProbe(caps.clone()).cpu(), caps);
        assert_eq!(caps.summary(), "scalar");
    }
}
