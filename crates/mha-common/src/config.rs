//! Runtime configuration read from the environment.

use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable holding the default worker-thread count.
pub const ENV_NUM_THREADS: &str = "MHA_NUM_THREADS";
/// Environment variable capping the host ISA probe (`scalar`, `neon`, `avx2`, `avx512`).
pub const ENV_FORCE_ISA: &str = "MHA_FORCE_ISA";
/// When set to `1`/`true`, `MHA_FORCE_ISA` is ignored and real hardware is probed.
pub const ENV_STRICT_PROBE: &str = "MHA_STRICT_PROBE";

/// Process-level runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default worker count; `0` lets the engine pick one per available core.
    pub num_threads: usize,
    /// Cap applied to the detected instruction tier.
    pub force_isa: Option<String>,
    /// Ignore `force_isa` and trust the hardware probe.
    pub strict_probe: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { num_threads: 0, force_isa: None, strict_probe: false }
    }
}

impl RuntimeConfig {
    /// Build from `MHA_*` environment variables. Malformed values are ignored.
    pub fn from_env() -> Self {
        let num_threads = env::var(ENV_NUM_THREADS)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let force_isa = env::var(ENV_FORCE_ISA)
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let strict_probe = env::var(ENV_STRICT_PROBE)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self { num_threads, force_isa, strict_probe }
    }

    /// Thread count to use when nothing more specific was requested.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 { self.num_threads } else { num_cpus::get().max(1) }
    }

    /// ISA cap to apply to the host probe, honouring strict mode.
    pub fn effective_isa_cap(&self) -> Option<&str> {
        if self.strict_probe { None } else { self.force_isa.as_deref() }
    }
}
