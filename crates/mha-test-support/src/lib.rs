//! Test support for the dense attention workspace.
//!
//! Provides the reference-vs-dense comparison harness used by the kernel
//! integration tests and benchmarks, and RAII guards for tests that touch
//! `MHA_*` environment variables.

pub mod env_guard;
pub mod harness;

pub use env_guard::{EnvGuard, EnvScope};
pub use harness::{
    BF16_TOLERANCE, CompareElem, DEFAULT_SEED, OperandSet, TestData, TestParams, check_result,
    compare_data, gen_data, make_tensor_obj, run_kernel,
};
