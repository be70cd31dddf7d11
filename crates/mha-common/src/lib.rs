//! Common types for the dense multi-head attention engine.
//!
//! Tensor and operator descriptors, the operand role enumeration, the error
//! taxonomy shared by every kernel, runtime configuration and the scoped
//! thread-count override.

pub mod config;
pub mod error;
pub mod n_thread;
pub mod operator;
pub mod tensor;
pub mod types;
pub mod warn_once;

pub use config::RuntimeConfig;
pub use error::*;
pub use n_thread::{
    NThreadGuard, current_n_thread, n_thread_override, with_n_thread, with_n_thread_scope,
};
pub use operator::{MhaDenseIo, OperatorDesc, attr, parse_bool};
pub use tensor::TensorDesc;
pub use types::*;
pub use warn_once::warn_once_fn;
