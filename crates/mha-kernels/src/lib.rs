//! Dense multi-head attention kernels for CPU.
//!
//! Construction is two-phase. [`KernelDesc::create`] validates an
//! [`OperatorDesc`](mha_common::OperatorDesc) for one [`KernelImpl`] and
//! captures the thread count and instruction tier; [`Kernel::create`] turns
//! the descriptor into something executable. Execution borrows caller
//! buffers through [`RuntimeData`] and never allocates operands itself.
//!
//! ```rust,ignore
//! let desc = KernelDesc::create(KernelImpl::Dense, &op_desc)?;
//! let kernel = Kernel::create(desc)?;
//! let mut workspace = AlignedBuffer::zeroed(kernel.workspace_size())?;
//! let mut data = RuntimeData::new()
//!     .with_input(MhaDenseIo::SrcQ, &q)
//!     .with_input(MhaDenseIo::SrcK, &k)
//!     .with_input(MhaDenseIo::SrcV, &v)
//!     .with_input(MhaDenseIo::AttScale, &scale)
//!     .with_dst(&mut dst)
//!     .with_workspace(&mut workspace);
//! kernel.execute(&mut data)?;
//! ```

pub mod cpu;
pub mod kernel;
pub mod kernel_desc;
pub mod runtime;
pub mod workspace;

pub use kernel::Kernel;
pub use kernel_desc::{KernelDesc, KernelImpl, MAX_HEAD_SIZE, MhaDenseShape, SoftmaxPolicy};
pub use runtime::{Inputs, RuntimeData};
pub use workspace::{AlignedBuffer, WORKSPACE_ALIGN};
