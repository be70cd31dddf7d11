//! Executable kernels, the second phase of construction.

use crate::cpu::{AttentionKernel, DenseKernel, RefKernel};
use crate::kernel_desc::{KernelDesc, KernelImpl};
use crate::runtime::RuntimeData;
use mha_common::Result;
use std::sync::Arc;

/// A runnable attention kernel bound to one descriptor.
///
/// Apart from the dense kernel's thread pool it holds no state between
/// calls, so it can be executed repeatedly, and from several threads, with
/// different buffers of the shape its descriptor describes.
#[derive(Debug)]
pub enum Kernel {
    Reference(RefKernel),
    Dense(DenseKernel),
}

impl Kernel {
    pub fn create(desc: Arc<KernelDesc>) -> Result<Self> {
        let kernel = match desc.impl_kind() {
            KernelImpl::Reference => Kernel::Reference(RefKernel::new(desc)),
            KernelImpl::Dense => Kernel::Dense(DenseKernel::new(desc)?),
        };
        log::debug!(
            "kernel {} ready: {} threads, {} workspace bytes",
            kernel.name(),
            kernel.desc().n_threads(),
            kernel.workspace_size()
        );
        Ok(kernel)
    }

    fn inner(&self) -> &dyn AttentionKernel {
        match self {
            Kernel::Reference(k) => k,
            Kernel::Dense(k) => k,
        }
    }

    pub fn desc(&self) -> &Arc<KernelDesc> {
        self.inner().desc()
    }

    pub fn name(&self) -> String {
        self.desc().name()
    }

    /// Bytes the caller must bind to the `Workspace` role.
    pub fn workspace_size(&self) -> usize {
        self.inner().workspace_size()
    }

    /// Compute DST from the bound operands.
    ///
    /// Buffers that disagree with the descriptor (missing, short, misaligned,
    /// or an undersized workspace) are reported as execution errors before
    /// anything is written.
    pub fn execute(&self, data: &mut RuntimeData<'_>) -> Result<()> {
        self.inner().execute(data)
    }
}
