//! Role-indexed buffers handed to a kernel for one execution.

use bytemuck::Pod;
use mha_common::{ExecutionError, MhaDenseIo, Result};

/// Borrowed operand buffers for one `execute` call.
///
/// Read-only roles hold shared byte slices; `Dst` and `Workspace` hold
/// exclusive ones. Nothing here is freed or reallocated by the engine.
#[derive(Default)]
pub struct RuntimeData<'a> {
    inputs: [Option<&'a [u8]>; MhaDenseIo::COUNT],
    dst: Option<&'a mut [u8]>,
    workspace: Option<&'a mut [u8]>,
}

impl<'a> RuntimeData<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a read-only operand.
    ///
    /// # Panics
    /// If `role` is `Dst` or `Workspace`; use [`Self::with_dst`] / [`Self::with_workspace`].
    pub fn with_input(mut self, role: MhaDenseIo, data: &'a [u8]) -> Self {
        self.set_input(role, data);
        self
    }

    pub fn with_dst(mut self, data: &'a mut [u8]) -> Self {
        self.dst = Some(data);
        self
    }

    pub fn with_workspace(mut self, data: &'a mut [u8]) -> Self {
        self.workspace = Some(data);
        self
    }

    pub fn set_input(&mut self, role: MhaDenseIo, data: &'a [u8]) {
        assert!(!role.is_output(), "{role} is an output role");
        self.inputs[role.index()] = Some(data);
    }

    /// Snapshot of the read-only bindings, usable while outputs are borrowed.
    pub fn inputs(&self) -> Inputs<'a> {
        Inputs { slots: self.inputs }
    }

    pub fn dst(&self) -> Option<&[u8]> {
        self.dst.as_deref()
    }

    pub fn dst_mut(&mut self) -> Option<&mut [u8]> {
        self.dst.as_deref_mut()
    }

    /// Exclusive access to both writable roles at once.
    pub fn outputs_mut(&mut self) -> (Option<&mut [u8]>, Option<&mut [u8]>) {
        (self.dst.as_deref_mut(), self.workspace.as_deref_mut())
    }
}

/// Read-only operand bindings.
#[derive(Debug, Clone, Copy)]
pub struct Inputs<'a> {
    slots: [Option<&'a [u8]>; MhaDenseIo::COUNT],
}

impl<'a> Inputs<'a> {
    pub fn get(&self, role: MhaDenseIo) -> Option<&'a [u8]> {
        self.slots[role.index()]
    }

    pub(crate) fn require(&self, role: MhaDenseIo) -> Result<&'a [u8]> {
        self.get(role).ok_or_else(|| ExecutionError::MissingBuffer { role }.into())
    }

    /// First `elems` elements of `role` reinterpreted as `T`.
    pub(crate) fn typed<T: Pod>(&self, role: MhaDenseIo, elems: usize) -> Result<&'a [T]> {
        cast_prefix(role, self.require(role)?, elems)
    }
}

fn checked_prefix_len<T>(role: MhaDenseIo, actual: usize, elems: usize) -> Result<usize> {
    let expected = elems * std::mem::size_of::<T>();
    if actual < expected {
        return Err(ExecutionError::BufferSize { role, expected, actual }.into());
    }
    Ok(expected)
}

pub(crate) fn cast_prefix<T: Pod>(role: MhaDenseIo, bytes: &[u8], elems: usize) -> Result<&[T]> {
    let n = checked_prefix_len::<T>(role, bytes.len(), elems)?;
    bytemuck::try_cast_slice(&bytes[..n]).map_err(|_| ExecutionError::Misaligned { role }.into())
}

pub(crate) fn cast_prefix_mut<T: Pod>(
    role: MhaDenseIo,
    bytes: &mut [u8],
    elems: usize,
) -> Result<&mut [T]> {
    let n = checked_prefix_len::<T>(role, bytes.len(), elems)?;
    bytemuck::try_cast_slice_mut(&mut bytes[..n])
        .map_err(|_| ExecutionError::Misaligned { role }.into())
}
