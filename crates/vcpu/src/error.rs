//! VCPU errors

use utils::HostVirtAddr;
use vmx::VmxError;

use crate::vcpu::VcpuState;

/// An error returned by the VCPU lifecycle operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VcpuError {
    /// A VMX instruction or configuration check failed.
    Vmx(VmxError),

    /// The operation is not permitted in the current state of the VCPU.
    InvalidState {
        expected: VcpuState,
        actual: VcpuState,
    },

    /// One of the structures handed to the hardware has no physical backing.
    UnmappedAddress(HostVirtAddr),
}

impl From<VmxError> for VcpuError {
    fn from(err: VmxError) -> Self {
        Self::Vmx(err)
    }
}

impl VcpuError {
    /// The underlying VMX error, if any.
    pub fn vmx(self) -> Option<VmxError> {
        match self {
            Self::Vmx(err) => Some(err),
            _ => None,
        }
    }
}
