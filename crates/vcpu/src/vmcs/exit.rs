//! VM-exit information fields.
//!
//! These fields are written by the processor on VM exits and are read-only.

use utils::{GuestPhysAddr, GuestVirtAddr};
use vmx::{ExitReason, VmcsField, VmxError, VmxExitQualification, VmxInstructionError};

use super::VmcsAccess;
use crate::interrupt::InterruptInfo;

pub trait ExitFields: VmcsAccess {
    /// The error of the last failed VMX instruction.
    fn instruction_error(&self) -> Result<VmxInstructionError, VmxError> {
        let err = self.vmcs_read(VmcsField::VmInstructionError)?;
        Ok(VmxInstructionError::from_u64(err))
    }

    /// Decoding information of the VMX instruction (or descriptor table access) that exited.
    fn instruction_info(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmxInstructionInfo)? as u32)
    }

    fn exit_instruction_length(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmExitInstructionLen)? as u32)
    }

    fn exit_interruption_info(&self) -> Result<InterruptInfo, VmxError> {
        let info = self.vmcs_read(VmcsField::VmExitIntrInfo)? as u32;
        let error_code = self.exit_interruption_error_code()?;
        Ok(InterruptInfo::from_exit(info, error_code))
    }

    fn exit_interruption_error_code(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmExitIntrErrorCode)? as u32)
    }

    fn exit_reason(&self) -> Result<ExitReason, VmxError> {
        Ok(ExitReason::from_u64(self.vmcs_read(VmcsField::VmExitReason)?))
    }

    fn exit_qualification(&self) -> Result<VmxExitQualification, VmxError> {
        let raw = self.vmcs_read(VmcsField::ExitQualification)?;
        Ok(VmxExitQualification { raw })
    }

    /// The faulting guest physical address, valid for EPT violations and misconfigurations.
    fn guest_physical_address(&self) -> Result<GuestPhysAddr, VmxError> {
        Ok(GuestPhysAddr::from(self.vmcs_read(VmcsField::GuestPhysicalAddress)?))
    }

    fn guest_linear_address(&self) -> Result<GuestVirtAddr, VmxError> {
        Ok(GuestVirtAddr::from(self.vmcs_read(VmcsField::GuestLinearAddress)?))
    }

    /// The event that was being delivered when the exit occured, if any.
    fn idt_vectoring_info(&self) -> Result<InterruptInfo, VmxError> {
        let info = self.vmcs_read(VmcsField::IdtVectoringInfoField)? as u32;
        let error_code = self.vmcs_read(VmcsField::IdtVectoringErrorCode)? as u32;
        Ok(InterruptInfo::from_exit(info, error_code))
    }
}

impl<T: VmcsAccess + ?Sized> ExitFields for T {}

// ————————————————————————————————— Tests —————————————————————————————————— //
