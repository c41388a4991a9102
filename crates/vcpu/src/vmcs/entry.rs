//! VM-entry event injection fields.

use vmx::{VmcsField, VmxError, VmxFieldError};

use super::VmcsAccess;

pub trait EntryFields: VmcsAccess {
    /// The raw VM-entry interruption-information field.
    fn entry_interruption_info(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmEntryIntrInfoField)? as u32)
    }

    fn set_entry_interruption_info(&mut self, info: u32) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmEntryIntrInfoField, info as u64)
            .map_err(|err| err.set_field(VmxFieldError::VmEntryIntInfoField))
    }

    fn entry_exception_error_code(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmEntryExceptionErrorCode)? as u32)
    }

    fn set_entry_exception_error_code(&mut self, error_code: u32) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmEntryExceptionErrorCode, error_code as u64)
    }

    fn entry_instruction_length(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::VmEntryInstructionLen)? as u32)
    }

    fn set_entry_instruction_length(&mut self, length: u32) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmEntryInstructionLen, length as u64)
    }
}

impl<T: VmcsAccess + ?Sized> EntryFields for T {}
