//! Host-state area.
//!
//! The state loaded by the processor on every VM exit.

use vmx::{VmcsField, VmxError};

use super::VmcsAccess;
use crate::regs::{Cr0Flags, Cr4Flags, HostSegment};

pub trait HostFields: VmcsAccess {
    fn host_cr0(&self) -> Result<Cr0Flags, VmxError> {
        Ok(Cr0Flags::from_bits_truncate(self.vmcs_read(VmcsField::HostCr0)?))
    }

    fn set_host_cr0(&mut self, cr0: Cr0Flags) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostCr0, cr0.bits())
    }

    fn set_host_cr0_raw(&mut self, cr0: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostCr0, cr0)
    }

    fn host_cr3(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostCr3)
    }

    fn set_host_cr3(&mut self, cr3: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostCr3, cr3)
    }

    fn host_cr4(&self) -> Result<Cr4Flags, VmxError> {
        Ok(Cr4Flags::from_bits_truncate(self.vmcs_read(VmcsField::HostCr4)?))
    }

    fn set_host_cr4(&mut self, cr4: Cr4Flags) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostCr4, cr4.bits())
    }

    fn set_host_cr4_raw(&mut self, cr4: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostCr4, cr4)
    }

    fn host_rsp(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostRsp)
    }

    fn set_host_rsp(&mut self, rsp: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostRsp, rsp)
    }

    fn host_rip(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostRip)
    }

    fn set_host_rip(&mut self, rip: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostRip, rip)
    }

    fn host_gdtr_base(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostGdtrBase)
    }

    fn set_host_gdtr_base(&mut self, base: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostGdtrBase, base)
    }

    fn host_idtr_base(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostIdtrBase)
    }

    fn set_host_idtr_base(&mut self, base: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostIdtrBase, base)
    }

    fn host_fs_base(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostFsBase)
    }

    fn host_gs_base(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostGsBase)
    }

    fn host_tr_base(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::HostTrBase)
    }

    fn host_selector(&self, role: HostSegment) -> Result<u16, VmxError> {
        Ok(self.vmcs_read(role.selector_field())? as u16)
    }

    fn set_host_selector(&mut self, role: HostSegment, selector: u16) -> Result<(), VmxError> {
        self.vmcs_write(role.selector_field(), selector as u64)
    }

    /// Sets the selector of a host segment, and its base for FS, GS and TR.
    fn set_host_segment(
        &mut self,
        role: HostSegment,
        selector: u16,
        base: u64,
    ) -> Result<(), VmxError> {
        self.set_host_selector(role, selector)?;
        match role.base_field() {
            Some(field) => self.vmcs_write(field, base),
            None => Ok(()),
        }
    }

    fn set_host_sysenter(&mut self, cs: u32, esp: u64, eip: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::HostIa32SysenterCs, cs as u64)?;
        self.vmcs_write(VmcsField::HostIa32SysenterEsp, esp)?;
        self.vmcs_write(VmcsField::HostIa32SysenterEip, eip)
    }
}

impl<T: VmcsAccess + ?Sized> HostFields for T {}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::MemoryVmcs;

    #[test]
    fn round_trip() {
        let mut vmcs = MemoryVmcs::default();

        let cr0 = Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING;
        let cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION;
        vmcs.set_host_cr0(cr0).unwrap();
        vmcs.set_host_cr3(0x0010_0000).unwrap();
        vmcs.set_host_cr4(cr4).unwrap();
        assert_eq!(vmcs.host_cr0(), Ok(cr0));
        assert_eq!(vmcs.host_cr3(), Ok(0x0010_0000));
        assert_eq!(vmcs.host_cr4(), Ok(cr4));
        vmcs.set_host_cr4_raw(cr4.bits() | (1 << 28)).unwrap();
        assert_eq!(vmcs.vmcs_read(VmcsField::HostCr4), Ok(cr4.bits() | (1 << 28)));
        vmcs.set_host_cr0_raw(0x8005_0073).unwrap();
        assert_eq!(vmcs.vmcs_read(VmcsField::HostCr0), Ok(0x8005_0073));

        vmcs.set_host_rsp(0xFFFF_8000_0000_8000).unwrap();
        vmcs.set_host_rip(0xFFFF_8000_0040_0000).unwrap();
        assert_eq!(vmcs.host_rsp(), Ok(0xFFFF_8000_0000_8000));
        assert_eq!(vmcs.host_rip(), Ok(0xFFFF_8000_0040_0000));

        vmcs.set_host_gdtr_base(0x1000).unwrap();
        vmcs.set_host_idtr_base(0x2000).unwrap();
        assert_eq!(vmcs.host_gdtr_base(), Ok(0x1000));
        assert_eq!(vmcs.host_idtr_base(), Ok(0x2000));
    }

    #[test]
    fn segments() {
        let mut vmcs = MemoryVmcs::default();

        vmcs.set_host_segment(HostSegment::Cs, 0x08, 0xDEAD).unwrap();
        vmcs.set_host_segment(HostSegment::Fs, 0x00, 0x7000).unwrap();
        vmcs.set_host_segment(HostSegment::Gs, 0x00, 0x8000).unwrap();
        vmcs.set_host_segment(HostSegment::Tr, 0x40, 0x9000).unwrap();

        assert_eq!(vmcs.host_selector(HostSegment::Cs), Ok(0x08));
        assert_eq!(vmcs.host_selector(HostSegment::Tr), Ok(0x40));
        assert_eq!(vmcs.host_fs_base(), Ok(0x7000));
        assert_eq!(vmcs.host_gs_base(), Ok(0x8000));
        assert_eq!(vmcs.host_tr_base(), Ok(0x9000));

        // CS has no base field, nothing else was written
        assert_eq!(vmcs.len(), 7);
    }
}
