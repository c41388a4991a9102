//! VM-execution, VM-exit and VM-entry control fields.

use utils::HostPhysAddr;
use vmx::bitmaps::{
    EntryControls, ExceptionBitmap, ExitControls, PageFaultErrorCode, PinbasedControls,
    PrimaryControls, SecondaryControls,
};
use vmx::{VmcsField, VmxError, VmxFieldError};

use super::VmcsAccess;

/// The capability MSRs of a control field.
///
/// `true_spec` is the matching IA32_VMX_TRUE_*_CTLS MSR, when the processor reports them in
/// IA32_VMX_BASIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlMsr {
    pub spec: u64,
    pub true_spec: Option<u64>,
}

impl ControlMsr {
    /// Adjusts the requested controls to the capabilities, see [`vmx::adjust_controls`].
    pub fn adjust(&self, user: u32, known: u32) -> Result<u32, VmxError> {
        vmx::adjust_controls(user, known, self.spec, self.true_spec)
    }
}

pub trait ControlFields: VmcsAccess {
    fn vpid(&self) -> Result<u16, VmxError> {
        Ok(self.vmcs_read(VmcsField::VirtualProcessorId)? as u16)
    }

    fn set_vpid(&mut self, vpid: u16) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VirtualProcessorId, vpid as u64)
    }

    // ——————————————————————————————— Controls ——————————————————————————————— //

    fn pin_based_controls(&self) -> Result<PinbasedControls, VmxError> {
        let ctrls = self.vmcs_read(VmcsField::PinBasedVmExecControl)?;
        Ok(PinbasedControls::from_bits_truncate(ctrls as u32))
    }

    /// Writes the pin-based controls as is.
    fn set_pin_based_controls(&mut self, flags: PinbasedControls) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::PinBasedVmExecControl, flags.bits() as u64)
    }

    /// Sets the pin-based controls, adjusted to the processor capabilities.
    fn configure_pin_based_controls(
        &mut self,
        flags: PinbasedControls,
        caps: &ControlMsr,
    ) -> Result<(), VmxError> {
        let ctrls = caps
            .adjust(flags.bits(), PinbasedControls::all().bits())
            .map_err(|err| err.set_field(VmxFieldError::PinBasedControls))?;
        self.vmcs_write(VmcsField::PinBasedVmExecControl, ctrls as u64)
    }

    fn primary_controls(&self) -> Result<PrimaryControls, VmxError> {
        let ctrls = self.vmcs_read(VmcsField::CpuBasedVmExecControl)?;
        Ok(PrimaryControls::from_bits_truncate(ctrls as u32))
    }

    fn set_primary_controls(&mut self, flags: PrimaryControls) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::CpuBasedVmExecControl, flags.bits() as u64)
    }

    fn configure_primary_controls(
        &mut self,
        flags: PrimaryControls,
        caps: &ControlMsr,
    ) -> Result<(), VmxError> {
        let ctrls = caps
            .adjust(flags.bits(), PrimaryControls::all().bits())
            .map_err(|err| err.set_field(VmxFieldError::PrimaryControls))?;
        self.vmcs_write(VmcsField::CpuBasedVmExecControl, ctrls as u64)
    }

    fn secondary_controls(&self) -> Result<SecondaryControls, VmxError> {
        let ctrls = self.vmcs_read(VmcsField::SecondaryVmExecControl)?;
        Ok(SecondaryControls::from_bits_truncate(ctrls as u32))
    }

    fn set_secondary_controls(&mut self, flags: SecondaryControls) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::SecondaryVmExecControl, flags.bits() as u64)
    }

    /// Secondary controls have no true capability MSR, `caps.true_spec` is ignored.
    fn configure_secondary_controls(
        &mut self,
        flags: SecondaryControls,
        caps: &ControlMsr,
    ) -> Result<(), VmxError> {
        let ctrls = vmx::adjust_controls(flags.bits(), SecondaryControls::all().bits(), caps.spec, None)
            .map_err(|err| err.set_field(VmxFieldError::SecondaryControls))?;
        self.vmcs_write(VmcsField::SecondaryVmExecControl, ctrls as u64)
    }

    fn exit_controls(&self) -> Result<ExitControls, VmxError> {
        let ctrls = self.vmcs_read(VmcsField::VmExitControls)?;
        Ok(ExitControls::from_bits_truncate(ctrls as u32))
    }

    fn set_exit_controls(&mut self, flags: ExitControls) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmExitControls, flags.bits() as u64)
    }

    fn configure_exit_controls(
        &mut self,
        flags: ExitControls,
        caps: &ControlMsr,
    ) -> Result<(), VmxError> {
        let ctrls = caps
            .adjust(flags.bits(), ExitControls::all().bits())
            .map_err(|err| err.set_field(VmxFieldError::ExitControls))?;
        self.vmcs_write(VmcsField::VmExitControls, ctrls as u64)
    }

    fn entry_controls(&self) -> Result<EntryControls, VmxError> {
        let ctrls = self.vmcs_read(VmcsField::VmEntryControls)?;
        Ok(EntryControls::from_bits_truncate(ctrls as u32))
    }

    fn set_entry_controls(&mut self, flags: EntryControls) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmEntryControls, flags.bits() as u64)
    }

    fn configure_entry_controls(
        &mut self,
        flags: EntryControls,
        caps: &ControlMsr,
    ) -> Result<(), VmxError> {
        let ctrls = caps
            .adjust(flags.bits(), EntryControls::all().bits())
            .map_err(|err| err.set_field(VmxFieldError::EntryControls))?;
        self.vmcs_write(VmcsField::VmEntryControls, ctrls as u64)
    }

    // ——————————————————————————— Bitmaps & Masks ———————————————————————————— //

    fn exception_bitmap(&self) -> Result<ExceptionBitmap, VmxError> {
        let bitmap = self.vmcs_read(VmcsField::ExceptionBitmap)?;
        Ok(ExceptionBitmap::from_bits_truncate(bitmap as u32))
    }

    fn set_exception_bitmap(&mut self, bitmap: ExceptionBitmap) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::ExceptionBitmap, bitmap.bits() as u64)
    }

    fn msr_bitmap(&self) -> Result<HostPhysAddr, VmxError> {
        Ok(HostPhysAddr::from(self.vmcs_read(VmcsField::MsrBitmap)?))
    }

    fn set_msr_bitmap(&mut self, addr: HostPhysAddr) -> Result<(), VmxError> {
        if !addr.is_aligned(0x1000) {
            return Err(VmxError::Misconfigured(VmxFieldError::MsrBitmaps));
        }
        self.vmcs_write(VmcsField::MsrBitmap, addr.as_u64())
    }

    fn io_bitmap_a(&self) -> Result<HostPhysAddr, VmxError> {
        Ok(HostPhysAddr::from(self.vmcs_read(VmcsField::IoBitmapA)?))
    }

    fn io_bitmap_b(&self) -> Result<HostPhysAddr, VmxError> {
        Ok(HostPhysAddr::from(self.vmcs_read(VmcsField::IoBitmapB)?))
    }

    /// Sets both I/O bitmaps, A covers ports 0x0000-0x7FFF and B ports 0x8000-0xFFFF.
    fn set_io_bitmaps(&mut self, a: HostPhysAddr, b: HostPhysAddr) -> Result<(), VmxError> {
        if !a.is_aligned(0x1000) || !b.is_aligned(0x1000) {
            return Err(VmxError::Misconfigured(VmxFieldError::IoBitmaps));
        }
        self.vmcs_write(VmcsField::IoBitmapA, a.as_u64())?;
        self.vmcs_write(VmcsField::IoBitmapB, b.as_u64())
    }

    fn page_fault_error_code_mask(&self) -> Result<PageFaultErrorCode, VmxError> {
        let mask = self.vmcs_read(VmcsField::PageFaultErrorCodeMask)?;
        Ok(PageFaultErrorCode::from_bits_truncate(mask as u32))
    }

    fn set_page_fault_error_code_mask(&mut self, mask: PageFaultErrorCode) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::PageFaultErrorCodeMask, mask.bits() as u64)
    }

    fn page_fault_error_code_match(&self) -> Result<PageFaultErrorCode, VmxError> {
        let pf_match = self.vmcs_read(VmcsField::PageFaultErrorCodeMatch)?;
        Ok(PageFaultErrorCode::from_bits_truncate(pf_match as u32))
    }

    fn set_page_fault_error_code_match(
        &mut self,
        pf_match: PageFaultErrorCode,
    ) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::PageFaultErrorCodeMatch, pf_match.bits() as u64)
    }

    // ——————————————————————————————— Pointers ——————————————————————————————— //

    fn ept_pointer(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::EptPointer)
    }

    fn set_ept_pointer(&mut self, eptp: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::EptPointer, eptp)
    }

    fn vmcs_link_pointer(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::VmcsLinkPointer)
    }

    fn set_vmcs_link_pointer(&mut self, pointer: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::VmcsLinkPointer, pointer)
    }

    // ———————————————————————— Control Register Masks ———————————————————————— //

    fn cr0_guest_host_mask(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::Cr0GuestHostMask)
    }

    fn set_cr0_guest_host_mask(&mut self, mask: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::Cr0GuestHostMask, mask)
    }

    fn cr0_read_shadow(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::Cr0ReadShadow)
    }

    fn set_cr0_read_shadow(&mut self, shadow: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::Cr0ReadShadow, shadow)
    }

    fn cr4_guest_host_mask(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::Cr4GuestHostMask)
    }

    fn set_cr4_guest_host_mask(&mut self, mask: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::Cr4GuestHostMask, mask)
    }

    fn cr4_read_shadow(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::Cr4ReadShadow)
    }

    fn set_cr4_read_shadow(&mut self, shadow: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::Cr4ReadShadow, shadow)
    }
}

impl<T: VmcsAccess + ?Sized> ControlFields for T {}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::MemoryVmcs;

    #[test]
    fn round_trip() {
        let mut vmcs = MemoryVmcs::default();

        vmcs.set_vpid(7).unwrap();
        assert_eq!(vmcs.vpid(), Ok(7));

        let primary = PrimaryControls::USE_MSR_BITMAPS | PrimaryControls::SECONDARY_CONTROLS;
        vmcs.set_primary_controls(primary).unwrap();
        assert_eq!(vmcs.primary_controls(), Ok(primary));

        let secondary = SecondaryControls::ENABLE_EPT | SecondaryControls::ENABLE_VPID;
        vmcs.set_secondary_controls(secondary).unwrap();
        assert_eq!(vmcs.secondary_controls(), Ok(secondary));

        vmcs.set_pin_based_controls(PinbasedControls::NMI_EXITING).unwrap();
        assert_eq!(vmcs.pin_based_controls(), Ok(PinbasedControls::NMI_EXITING));

        vmcs.set_exit_controls(ExitControls::HOST_ADDRESS_SPACE_SIZE).unwrap();
        assert_eq!(vmcs.exit_controls(), Ok(ExitControls::HOST_ADDRESS_SPACE_SIZE));

        vmcs.set_entry_controls(EntryControls::IA32E_MODE_GUEST).unwrap();
        assert_eq!(vmcs.entry_controls(), Ok(EntryControls::IA32E_MODE_GUEST));

        let bitmap = ExceptionBitmap::PAGE_FAULT | ExceptionBitmap::BREAKPOINT;
        vmcs.set_exception_bitmap(bitmap).unwrap();
        assert_eq!(vmcs.exception_bitmap(), Ok(bitmap));

        vmcs.set_msr_bitmap(HostPhysAddr::new(0x5000)).unwrap();
        assert_eq!(vmcs.msr_bitmap(), Ok(HostPhysAddr::new(0x5000)));

        vmcs.set_io_bitmaps(HostPhysAddr::new(0x6000), HostPhysAddr::new(0x7000)).unwrap();
        assert_eq!(vmcs.io_bitmap_a(), Ok(HostPhysAddr::new(0x6000)));
        assert_eq!(vmcs.io_bitmap_b(), Ok(HostPhysAddr::new(0x7000)));

        vmcs.set_page_fault_error_code_mask(PageFaultErrorCode::WRITE).unwrap();
        vmcs.set_page_fault_error_code_match(PageFaultErrorCode::PRESENT).unwrap();
        assert_eq!(vmcs.page_fault_error_code_mask(), Ok(PageFaultErrorCode::WRITE));
        assert_eq!(vmcs.page_fault_error_code_match(), Ok(PageFaultErrorCode::PRESENT));

        vmcs.set_ept_pointer(0x8000 | 0x1E).unwrap();
        assert_eq!(vmcs.ept_pointer(), Ok(0x801E));

        vmcs.set_vmcs_link_pointer(u64::MAX).unwrap();
        assert_eq!(vmcs.vmcs_link_pointer(), Ok(u64::MAX));

        vmcs.set_cr0_guest_host_mask(1 << 3).unwrap();
        vmcs.set_cr0_read_shadow(0x8000_0031).unwrap();
        vmcs.set_cr4_guest_host_mask(1 << 13).unwrap();
        vmcs.set_cr4_read_shadow(0x20).unwrap();
        assert_eq!(vmcs.cr0_guest_host_mask(), Ok(1 << 3));
        assert_eq!(vmcs.cr0_read_shadow(), Ok(0x8000_0031));
        assert_eq!(vmcs.cr4_guest_host_mask(), Ok(1 << 13));
        assert_eq!(vmcs.cr4_read_shadow(), Ok(0x20));
    }

    #[test]
    fn misaligned_bitmaps() {
        let mut vmcs = MemoryVmcs::default();
        assert_eq!(
            vmcs.set_msr_bitmap(HostPhysAddr::new(0x5008)),
            Err(VmxError::Misconfigured(VmxFieldError::MsrBitmaps))
        );
        assert_eq!(
            vmcs.set_io_bitmaps(HostPhysAddr::new(0x6000), HostPhysAddr::new(0x7010)),
            Err(VmxError::Misconfigured(VmxFieldError::IoBitmaps))
        );
    }

    #[rustfmt::skip]
    #[test]
    fn configure_controls() {
        let mut vmcs = MemoryVmcs::default();

        // Bit 1 must be 1, bit 3 may be either, everything else must be 0
        let caps = ControlMsr {
            spec: (0b1010 << 32) | 0b0010,
            true_spec: None,
        };
        vmcs.configure_pin_based_controls(PinbasedControls::NMI_EXITING, &caps).unwrap();
        assert_eq!(vmcs.vmcs_read(VmcsField::PinBasedVmExecControl), Ok(0b1010));

        assert_eq!(
            vmcs.configure_pin_based_controls(PinbasedControls::EXTERNAL_INTERRUPT_EXITING, &caps),
            Err(VmxError::Disallowed1(VmxFieldError::PinBasedControls, 0))
        );
    }
}
