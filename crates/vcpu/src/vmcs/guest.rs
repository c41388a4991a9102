//! Guest-state area.

use vmx::{VmcsField, VmxError};

use super::VmcsAccess;
use crate::regs::{
    Cr0Flags, Cr4Flags, DescriptorTable, RFlags, Segment, SegmentAccess, SegmentRegister,
};

const RFLAGS_RESERVED_1: u64 = 1 << 1;

/// Named accessors for one segment role.
macro_rules! guest_segment {
    ($get:ident, $set:ident, $role:expr) => {
        fn $get(&self) -> Result<Segment, VmxError> {
            self.guest_segment($role)
        }

        fn $set(&mut self, segment: &Segment) -> Result<(), VmxError> {
            self.set_guest_segment($role, segment)
        }
    };
}

pub trait GuestFields: VmcsAccess {
    // ——————————————————————————— Control Registers —————————————————————————— //

    fn guest_cr0(&self) -> Result<Cr0Flags, VmxError> {
        Ok(Cr0Flags::from_bits_truncate(self.vmcs_read(VmcsField::GuestCr0)?))
    }

    fn set_guest_cr0(&mut self, cr0: Cr0Flags) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestCr0, cr0.bits())
    }

    /// Guest CR0, including the bits without a [`Cr0Flags`] flag.
    fn guest_cr0_raw(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestCr0)
    }

    fn set_guest_cr0_raw(&mut self, cr0: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestCr0, cr0)
    }

    /// Guest CR3, including the PCID and flags bits.
    fn guest_cr3(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestCr3)
    }

    fn set_guest_cr3(&mut self, cr3: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestCr3, cr3)
    }

    fn guest_cr4(&self) -> Result<Cr4Flags, VmxError> {
        Ok(Cr4Flags::from_bits_truncate(self.vmcs_read(VmcsField::GuestCr4)?))
    }

    fn set_guest_cr4(&mut self, cr4: Cr4Flags) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestCr4, cr4.bits())
    }

    /// Guest CR4, including the bits without a [`Cr4Flags`] flag.
    fn guest_cr4_raw(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestCr4)
    }

    fn set_guest_cr4_raw(&mut self, cr4: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestCr4, cr4)
    }

    fn guest_dr7(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestDr7)
    }

    fn set_guest_dr7(&mut self, dr7: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestDr7, dr7)
    }

    /// The guest IA32_DEBUGCTL MSR, loaded on entry with the "load debug controls" control.
    fn guest_debugctl(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestIa32Debugctl)
    }

    fn set_guest_debugctl(&mut self, debugctl: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestIa32Debugctl, debugctl)
    }

    // ————————————————————————————— Instruction Flow ————————————————————————— //

    fn guest_rsp(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestRsp)
    }

    fn set_guest_rsp(&mut self, rsp: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestRsp, rsp)
    }

    fn guest_rip(&self) -> Result<u64, VmxError> {
        self.vmcs_read(VmcsField::GuestRip)
    }

    fn set_guest_rip(&mut self, rip: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestRip, rip)
    }

    fn guest_rflags(&self) -> Result<RFlags, VmxError> {
        Ok(RFlags::from_bits_truncate(self.vmcs_read(VmcsField::GuestRflags)?))
    }

    /// Bit 1 of RFLAGS is reserved and always written as 1.
    fn set_guest_rflags(&mut self, rflags: RFlags) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestRflags, rflags.bits() | RFLAGS_RESERVED_1)
    }

    // ———————————————————————————— Descriptor Tables ————————————————————————— //

    fn guest_gdtr(&self) -> Result<DescriptorTable, VmxError> {
        Ok(DescriptorTable {
            base: self.vmcs_read(VmcsField::GuestGdtrBase)?,
            limit: self.vmcs_read(VmcsField::GuestGdtrLimit)? as u16,
        })
    }

    fn set_guest_gdtr(&mut self, gdtr: &DescriptorTable) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestGdtrBase, gdtr.base)?;
        self.vmcs_write(VmcsField::GuestGdtrLimit, gdtr.limit as u64)
    }

    fn guest_idtr(&self) -> Result<DescriptorTable, VmxError> {
        Ok(DescriptorTable {
            base: self.vmcs_read(VmcsField::GuestIdtrBase)?,
            limit: self.vmcs_read(VmcsField::GuestIdtrLimit)? as u16,
        })
    }

    fn set_guest_idtr(&mut self, idtr: &DescriptorTable) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestIdtrBase, idtr.base)?;
        self.vmcs_write(VmcsField::GuestIdtrLimit, idtr.limit as u64)
    }

    // ——————————————————————————————— Segments ——————————————————————————————— //

    fn guest_segment(&self, role: SegmentRegister) -> Result<Segment, VmxError> {
        Ok(Segment {
            selector: self.guest_selector(role)?,
            base: self.guest_base(role)?,
            limit: self.guest_limit(role)?,
            access: self.guest_access(role)?,
        })
    }

    fn set_guest_segment(&mut self, role: SegmentRegister, segment: &Segment) -> Result<(), VmxError> {
        self.vmcs_write(role.selector_field(), segment.selector as u64)?;
        self.vmcs_write(role.base_field(), segment.base)?;
        self.vmcs_write(role.limit_field(), segment.limit as u64)?;
        self.vmcs_write(role.access_field(), segment.access.bits() as u64)
    }

    fn guest_selector(&self, role: SegmentRegister) -> Result<u16, VmxError> {
        Ok(self.vmcs_read(role.selector_field())? as u16)
    }

    fn guest_base(&self, role: SegmentRegister) -> Result<u64, VmxError> {
        self.vmcs_read(role.base_field())
    }

    fn guest_limit(&self, role: SegmentRegister) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(role.limit_field())? as u32)
    }

    fn guest_access(&self, role: SegmentRegister) -> Result<SegmentAccess, VmxError> {
        let access = self.vmcs_read(role.access_field())?;
        Ok(SegmentAccess::from_bits_truncate(access as u32))
    }

    guest_segment!(guest_es, set_guest_es, SegmentRegister::Es);
    guest_segment!(guest_cs, set_guest_cs, SegmentRegister::Cs);
    guest_segment!(guest_ss, set_guest_ss, SegmentRegister::Ss);
    guest_segment!(guest_ds, set_guest_ds, SegmentRegister::Ds);
    guest_segment!(guest_fs, set_guest_fs, SegmentRegister::Fs);
    guest_segment!(guest_gs, set_guest_gs, SegmentRegister::Gs);
    guest_segment!(guest_ldtr, set_guest_ldtr, SegmentRegister::Ldtr);
    guest_segment!(guest_tr, set_guest_tr, SegmentRegister::Tr);

    // ———————————————————————————————— SYSENTER —————————————————————————————— //

    fn guest_sysenter_cs(&self) -> Result<u32, VmxError> {
        Ok(self.vmcs_read(VmcsField::GuestSysenterCs)? as u32)
    }

    fn set_guest_sysenter(&mut self, cs: u32, esp: u64, eip: u64) -> Result<(), VmxError> {
        self.vmcs_write(VmcsField::GuestSysenterCs, cs as u64)?;
        self.vmcs_write(VmcsField::GuestSysenterEsp, esp)?;
        self.vmcs_write(VmcsField::GuestSysenterEip, eip)
    }
}

impl<T: VmcsAccess + ?Sized> GuestFields for T {}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::MemoryVmcs;

    #[test]
    fn round_trip() {
        let mut vmcs = MemoryVmcs::default();

        let cr0 = Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING | Cr0Flags::NUMERIC_ERROR;
        vmcs.set_guest_cr0(cr0).unwrap();
        assert_eq!(vmcs.guest_cr0(), Ok(cr0));

        vmcs.set_guest_cr3(0x1000 | 0x5).unwrap();
        assert_eq!(vmcs.guest_cr3(), Ok(0x1005));

        let cr4 = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS;
        vmcs.set_guest_cr4(cr4).unwrap();
        assert_eq!(vmcs.guest_cr4(), Ok(cr4));

        // Bits unknown to the typed flags (CR4.UINTR) survive the raw accessors only
        let raw_cr4 = cr4.bits() | (1 << 25);
        vmcs.set_guest_cr4_raw(raw_cr4).unwrap();
        assert_eq!(vmcs.guest_cr4_raw(), Ok(raw_cr4));
        assert_eq!(vmcs.guest_cr4(), Ok(cr4));
        vmcs.set_guest_cr0_raw(cr0.bits() | (1 << 6)).unwrap();
        assert_eq!(vmcs.guest_cr0_raw(), Ok(cr0.bits() | (1 << 6)));

        vmcs.set_guest_dr7(0x400).unwrap();
        vmcs.set_guest_debugctl(0x1).unwrap();
        assert_eq!(vmcs.guest_dr7(), Ok(0x400));
        assert_eq!(vmcs.guest_debugctl(), Ok(0x1));

        vmcs.set_guest_rsp(0xFFFF_8000_0000_1000).unwrap();
        vmcs.set_guest_rip(0xFFFF_8000_0000_2000).unwrap();
        vmcs.set_guest_rflags(RFlags::INTERRUPT_FLAG).unwrap();
        assert_eq!(vmcs.guest_rsp(), Ok(0xFFFF_8000_0000_1000));
        assert_eq!(vmcs.guest_rip(), Ok(0xFFFF_8000_0000_2000));
        assert_eq!(vmcs.guest_rflags(), Ok(RFlags::INTERRUPT_FLAG));
        assert_eq!(vmcs.vmcs_read(VmcsField::GuestRflags), Ok(0x202));

        let gdtr = DescriptorTable { base: 0xFFFF_8000_0010_0000, limit: 0x7F };
        let idtr = DescriptorTable { base: 0xFFFF_8000_0020_0000, limit: 0xFFF };
        vmcs.set_guest_gdtr(&gdtr).unwrap();
        vmcs.set_guest_idtr(&idtr).unwrap();
        assert_eq!(vmcs.guest_gdtr(), Ok(gdtr));
        assert_eq!(vmcs.guest_idtr(), Ok(idtr));

        vmcs.set_guest_sysenter(0x10, 0x2000, 0x3000).unwrap();
        assert_eq!(vmcs.guest_sysenter_cs(), Ok(0x10));
    }

    #[test]
    fn segments() {
        let mut vmcs = MemoryVmcs::default();

        let cs = Segment {
            selector: 0x10,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: SegmentAccess::from_bits_truncate(0xA09B),
        };
        let tr = Segment {
            selector: 0x40,
            base: 0xFFFF_8000_1234_5000,
            limit: 0x67,
            access: SegmentAccess::from_bits_truncate(0x8B),
        };

        vmcs.set_guest_cs(&cs).unwrap();
        vmcs.set_guest_segment(SegmentRegister::Tr, &tr).unwrap();
        vmcs.set_guest_ldtr(&Segment::unusable(0)).unwrap();

        assert_eq!(vmcs.guest_segment(SegmentRegister::Cs), Ok(cs));
        assert_eq!(vmcs.guest_tr(), Ok(tr));
        assert_eq!(vmcs.guest_selector(SegmentRegister::Tr), Ok(0x40));
        assert_eq!(vmcs.guest_base(SegmentRegister::Tr), Ok(0xFFFF_8000_1234_5000));
        assert_eq!(vmcs.guest_limit(SegmentRegister::Cs), Ok(0xFFFF_FFFF));
        assert!(!vmcs.guest_ldtr().unwrap().is_usable());

        // Roles do not alias each other
        assert_eq!(vmcs.guest_ds().unwrap().selector, 0);
    }
}
