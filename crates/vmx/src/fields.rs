//! VMCS field encodings.
//!
//! Only the fields programmed or inspected by the VCPU are listed here, see Intel SDM Vol. 3D
//! Appendix B for the complete table.

// ———————————————————————— Masks from Intel Manual ————————————————————————— //
// All these are defined in table 25-21 of chapter 25.11.2 in the Intel Manual.
// (VMREAD, VMWRITE, and Encodings of VMCS Fields)
// VMCS Shifts.
pub const VMCS_FIELD_ACCESS_TYPE_SHIFT: u32 = 0;
pub const VMCS_FIELD_INDEX_SHIFT: u32 = 1;
pub const VMCS_FIELD_TYPE_SHIFT: u32 = 10;
pub const VMCS_FIELD_WIDTH_SHIFT: u32 = 13;
// VMCS Masks.
pub const VMCS_FIELD_ACCESS_TYPE_MASK: u32 = 1 << VMCS_FIELD_ACCESS_TYPE_SHIFT;
pub const VMCS_FIELD_INDEX_MASK: u32 = (0b111_111_111) << VMCS_FIELD_INDEX_SHIFT;
pub const VMCS_FIELD_TYPE_MASK: u32 = (0b11) << VMCS_FIELD_TYPE_SHIFT;
pub const VMCS_FIELD_WIDTH_MASK: u32 = (0b11) << VMCS_FIELD_WIDTH_SHIFT;

// ———————————————————————————— Enum for Fields ————————————————————————————— //

#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
#[repr(u32)]
pub enum VmcsField {
    // 16 bits
    VirtualProcessorId = 0x00000000,
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080a,
    GuestLdtrSelector = 0x0000080c,
    GuestTrSelector = 0x0000080e,
    HostEsSelector = 0x00000c00,
    HostCsSelector = 0x00000c02,
    HostSsSelector = 0x00000c04,
    HostDsSelector = 0x00000c06,
    HostFsSelector = 0x00000c08,
    HostGsSelector = 0x00000c0a,
    HostTrSelector = 0x00000c0c,

    // 64 bits
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    MsrBitmap = 0x00002004,
    TscOffset = 0x00002010,
    EptPointer = 0x0000201a,
    GuestPhysicalAddress = 0x00002400,
    VmcsLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Pat = 0x00002804,
    GuestIa32Efer = 0x00002806,

    // 32 bits
    PinBasedVmExecControl = 0x00004000,
    CpuBasedVmExecControl = 0x00004002,
    ExceptionBitmap = 0x00004004,
    PageFaultErrorCodeMask = 0x00004006,
    PageFaultErrorCodeMatch = 0x00004008,
    Cr3TargetCount = 0x0000400a,
    VmExitControls = 0x0000400c,
    VmExitMsrStoreCount = 0x0000400e,
    VmExitMsrLoadCount = 0x00004010,
    VmEntryControls = 0x00004012,
    VmEntryMsrLoadCount = 0x00004014,
    VmEntryIntrInfoField = 0x00004016,
    VmEntryExceptionErrorCode = 0x00004018,
    VmEntryInstructionLen = 0x0000401a,
    SecondaryVmExecControl = 0x0000401e,
    VmInstructionError = 0x00004400,
    VmExitReason = 0x00004402,
    VmExitIntrInfo = 0x00004404,
    VmExitIntrErrorCode = 0x00004406,
    IdtVectoringInfoField = 0x00004408,
    IdtVectoringErrorCode = 0x0000440a,
    VmExitInstructionLen = 0x0000440c,
    VmxInstructionInfo = 0x0000440e,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480a,
    GuestLdtrLimit = 0x0000480c,
    GuestTrLimit = 0x0000480e,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsArBytes = 0x00004814,
    GuestCsArBytes = 0x00004816,
    GuestSsArBytes = 0x00004818,
    GuestDsArBytes = 0x0000481a,
    GuestFsArBytes = 0x0000481c,
    GuestGsArBytes = 0x0000481e,
    GuestLdtrArBytes = 0x00004820,
    GuestTrArBytes = 0x00004822,
    GuestInterruptibilityInfo = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestSysenterCs = 0x0000482a,
    HostIa32SysenterCs = 0x00004c00,

    // Natural width
    Cr0GuestHostMask = 0x00006000,
    Cr4GuestHostMask = 0x00006002,
    Cr0ReadShadow = 0x00006004,
    Cr4ReadShadow = 0x00006006,
    ExitQualification = 0x00006400,
    GuestLinearAddress = 0x0000640a,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680a,
    GuestDsBase = 0x0000680c,
    GuestFsBase = 0x0000680e,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681a,
    GuestRsp = 0x0000681c,
    GuestRip = 0x0000681e,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestSysenterEsp = 0x00006824,
    GuestSysenterEip = 0x00006826,
    HostCr0 = 0x00006c00,
    HostCr3 = 0x00006c02,
    HostCr4 = 0x00006c04,
    HostFsBase = 0x00006c06,
    HostGsBase = 0x00006c08,
    HostTrBase = 0x00006c0a,
    HostGdtrBase = 0x00006c0c,
    HostIdtrBase = 0x00006c0e,
    HostIa32SysenterEsp = 0x00006c10,
    HostIa32SysenterEip = 0x00006c12,
    HostRsp = 0x00006c14,
    HostRip = 0x00006c16,
}

/// Valid VmcsFieldAccessType as encoded in a VMCS.
/// See chapter 25.11.2 and table 25-21 in the Intel manual.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldAccessType {
    Full = 0,
    High = 1,
}

/// Valid VmcsFieldWidth as encoded in a VMCS.
/// See chapter 25.11.2 and table 25-21 in the Intel manual.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldWidth {
    Width16 = 0,
    Width64 = 1,
    Width32 = 2,
    WidthNat = 3,
}

impl VmcsFieldWidth {
    pub fn from_raw(v: u8) -> VmcsFieldWidth {
        match v & 0b11 {
            0 => VmcsFieldWidth::Width16,
            1 => VmcsFieldWidth::Width64,
            2 => VmcsFieldWidth::Width32,
            _ => VmcsFieldWidth::WidthNat,
        }
    }

    /// Mask of the bits that a field of this width can hold on a 64 bits processor.
    pub fn mask(self) -> u64 {
        match self {
            VmcsFieldWidth::Width16 => 0xFFFF,
            VmcsFieldWidth::Width32 => 0xFFFF_FFFF,
            VmcsFieldWidth::Width64 | VmcsFieldWidth::WidthNat => u64::MAX,
        }
    }
}

/// Types of VMCSFields.
/// See Chapter 25.11.2 table 25-21 in the Intel manual.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum VmcsFieldType {
    Control = 0,
    VmExitInformation = 1,
    GuestState = 2,
    HostState = 3,
}

impl VmcsFieldType {
    pub fn from_raw(v: u8) -> VmcsFieldType {
        match v & 0b11 {
            0 => VmcsFieldType::Control,
            1 => VmcsFieldType::VmExitInformation,
            2 => VmcsFieldType::GuestState,
            _ => VmcsFieldType::HostState,
        }
    }

    pub fn is_vmwritable(&self) -> bool {
        !matches!(self, VmcsFieldType::VmExitInformation)
    }
}

impl VmcsField {
    #[inline]
    pub fn raw(&self) -> u32 {
        *self as u32
    }

    /// Get the VmcsField width.
    pub fn width(&self) -> VmcsFieldWidth {
        VmcsFieldWidth::from_raw(((self.raw() & VMCS_FIELD_WIDTH_MASK) >> VMCS_FIELD_WIDTH_SHIFT) as u8)
    }

    /// Get the VmcsField type.
    pub fn tpe(&self) -> VmcsFieldType {
        VmcsFieldType::from_raw(((self.raw() & VMCS_FIELD_TYPE_MASK) >> VMCS_FIELD_TYPE_SHIFT) as u8)
    }

    pub fn access_type(&self) -> VmcsFieldAccessType {
        if self.raw() & VMCS_FIELD_ACCESS_TYPE_MASK == 0 {
            VmcsFieldAccessType::Full
        } else {
            VmcsFieldAccessType::High
        }
    }

    /// Index of the field within its width/type group, bits 9:1 of the encoding.
    pub fn index(&self) -> u32 {
        (self.raw() & VMCS_FIELD_INDEX_MASK) >> VMCS_FIELD_INDEX_SHIFT
    }

    /// Returns true if the field is for sure not supported by a CPU reporting `vmcs_enum` in the
    /// IA32_VMX_VMCS_ENUM MSR.
    ///
    /// See Intel manual volume 3 annex A.9.
    pub fn is_unsupported(&self, vmcs_enum: u64) -> bool {
        (self.raw() as u64 & 0b11_1111_1110) > (vmcs_enum & 0b11_1111_1110)
    }
}

/// General purpose registers, numbered the way VM-exit qualifications and instruction information
/// encode them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralPurposeField {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GeneralPurposeField {
    pub fn from_raw(v: u64) -> GeneralPurposeField {
        match v & 0b1111 {
            0 => GeneralPurposeField::Rax,
            1 => GeneralPurposeField::Rcx,
            2 => GeneralPurposeField::Rdx,
            3 => GeneralPurposeField::Rbx,
            4 => GeneralPurposeField::Rsp,
            5 => GeneralPurposeField::Rbp,
            6 => GeneralPurposeField::Rsi,
            7 => GeneralPurposeField::Rdi,
            8 => GeneralPurposeField::R8,
            9 => GeneralPurposeField::R9,
            10 => GeneralPurposeField::R10,
            11 => GeneralPurposeField::R11,
            12 => GeneralPurposeField::R12,
            13 => GeneralPurposeField::R13,
            14 => GeneralPurposeField::R14,
            _ => GeneralPurposeField::R15,
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn field_width() {
        assert_eq!(VmcsField::VirtualProcessorId.width(), VmcsFieldWidth::Width16);
        assert_eq!(VmcsField::HostTrSelector.width(), VmcsFieldWidth::Width16);
        assert_eq!(VmcsField::EptPointer.width(), VmcsFieldWidth::Width64);
        assert_eq!(VmcsField::VmcsLinkPointer.width(), VmcsFieldWidth::Width64);
        assert_eq!(VmcsField::VmEntryIntrInfoField.width(), VmcsFieldWidth::Width32);
        assert_eq!(VmcsField::GuestTrArBytes.width(), VmcsFieldWidth::Width32);
        assert_eq!(VmcsField::GuestRip.width(), VmcsFieldWidth::WidthNat);
        assert_eq!(VmcsField::HostRsp.width(), VmcsFieldWidth::WidthNat);
    }

    #[test]
    fn field_type() {
        assert_eq!(VmcsField::MsrBitmap.tpe(), VmcsFieldType::Control);
        assert_eq!(VmcsField::VmEntryInstructionLen.tpe(), VmcsFieldType::Control);
        assert_eq!(VmcsField::Cr4ReadShadow.tpe(), VmcsFieldType::Control);
        assert_eq!(VmcsField::VmExitReason.tpe(), VmcsFieldType::VmExitInformation);
        assert_eq!(VmcsField::GuestPhysicalAddress.tpe(), VmcsFieldType::VmExitInformation);
        assert_eq!(VmcsField::ExitQualification.tpe(), VmcsFieldType::VmExitInformation);
        assert_eq!(VmcsField::VmcsLinkPointer.tpe(), VmcsFieldType::GuestState);
        assert_eq!(VmcsField::GuestCsSelector.tpe(), VmcsFieldType::GuestState);
        assert_eq!(VmcsField::HostRip.tpe(), VmcsFieldType::HostState);
        assert_eq!(VmcsField::HostIa32SysenterCs.tpe(), VmcsFieldType::HostState);

        assert!(!VmcsField::VmInstructionError.tpe().is_vmwritable());
        assert!(VmcsField::GuestRflags.tpe().is_vmwritable());
        assert_eq!(VmcsField::GuestRflags.access_type(), VmcsFieldAccessType::Full);
    }

    #[test]
    fn unsupported_fields() {
        // Highest index is 0x17, as reported by early VMX processors.
        let vmcs_enum = 0x17 << 1;
        assert!(!VmcsField::HostRip.is_unsupported(vmcs_enum));
        assert!(VmcsField::GuestIa32Efer.index() < 0x17);
        assert!(VmcsField::SecondaryVmExecControl.index() < 0x17);
        assert!(VmcsField::HostIa32SysenterCs.index() == 0);
    }

    #[test]
    fn gp_registers_encoding() {
        assert_eq!(GeneralPurposeField::from_raw(0), GeneralPurposeField::Rax);
        assert_eq!(GeneralPurposeField::from_raw(3), GeneralPurposeField::Rbx);
        assert_eq!(GeneralPurposeField::from_raw(4), GeneralPurposeField::Rsp);
        assert_eq!(GeneralPurposeField::from_raw(0x1F), GeneralPurposeField::R15);
    }
}
