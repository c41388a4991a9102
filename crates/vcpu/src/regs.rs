//! Register value objects
//!
//! Segments, descriptor tables and segment roles as programmed into the VMCS. Control registers
//! and RFLAGS use the types of the `x86_64` crate.

use bitflags::bitflags;
use vmx::VmcsField;

pub use x86_64::registers::control::{Cr0Flags, Cr4Flags};
pub use x86_64::registers::rflags::RFlags;

/// A descriptor table register (GDTR or IDTR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

bitflags! {
    /// Segment access rights, in the VMX format.
    ///
    /// See Intel SDM Vol. 3C Table 24-2.
    pub struct SegmentAccess: u32 {
        const ACCESSED        = 1 << 0;
        /// Readable for code segments, writable for data segments.
        const READ_WRITE      = 1 << 1;
        /// Conforming for code segments, expand-down for data segments.
        const CONFORMING      = 1 << 2;
        const CODE            = 1 << 3;
        /// Code or data segment (as opposed to a system segment).
        const CODE_DATA       = 1 << 4;
        const DPL_LOW         = 1 << 5;
        const DPL_HIGH        = 1 << 6;
        const PRESENT         = 1 << 7;
        const AVAILABLE       = 1 << 12;
        /// 64-bit code segment.
        const LONG_MODE       = 1 << 13;
        const DEFAULT_BIG     = 1 << 14;
        const GRANULARITY     = 1 << 15;
        /// The segment is unusable.
        const UNUSABLE        = 1 << 16;
    }
}

impl SegmentAccess {
    /// Descriptor privilege level.
    pub fn dpl(self) -> u8 {
        ((self.bits() >> 5) & 0b11) as u8
    }

    /// The segment type (bits 3:0).
    pub fn segment_type(self) -> u8 {
        (self.bits() & 0b1111) as u8
    }
}

/// A segment as cached by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: SegmentAccess,
}

impl Segment {
    /// An unusable segment, used for null selectors and LDT-relative selectors.
    pub fn unusable(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            access: SegmentAccess::UNUSABLE,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.access.contains(SegmentAccess::UNUSABLE)
    }
}

// ————————————————————————————— Segment Roles —————————————————————————————— //

/// Guest segment registers, in VMCS encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl SegmentRegister {
    pub const ALL: [SegmentRegister; 8] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
    ];

    pub fn selector_field(self) -> VmcsField {
        match self {
            Self::Es => VmcsField::GuestEsSelector,
            Self::Cs => VmcsField::GuestCsSelector,
            Self::Ss => VmcsField::GuestSsSelector,
            Self::Ds => VmcsField::GuestDsSelector,
            Self::Fs => VmcsField::GuestFsSelector,
            Self::Gs => VmcsField::GuestGsSelector,
            Self::Ldtr => VmcsField::GuestLdtrSelector,
            Self::Tr => VmcsField::GuestTrSelector,
        }
    }

    pub fn base_field(self) -> VmcsField {
        match self {
            Self::Es => VmcsField::GuestEsBase,
            Self::Cs => VmcsField::GuestCsBase,
            Self::Ss => VmcsField::GuestSsBase,
            Self::Ds => VmcsField::GuestDsBase,
            Self::Fs => VmcsField::GuestFsBase,
            Self::Gs => VmcsField::GuestGsBase,
            Self::Ldtr => VmcsField::GuestLdtrBase,
            Self::Tr => VmcsField::GuestTrBase,
        }
    }

    pub fn limit_field(self) -> VmcsField {
        match self {
            Self::Es => VmcsField::GuestEsLimit,
            Self::Cs => VmcsField::GuestCsLimit,
            Self::Ss => VmcsField::GuestSsLimit,
            Self::Ds => VmcsField::GuestDsLimit,
            Self::Fs => VmcsField::GuestFsLimit,
            Self::Gs => VmcsField::GuestGsLimit,
            Self::Ldtr => VmcsField::GuestLdtrLimit,
            Self::Tr => VmcsField::GuestTrLimit,
        }
    }

    pub fn access_field(self) -> VmcsField {
        match self {
            Self::Es => VmcsField::GuestEsArBytes,
            Self::Cs => VmcsField::GuestCsArBytes,
            Self::Ss => VmcsField::GuestSsArBytes,
            Self::Ds => VmcsField::GuestDsArBytes,
            Self::Fs => VmcsField::GuestFsArBytes,
            Self::Gs => VmcsField::GuestGsArBytes,
            Self::Ldtr => VmcsField::GuestLdtrArBytes,
            Self::Tr => VmcsField::GuestTrArBytes,
        }
    }
}

/// Host segment registers. There is no host LDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSegment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Tr,
}

impl HostSegment {
    pub const ALL: [HostSegment; 7] = [
        Self::Es,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Fs,
        Self::Gs,
        Self::Tr,
    ];

    pub fn selector_field(self) -> VmcsField {
        match self {
            Self::Es => VmcsField::HostEsSelector,
            Self::Cs => VmcsField::HostCsSelector,
            Self::Ss => VmcsField::HostSsSelector,
            Self::Ds => VmcsField::HostDsSelector,
            Self::Fs => VmcsField::HostFsSelector,
            Self::Gs => VmcsField::HostGsSelector,
            Self::Tr => VmcsField::HostTrSelector,
        }
    }

    /// Only FS, GS and TR have a base in the host-state area.
    pub fn base_field(self) -> Option<VmcsField> {
        match self {
            Self::Fs => Some(VmcsField::HostFsBase),
            Self::Gs => Some(VmcsField::HostGsBase),
            Self::Tr => Some(VmcsField::HostTrBase),
            _ => None,
        }
    }

    /// The field used to attribute a faulty selector.
    pub fn error_field(self) -> vmx::VmxFieldError {
        use vmx::VmxFieldError;
        match self {
            Self::Es => VmxFieldError::HostEsSelector,
            Self::Cs => VmxFieldError::HostCsSelector,
            Self::Ss => VmxFieldError::HostSsSelector,
            Self::Ds => VmxFieldError::HostDsSelector,
            Self::Fs => VmxFieldError::HostFsSelector,
            Self::Gs => VmxFieldError::HostGsSelector,
            Self::Tr => VmxFieldError::HostTrSelector,
        }
    }
}
