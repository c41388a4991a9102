//! VM exit information: exit reasons, interruption types, exception vectors and qualifications.

use crate::bitmaps::exit_qualification::{ControlRegisterAccesses, EptViolation};
use crate::fields::GeneralPurposeField;

// ——————————————————————————————— Exit Reason —————————————————————————————— //

/// The basic VM Exit reason.
///
/// See Intel manual volume 3 annex C.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u16)]
pub enum VmxExitReason {
    /// Exception or NMI, subject to the exception bitmap and "NMI exiting".
    Exception                       = 0,
    ExternalInterrupt               = 1,
    TripleFault                     = 2,
    InitSignal                      = 3,
    StartUpIpi                      = 4,
    IoSystemManagementInterrupt     = 5,
    OtherSmi                        = 6,
    InterruptWindow                 = 7,
    NmiWindow                       = 8,
    TaskSwitch                      = 9,
    /// CPUID always exits.
    Cpuid                           = 10,
    /// GETSEC always exits.
    Getsec                          = 11,
    Hlt                             = 12,
    /// INVD always exits.
    Invd                            = 13,
    Invlpg                          = 14,
    Rdpmc                           = 15,
    Rdtsc                           = 16,
    Rsm                             = 17,
    Vmcall                          = 18,
    Vmclear                         = 19,
    Vmlaunch                        = 20,
    Vmptrld                         = 21,
    Vmptrst                         = 22,
    Vmread                          = 23,
    Vmresume                        = 24,
    Vmwrite                         = 25,
    Vmxoff                          = 26,
    Vmxon                           = 27,
    /// MOV to/from CR, CLTS or LMSW intercepted by the CR masks or CR3/CR8 exiting controls.
    ControlRegisterAccesses         = 28,
    MovDR                           = 29,
    IoInstruction                   = 30,
    /// RDMSR on an MSR whose bitmap bit is set, or outside of the bitmap ranges.
    Rdmsr                           = 31,
    /// WRMSR on an MSR whose bitmap bit is set, or outside of the bitmap ranges.
    Wrmsr                           = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading        = 34,
    Mwait                           = 36,
    MonitorTrapFlag                 = 37,
    Monitor                         = 39,
    Pause                           = 40,
    VmEntryFailureMachineCheck      = 41,
    TprBelowThreshold               = 43,
    ApicAccess                      = 44,
    VirtualizedEoi                  = 45,
    AccessToGdtrOrIdtr              = 46,
    AccessToLdtrOrTr                = 47,
    EptViolation                    = 48,
    EptMisconfiguration             = 49,
    Invept                          = 50,
    Rdtscp                          = 51,
    VmxPreemptionTimerExpired       = 52,
    Invvpid                         = 53,
    Wbinvd                          = 54,
    /// XSETBV always exits.
    Xsetbv                          = 55,
    ApicWrite                       = 56,
    Rdrand                          = 57,
    Invpcid                         = 58,
    Vmfunc                          = 59,
    Encls                           = 60,
    Rdseed                          = 61,
    PageModificationLogFull         = 62,
    Xsaves                          = 63,
    Xrstors                         = 64,
    /// An unknown exit reason.
    Unknown                         = 0xFFFF,
}

impl VmxExitReason {
    pub fn from_u16(reason: u16) -> Self {
        match reason {
            0 => Self::Exception,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            3 => Self::InitSignal,
            4 => Self::StartUpIpi,
            5 => Self::IoSystemManagementInterrupt,
            6 => Self::OtherSmi,
            7 => Self::InterruptWindow,
            8 => Self::NmiWindow,
            9 => Self::TaskSwitch,
            10 => Self::Cpuid,
            11 => Self::Getsec,
            12 => Self::Hlt,
            13 => Self::Invd,
            14 => Self::Invlpg,
            15 => Self::Rdpmc,
            16 => Self::Rdtsc,
            17 => Self::Rsm,
            18 => Self::Vmcall,
            19 => Self::Vmclear,
            20 => Self::Vmlaunch,
            21 => Self::Vmptrld,
            22 => Self::Vmptrst,
            23 => Self::Vmread,
            24 => Self::Vmresume,
            25 => Self::Vmwrite,
            26 => Self::Vmxoff,
            27 => Self::Vmxon,
            28 => Self::ControlRegisterAccesses,
            29 => Self::MovDR,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            33 => Self::VmEntryFailureInvalidGuestState,
            34 => Self::VmEntryFailureMsrLoading,
            36 => Self::Mwait,
            37 => Self::MonitorTrapFlag,
            39 => Self::Monitor,
            40 => Self::Pause,
            41 => Self::VmEntryFailureMachineCheck,
            43 => Self::TprBelowThreshold,
            44 => Self::ApicAccess,
            45 => Self::VirtualizedEoi,
            46 => Self::AccessToGdtrOrIdtr,
            47 => Self::AccessToLdtrOrTr,
            48 => Self::EptViolation,
            49 => Self::EptMisconfiguration,
            50 => Self::Invept,
            51 => Self::Rdtscp,
            52 => Self::VmxPreemptionTimerExpired,
            53 => Self::Invvpid,
            54 => Self::Wbinvd,
            55 => Self::Xsetbv,
            56 => Self::ApicWrite,
            57 => Self::Rdrand,
            58 => Self::Invpcid,
            59 => Self::Vmfunc,
            60 => Self::Encls,
            61 => Self::Rdseed,
            62 => Self::PageModificationLogFull,
            63 => Self::Xsaves,
            64 => Self::Xrstors,
            _ => Self::Unknown,
        }
    }

    /// Returns true for the guest executing one of the VMX instructions.
    pub fn is_vmx_instruction(self) -> bool {
        matches!(
            self,
            Self::Vmclear
                | Self::Vmlaunch
                | Self::Vmptrld
                | Self::Vmptrst
                | Self::Vmread
                | Self::Vmresume
                | Self::Vmwrite
                | Self::Vmxoff
                | Self::Vmxon
                | Self::Invept
                | Self::Invvpid
                | Self::Vmfunc
        )
    }

    /// Returns true if the exit is caused by the guest executing an instruction, in which case
    /// the VM-exit instruction length is valid.
    ///
    /// See Intel manual volume 3 section 27.2.5.
    pub fn is_instruction(self) -> bool {
        self.is_vmx_instruction()
            || matches!(
                self,
                Self::Cpuid
                    | Self::Getsec
                    | Self::Hlt
                    | Self::Invd
                    | Self::Invlpg
                    | Self::Rdpmc
                    | Self::Rdtsc
                    | Self::Rsm
                    | Self::Vmcall
                    | Self::ControlRegisterAccesses
                    | Self::MovDR
                    | Self::IoInstruction
                    | Self::Rdmsr
                    | Self::Wrmsr
                    | Self::Mwait
                    | Self::Monitor
                    | Self::Pause
                    | Self::AccessToGdtrOrIdtr
                    | Self::AccessToLdtrOrTr
                    | Self::Rdtscp
                    | Self::Wbinvd
                    | Self::Xsetbv
                    | Self::Rdrand
                    | Self::Invpcid
                    | Self::Encls
                    | Self::Rdseed
                    | Self::Xsaves
                    | Self::Xrstors
            )
    }
}

/// The full exit reason field: basic reason in bits 15:0, VM-entry failure in bit 31.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ExitReason {
    pub basic: VmxExitReason,
    pub entry_failure: bool,
}

impl ExitReason {
    pub fn from_u64(raw: u64) -> Self {
        Self {
            basic: VmxExitReason::from_u16(raw as u16),
            entry_failure: raw & (1 << 31) != 0,
        }
    }
}

// ———————————————————————————— Interruption Type ——————————————————————————— //

/// Interruption type, bits 10:8 of the interruption-information fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt,
    Reserved,
    NonMaskableInterrupt,
    HardwareException,
    SoftwareInterrupt,
    PrivilegedSoftwareException,
    SoftwareException,
    Other,
}

impl InterruptionType {
    /// Return the interrupt type from a raw interruption information field.
    pub fn from_raw(info: u32) -> Self {
        match (info >> 8) & 0b111 {
            0 => Self::ExternalInterrupt,
            1 => Self::Reserved,
            2 => Self::NonMaskableInterrupt,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::Other,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::ExternalInterrupt => 0,
            Self::Reserved => 1,
            Self::NonMaskableInterrupt => 2,
            Self::HardwareException => 3,
            Self::SoftwareInterrupt => 4,
            Self::PrivilegedSoftwareException => 5,
            Self::SoftwareException => 6,
            Self::Other => 7,
        }
    }

    /// Software-delivered events (INT n, INT1, INT3, INTO) need a VM-entry instruction length.
    pub fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

// ———————————————————————————— Exception Vectors ——————————————————————————— //

/// Architectural exception vectors.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum ExceptionVector {
    DivideError             = 0,
    Debug                   = 1,
    Nmi                     = 2,
    Breakpoint              = 3,
    Overflow                = 4,
    BoundRangeExceeded      = 5,
    InvalidOpcode           = 6,
    DeviceNotAvailable      = 7,
    DoubleFault             = 8,
    InvalidTss              = 10,
    SegmentNotPresent       = 11,
    StackSegmentFault       = 12,
    GeneralProtectionFault  = 13,
    PageFault               = 14,
    X87FloatingPoint        = 16,
    AlignmentCheck          = 17,
    MachineCheck            = 18,
    SimdFloatingPoint       = 19,
    Virtualization          = 20,
    ControlProtection       = 21,
}

impl ExceptionVector {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if the processor pushes an error code when delivering this vector as a
    /// hardware exception.
    pub fn has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
    }
}

// —————————————————————————— Exit Qualifications ——————————————————————————— //

/// A bit vector containing information about VM exit reason.
///
/// The bits must be interpreted differently depending on the exit reason. This types provides a
/// simple way of casting the bits based on the reason.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct VmxExitQualification {
    pub raw: u64,
}

impl VmxExitQualification {
    /// Interpretation due to EPT violations.
    pub fn ept_violation(self) -> EptViolation {
        EptViolation::from_bits_truncate(self.raw)
    }

    /// Interpretation due to access to a control register.
    pub fn control_register_accesses(self) -> ControlRegisterAccesses {
        let cr = (self.raw & 0b1111) as u8;
        let reg = GeneralPurposeField::from_raw(self.raw >> 8);
        match (self.raw >> 4) & 0b11 {
            0 => ControlRegisterAccesses::MovToCr(cr, reg),
            1 => ControlRegisterAccesses::MovFromCr(cr, reg),
            2 => ControlRegisterAccesses::Clts,
            _ => ControlRegisterAccesses::Lmsw(((self.raw >> 16) & 0xFFFF) as u16),
        }
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
