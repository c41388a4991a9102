//! VMX Errors

/// An error that occured during VMX operations.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxError {
    /// VMCS pointer is valid, but some other error was encountered. Read VM-instruction error
    /// field of VMCS for more details.
    VmFailValid(VmxInstructionError),

    /// VMCS pointer is invalid.
    VmFailInvalid,

    /// VMX is not supported by the current CPU.
    VmxNotSupported,

    /// VMX is supported by the CPU but not enabled. See IA_32_FEATURE_CONTROL MSR.
    VmxNotEnabled,

    /// A particular feature is not supported.
    FeatureNotSupported,

    /// Value 1 is not supported for one of the configuration bits for which it was requested.
    Disallowed1(VmxFieldError, u8),

    /// Value 0 is not supported for one of the configuration bits for which it was requested.
    Disallowed0(VmxFieldError, u8),

    /// Current value of the bit is not valid. This can be caused by an equality requirement
    /// between two fields for instance.
    MisconfiguredBit(VmxFieldError, u8),

    /// Current value of the field is not valid. This might be due to restrictions on multiple
    /// bits, for instance a range of the bits might have fixed possible values.
    Misconfigured(VmxFieldError),
}

impl VmxError {
    /// If the error is tied to a bit of a field, override the faulty VMX field.
    pub fn set_field(self, field: VmxFieldError) -> Self {
        match self {
            Self::Disallowed0(_, idx) => Self::Disallowed0(field, idx),
            Self::Disallowed1(_, idx) => Self::Disallowed1(field, idx),
            Self::MisconfiguredBit(_, idx) => Self::MisconfiguredBit(field, idx),
            Self::Misconfigured(_) => Self::Misconfigured(field),
            _ => self,
        }
    }

    /// The VM-instruction error, if the hardware reported one.
    pub fn instruction_error(self) -> Option<VmxInstructionError> {
        match self {
            Self::VmFailValid(err) => Some(err),
            _ => None,
        }
    }
}

/// An error resulting from the execution of a VMX instruction.
///
/// See Intel Manual 3C Section 30.4.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum VmxInstructionError {
    /// VMCALL executed in VMX root operation.
    VmCallRoot                   = 1,
    /// VMCLEAR with invalid physical address.
    VmClearInvalid               = 2,
    /// VMCLEAR with VMXON pointer.
    VmClearVmxon                 = 3,
    /// VMLAUNCH with non-clear VMCS.
    VmLaunchNonClear             = 4,
    /// VMRESUME with non-launched VMCS.
    VmResumeNonLaunched          = 5,
    /// VMRESUME after VMXOFF.
    VmResumeAfterVmxoff          = 6,
    /// VM entry with invalid control fields.
    VmEntryInvalidCtrlFields     = 7,
    /// VM entry with invalid host state.
    VmEntryInvalidHostState      = 8,
    /// VMPTRLD with invalid physical address.
    VmPtrldInvalidPhysAddr       = 9,
    /// VMPTRLD with VMXON pointer.
    VmPtrldVmxon                 = 10,
    /// VMPTRLD with incorrect VMCS revision identifier.
    VmPtrldInvalidRevId          = 11,
    /// VMREAD/VMWRITE to unsupported component.
    VmAccessUnsupportedField     = 12,
    /// VMWRITE to read-only component.
    VmWriteToReadOnly            = 13,
    /// VMXON executed in VMX root operation.
    VmxonDuringVmxRoot           = 15,
    /// VM entry with invalid executive-VMCS pointer.
    VmEntryInvalidVmcs           = 16,
    /// VM entry with non-launched executive VMCS.
    VmEntryNonLaunched           = 17,
    /// VM entry with executive-VMCS pointer not VMXON pointer.
    VmEntryVmcsNotVmxon          = 18,
    /// VMCALL with non-clear VMCS.
    VmCallNonClearVmcs           = 19,
    /// VMCALL with invalid VM-exit control fields.
    VmCallInvalidExitCtrlFields  = 20,
    /// VMCALL with incorrect MSEG revision identifier.
    VmCallInvalidRevId           = 22,
    /// VMXOFF under dual-monitor treatment of SMIs and SMM.
    VmxoffDualMonitor            = 23,
    /// VMCALL with invalid SMM-monitor features.
    VmCallInvalidSmmFeatures     = 24,
    /// VM entry with invalid VM-execution control fields in executive VMCS.
    VmEntryInvalidExecCtrlFields = 25,
    /// VM entry with events blocked by MOV SS.
    VmEntryBlockedMovSS          = 26,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidInvEptInvVpid         = 28,
    /// Unknown error.
    Unknown                      = 0,
}

impl VmxInstructionError {
    pub fn from_u64(err: u64) -> VmxInstructionError {
        match err {
            1 => Self::VmCallRoot,
            2 => Self::VmClearInvalid,
            3 => Self::VmClearVmxon,
            4 => Self::VmLaunchNonClear,
            5 => Self::VmResumeNonLaunched,
            6 => Self::VmResumeAfterVmxoff,
            7 => Self::VmEntryInvalidCtrlFields,
            8 => Self::VmEntryInvalidHostState,
            9 => Self::VmPtrldInvalidPhysAddr,
            10 => Self::VmPtrldVmxon,
            11 => Self::VmPtrldInvalidRevId,
            12 => Self::VmAccessUnsupportedField,
            13 => Self::VmWriteToReadOnly,
            15 => Self::VmxonDuringVmxRoot,
            16 => Self::VmEntryInvalidVmcs,
            17 => Self::VmEntryNonLaunched,
            18 => Self::VmEntryVmcsNotVmxon,
            19 => Self::VmCallNonClearVmcs,
            20 => Self::VmCallInvalidExitCtrlFields,
            22 => Self::VmCallInvalidRevId,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmCallInvalidSmmFeatures,
            25 => Self::VmEntryInvalidExecCtrlFields,
            26 => Self::VmEntryBlockedMovSS,
            28 => Self::InvalidInvEptInvVpid,
            _ => Self::Unknown,
        }
    }

    /// The raw error number, as stored in the VM-instruction error field.
    pub fn as_u64(self) -> u64 {
        self as u32 as u64
    }
}

/// The VMCS field (or VMX structure) an error is attributed to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum VmxFieldError {
    // Host
    HostCr0,
    HostCr4,
    HostCsSelector,
    HostDsSelector,
    HostEsSelector,
    HostFsSelector,
    HostGsSelector,
    HostSsSelector,
    HostTrSelector,

    // Guest
    GuestCr0,
    GuestCr4,
    GuestRflags,
    GuestGdtrLimit,
    GuestIdtrLimit,

    // Controls
    PinBasedControls,
    PrimaryControls,
    SecondaryControls,
    ExitControls,
    EntryControls,
    VmEntryIntInfoField,
    MsrBitmaps,
    IoBitmaps,
    EptPointer,

    // Regions
    VmxonRegion,
    VmcsRegion,

    // Other
    Unknown,
}
