//! VMX bitmaps.
//!
//! Wrappers for simple and type safe manipulation of bitmaps used throughout VMX operations.

use bitflags::bitflags;

bitflags! {
    /// Pin-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.1.
    pub struct PinbasedControls: u32 {
        /// External-interrupt exiting.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMI exiting.
        const NMI_EXITING                = 1 << 3;
        /// Virtual NMIs.
        const VIRTUAL_NMIS               = 1 << 5;
        /// Activate VMX-preemption timer.
        const VMX_PREEMPTION_TIMER       = 1 << 6;
        /// Process posted interrupts.
        const POSTED_INTERRUPTS          = 1 << 7;
    }

    /// Primary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-6.
    pub struct PrimaryControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING       = 1 << 3;
        const HLT_EXITING              = 1 << 7;
        const INVLPG_EXITING           = 1 << 9;
        const MWAIT_EXITING            = 1 << 10;
        const RDPMC_EXITING            = 1 << 11;
        const RDTSC_EXITING            = 1 << 12;
        const CR3_LOAD_EXITING         = 1 << 15;
        const CR3_STORE_EXITING        = 1 << 16;
        const CR8_LOAD_EXITING         = 1 << 19;
        const CR8_STORE_EXITING        = 1 << 20;
        const USE_TPR_SHADOW           = 1 << 21;
        const NMI_WINDOW_EXITING       = 1 << 22;
        const MOV_DR_EXITING           = 1 << 23;
        const UNCOND_IO_EXITING        = 1 << 24;
        const USE_IO_BITMAPS           = 1 << 25;
        const MONITOR_TRAP_FLAG        = 1 << 27;
        const USE_MSR_BITMAPS          = 1 << 28;
        const MONITOR_EXITING          = 1 << 29;
        const PAUSE_EXITING            = 1 << 30;
        /// Activate secondary controls.
        const SECONDARY_CONTROLS       = 1 << 31;
    }

    /// Secondary processor-based VM-execution controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.6.2, Table 24-7.
    pub struct SecondaryControls: u32 {
        const VIRTUALIZE_APIC            = 1 << 0;
        const ENABLE_EPT                 = 1 << 1;
        const DTABLE_EXITING             = 1 << 2;
        const ENABLE_RDTSCP              = 1 << 3;
        const VIRTUALIZE_X2APIC          = 1 << 4;
        const ENABLE_VPID                = 1 << 5;
        const WBINVD_EXITING             = 1 << 6;
        const UNRESTRICTED_GUEST         = 1 << 7;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING         = 1 << 10;
        const RDRAND_EXITING             = 1 << 11;
        const ENABLE_INVPCID             = 1 << 12;
        const ENABLE_VM_FUNCTIONS        = 1 << 13;
        const VMCS_SHADOWING             = 1 << 14;
        const RDSEED_EXITING             = 1 << 16;
        const ENABLE_PML                 = 1 << 17;
        const EPT_VIOLATION_VE           = 1 << 18;
        const CONCEAL_VMX_FROM_PT        = 1 << 19;
        /// Enable XSAVES/XRSTORS.
        const ENABLE_XSAVES_XRSTORS      = 1 << 20;
        const USE_TSC_SCALING            = 1 << 25;
    }

    /// VM-exit controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.7.
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS        = 1 << 2;
        /// Host address-space size, the host runs in 64 bits mode after the exit.
        const HOST_ADDRESS_SPACE_SIZE    = 1 << 9;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTERRUPT_ON_EXIT      = 1 << 15;
        const SAVE_IA32_PAT              = 1 << 18;
        const LOAD_IA32_PAT              = 1 << 19;
        const SAVE_IA32_EFER             = 1 << 20;
        const LOAD_IA32_EFER             = 1 << 21;
        const SAVE_VMX_PREEMPTION_TIMER  = 1 << 22;
        const CONCEAL_VMX_FROM_PT        = 1 << 24;
    }

    /// VM-entry controls.
    ///
    /// See Intel SDM, Volume 3C, Section 24.8.
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS        = 1 << 2;
        /// The guest runs in IA-32e mode after entry.
        const IA32E_MODE_GUEST           = 1 << 9;
        const ENTRY_TO_SMM               = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR    = 1 << 11;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_IA32_PAT              = 1 << 14;
        const LOAD_IA32_EFER             = 1 << 15;
        const CONCEAL_VMX_FROM_PT        = 1 << 17;
    }

    /// VM-entry and VM-exit interruption-information fields (32 bits).
    ///
    /// Only the flag bits are listed, the vector (bits 7:0) and the interruption type (bits 10:8)
    /// are values.
    ///
    /// See Intel SDM, Volume 3C, Sections 24.8.3 and 24.9.2.
    pub struct InterruptionInformation: u32 {
        /// Deliver error code (0 = do not deliver, 1 = deliver).
        const ERROR_CODE_VALID = 1 << 11;
        /// NMI unblocking due to IRET (exit information only).
        const NMI_UNBLOCKING   = 1 << 12;
        /// Valid.
        const VALID            = 1 << 31;
    }

    /// The exception bitmap.
    ///
    /// Setting a bit to 1 will cause the corresponding exception to trigger a VMExit instead of
    /// being delivered to the guests.
    pub struct ExceptionBitmap: u32 {
        const DIVIDE_ERROR             = 1 << 0;
        const DEBUG                    = 1 << 1;
        const NMI                      = 1 << 2;
        const BREAKPOINT               = 1 << 3;
        const OVERFLOW                 = 1 << 4;
        const BOUND_RANGE_EXCEEDED     = 1 << 5;
        const INVALID_OPCODE           = 1 << 6;
        const DEVICE_NOT_AVAILABLE     = 1 << 7;
        const DOUBLE_FAULT             = 1 << 8;
        const INVALID_TSS              = 1 << 10;
        const SEGMENT_NOT_PRESENT      = 1 << 11;
        const STACK_SEGMENT_FAULT      = 1 << 12;
        const GENERAL_PROTECTION_FAULT = 1 << 13;
        const PAGE_FAULT               = 1 << 14;
        const X87_FLOATING_POINT       = 1 << 16;
        const ALIGNMENT_CHECK          = 1 << 17;
        const MACHINE_CHECK            = 1 << 18;
        const SIMD_FLOATING_POINT      = 1 << 19;
        const VIRTUALIZATION           = 1 << 20;
    }

    /// Page-fault error code, as matched by the page-fault error-code mask and match fields.
    pub struct PageFaultErrorCode: u32 {
        const PRESENT           = 1 << 0;
        const WRITE             = 1 << 1;
        const USER_MODE         = 1 << 2;
        const RESERVED_WRITE    = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
        const PROTECTION_KEY    = 1 << 5;
    }

    /// EPT and VPID capabilities.
    ///
    /// See Intel manual volume 3 annex A.10 for details.
    pub struct EptCapability: u64 {
        const EXECUTE_ONLY            = 1 << 0;
        const PAGE_WALK_4             = 1 << 6;
        const UNCACHEABLE             = 1 << 8;
        const WRITE_BACK              = 1 << 14;
        const PAGE_2MB                = 1 << 16;
        const PAGE_1GB                = 1 << 17;
        const INVEPT                  = 1 << 20;
        const ACCESS_DIRTY            = 1 << 21;
        const SINGLE_CTX_INVEPT       = 1 << 25;
        const ALL_CTX_INVEPT          = 1 << 26;
        const INVVPID                 = 1 << 32;
        const INDIVIDUAL_ADDR_INVVPID = 1 << 40;
        const SINGLE_CTX_INVVPID      = 1 << 41;
        const ALL_CTX_INVVPID         = 1 << 42;
    }

    /// Flags of an EPT paging-structure entry.
    pub struct EptEntryFlags: u64 {
        /// Enable read accesses.
        const READ               = 1 << 0;
        /// Enable write accesses.
        const WRITE              = 1 << 1;
        /// Enable supervisor-mode execution. If mode-based execute control bit is 0, also control
        /// user-mode execution.
        const SUPERVISOR_EXECUTE = 1 << 2;
        /// Memory type write-back (bits 5:3 = 6), only meaningful on leaf entries.
        const MEMORY_TYPE_WB     = 6 << 3;
        const IGNORE_PAT         = 1 << 6;
        /// If 1, points to a data page instead of a page table.
        const PAGE               = 1 << 7;
        const ACCESSED           = 1 << 8;
        const DIRTY              = 1 << 9;
        /// Enable user-mode execution.
        const USER_EXECUTE       = 1 << 10;
    }

    /// The RFLAGS bits relevant to VMX status reporting and guest state checks.
    pub struct RFlags: u64 {
        const CARRY_FLAG     = 1 << 0;
        /// Always 1.
        const RESERVED_1     = 1 << 1;
        const PARITY_FLAG    = 1 << 2;
        const AUX_FLAG       = 1 << 4;
        const ZERO_FLAG      = 1 << 6;
        const SIGN_FLAG      = 1 << 7;
        const TRAP_FLAG      = 1 << 8;
        const INTERRUPT_FLAG = 1 << 9;
        const DIRECTION_FLAG = 1 << 10;
        const OVERFLOW_FLAG  = 1 << 11;
        const VIRTUAL_8086   = 1 << 17;
    }
}

// —————————————————————————— Exit Qualifications ——————————————————————————— //

pub mod exit_qualification {
    use super::*;
    use crate::fields::GeneralPurposeField;

    bitflags! {
        pub struct EptViolation: u64 {
            /// Violation due to a read operation.
            const READ = 1 << 0;
            /// Violation due to a write operation.
            const WRITE = 1 << 1;
            /// Violation due to an instruction fetch.
            const EXECUTE = 1 << 2;
            /// The guest physical address was readable.
            const GUEST_PHYS_READ = 1 << 3;
            /// The guest physical address was writeable.
            const GUEST_PHYS_WRITE = 1 << 4;
            /// The guest physical address was executable.
            const GUEST_PHYS_EXECUTE = 1 << 5;
            /// The guest linear address field from the VMCS is valid.
            const GUEST_LINEAR_IS_VALID = 1 << 7;
            /// The access was to the translated linear address rather than a paging structure.
            const CAUSED_BY_TRANSLATED_LINEAR_ADDR = 1 << 8;
            /// NMI unblocking due to IRET.
            const NMI_UNBLOCKING = 1 << 12;
        }
    }

    /// Control Register Accesses qualification.
    ///
    /// See table 27.3.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ControlRegisterAccesses {
        MovToCr(u8, GeneralPurposeField),
        MovFromCr(u8, GeneralPurposeField),
        Clts,
        /// LMSW, with its 16 bits source operand.
        Lmsw(u16),
    }
}
