//! Interrupt descriptor
//!
//! Describes one event to be delivered to the guest on the next VM entry, or one event reported
//! by the processor on a VM exit.

use vmx::bitmaps::InterruptionInformation;
use vmx::{ExceptionVector, InterruptionType};

/// An interrupt or exception event.
///
/// A descriptor is either the "nothing pending" sentinel returned by `Default`, or fully
/// populated by [`InterruptInfo::new`] or [`InterruptInfo::with_error_code`]. There are no
/// setters: a descriptor is replaced as a whole, which keeps `error_code_valid` consistent with
/// the constructor that was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    vector: u8,
    kind: InterruptionType,
    error_code: u32,
    error_code_valid: bool,
    nmi_unblocking: bool,
    valid: bool,
    rip_adjust: Option<u32>,
}

impl Default for InterruptInfo {
    fn default() -> Self {
        Self {
            vector: 0,
            kind: InterruptionType::ExternalInterrupt,
            error_code: 0,
            error_code_valid: false,
            nmi_unblocking: false,
            valid: false,
            rip_adjust: None,
        }
    }
}

impl InterruptInfo {
    /// An event without error code.
    ///
    /// `rip_adjust` is the instruction length reported to the processor on entry, `None` lets the
    /// VCPU use the length of the instruction that caused the exit.
    pub fn new(kind: InterruptionType, vector: u8, rip_adjust: Option<u32>) -> Self {
        Self::normalized(kind, vector, 0, false, rip_adjust)
    }

    /// An event carrying an error code.
    pub fn with_error_code(
        kind: InterruptionType,
        vector: u8,
        error_code: u32,
        rip_adjust: Option<u32>,
    ) -> Self {
        Self::normalized(kind, vector, error_code, true, rip_adjust)
    }

    fn normalized(
        kind: InterruptionType,
        vector: u8,
        error_code: u32,
        error_code_valid: bool,
        rip_adjust: Option<u32>,
    ) -> Self {
        Self {
            vector,
            kind,
            error_code,
            error_code_valid,
            nmi_unblocking: false,
            valid: true,
            rip_adjust,
        }
    }

    /// Decodes a VM-exit interruption-information field together with its error code.
    pub fn from_exit(info: u32, error_code: u32) -> Self {
        let flags = InterruptionInformation::from_bits_truncate(info);
        if !flags.contains(InterruptionInformation::VALID) {
            return Self::default();
        }

        let error_code_valid = flags.contains(InterruptionInformation::ERROR_CODE_VALID);
        Self {
            vector: (info & 0xFF) as u8,
            kind: InterruptionType::from_raw(info),
            error_code: if error_code_valid { error_code } else { 0 },
            error_code_valid,
            nmi_unblocking: flags.contains(InterruptionInformation::NMI_UNBLOCKING),
            valid: true,
            rip_adjust: None,
        }
    }

    /// Encodes the descriptor as a VM-entry interruption-information field.
    ///
    /// The NMI unblocking bit is reserved on entry and never encoded.
    pub fn to_entry_info(&self) -> u32 {
        let mut flags = InterruptionInformation::empty();
        flags.set(InterruptionInformation::VALID, self.valid);
        flags.set(InterruptionInformation::ERROR_CODE_VALID, self.error_code_valid);
        self.vector as u32 | (self.kind.as_u32() << 8) | flags.bits()
    }

    /// Returns the descriptor with the architectural rules for event injection applied.
    ///
    /// The NMI vector always uses the NMI type and the NMI type always uses the NMI vector. Only
    /// hardware exceptions whose vector pushes an error code deliver one (zero if the caller did
    /// not supply any).
    pub(crate) fn sanitized(self) -> Self {
        let nmi = ExceptionVector::Nmi.as_u8();
        let is_nmi = self.vector == nmi || self.kind == InterruptionType::NonMaskableInterrupt;
        let (kind, vector) = if is_nmi {
            (InterruptionType::NonMaskableInterrupt, nmi)
        } else {
            (self.kind, self.vector)
        };
        let error_code_valid =
            kind == InterruptionType::HardwareException && ExceptionVector::has_error_code(vector);

        Self {
            vector,
            kind,
            error_code_valid,
            error_code: if error_code_valid { self.error_code } else { 0 },
            nmi_unblocking: false,
            ..self
        }
    }

    pub fn vector(&self) -> u8 {
        self.vector
    }

    pub fn kind(&self) -> InterruptionType {
        self.kind
    }

    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    pub fn rip_adjust(&self) -> Option<u32> {
        self.rip_adjust
    }

    pub fn error_code_valid(&self) -> bool {
        self.error_code_valid
    }

    pub fn nmi_unblocking(&self) -> bool {
        self.nmi_unblocking
    }

    pub fn valid(&self) -> bool {
        self.valid
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
