//! VMX support
//!
//! Low level building blocks for Intel VT-x: raw instructions, VMCS field encodings, control
//! bitmaps, capability MSRs and the checks needed before entering a guest.
#![cfg_attr(not(test), no_std)]

pub mod bitmaps;
pub mod check;
pub mod errors;
pub mod exit;
pub mod fields;
pub mod msr;
pub mod raw;

pub use utils::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr};

pub use crate::errors::{VmxError, VmxFieldError, VmxInstructionError};
pub use crate::exit::{
    ExceptionVector, ExitReason, InterruptionType, VmxExitQualification, VmxExitReason,
};
pub use crate::fields::VmcsField;

/// Mask for keeping only the 32 lower bits.
const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

/// CPUID leaf 1, ECX mask for VMX support
pub const CPUID_ECX_VMX_MASK: u32 = 1 << 5;

/// CR4 bit enabling VMX operations.
pub const CR4_VMXE: u64 = 1 << 13;

/// Value of the VMCS link pointer when VMCS shadowing is not used.
pub const VMCS_LINK_POINTER_NONE: u64 = u64::MAX;

// ————————————————————————————— VMX Operations ————————————————————————————— //

/// Basic VMX Information.
///
/// See Intel SDM Vol. 3D Appendix A-1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmxBasicInfo {
    /// The 31-bits VMCS revision identifier used by the CPU.
    pub revision: u32,

    /// Minimum required size in bytes for VMCS and VMXON regions.
    pub vmcs_width: u32,

    /// Support the VMX_TRUE_CTLS registers.
    pub support_true_ctls: bool,
}

impl VmxBasicInfo {
    /// Decodes the IA32_VMX_BASIC MSR.
    pub fn from_msr(vmx_basic: u64) -> Self {
        Self {
            revision: (vmx_basic & ((1 << 31) - 1)) as u32,
            vmcs_width: ((vmx_basic >> 32) & ((1 << 13) - 1)) as u32,
            support_true_ctls: vmx_basic & (1 << 55) != 0,
        }
    }
}

/// Checks the IA32_FEATURE_CONTROL MSR.
///
/// Returns the value that must be written back to the MSR when VMX has to be enabled (and the MSR
/// locked) by the hypervisor itself. On bare metal the firmware is in charge of that.
///
/// See manual 3C Section 23.7
pub fn check_feature_control(feature_control: u64) -> Result<Option<u64>, VmxError> {
    const LOCKED: u64 = 1 << 0;
    const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

    if feature_control & LOCKED != 0 {
        if feature_control & VMXON_OUTSIDE_SMX == 0 {
            return Err(VmxError::VmxNotEnabled);
        }
        return Ok(None);
    }

    if cfg!(feature = "bare_metal") {
        log::warn!("IA32_FEATURE_CONTROL is not locked by the firmware");
        Err(VmxError::VmxNotEnabled)
    } else {
        Ok(Some(feature_control | LOCKED | VMXON_OUTSIDE_SMX))
    }
}

/// Returns the secondary controls the processor allows to set to 1.
///
/// `procbased_ctls` and `procbased_ctls2` are the raw IA32_VMX_PROCBASED_CTLS and
/// IA32_VMX_PROCBASED_CTLS2 MSRs, the latter is only meaningful if the former allows secondary
/// controls.
pub fn secondary_controls_capabilities(
    procbased_ctls: u64,
    procbased_ctls2: u64,
) -> Result<bitmaps::SecondaryControls, VmxError> {
    if procbased_ctls & (1 << 63) == 0 {
        return Err(VmxError::FeatureNotSupported);
    }
    let allowed_1 = (procbased_ctls2 >> 32) as u32;
    Ok(bitmaps::SecondaryControls::from_bits_truncate(allowed_1))
}

/// Computes the value of a control field.
///
/// `user` is the set of controls requested by the VMM and `known` the set of controls the VMM
/// knows about, spec and true_spec are the capability MSRs of the control. Bits not known by the
/// VMM are set to their default value.
///
/// See Intel SDM Vol 3D Appending A.3.1 for allowed settings explanation.
pub fn adjust_controls(
    user: u32,
    known: u32,
    spec: u64,
    true_spec: Option<u64>,
) -> Result<u32, VmxError> {
    match true_spec {
        Some(true_spec) => get_true_ctls(user, spec, true_spec, known),
        None => get_ctls(user, spec, known),
    }
}

/// Computes the control bits when there is no support for true controls.
///
/// In case of error, returns the index of a bit
fn get_ctls(user: u32, spec: u64, known: u32) -> Result<u32, VmxError> {
    // NOTE: see Intel SDM Vol 3C Section 31.5.1, algorithm 3
    let allowed_zeros = (spec & LOW_32_BITS_MASK) as u32;
    let allowed_ones = (spec >> 32) as u32;

    let must_be_0 = !user & allowed_zeros & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }
    let must_be_0 = user & !allowed_ones & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    let default_value = allowed_zeros & allowed_ones;
    Ok(user | default_value)
}

/// Computes the control bits when there  is support for true controls.
fn get_true_ctls(user: u32, spec: u64, true_spec: u64, known: u32) -> Result<u32, VmxError> {
    // NOTE: see Intel SDM Vol 3C Section 31.5.1, algorithm 3
    let allowed_zeros = (spec & LOW_32_BITS_MASK) as u32;
    let true_allowed_zeros = (true_spec & LOW_32_BITS_MASK) as u32;
    let true_allowed_ones = (true_spec >> 32) as u32;

    let must_be_0 = !user & true_allowed_zeros & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }
    let must_be_0 = user & !true_allowed_ones & known;
    if must_be_0 != 0 {
        let idx = must_be_0.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    let default_value = true_allowed_zeros & true_allowed_ones;
    let can_be_both = true_allowed_ones & !true_allowed_zeros;
    let must_be_ones = can_be_both & !known & allowed_zeros;
    Ok(default_value | user | must_be_ones)
}

// ————————————————————————————————— Tests —————————————————————————————————— //
