//! Software implementation of VMX hardware checks
//!
//! This module implements **some** of the checks done by the VMX extension on VM entries. They
//! run before the first VMLAUNCH so that a misconfiguration is reported with the faulty field
//! rather than as an opaque VM-instruction error.

use crate::errors::{VmxError, VmxFieldError};
use crate::exit::InterruptionType;

/// Validates a control register (CR0 or CR4) against its valid state.
///
/// See Intel Manual volume 3 annex A.7 & A.8.
pub fn validate_cr(cr: u64, fixed_0: u64, fixed_1: u64) -> Result<(), VmxError> {
    let must_be_zero = fixed_0 & !cr;
    if must_be_zero != 0 {
        let idx = must_be_zero.trailing_zeros() as u8;
        return Err(VmxError::Disallowed0(VmxFieldError::Unknown, idx));
    }

    let must_be_zero = (!fixed_1) & cr;
    if must_be_zero != 0 {
        let idx = must_be_zero.trailing_zeros() as u8;
        return Err(VmxError::Disallowed1(VmxFieldError::Unknown, idx));
    }

    Ok(())
}

/// Host selectors must have both RPL and TI cleared (section 26.2.3).
pub fn validate_host_selector(selector: u16, field: VmxFieldError) -> Result<(), VmxError> {
    let faulty = selector & 0b111;
    if faulty != 0 {
        Err(VmxError::Disallowed1(field, faulty.trailing_zeros() as u8))
    } else {
        Ok(())
    }
}

/// Guest RFLAGS: reserved bits 63:22, 15, 5 and 3 must be 0 and bit 1 must be 1 (section
/// 26.3.1.4).
pub fn validate_guest_rflags(rflags: u64) -> Result<(), VmxError> {
    const RESERVED_ZEROS: u64 = !((1 << 22) - 1) | (1 << 15) | (1 << 5) | (1 << 3);
    const RESERVED_ONE: u64 = 1 << 1;

    let must_be_zero = rflags & RESERVED_ZEROS;
    if must_be_zero != 0 {
        return Err(VmxError::Disallowed1(
            VmxFieldError::GuestRflags,
            must_be_zero.trailing_zeros() as u8,
        ));
    }
    if rflags & RESERVED_ONE == 0 {
        return Err(VmxError::Disallowed0(VmxFieldError::GuestRflags, 1));
    }
    Ok(())
}

/// Checks the VM-entry interruption-information field (section 26.2.1.3).
///
/// Only the checks that do not depend on other VMCS fields are performed here.
pub fn validate_entry_interruption(info: u32) -> Result<(), VmxError> {
    const VALID: u32 = 1 << 31;
    const ERROR_CODE_VALID: u32 = 1 << 11;
    const RESERVED: u32 = ((1 << 19) - 1) << 12;
    let field = VmxFieldError::VmEntryIntInfoField;

    if info & VALID == 0 {
        return Ok(());
    }
    if info & RESERVED != 0 {
        return Err(VmxError::Disallowed1(field, (info & RESERVED).trailing_zeros() as u8));
    }

    let vector = info & 0xFF;
    let tpe = InterruptionType::from_raw(info);
    match tpe {
        InterruptionType::Reserved => return Err(VmxError::Misconfigured(field)),
        InterruptionType::NonMaskableInterrupt if vector != 2 => {
            return Err(VmxError::Misconfigured(field))
        }
        InterruptionType::HardwareException if vector > 31 => {
            return Err(VmxError::Misconfigured(field))
        }
        _ => {}
    }
    if info & ERROR_CODE_VALID != 0 && tpe != InterruptionType::HardwareException {
        return Err(VmxError::MisconfiguredBit(field, 11));
    }
    Ok(())
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    /// See manual Annex A.7 & A.8
    #[rustfmt::skip]
    #[test]
    fn validate_cr() {
        // Testing valid combinations
        let fixed_0: u64 = 0b001_000;
        let fixed_1: u64 = 0b111_011;
        let cr:      u64 = 0b011_010;

        assert_eq!(super::validate_cr(cr, fixed_0, fixed_1), Ok(()));

        // testing disallowed one
        let fixed_0: u64 = 0b0_001;
        let fixed_1: u64 = 0b0_111;
        let cr:      u64 = 0b1_011;

        assert_eq!(
            super::validate_cr(cr, fixed_0, fixed_1),
            Err(VmxError::Disallowed1(VmxFieldError::Unknown, 3))
        );

        // testing disallowed zero
        let fixed_0: u64 = 0b1_01;
        let fixed_1: u64 = 0b1_11;
        let cr:      u64 = 0b0_11;

        assert_eq!(
            super::validate_cr(cr, fixed_0, fixed_1),
            Err(VmxError::Disallowed0(VmxFieldError::Unknown, 2))
        );
    }

    #[rustfmt::skip]
    #[test]
    fn host_selectors() {
        let field = VmxFieldError::HostCsSelector;
        assert_eq!(validate_host_selector(0b0001_0000, field), Ok(()));
        assert_eq!(validate_host_selector(0b0001_0011, field), Err(VmxError::Disallowed1(field, 0)));
        assert_eq!(validate_host_selector(0b0001_0100, field), Err(VmxError::Disallowed1(field, 2)));
    }

    #[rustfmt::skip]
    #[test]
    fn guest_rflags() {
        assert_eq!(validate_guest_rflags(0b10_0000_0010), Ok(()));
        assert_eq!(
            validate_guest_rflags(0b10_0000_0000),
            Err(VmxError::Disallowed0(VmxFieldError::GuestRflags, 1))
        );
        assert_eq!(
            validate_guest_rflags(0b10_0010_1010),
            Err(VmxError::Disallowed1(VmxFieldError::GuestRflags, 3))
        );
        assert_eq!(
            validate_guest_rflags((1 << 22) | 0b10),
            Err(VmxError::Disallowed1(VmxFieldError::GuestRflags, 22))
        );
    }

    #[rustfmt::skip]
    #[test]
    fn entry_interruption() {
        let field = VmxFieldError::VmEntryIntInfoField;

        // Not valid: never checked
        assert_eq!(validate_entry_interruption(0x0000_0FFF), Ok(()));
        // #PF with error code
        assert_eq!(validate_entry_interruption(0x8000_0B0E), Ok(()));
        // NMI on vector 3
        assert_eq!(validate_entry_interruption(0x8000_0203), Err(VmxError::Misconfigured(field)));
        // Software interrupt with an error code
        assert_eq!(validate_entry_interruption(0x8000_0C80), Err(VmxError::MisconfiguredBit(field, 11)));
        // Reserved bit 12 set
        assert_eq!(validate_entry_interruption(0x8000_1302), Err(VmxError::Disallowed1(field, 12)));
    }
}
