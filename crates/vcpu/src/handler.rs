//! Exit handlers
//!
//! The VCPU delegates every VM exit to an [`ExitHandler`]. [`PassthroughHandler`] executes the
//! intercepted instructions on behalf of the guest, so that the guest behaves as if it was not
//! virtualized.

use vmx::bitmaps::exit_qualification::ControlRegisterAccesses;
use vmx::msr::{self, Msr};
use vmx::{ExceptionVector, InterruptionType, VmxExitReason};

use crate::error::VcpuError;
use crate::hal::VmxHal;
use crate::interrupt::InterruptInfo;
use crate::regs::{Cr0Flags, Cr4Flags, SegmentRegister};
use crate::vcpu::Vcpu;
use crate::vmcs::{ControlFields, ExitFields, GuestFields, VmcsAccess};

/// VMCALL number (in RCX) asking the VCPU to devirtualize, only honored from ring 0.
pub const VMCALL_TERMINATE: u64 = 0xDEAD;
/// VMCALL number (in RCX) used as a debugging breakpoint.
pub const VMCALL_BREAKPOINT: u64 = 0xAABB;

const CR3_PCID_NO_INVALIDATE: u64 = 1 << 63;
/// PE, MP, EM and TS, the bits loaded by LMSW.
const CR0_MSW_MASK: u64 = 0b1111;

/// Handles the VM exits of a VCPU.
///
/// The handler runs in VMX root operation, with the registers of the guest available through
/// [`Vcpu::exit_context_mut`] and the exit information through the VMCS accessors. By default
/// the guest RIP is advanced past the instruction that caused the exit once the handler returns.
/// Returning an error devirtualizes the guest.
pub trait ExitHandler<H: VmxHal> {
    fn handle(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError>;
}

/// Emulates intercepted instructions with the instruction itself, executed in root mode.
#[derive(Debug, Default)]
pub struct PassthroughHandler {
    /// Number of exits handled so far.
    pub exits: u64,
}

impl<H: VmxHal> ExitHandler<H> for PassthroughHandler {
    fn handle(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        self.exits += 1;
        let reason = vcpu.exit_reason()?.basic;
        match reason {
            VmxExitReason::Exception => self.exception_or_nmi(vcpu),
            VmxExitReason::TripleFault => {
                log::error!("VCPU {}: guest triple fault", vcpu.vpid());
                vcpu.suppress_rip_adjust();
                vcpu.terminate()
            }
            // The guest physical memory is identity mapped, the guest touched memory that does
            // not exist.
            VmxExitReason::EptViolation | VmxExitReason::EptMisconfiguration => {
                let qualification = vcpu.exit_qualification()?.raw;
                log::error!(
                    "VCPU {}: {:?} at 0x{:x} (qualification 0x{:x})",
                    vcpu.vpid(),
                    reason,
                    vcpu.exit_context().rip,
                    qualification
                );
                vcpu.suppress_rip_adjust();
                vcpu.terminate()
            }
            VmxExitReason::Cpuid => {
                let ctx = vcpu.exit_context();
                let res = vcpu.hal().cpuid(ctx.rax as u32, ctx.rcx as u32);
                let ctx = vcpu.exit_context_mut();
                ctx.rax = res.eax as u64;
                ctx.rbx = res.ebx as u64;
                ctx.rcx = res.ecx as u64;
                ctx.rdx = res.edx as u64;
                Ok(())
            }
            VmxExitReason::Rdtsc => {
                let tsc = vcpu.hal().rdtsc();
                vcpu.exit_context_mut().set_edx_eax(tsc);
                Ok(())
            }
            VmxExitReason::Rdtscp => {
                let (tsc, aux) = vcpu.hal().rdtscp();
                let ctx = vcpu.exit_context_mut();
                ctx.set_edx_eax(tsc);
                ctx.rcx = aux as u64;
                Ok(())
            }
            // INVD would discard the writes of the host, write them back instead
            VmxExitReason::Invd | VmxExitReason::Wbinvd => {
                vcpu.hal_mut().wbinvd();
                Ok(())
            }
            VmxExitReason::Vmcall => self.vmcall(vcpu),
            VmxExitReason::ControlRegisterAccesses => self.mov_cr(vcpu),
            VmxExitReason::Rdmsr => self.rdmsr(vcpu),
            VmxExitReason::Wrmsr => self.wrmsr(vcpu),
            VmxExitReason::Xsetbv => {
                let ctx = vcpu.exit_context();
                let (index, value) = (ctx.rcx as u32, ctx.edx_eax());
                vcpu.hal_mut().xsetbv(index, value);
                Ok(())
            }
            reason if reason.is_vmx_instruction() => invalid_opcode(vcpu),
            reason => {
                log::debug!("VCPU {}: unhandled exit {:?}", vcpu.vpid(), reason);
                // There is no instruction to skip past for events.
                if !reason.is_instruction() {
                    vcpu.suppress_rip_adjust();
                }
                Ok(())
            }
        }
    }
}

impl PassthroughHandler {
    /// Re-injects the intercepted event, the guest RIP is then controlled by the injection.
    fn exception_or_nmi<H: VmxHal>(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        let event = vcpu.exit_interrupt_info()?;
        if event.kind() == InterruptionType::HardwareException
            && event.vector() == ExceptionVector::PageFault.as_u8()
        {
            let address = vcpu.exit_qualification()?.raw;
            vcpu.hal_mut().write_cr2(address);
        }
        vcpu.inject(event)?;
        vcpu.suppress_rip_adjust();
        Ok(())
    }

    fn vmcall<H: VmxHal>(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        let number = vcpu.exit_context().rcx;
        let ring = vcpu.guest_selector(SegmentRegister::Cs)? & 0b11;
        match number {
            VMCALL_TERMINATE if ring == 0 => vcpu.terminate(),
            VMCALL_BREAKPOINT => {
                log::info!("VCPU {}: breakpoint at 0x{:x}", vcpu.vpid(), vcpu.exit_context().rip);
                Ok(())
            }
            _ => invalid_opcode(vcpu),
        }
    }

    fn mov_cr<H: VmxHal>(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        match vcpu.exit_qualification()?.control_register_accesses() {
            ControlRegisterAccesses::MovToCr(cr, reg) => {
                let value = vcpu.exit_context().gpr(reg);
                match cr {
                    0 => {
                        vcpu.set_guest_cr0_raw(value)?;
                        vcpu.set_cr0_read_shadow(value)?;
                    }
                    3 => {
                        // Bit 63 only selects whether the TLB is flushed, it is never stored
                        let pcide = vcpu.guest_cr4_raw()? & Cr4Flags::PCID.bits() != 0;
                        let cr3 = if pcide { value & !CR3_PCID_NO_INVALIDATE } else { value };
                        vcpu.set_guest_cr3(cr3)?;
                        vcpu.hal_mut().invvpid_all()?;
                    }
                    4 => {
                        vcpu.set_guest_cr4_raw(value)?;
                        vcpu.set_cr4_read_shadow(value)?;
                    }
                    _ => log::debug!("VCPU {}: ignoring write to CR{}", vcpu.vpid(), cr),
                }
            }
            ControlRegisterAccesses::MovFromCr(cr, reg) => match cr {
                3 => {
                    let cr3 = vcpu.guest_cr3()?;
                    vcpu.exit_context_mut().set_gpr(reg, cr3);
                }
                _ => log::debug!("VCPU {}: ignoring read of CR{}", vcpu.vpid(), cr),
            },
            ControlRegisterAccesses::Clts => {
                let cr0 = vcpu.guest_cr0_raw()? & !Cr0Flags::TASK_SWITCHED.bits();
                vcpu.set_guest_cr0_raw(cr0)?;
                vcpu.set_cr0_read_shadow(cr0)?;
            }
            ControlRegisterAccesses::Lmsw(msw) => {
                // LMSW can set PE but never clear it
                let cr0 = vcpu.guest_cr0_raw()?;
                let cr0 = (cr0 & !(CR0_MSW_MASK & !1)) | (msw as u64 & CR0_MSW_MASK);
                vcpu.set_guest_cr0_raw(cr0)?;
                vcpu.set_cr0_read_shadow(cr0)?;
            }
        }
        Ok(())
    }

    fn rdmsr<H: VmxHal>(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        let id = Msr::new(vcpu.exit_context().rcx as u32);
        if !id.in_bitmap_range() {
            return general_protection(vcpu);
        }
        let value = match id {
            msr::IA32_DEBUGCTL => vcpu.guest_debugctl()?,
            msr::IA32_FS_BASE => vcpu.guest_base(SegmentRegister::Fs)?,
            msr::IA32_GS_BASE => vcpu.guest_base(SegmentRegister::Gs)?,
            other => vcpu.hal().read_msr(other),
        };
        vcpu.exit_context_mut().set_edx_eax(value);
        Ok(())
    }

    fn wrmsr<H: VmxHal>(&mut self, vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
        let id = Msr::new(vcpu.exit_context().rcx as u32);
        if !id.in_bitmap_range() {
            return general_protection(vcpu);
        }
        let value = vcpu.exit_context().edx_eax();
        match id {
            msr::IA32_DEBUGCTL => vcpu.set_guest_debugctl(value)?,
            msr::IA32_FS_BASE => vcpu.vmcs_write(SegmentRegister::Fs.base_field(), value)?,
            msr::IA32_GS_BASE => vcpu.vmcs_write(SegmentRegister::Gs.base_field(), value)?,
            other => vcpu.hal_mut().write_msr(other, value),
        }
        Ok(())
    }
}

/// Injects #UD, pointing to the instruction that caused the exit.
fn invalid_opcode<H: VmxHal>(vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
    let ud = InterruptInfo::new(
        InterruptionType::HardwareException,
        ExceptionVector::InvalidOpcode.as_u8(),
        None,
    );
    vcpu.inject(ud)?;
    vcpu.suppress_rip_adjust();
    Ok(())
}

/// Injects #GP(0), for MSRs that do not exist.
fn general_protection<H: VmxHal>(vcpu: &mut Vcpu<'_, H>) -> Result<(), VcpuError> {
    let gp = InterruptInfo::with_error_code(
        InterruptionType::HardwareException,
        ExceptionVector::GeneralProtectionFault.as_u8(),
        0,
        None,
    );
    vcpu.inject(gp)?;
    vcpu.suppress_rip_adjust();
    Ok(())
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::{Call, FakeHal, FS_BASE};
    use crate::regs::Segment;
    use crate::vcpu::{ExitAction, VcpuState};
    use crate::vmcs::EntryFields;
    use vmx::VmcsField;

    const GUEST_RIP: u64 = 0xFFFF_8000_0010_0000;

    fn running<'h>(handler: &'h mut PassthroughHandler) -> Box<Vcpu<'h, FakeHal>> {
        let mut vcpu = Box::new(Vcpu::new(FakeHal::default()));
        vcpu.initialize(Some(handler)).unwrap();
        vcpu.launch().unwrap();
        vcpu.set_guest_rip(GUEST_RIP).unwrap();
        vcpu
    }

    fn exit(
        vcpu: &mut Vcpu<'_, FakeHal>,
        reason: VmxExitReason,
        qualification: u64,
        length: u64,
    ) -> ExitAction {
        let vmcs = &mut vcpu.hal_mut().vmcs;
        vmcs.set_exit_field(VmcsField::VmExitReason, reason as u64);
        vmcs.set_exit_field(VmcsField::ExitQualification, qualification);
        vmcs.set_exit_field(VmcsField::VmExitInstructionLen, length);
        vcpu.handle_exit()
    }

    #[test]
    fn cpuid() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);
        vcpu.guest_context_mut().rax = 0xFFFF_FFFF_0000_0000;
        vcpu.guest_context_mut().rcx = 7;
        vcpu.guest_context_mut().r12 = 0x1212;

        assert_eq!(exit(&mut vcpu, VmxExitReason::Cpuid, 0, 2), ExitAction::Resume);
        let ctx = *vcpu.guest_context();
        assert_eq!(ctx.rax, 0);
        assert_eq!(ctx.rbx, 0x756E_6547);
        assert_eq!(ctx.rcx, 7);
        assert_eq!(ctx.rdx, 0x4965_6E69);
        assert_eq!(ctx.r12, 0x1212);
        assert_eq!(ctx.rip, GUEST_RIP + 2);
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP + 2));
    }

    #[test]
    fn timestamps() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        exit(&mut vcpu, VmxExitReason::Rdtsc, 0, 2);
        assert_eq!(vcpu.guest_context().rax, 0x5678_9ABC);
        assert_eq!(vcpu.guest_context().rdx, 0x1234);

        exit(&mut vcpu, VmxExitReason::Rdtscp, 0, 3);
        assert_eq!(vcpu.guest_context().edx_eax(), 0x1234_5678_9ABC);
        assert_eq!(vcpu.guest_context().rcx, 3);
        assert_eq!(vcpu.guest_context().rip, GUEST_RIP + 5);
    }

    #[test]
    fn vmcall() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        // Unknown numbers raise #UD on the VMCALL itself
        vcpu.guest_context_mut().rcx = 0x1234;
        assert_eq!(exit(&mut vcpu, VmxExitReason::Vmcall, 0, 3), ExitAction::Resume);
        assert_eq!(vcpu.entry_interruption_info(), Ok(0x8000_0306));
        assert_eq!(vcpu.guest_context().rip, GUEST_RIP);

        vcpu.guest_context_mut().rcx = VMCALL_BREAKPOINT;
        assert_eq!(exit(&mut vcpu, VmxExitReason::Vmcall, 0, 3), ExitAction::Resume);
        assert_eq!(vcpu.guest_context().rip, GUEST_RIP + 3);

        // Termination requires ring 0
        let kernel_cs = vcpu.guest_cs().unwrap();
        let user_cs = Segment { selector: 0x2B, ..kernel_cs };
        vcpu.set_guest_cs(&user_cs).unwrap();
        vcpu.guest_context_mut().rcx = VMCALL_TERMINATE;
        assert_eq!(exit(&mut vcpu, VmxExitReason::Vmcall, 0, 3), ExitAction::Resume);
        assert_eq!(vcpu.state(), VcpuState::Running);

        vcpu.set_guest_cs(&kernel_cs).unwrap();
        assert_eq!(exit(&mut vcpu, VmxExitReason::Vmcall, 0, 3), ExitAction::Devirtualize);
        assert_eq!(vcpu.state(), VcpuState::Terminated);
        assert_eq!(vcpu.exit_context().rip, GUEST_RIP + 6);
        assert_eq!(vcpu.exit_context().rcx, VMCALL_TERMINATE);
        assert!(!vcpu.hal().vmx_on);
    }

    #[test]
    fn vmx_instructions() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        assert_eq!(exit(&mut vcpu, VmxExitReason::Vmxon, 0, 4), ExitAction::Resume);
        assert_eq!(vcpu.entry_interruption_info(), Ok(0x8000_0306));
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
    }

    #[test]
    fn exceptions() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        // #PF with error code 2, faulting address in the exit qualification
        let vmcs = &mut vcpu.hal_mut().vmcs;
        vmcs.set_exit_field(VmcsField::VmExitIntrInfo, 0x8000_0B0E);
        vmcs.set_exit_field(VmcsField::VmExitIntrErrorCode, 2);
        assert_eq!(exit(&mut vcpu, VmxExitReason::Exception, 0xDEAD_B000, 0), ExitAction::Resume);

        assert_eq!(vcpu.entry_interruption_info(), Ok(0x8000_0B0E));
        assert_eq!(vcpu.entry_exception_error_code(), Ok(2));
        assert_eq!(vcpu.hal().calls.last(), Some(&Call::WriteCr2(0xDEAD_B000)));
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
    }

    #[test]
    fn triple_fault() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);
        assert_eq!(exit(&mut vcpu, VmxExitReason::TripleFault, 0, 0), ExitAction::Devirtualize);
        assert_eq!(vcpu.state(), VcpuState::Terminated);
    }

    #[test]
    fn ept_violation() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        // A stale instruction length must not move RIP
        let action = exit(&mut vcpu, VmxExitReason::EptViolation, 0b10, 7);
        assert_eq!(action, ExitAction::Devirtualize);
        assert_eq!(vcpu.state(), VcpuState::Terminated);
        assert_eq!(vcpu.exit_context().rip, GUEST_RIP);
        assert!(!vcpu.hal().vmx_on);
    }

    #[test]
    fn events_do_not_advance_rip() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        assert_eq!(exit(&mut vcpu, VmxExitReason::ExternalInterrupt, 0, 3), ExitAction::Resume);
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
        assert_eq!(exit(&mut vcpu, VmxExitReason::InterruptWindow, 0, 3), ExitAction::Resume);
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
    }

    #[test]
    fn control_registers() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        #[rustfmt::skip]
        const MOV_TO_CR0_RBX:   u64 = 0b0011_0000_0000;
        #[rustfmt::skip]
        const MOV_TO_CR3_RAX:   u64 = 0b0000_0000_0011;
        #[rustfmt::skip]
        const MOV_FROM_CR3_R9:  u64 = 0b1001_0001_0011;
        #[rustfmt::skip]
        const CLTS:             u64 = 0b0000_0010_0000;

        vcpu.guest_context_mut().rbx = 0x8005_003B;
        exit(&mut vcpu, VmxExitReason::ControlRegisterAccesses, MOV_TO_CR0_RBX, 3);
        assert_eq!(vcpu.guest_cr0().unwrap().bits(), 0x8005_003B);
        assert_eq!(vcpu.cr0_read_shadow(), Ok(0x8005_003B));

        exit(&mut vcpu, VmxExitReason::ControlRegisterAccesses, CLTS, 2);
        assert_eq!(vcpu.guest_cr0().unwrap().bits(), 0x8005_0033);
        assert_eq!(vcpu.cr0_read_shadow(), Ok(0x8005_0033));

        // LMSW sets TS and does not clear PE
        exit(&mut vcpu, VmxExitReason::ControlRegisterAccesses, (0x8 << 16) | 0b11_0000, 4);
        assert_eq!(vcpu.guest_cr0().unwrap().bits(), 0x8005_0039);

        // Bit 63 is dropped when PCIDs are enabled, and the TLB is flushed
        let cr4 = vcpu.guest_cr4().unwrap() | Cr4Flags::PCID;
        vcpu.set_guest_cr4(cr4).unwrap();
        vcpu.guest_context_mut().rax = (1 << 63) | 0x2_0005;
        exit(&mut vcpu, VmxExitReason::ControlRegisterAccesses, MOV_TO_CR3_RAX, 3);
        assert_eq!(vcpu.guest_cr3(), Ok(0x2_0005));
        assert_eq!(vcpu.hal().calls.last(), Some(&Call::InvvpidAll));

        exit(&mut vcpu, VmxExitReason::ControlRegisterAccesses, MOV_FROM_CR3_R9, 3);
        assert_eq!(vcpu.guest_context().r9, 0x2_0005);
    }

    #[test]
    fn msrs() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        vcpu.guest_context_mut().rcx = msr::IA32_FS_BASE.address() as u64;
        exit(&mut vcpu, VmxExitReason::Rdmsr, 0, 2);
        assert_eq!(vcpu.guest_context().edx_eax(), FS_BASE);

        vcpu.guest_context_mut().rcx = msr::IA32_GS_BASE.address() as u64;
        vcpu.guest_context_mut().set_edx_eax(0xFFFF_8000_0000_7000);
        exit(&mut vcpu, VmxExitReason::Wrmsr, 0, 2);
        assert_eq!(vcpu.guest_base(SegmentRegister::Gs), Ok(0xFFFF_8000_0000_7000));

        vcpu.guest_context_mut().rcx = msr::IA32_TSC_AUX.address() as u64;
        vcpu.guest_context_mut().set_edx_eax(5);
        exit(&mut vcpu, VmxExitReason::Wrmsr, 0, 2);
        assert_eq!(
            vcpu.hal().calls.last(),
            Some(&Call::WriteMsr(msr::IA32_TSC_AUX.address(), 5))
        );
        exit(&mut vcpu, VmxExitReason::Rdmsr, 0, 2);
        assert_eq!(vcpu.guest_context().rax, 5);
        assert_eq!(vcpu.guest_context().rdx, 0);
    }

    #[test]
    fn unknown_msrs() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);
        let calls = vcpu.hal().calls.len();

        // Hypervisor range, outside of both MSR bitmap ranges
        vcpu.guest_context_mut().rcx = 0x4000_0000;
        vcpu.guest_context_mut().set_edx_eax(0x1234);
        assert_eq!(exit(&mut vcpu, VmxExitReason::Wrmsr, 0, 2), ExitAction::Resume);
        assert_eq!(vcpu.entry_interruption_info(), Ok(0x8000_0B0D));
        assert_eq!(vcpu.entry_exception_error_code(), Ok(0));
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
        assert_eq!(vcpu.hal().calls.len(), calls);

        vcpu.set_entry_interruption_info(0).unwrap();
        vcpu.guest_context_mut().rax = 0xAA;
        vcpu.guest_context_mut().rdx = 0xBB;
        assert_eq!(exit(&mut vcpu, VmxExitReason::Rdmsr, 0, 2), ExitAction::Resume);
        assert_eq!(vcpu.entry_interruption_info(), Ok(0x8000_0B0D));
        assert_eq!(vcpu.guest_context().rax, 0xAA);
        assert_eq!(vcpu.guest_context().rdx, 0xBB);
        assert_eq!(vcpu.guest_rip(), Ok(GUEST_RIP));
    }

    #[test]
    fn cache_and_xsetbv() {
        let mut handler = PassthroughHandler::default();
        let mut vcpu = running(&mut handler);

        exit(&mut vcpu, VmxExitReason::Invd, 0, 2);
        assert_eq!(vcpu.hal().calls.last(), Some(&Call::Wbinvd));

        vcpu.guest_context_mut().rcx = 0;
        vcpu.guest_context_mut().set_edx_eax(0x7);
        exit(&mut vcpu, VmxExitReason::Xsetbv, 0, 3);
        assert_eq!(vcpu.hal().calls.last(), Some(&Call::Xsetbv(0, 0x7)));

        // Unhandled exits resume after the instruction
        exit(&mut vcpu, VmxExitReason::Hlt, 0, 1);
        assert_eq!(vcpu.guest_context().rip, GUEST_RIP + 6);
        drop(vcpu);
        assert_eq!(handler.exits, 3);
    }
}
