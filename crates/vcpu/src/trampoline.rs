//! Mode transition trampolines
//!
//! Assembly stubs moving between VMX root and non-root operation:
//!
//! - `vmx_launch` enters the guest for the first time. The guest resumes right after the stub,
//!   so that the caller of [`launch`] continues as the guest.
//! - `vmx_entry_guest` is the host RIP: it saves the guest registers in the guest context of the
//!   [`TransitionFrame`] (the host RSP) and calls the dispatch function stored in the frame.
//! - `vmx_resume` loads a guest context and executes VMRESUME, returning RFLAGS if it fails.
//! - `vmx_restore_context` continues execution in root mode with a context, used once VMX
//!   operation is left.

use core::arch::global_asm;
use core::arch::x86_64::{_fxrstor64, _fxsave64};

use vmx::VmcsField;

use crate::frame::*;
use crate::hal::VmxHal;
use crate::vcpu::{ExitAction, Vcpu};

global_asm!(
    ".text",
    ".global vmx_entry_guest",
    "vmx_entry_guest:",
    // RSP points to the guest context, RSP and RIP are saved in the VMCS.
    "mov [rsp + {RAX}], rax",
    "mov [rsp + {RCX}], rcx",
    "mov [rsp + {RDX}], rdx",
    "mov [rsp + {RBX}], rbx",
    "mov [rsp + {RBP}], rbp",
    "mov [rsp + {RSI}], rsi",
    "mov [rsp + {RDI}], rdi",
    "mov [rsp + {R8}], r8",
    "mov [rsp + {R9}], r9",
    "mov [rsp + {R10}], r10",
    "mov [rsp + {R11}], r11",
    "mov [rsp + {R12}], r12",
    "mov [rsp + {R13}], r13",
    "mov [rsp + {R14}], r14",
    "mov [rsp + {R15}], r15",
    // The stack of the frame lies below the guest context.
    "mov rdi, rsp",
    "sub rdi, {GUEST_CONTEXT}",
    "call [rdi + {DISPATCH}]",
    "ud2",
    "",
    ".global vmx_resume",
    "vmx_resume:",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rax, rdi",
    "mov rcx, [rax + {RCX}]",
    "mov rdx, [rax + {RDX}]",
    "mov rbx, [rax + {RBX}]",
    "mov rbp, [rax + {RBP}]",
    "mov rsi, [rax + {RSI}]",
    "mov rdi, [rax + {RDI}]",
    "mov r8, [rax + {R8}]",
    "mov r9, [rax + {R9}]",
    "mov r10, [rax + {R10}]",
    "mov r11, [rax + {R11}]",
    "mov r12, [rax + {R12}]",
    "mov r13, [rax + {R13}]",
    "mov r14, [rax + {R14}]",
    "mov r15, [rax + {R15}]",
    "mov rax, [rax + {RAX}]",
    "vmresume",
    // Only reached on failure
    "pushfq",
    "pop rax",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "ret",
    "",
    ".global vmx_restore_context",
    "vmx_restore_context:",
    "mov rax, rdi",
    // RIP and RFLAGS go on the restored stack, which must not have a red zone.
    "mov rsp, [rax + {RSP}]",
    "push qword ptr [rax + {RIP}]",
    "push qword ptr [rax + {RFLAGS}]",
    "mov rcx, [rax + {RCX}]",
    "mov rdx, [rax + {RDX}]",
    "mov rbx, [rax + {RBX}]",
    "mov rbp, [rax + {RBP}]",
    "mov rsi, [rax + {RSI}]",
    "mov rdi, [rax + {RDI}]",
    "mov r8, [rax + {R8}]",
    "mov r9, [rax + {R9}]",
    "mov r10, [rax + {R10}]",
    "mov r11, [rax + {R11}]",
    "mov r12, [rax + {R12}]",
    "mov r13, [rax + {R13}]",
    "mov r14, [rax + {R14}]",
    "mov r15, [rax + {R15}]",
    "mov rax, [rax + {RAX}]",
    "popfq",
    "ret",
    "",
    ".global vmx_launch",
    "vmx_launch:",
    // The guest starts with the current stack, at label 2, with the current flags.
    "mov rcx, {GUEST_RSP}",
    "vmwrite rcx, rsp",
    "jbe 3f",
    "mov rcx, {GUEST_RIP}",
    "lea rax, [rip + 2f]",
    "vmwrite rcx, rax",
    "jbe 3f",
    "pushfq",
    "pop rax",
    "mov rcx, {GUEST_RFLAGS}",
    "vmwrite rcx, rax",
    "jbe 3f",
    "vmlaunch",
    "3:",
    "pushfq",
    "pop rax",
    "ret",
    "2:",
    "xor eax, eax",
    "ret",
    RAX = const CONTEXT_RAX,
    RCX = const CONTEXT_RCX,
    RDX = const CONTEXT_RDX,
    RBX = const CONTEXT_RBX,
    RSP = const CONTEXT_RSP,
    RBP = const CONTEXT_RBP,
    RSI = const CONTEXT_RSI,
    RDI = const CONTEXT_RDI,
    R8 = const CONTEXT_R8,
    R9 = const CONTEXT_R9,
    R10 = const CONTEXT_R10,
    R11 = const CONTEXT_R11,
    R12 = const CONTEXT_R12,
    R13 = const CONTEXT_R13,
    R14 = const CONTEXT_R14,
    R15 = const CONTEXT_R15,
    RIP = const CONTEXT_RIP,
    RFLAGS = const CONTEXT_RFLAGS,
    GUEST_CONTEXT = const FRAME_GUEST_CONTEXT,
    DISPATCH = const FRAME_DISPATCH,
    GUEST_RSP = const VmcsField::GuestRsp as u32,
    GUEST_RIP = const VmcsField::GuestRip as u32,
    GUEST_RFLAGS = const VmcsField::GuestRflags as u32,
);

extern "C" {
    fn vmx_entry_guest() -> !;
    fn vmx_resume(context: *const Context) -> u64;
    fn vmx_restore_context(context: *const Context) -> !;
    fn vmx_launch() -> u64;
}

/// Executes VMLAUNCH, the guest continues after this call.
///
/// Returns 0 once running as the guest, or the RFLAGS left by the failing VMX instruction.
///
/// # Safety
///
/// A VMCS must be current, with the host state pointing to a live [`TransitionFrame`].
pub unsafe fn launch() -> u64 {
    vmx_launch()
}

/// The address of the VM exit trampoline, to be used as host RIP.
pub fn entry_point() -> u64 {
    vmx_entry_guest as usize as u64
}

/// The exit handling pass, called by `vmx_entry_guest` on the private stack of the VCPU.
///
/// # Safety
///
/// `frame` must be the frame of a `Vcpu<H>`, which holds it as its first field.
pub(crate) unsafe extern "C" fn exit_dispatch<H: VmxHal>(frame: *mut TransitionFrame) -> ! {
    let vcpu = &mut *(frame as *mut Vcpu<'_, H>);

    // Exit handlers are free to use SSE registers
    _fxsave64(vcpu.fxsave_area());
    let action = vcpu.handle_exit();
    _fxrstor64(vcpu.fxsave_area());

    if action == ExitAction::Resume {
        let rflags = vmx_resume(&vcpu.frame().guest_context);
        vcpu.resume_failed(rflags);
    }
    vmx_restore_context(&vcpu.frame().exit_context)
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_point_is_code() {
        let entry = entry_point();
        assert_eq!(entry, vmx_entry_guest as usize as u64);
        for other in [
            vmx_launch as usize,
            vmx_resume as usize,
            vmx_restore_context as usize,
            launch as usize,
        ] {
            assert_ne!(entry, other as u64);
        }

        // `mov [rsp + RAX], rax`, then `push rbx`
        let code = unsafe { core::slice::from_raw_parts(entry as *const u8, 2) };
        assert_eq!(code, &[0x48, 0x89]);
        let code = unsafe { core::slice::from_raw_parts(vmx_resume as usize as *const u8, 1) };
        assert_eq!(code, &[0x53]);
    }
}
