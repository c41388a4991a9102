//! Transition frame
//!
//! The memory shared between the VCPU and the mode-transition trampolines: the private stack
//! used while handling VM exits, followed by the guest register context and the context of the
//! last exit. The trampolines address these through the offsets below, which are derived from the
//! Rust layout and checked at compile time.

use core::mem::{offset_of, size_of};

use vmx::fields::GeneralPurposeField;

use crate::VCPU_STACK_SIZE;

/// General purpose registers, instruction pointer and flags of a logical processor.
///
/// Registers are stored in their architectural encoding order, as used by the exit
/// qualifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Context {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Context {
    pub fn gpr(&self, reg: GeneralPurposeField) -> u64 {
        match reg {
            GeneralPurposeField::Rax => self.rax,
            GeneralPurposeField::Rcx => self.rcx,
            GeneralPurposeField::Rdx => self.rdx,
            GeneralPurposeField::Rbx => self.rbx,
            GeneralPurposeField::Rsp => self.rsp,
            GeneralPurposeField::Rbp => self.rbp,
            GeneralPurposeField::Rsi => self.rsi,
            GeneralPurposeField::Rdi => self.rdi,
            GeneralPurposeField::R8 => self.r8,
            GeneralPurposeField::R9 => self.r9,
            GeneralPurposeField::R10 => self.r10,
            GeneralPurposeField::R11 => self.r11,
            GeneralPurposeField::R12 => self.r12,
            GeneralPurposeField::R13 => self.r13,
            GeneralPurposeField::R14 => self.r14,
            GeneralPurposeField::R15 => self.r15,
        }
    }

    pub fn set_gpr(&mut self, reg: GeneralPurposeField, value: u64) {
        let slot = match reg {
            GeneralPurposeField::Rax => &mut self.rax,
            GeneralPurposeField::Rcx => &mut self.rcx,
            GeneralPurposeField::Rdx => &mut self.rdx,
            GeneralPurposeField::Rbx => &mut self.rbx,
            GeneralPurposeField::Rsp => &mut self.rsp,
            GeneralPurposeField::Rbp => &mut self.rbp,
            GeneralPurposeField::Rsi => &mut self.rsi,
            GeneralPurposeField::Rdi => &mut self.rdi,
            GeneralPurposeField::R8 => &mut self.r8,
            GeneralPurposeField::R9 => &mut self.r9,
            GeneralPurposeField::R10 => &mut self.r10,
            GeneralPurposeField::R11 => &mut self.r11,
            GeneralPurposeField::R12 => &mut self.r12,
            GeneralPurposeField::R13 => &mut self.r13,
            GeneralPurposeField::R14 => &mut self.r14,
            GeneralPurposeField::R15 => &mut self.r15,
        };
        *slot = value;
    }

    /// Writes a 64 bits value split in EDX:EAX, as done by RDMSR, RDTSC and friends.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xFFFF_FFFF;
        self.rdx = value >> 32;
    }

    /// Reads a 64 bits value from EDX:EAX, as consumed by WRMSR and XSETBV.
    pub fn edx_eax(&self) -> u64 {
        ((self.rdx & 0xFFFF_FFFF) << 32) | (self.rax & 0xFFFF_FFFF)
    }
}

/// Function called by the exit trampoline, with the frame as argument.
pub type ExitDispatch = unsafe extern "C" fn(*mut TransitionFrame) -> !;

/// Stack and register contexts used across VM exits.
///
/// The host stack pointer programmed in the VMCS is the address of `guest_context`: the exit
/// trampoline stores the guest registers there, then uses the memory below as its stack.
#[repr(C, align(16))]
pub struct TransitionFrame {
    pub stack: [u8; VCPU_STACK_SIZE],
    pub guest_context: Context,
    pub exit_context: Context,
    /// The exit handling pass of the VCPU owning this frame.
    pub dispatch: Option<ExitDispatch>,
}

impl TransitionFrame {
    pub const fn new() -> Self {
        Self {
            stack: [0; VCPU_STACK_SIZE],
            guest_context: Context {
                rax: 0,
                rcx: 0,
                rdx: 0,
                rbx: 0,
                rsp: 0,
                rbp: 0,
                rsi: 0,
                rdi: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                rip: 0,
                rflags: 0,
            },
            exit_context: Context {
                rax: 0,
                rcx: 0,
                rdx: 0,
                rbx: 0,
                rsp: 0,
                rbp: 0,
                rsi: 0,
                rdi: 0,
                r8: 0,
                r9: 0,
                r10: 0,
                r11: 0,
                r12: 0,
                r13: 0,
                r14: 0,
                r15: 0,
                rip: 0,
                rflags: 0,
            },
            dispatch: None,
        }
    }
}

// ———————————————————————————————— Offsets ————————————————————————————————— //

pub const FRAME_GUEST_CONTEXT: usize = offset_of!(TransitionFrame, guest_context);
pub const FRAME_EXIT_CONTEXT: usize = offset_of!(TransitionFrame, exit_context);
pub const FRAME_DISPATCH: usize = offset_of!(TransitionFrame, dispatch);

pub const CONTEXT_RAX: usize = offset_of!(Context, rax);
pub const CONTEXT_RCX: usize = offset_of!(Context, rcx);
pub const CONTEXT_RDX: usize = offset_of!(Context, rdx);
pub const CONTEXT_RBX: usize = offset_of!(Context, rbx);
pub const CONTEXT_RSP: usize = offset_of!(Context, rsp);
pub const CONTEXT_RBP: usize = offset_of!(Context, rbp);
pub const CONTEXT_RSI: usize = offset_of!(Context, rsi);
pub const CONTEXT_RDI: usize = offset_of!(Context, rdi);
pub const CONTEXT_R8: usize = offset_of!(Context, r8);
pub const CONTEXT_R9: usize = offset_of!(Context, r9);
pub const CONTEXT_R10: usize = offset_of!(Context, r10);
pub const CONTEXT_R11: usize = offset_of!(Context, r11);
pub const CONTEXT_R12: usize = offset_of!(Context, r12);
pub const CONTEXT_R13: usize = offset_of!(Context, r13);
pub const CONTEXT_R14: usize = offset_of!(Context, r14);
pub const CONTEXT_R15: usize = offset_of!(Context, r15);
pub const CONTEXT_RIP: usize = offset_of!(Context, rip);
pub const CONTEXT_RFLAGS: usize = offset_of!(Context, rflags);

// The exit trampoline derives the frame from the host stack pointer, and calls the dispatcher with
// a 16 bytes aligned stack.
const _: () = assert!(FRAME_GUEST_CONTEXT == VCPU_STACK_SIZE);
const _: () = assert!(FRAME_GUEST_CONTEXT % 16 == 0);
const _: () = assert!(FRAME_EXIT_CONTEXT == FRAME_GUEST_CONTEXT + size_of::<Context>());
const _: () = assert!(size_of::<Context>() == 18 * 8);
const _: () = assert!(CONTEXT_RSP == GeneralPurposeField::Rsp as usize * 8);
const _: () = assert!(CONTEXT_R15 == GeneralPurposeField::R15 as usize * 8);
const _: () = assert!(size_of::<Option<ExitDispatch>>() == 8);

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        let frame = TransitionFrame::new();
        let base = &frame as *const _ as usize;
        assert_eq!(&frame.guest_context as *const _ as usize - base, VCPU_STACK_SIZE);
        assert_eq!(&frame.exit_context as *const _ as usize - base, VCPU_STACK_SIZE + 144);
        assert_eq!(CONTEXT_RIP, 16 * 8);
        assert_eq!(CONTEXT_RFLAGS, 17 * 8);
    }

    #[test]
    fn registers() {
        let mut ctx = Context::default();
        ctx.set_gpr(GeneralPurposeField::R11, 0x1111);
        ctx.set_gpr(GeneralPurposeField::Rbx, 0x2222);
        assert_eq!(ctx.r11, 0x1111);
        assert_eq!(ctx.gpr(GeneralPurposeField::Rbx), 0x2222);
        assert_eq!(ctx.gpr(GeneralPurposeField::Rsp), 0);

        ctx.set_edx_eax(0x1234_5678_9ABC_DEF0);
        assert_eq!(ctx.rax, 0x9ABC_DEF0);
        assert_eq!(ctx.rdx, 0x1234_5678);
        assert_eq!(ctx.edx_eax(), 0x1234_5678_9ABC_DEF0);

        // Upper halves are ignored
        ctx.rax |= 0xFFFF_FFFF << 32;
        assert_eq!(ctx.edx_eax(), 0x1234_5678_9ABC_DEF0);
    }
}
