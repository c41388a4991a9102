//! VMX virtual CPU
//!
//! A per-processor VCPU that moves the running operating system into VMX non-root operation,
//! intercepts VM exits, and resumes or devirtualizes it afterward. The hardware is reached through
//! the [`VmxHal`] trait so that the whole lifecycle can be exercised without VT-x.
#![cfg_attr(not(test), no_std)]

pub mod ept;
pub mod error;
pub mod frame;
pub mod hal;
pub mod handler;
pub mod hardware;
pub mod interrupt;
pub mod regs;
pub mod segment;
pub mod trampoline;
pub mod vcpu;
pub mod vmcs;

#[cfg(test)]
mod fake;

pub use crate::ept::Ept;
pub use crate::error::VcpuError;
pub use crate::frame::{Context, TransitionFrame};
pub use crate::hal::{ProcessorState, VmxHal};
pub use crate::handler::{ExitHandler, PassthroughHandler};
pub use crate::hardware::Hardware;
pub use crate::interrupt::InterruptInfo;
pub use crate::vcpu::{ExitAction, LaunchError, Vcpu, VcpuState};
pub use crate::vmcs::{ControlFields, EntryFields, ExitFields, GuestFields, HostFields, VmcsAccess};

/// Size of the private stack used by the VCPU while handling VM exits.
pub const VCPU_STACK_SIZE: usize = 0x8000;
