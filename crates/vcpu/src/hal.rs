//! Hardware abstraction layer
//!
//! Everything the VCPU needs from the processor goes through [`VmxHal`]: capability MSRs, VMX
//! instructions, the state of the running processor and the instructions executed on behalf of
//! the guest. [`crate::Hardware`] is the implementation for the real processor.

use core::arch::x86_64::CpuidResult;

use utils::{HostPhysAddr, HostVirtAddr};
use vmx::msr::Msr;
use vmx::{VmcsField, VmxError};

use crate::regs::DescriptorTable;

/// A snapshot of the registers of the current processor, used to mirror it in the guest and to
/// build the host state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rflags: u64,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldtr: u16,
    pub tr: u16,
}

/// The interfaces the VCPU uses to reach the processor.
pub trait VmxHal {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    fn read_msr(&self, msr: Msr) -> u64;
    fn write_msr(&mut self, msr: Msr, value: u64);

    fn write_cr0(&mut self, value: u64);
    fn write_cr2(&mut self, value: u64);
    fn write_cr3(&mut self, value: u64);
    fn write_cr4(&mut self, value: u64);
    fn write_dr7(&mut self, value: u64);

    fn load_gdtr(&mut self, gdtr: &DescriptorTable);
    fn load_idtr(&mut self, idtr: &DescriptorTable);

    /// Captures the control registers, flags, descriptor tables and selectors of the processor.
    fn capture_state(&self) -> ProcessorState;

    /// The descriptors of the GDT pointed to by `gdtr`.
    fn gdt(&self, gdtr: &DescriptorTable) -> &[u64];

    /// Converts a host virtual address to a host physical address.
    fn virt_to_phys(&self, addr: HostVirtAddr) -> Option<HostPhysAddr>;

    // ——————————————————————————— VMX Instructions ——————————————————————————— //

    fn vmxon(&mut self, region: HostPhysAddr) -> Result<(), VmxError>;
    fn vmxoff(&mut self) -> Result<(), VmxError>;
    fn vmclear(&mut self, region: HostPhysAddr) -> Result<(), VmxError>;
    fn vmptrld(&mut self, region: HostPhysAddr) -> Result<(), VmxError>;
    fn vmread(&self, field: VmcsField) -> Result<u64, VmxError>;
    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError>;

    /// Enters the guest for the first time.
    ///
    /// The guest resumes the caller: on success this function returns in VMX non-root operation,
    /// with the caller's stack, instruction pointer and flags.
    fn launch(&mut self) -> Result<(), VmxError>;

    /// Address of the code executed by the host on VM exits.
    fn exit_entry_point(&self) -> u64;

    fn invvpid_all(&mut self) -> Result<(), VmxError>;

    // ———————————————————————— Guest Instructions ———————————————————————————— //

    fn rdtsc(&self) -> u64;

    /// Returns the TSC and IA32_TSC_AUX.
    fn rdtscp(&self) -> (u64, u32);

    fn wbinvd(&mut self);

    fn xsetbv(&mut self, index: u32, value: u64);
}
