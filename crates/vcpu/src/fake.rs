//! In-memory VMCS and processor used by the unit tests.

use std::collections::BTreeMap;
use std::vec::Vec;

use core::arch::x86_64::CpuidResult;

use utils::{HostPhysAddr, HostVirtAddr};
use vmx::bitmaps::EptCapability;
use vmx::msr::{self, Msr};
use vmx::{VmcsField, VmxError, VmxInstructionError};

use crate::hal::{ProcessorState, VmxHal};
use crate::regs::DescriptorTable;
use crate::vcpu::{ExitAction, Vcpu};
use crate::vmcs::VmcsAccess;

/// A VMCS backed by a map, enforcing field widths and read-only fields.
#[derive(Debug, Default)]
pub struct MemoryVmcs {
    fields: BTreeMap<VmcsField, u64>,
}

impl MemoryVmcs {
    /// Sets a field as the processor would do on a VM exit, bypassing the read-only check.
    pub fn set_exit_field(&mut self, field: VmcsField, value: u64) {
        self.fields.insert(field, value & field.width().mask());
    }

    /// Number of fields written so far.
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

impl VmcsAccess for MemoryVmcs {
    fn vmcs_read(&self, field: VmcsField) -> Result<u64, VmxError> {
        Ok(self.fields.get(&field).copied().unwrap_or(0))
    }

    fn vmcs_write(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError> {
        if !field.tpe().is_vmwritable() {
            return Err(VmxError::VmFailValid(VmxInstructionError::VmWriteToReadOnly));
        }
        self.fields.insert(field, value & field.width().mask());
        Ok(())
    }
}

/// Side effects of the fake processor, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Vmxon(HostPhysAddr),
    Vmxoff,
    Vmclear(HostPhysAddr),
    Vmptrld(HostPhysAddr),
    Launch,
    InvvpidAll,
    Wbinvd,
    Xsetbv(u32, u64),
    WriteMsr(u32, u64),
    WriteCr0(u64),
    WriteCr2(u64),
    WriteCr3(u64),
    WriteCr4(u64),
    WriteDr7(u64),
    LoadGdtr(DescriptorTable),
    LoadIdtr(DescriptorTable),
}

pub const FS_BASE: u64 = 0xFFFF_8000_0000_F000;
pub const GS_BASE: u64 = 0xFFFF_8000_0000_6000;

/// A VMX capable processor running a 64 bits kernel.
pub struct FakeHal {
    pub vmcs: MemoryVmcs,
    pub msrs: BTreeMap<u32, u64>,
    pub state: ProcessorState,
    pub gdt: Vec<u64>,
    pub vmx_supported: bool,
    /// Outcome of the next VMLAUNCH.
    pub launch_result: Result<(), VmxError>,
    pub vmx_on: bool,
    pub current_vmcs: Option<HostPhysAddr>,
    pub calls: Vec<Call>,
    pub tsc: u64,
    pub tsc_aux: u32,
    /// When set, VMLAUNCH fails on VM entry: the processor records an invalid guest state exit
    /// and runs the exit handling of this VCPU before the launch returns.
    pub entry_failure: Option<*mut Vcpu<'static, FakeHal>>,
}

impl Default for FakeHal {
    fn default() -> Self {
        let all_allowed = 0xFFFF_FFFF << 32;
        let ept_caps = EptCapability::PAGE_WALK_4
            | EptCapability::WRITE_BACK
            | EptCapability::PAGE_1GB
            | EptCapability::INVVPID
            | EptCapability::ALL_CTX_INVVPID;

        let mut msrs = BTreeMap::new();
        msrs.insert(msr::FEATURE_CONTROL.address(), 0b101);
        msrs.insert(msr::VMX_BASIC.address(), 1 | (0x1000 << 32) | (1 << 55));
        for ctls in [
            msr::VMX_PINBASED_CTLS,
            msr::VMX_PROCBASED_CTLS,
            msr::VMX_EXIT_CTLS,
            msr::VMX_ENTRY_CTLS,
            msr::VMX_PROCBASED_CTLS2,
            msr::VMX_TRUE_PINBASED_CTLS,
            msr::VMX_TRUE_PROCBASED_CTLS,
            msr::VMX_TRUE_EXIT_CTLS,
            msr::VMX_TRUE_ENTRY_CTLS,
        ] {
            msrs.insert(ctls.address(), all_allowed);
        }
        msrs.insert(msr::VMX_CR0_FIXED0.address(), 0x8000_0021);
        msrs.insert(msr::VMX_CR0_FIXED1.address(), 0xFFFF_FFFF);
        msrs.insert(msr::VMX_CR4_FIXED0.address(), 0x2000);
        msrs.insert(msr::VMX_CR4_FIXED1.address(), 0x3F_FFFF);
        msrs.insert(msr::VMX_EPT_VPID_CAP.address(), ept_caps.bits());
        msrs.insert(msr::IA32_FS_BASE.address(), FS_BASE);
        msrs.insert(msr::IA32_GS_BASE.address(), GS_BASE);

        let state = ProcessorState {
            cr0: 0x8005_0033,
            cr3: 0x1_0000,
            cr4: 0x6F0,
            dr7: 0x400,
            rflags: 0x246,
            gdtr: DescriptorTable { base: 0x1000, limit: 39 },
            idtr: DescriptorTable { base: 0x2000, limit: 0xFFF },
            cs: 0x08,
            ss: 0x10,
            tr: 0x18,
            ..Default::default()
        };

        Self {
            vmcs: MemoryVmcs::default(),
            msrs,
            state,
            #[rustfmt::skip]
            gdt: vec![
                0x0000_0000_0000_0000, // null
                0x00AF_9A00_0000_FFFF, // 64 bits kernel code
                0x00CF_9200_0000_FFFF, // kernel data
                0x1200_8B34_5678_0067, // TSS, low half
                0x0000_0000_FFFF_8000, // TSS, high half
            ],
            vmx_supported: true,
            launch_result: Ok(()),
            vmx_on: false,
            current_vmcs: None,
            calls: Vec::new(),
            tsc: 0x1234_5678_9ABC,
            tsc_aux: 3,
            entry_failure: None,
        }
    }
}

impl FakeHal {
    fn vmx_operation(&self) -> Result<(), VmxError> {
        if self.vmx_on {
            Ok(())
        } else {
            Err(VmxError::VmFailInvalid)
        }
    }
}

impl VmxHal for FakeHal {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let ecx = if leaf == 1 && self.vmx_supported {
            vmx::CPUID_ECX_VMX_MASK
        } else {
            subleaf
        };
        CpuidResult {
            eax: leaf,
            ebx: 0x756E_6547,
            ecx,
            edx: 0x4965_6E69,
        }
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        self.msrs.get(&msr.address()).copied().unwrap_or(0)
    }

    fn write_msr(&mut self, msr: Msr, value: u64) {
        self.calls.push(Call::WriteMsr(msr.address(), value));
        self.msrs.insert(msr.address(), value);
    }

    fn write_cr0(&mut self, value: u64) {
        self.calls.push(Call::WriteCr0(value));
        self.state.cr0 = value;
    }

    fn write_cr2(&mut self, value: u64) {
        self.calls.push(Call::WriteCr2(value));
    }

    fn write_cr3(&mut self, value: u64) {
        self.calls.push(Call::WriteCr3(value));
        self.state.cr3 = value;
    }

    fn write_cr4(&mut self, value: u64) {
        self.calls.push(Call::WriteCr4(value));
        self.state.cr4 = value;
    }

    fn write_dr7(&mut self, value: u64) {
        self.calls.push(Call::WriteDr7(value));
        self.state.dr7 = value;
    }

    fn load_gdtr(&mut self, gdtr: &DescriptorTable) {
        self.calls.push(Call::LoadGdtr(*gdtr));
        self.state.gdtr = *gdtr;
    }

    fn load_idtr(&mut self, idtr: &DescriptorTable) {
        self.calls.push(Call::LoadIdtr(*idtr));
        self.state.idtr = *idtr;
    }

    fn capture_state(&self) -> ProcessorState {
        self.state
    }

    fn gdt(&self, _gdtr: &DescriptorTable) -> &[u64] {
        &self.gdt
    }

    fn virt_to_phys(&self, addr: HostVirtAddr) -> Option<HostPhysAddr> {
        Some(HostPhysAddr::new(addr.as_usize()))
    }

    fn vmxon(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        self.calls.push(Call::Vmxon(region));
        if self.vmx_on || self.state.cr4 & vmx::CR4_VMXE == 0 {
            return Err(VmxError::VmFailInvalid);
        }
        self.vmx_on = true;
        Ok(())
    }

    fn vmxoff(&mut self) -> Result<(), VmxError> {
        self.calls.push(Call::Vmxoff);
        self.vmx_operation()?;
        self.vmx_on = false;
        self.current_vmcs = None;
        Ok(())
    }

    fn vmclear(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        self.calls.push(Call::Vmclear(region));
        self.vmx_operation()?;
        if self.current_vmcs == Some(region) {
            self.current_vmcs = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        self.calls.push(Call::Vmptrld(region));
        self.vmx_operation()?;
        self.current_vmcs = Some(region);
        Ok(())
    }

    fn vmread(&self, field: VmcsField) -> Result<u64, VmxError> {
        match self.current_vmcs {
            Some(_) => self.vmcs.vmcs_read(field),
            None => Err(VmxError::VmFailInvalid),
        }
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError> {
        match self.current_vmcs {
            Some(_) => self.vmcs.vmcs_write(field, value),
            None => Err(VmxError::VmFailInvalid),
        }
    }

    fn launch(&mut self) -> Result<(), VmxError> {
        self.calls.push(Call::Launch);
        if self.current_vmcs.is_none() {
            return Err(VmxError::VmFailInvalid);
        }
        if let Err(VmxError::VmFailValid(err)) = self.launch_result {
            self.vmcs.set_exit_field(VmcsField::VmInstructionError, err.as_u64());
        }
        if let Some(vcpu) = self.entry_failure.take() {
            self.vmcs.set_exit_field(VmcsField::VmExitReason, (1 << 31) | 33);
            // The exit trampoline reaches the VCPU through the host RSP, not through the caller.
            let action = unsafe { (*vcpu).handle_exit() };
            assert_eq!(action, ExitAction::Devirtualize);
            return Ok(());
        }
        self.launch_result
    }

    fn exit_entry_point(&self) -> u64 {
        0xFFFF_8000_0040_0000
    }

    fn invvpid_all(&mut self) -> Result<(), VmxError> {
        self.calls.push(Call::InvvpidAll);
        self.vmx_operation()
    }

    fn rdtsc(&self) -> u64 {
        self.tsc
    }

    fn rdtscp(&self) -> (u64, u32) {
        (self.tsc, self.tsc_aux)
    }

    fn wbinvd(&mut self) {
        self.calls.push(Call::Wbinvd);
    }

    fn xsetbv(&mut self, index: u32, value: u64) {
        self.calls.push(Call::Xsetbv(index, value));
    }
}
