//! The real processor
//!
//! [`Hardware`] implements [`VmxHal`] with the instructions of the current logical processor. It
//! expects to run in ring 0 of a 64 bits kernel that maps the whole physical memory at a fixed
//! offset.

use core::arch::asm;
use core::arch::x86_64::{CpuidResult, __cpuid_count, __rdtscp, _rdtsc};

use utils::{HostPhysAddr, HostVirtAddr};
use vmx::bitmaps::RFlags as VmxFlags;
use vmx::msr::Msr;
use vmx::raw::{self, InvVpidType};
use vmx::{VmcsField, VmxError};
use x86_64::instructions::tables::{lgdt, lidt, sgdt, sidt};
use x86_64::registers::control::{Cr0, Cr3, Cr4};
use x86_64::registers::rflags;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, FS, GS, SS};
use x86_64::structures::paging::{OffsetPageTable, PageTable, Translate};
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

use crate::hal::{ProcessorState, VmxHal};
use crate::regs::DescriptorTable;
use crate::trampoline;

pub struct Hardware {
    physical_memory_offset: HostVirtAddr,
}

impl Hardware {
    /// # Safety
    ///
    /// The complete physical memory must be mapped at `physical_memory_offset`, and the value
    /// must only be used on the processor executing the VCPU.
    pub unsafe fn new(physical_memory_offset: HostVirtAddr) -> Self {
        Self {
            physical_memory_offset,
        }
    }
}

impl VmxHal for Hardware {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        unsafe { __cpuid_count(leaf, subleaf) }
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        unsafe { msr.read() }
    }

    fn write_msr(&mut self, msr: Msr, value: u64) {
        unsafe { msr.write(value) }
    }

    fn write_cr0(&mut self, value: u64) {
        unsafe { Cr0::write_raw(value) }
    }

    fn write_cr2(&mut self, value: u64) {
        unsafe {
            asm!("mov cr2, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }

    fn write_cr3(&mut self, value: u64) {
        // Cr3::write only takes a frame and the two legacy flags, PCID bits would be lost.
        unsafe {
            asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
        }
    }

    fn write_cr4(&mut self, value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    fn write_dr7(&mut self, value: u64) {
        unsafe {
            asm!("mov dr7, {}", in(reg) value, options(nomem, nostack, preserves_flags));
        }
    }

    fn load_gdtr(&mut self, gdtr: &DescriptorTable) {
        unsafe { lgdt(&table_pointer(gdtr)) }
    }

    fn load_idtr(&mut self, idtr: &DescriptorTable) {
        unsafe { lidt(&table_pointer(idtr)) }
    }

    fn capture_state(&self) -> ProcessorState {
        let (cr3, dr7, ldtr, tr): (u64, u64, u16, u16);
        unsafe {
            // There are no wrappers for these in the x86_64 crate.
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            asm!("mov {}, dr7", out(reg) dr7, options(nomem, nostack, preserves_flags));
            asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack, preserves_flags));
            asm!("str {0:x}", out(reg) tr, options(nomem, nostack, preserves_flags));
        }
        let gdt = sgdt();
        let idt = sidt();

        ProcessorState {
            cr0: Cr0::read_raw(),
            cr3,
            cr4: Cr4::read_raw(),
            dr7,
            rflags: rflags::read_raw(),
            gdtr: DescriptorTable {
                base: gdt.base.as_u64(),
                limit: gdt.limit,
            },
            idtr: DescriptorTable {
                base: idt.base.as_u64(),
                limit: idt.limit,
            },
            es: ES::get_reg().0,
            cs: CS::get_reg().0,
            ss: SS::get_reg().0,
            ds: DS::get_reg().0,
            fs: FS::get_reg().0,
            gs: GS::get_reg().0,
            ldtr,
            tr,
        }
    }

    fn gdt(&self, gdtr: &DescriptorTable) -> &[u64] {
        let len = (gdtr.limit as usize + 1) / 8;
        unsafe { core::slice::from_raw_parts(gdtr.base as *const u64, len) }
    }

    fn virt_to_phys(&self, addr: HostVirtAddr) -> Option<HostPhysAddr> {
        let offset = VirtAddr::new(self.physical_memory_offset.as_u64());
        let (level_4_table_frame, _) = Cr3::read();
        let table = offset + level_4_table_frame.start_address().as_u64();

        // The mapper is only used for reads.
        let mapper = unsafe { OffsetPageTable::new(&mut *table.as_mut_ptr::<PageTable>(), offset) };
        let addr = VirtAddr::try_new(addr.as_u64()).ok()?;
        mapper
            .translate_addr(addr)
            .map(|phys| HostPhysAddr::new(phys.as_u64() as usize))
    }

    fn vmxon(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        unsafe { raw::vmxon(region.as_u64()) }
    }

    fn vmxoff(&mut self) -> Result<(), VmxError> {
        unsafe { raw::vmxoff() }
    }

    fn vmclear(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        unsafe { raw::vmclear(region.as_u64()) }
    }

    fn vmptrld(&mut self, region: HostPhysAddr) -> Result<(), VmxError> {
        unsafe { raw::vmptrld(region.as_u64()) }
    }

    fn vmread(&self, field: VmcsField) -> Result<u64, VmxError> {
        unsafe { raw::vmread(field as u64) }
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<(), VmxError> {
        unsafe { raw::vmwrite(field as u64, value) }
    }

    fn launch(&mut self) -> Result<(), VmxError> {
        let rflags = unsafe { trampoline::launch() };
        if rflags == 0 {
            return Ok(());
        }
        match unsafe { raw::status_from_rflags(VmxFlags::from_bits_truncate(rflags)) } {
            Err(err) => Err(err),
            // VMLAUNCH does not fall through on success
            Ok(()) => Err(VmxError::VmFailInvalid),
        }
    }

    fn exit_entry_point(&self) -> u64 {
        trampoline::entry_point()
    }

    fn invvpid_all(&mut self) -> Result<(), VmxError> {
        unsafe { raw::invvpid(InvVpidType::AllContext, 0, 0) }
    }

    fn rdtsc(&self) -> u64 {
        unsafe { _rdtsc() }
    }

    fn rdtscp(&self) -> (u64, u32) {
        let mut aux = 0;
        let tsc = unsafe { __rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn wbinvd(&mut self) {
        unsafe {
            asm!("wbinvd", options(nostack, preserves_flags));
        }
    }

    fn xsetbv(&mut self, index: u32, value: u64) {
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") index,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack, preserves_flags),
            );
        }
    }
}

fn table_pointer(table: &DescriptorTable) -> DescriptorTablePointer {
    DescriptorTablePointer {
        limit: table.limit,
        base: VirtAddr::new_truncate(table.base),
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gdt() {
        let table: [u64; 3] = [0, 0x00AF_9A00_0000_FFFF, 0x00CF_9200_0000_FFFF];
        let gdtr = DescriptorTable {
            base: table.as_ptr() as u64,
            limit: 23,
        };
        let hardware = unsafe { Hardware::new(HostVirtAddr::zero()) };
        assert_eq!(hardware.gdt(&gdtr), &table);
        assert_eq!(hardware.exit_entry_point(), trampoline::entry_point());
    }

    #[test]
    fn descriptor_table_pointer() {
        let idtr = DescriptorTable {
            base: 0xFFFF_8000_0020_0000,
            limit: 0xFFF,
        };
        let pointer = table_pointer(&idtr);
        assert_eq!(pointer.limit, 0xFFF);
        assert_eq!(pointer.base.as_u64(), 0xFFFF_8000_0020_0000);
    }
}
