//! Extended Page Table
//!
//! The VCPU owns a minimal EPT: the first 512 GiB of guest physical memory are identity mapped
//! with 1 GiB pages, so that the guest keeps seeing the host physical address space.
//!
//! Every page is write-back, MMIO ranges included. The EPT memory type takes the place of the
//! MTRRs in non-root operation, so the guest PAT is the only way left to map device memory as
//! uncacheable: the leaves never set "ignore PAT", and a UC PAT entry still wins over WB.
//! Firmware that relies on MTRRs alone to keep MMIO uncacheable is not supported.

use utils::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
use vmx::bitmaps::{EptCapability, EptEntryFlags};
use vmx::VmxError;

use crate::error::VcpuError;

pub const GIANT_PAGE_SIZE: usize = 1 << 30;

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = ((1 << 40) - 1) << 12;

/// EPTP memory type: write-back.
const EPTP_MEMORY_TYPE_WB: u64 = 6;
/// EPTP page-walk length minus one.
const EPTP_WALK_LENGTH_4: u64 = 3 << 3;

/// Read, write and execute for supervisor accesses.
pub const EPT_PRESENT: EptEntryFlags = EptEntryFlags::READ
    .union(EptEntryFlags::WRITE)
    .union(EptEntryFlags::SUPERVISOR_EXECUTE);

/// A 4 KiB paging structure.
#[derive(Clone)]
#[repr(C, align(0x1000))]
struct Table([u64; ENTRIES]);

/// An identity-mapping extended page table: one PML4 and one PDPT of giant pages.
pub struct Ept {
    pml4: Table,
    pdpt: Table,
    root: HostPhysAddr,
}

impl Ept {
    pub const fn new() -> Self {
        Self {
            pml4: Table([0; ENTRIES]),
            pdpt: Table([0; ENTRIES]),
            root: HostPhysAddr::zero(),
        }
    }

    /// Builds the identity mapping.
    ///
    /// `caps` is the IA32_VMX_EPT_VPID_CAP MSR and `translate` converts the address of the
    /// tables, which live in the host address space, into physical addresses.
    pub fn identity_map(
        &mut self,
        caps: EptCapability,
        translate: impl Fn(HostVirtAddr) -> Option<HostPhysAddr>,
    ) -> Result<(), VcpuError> {
        let required = EptCapability::PAGE_WALK_4 | EptCapability::WRITE_BACK | EptCapability::PAGE_1GB;
        if !caps.contains(required) {
            log::warn!("EPT capabilities {:?} lack {:?}", caps, required - caps);
            return Err(VmxError::FeatureNotSupported.into());
        }

        let pml4_virt = HostVirtAddr::of(&self.pml4);
        let pdpt_virt = HostVirtAddr::of(&self.pdpt);
        let pml4 = translate(pml4_virt).ok_or(VcpuError::UnmappedAddress(pml4_virt))?;
        let pdpt = translate(pdpt_virt).ok_or(VcpuError::UnmappedAddress(pdpt_virt))?;

        let leaf = EPT_PRESENT | EptEntryFlags::PAGE | EptEntryFlags::MEMORY_TYPE_WB;
        for (idx, entry) in self.pdpt.0.iter_mut().enumerate() {
            *entry = ((idx * GIANT_PAGE_SIZE) as u64 & ADDR_MASK) | leaf.bits();
        }
        self.pml4.0.fill(0);
        self.pml4.0[0] = (pdpt.as_u64() & ADDR_MASK) | EPT_PRESENT.bits();
        self.root = pml4;

        log::debug!("EPT identity map rooted at 0x{:x}", pml4.as_u64());
        Ok(())
    }

    /// Physical address of the PML4, zero until the table is built.
    pub fn root(&self) -> HostPhysAddr {
        self.root
    }

    /// The Extended Page Table Pointer, with write-back memory type and a 4 levels walk.
    ///
    /// See Intel manual volume 3 section 24.6.11.
    pub fn eptp(&self) -> u64 {
        self.root.as_u64() | EPTP_MEMORY_TYPE_WB | EPTP_WALK_LENGTH_4
    }

    /// Walks the table in software, returning the host physical address and the leaf flags.
    pub fn translate(&self, gpa: GuestPhysAddr) -> Option<(HostPhysAddr, EptEntryFlags)> {
        let addr = gpa.as_u64();
        let l4_index = ((addr >> 39) & 0x1FF) as usize;
        let l3_index = ((addr >> 30) & 0x1FF) as usize;

        let pml4e = self.pml4.0[l4_index];
        if pml4e & EPT_PRESENT.bits() == 0 {
            return None;
        }
        let pdpte = self.pdpt.0[l3_index];
        let flags = EptEntryFlags::from_bits_truncate(pdpte);
        if !flags.intersects(EPT_PRESENT) || !flags.contains(EptEntryFlags::PAGE) {
            return None;
        }

        let offset = addr & (GIANT_PAGE_SIZE as u64 - 1);
        Some((HostPhysAddr::from((pdpte & ADDR_MASK) | offset), flags))
    }
}

impl Default for Ept {
    fn default() -> Self {
        Self::new()
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
