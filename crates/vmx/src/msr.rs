//! VMX Model Specific Registers
//!
//! A collection of some model specific registers relevant to VMX, together with the MSR and I/O
//! bitmaps used to let the guest access them directly.

use core::arch::asm;

/// First address of low MSRs.
pub const LOW_MSR_START: u32 = 0;
/// Last address of low MSRs.
pub const LOW_MSR_END: u32 = 0x1FFF;
/// First address of high MSRs.
pub const HIGH_MSR_START: u32 = 0xC000_0000;
/// Last address of high MSRs.
pub const HIGH_MSR_END: u32 = 0xC000_1FFF;

// ——————————————————————————————— Known MSRs ——————————————————————————————— //

pub const FEATURE_CONTROL: Msr = Msr::new(0x3A);
pub const SYSENTER_CS: Msr = Msr::new(0x174);
pub const SYSENTER_ESP: Msr = Msr::new(0x175);
pub const SYSENTER_EIP: Msr = Msr::new(0x176);
pub const IA32_DEBUGCTL: Msr = Msr::new(0x1D9);
pub const VMX_BASIC: Msr = Msr::new(0x480);
pub const VMX_PINBASED_CTLS: Msr = Msr::new(0x481);
pub const VMX_PROCBASED_CTLS: Msr = Msr::new(0x482);
pub const VMX_EXIT_CTLS: Msr = Msr::new(0x483);
pub const VMX_ENTRY_CTLS: Msr = Msr::new(0x484);
pub const VMX_CR0_FIXED0: Msr = Msr::new(0x486);
pub const VMX_CR0_FIXED1: Msr = Msr::new(0x487);
pub const VMX_CR4_FIXED0: Msr = Msr::new(0x488);
pub const VMX_CR4_FIXED1: Msr = Msr::new(0x489);
pub const VMX_VMCS_ENUM: Msr = Msr::new(0x48A);
pub const VMX_PROCBASED_CTLS2: Msr = Msr::new(0x48B);
pub const VMX_EPT_VPID_CAP: Msr = Msr::new(0x48C);
pub const VMX_TRUE_PINBASED_CTLS: Msr = Msr::new(0x48D);
pub const VMX_TRUE_PROCBASED_CTLS: Msr = Msr::new(0x48E);
pub const VMX_TRUE_EXIT_CTLS: Msr = Msr::new(0x48F);
pub const VMX_TRUE_ENTRY_CTLS: Msr = Msr::new(0x490);
pub const IA32_EFER: Msr = Msr::new(0xC000_0080);
pub const IA32_FS_BASE: Msr = Msr::new(0xC000_0100);
pub const IA32_GS_BASE: Msr = Msr::new(0xC000_0101);
pub const IA32_TSC_AUX: Msr = Msr::new(0xC000_0103);

// —————————————————————————————————— MSR ——————————————————————————————————— //

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msr(u32);

impl Msr {
    /// Creates a new MSR for it's address.
    pub const fn new(reg: u32) -> Self {
        Self(reg)
    }

    /// Returns the address of this MSR.
    pub const fn address(self) -> u32 {
        self.0
    }

    /// Returns true if the MSR lies in one of the two ranges covered by the MSR bitmaps. The
    /// architectural MSRs all live there, accessing anything else faults on the host.
    pub fn in_bitmap_range(self) -> bool {
        MsrBitmaps::locate(self).is_some()
    }

    /// Reads 64 bits MSR register.
    ///
    /// ## Safety
    ///
    /// The caller must ensure that this read operation has no unsafe side
    /// effects.
    #[inline]
    pub unsafe fn read(&self) -> u64 {
        let (high, low): (u32, u32);
        asm!(
            "rdmsr",
            in("ecx") self.0,
            out("eax") low, out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
        ((high as u64) << 32) | (low as u64)
    }

    /// Writes 64 bits to MSR register.
    ///
    /// ## Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline]
    pub unsafe fn write(&self, value: u64) {
        let low = value as u32;
        let high = (value >> 32) as u32;

        asm!(
            "wrmsr",
            in("ecx") self.0,
            in("eax") low, in("edx") high,
            options(nostack, preserves_flags),
        );
    }
}

// —————————————————————————————— MSR Bitmaps ——————————————————————————————— //

/// An MSR bitmaps that can be used to configure direct read or write access to host MSRs.
///
/// A bit set to 1 causes a VM exit on access, MSRs outside of the two covered ranges always
/// exit.
///
/// See Intel manual section 24.6.9.
#[repr(C, align(0x1000))]
pub struct MsrBitmaps {
    read_low: [u8; 1024],
    read_high: [u8; 1024],
    write_low: [u8; 1024],
    write_high: [u8; 1024],
}

/// Which half of the bitmap an MSR falls into.
enum MsrRange {
    Low,
    High,
}

impl MsrBitmaps {
    /// A bitmap allowing every access.
    pub const fn new() -> Self {
        Self {
            read_low: [0; 1024],
            read_high: [0; 1024],
            write_low: [0; 1024],
            write_high: [0; 1024],
        }
    }

    /// Configures the bitmap so that all accesses are denied.
    pub fn deny_all(&mut self) {
        self.read_low.fill(0xFF);
        self.read_high.fill(0xFF);
        self.write_low.fill(0xFF);
        self.write_high.fill(0xFF);
    }

    /// Configures the bitmap so that all accesses are allowed.
    pub fn allow_all(&mut self) {
        self.read_low.fill(0x00);
        self.read_high.fill(0x00);
        self.write_low.fill(0x00);
        self.write_high.fill(0x00);
    }

    /// Deny read access to the given MSR.
    pub fn deny_read(&mut self, msr: Msr) {
        if let Some((range, byte, bit)) = Self::locate(msr) {
            match range {
                MsrRange::Low => self.read_low[byte] |= bit,
                MsrRange::High => self.read_high[byte] |= bit,
            }
        }
    }

    /// Allow read access to the given MSR.
    pub fn allow_read(&mut self, msr: Msr) {
        if let Some((range, byte, bit)) = Self::locate(msr) {
            match range {
                MsrRange::Low => self.read_low[byte] &= !bit,
                MsrRange::High => self.read_high[byte] &= !bit,
            }
        }
    }

    /// Deny write access to the given MSR.
    pub fn deny_write(&mut self, msr: Msr) {
        if let Some((range, byte, bit)) = Self::locate(msr) {
            match range {
                MsrRange::Low => self.write_low[byte] |= bit,
                MsrRange::High => self.write_high[byte] |= bit,
            }
        }
    }

    /// Allow write access to the given MSR.
    pub fn allow_write(&mut self, msr: Msr) {
        if let Some((range, byte, bit)) = Self::locate(msr) {
            match range {
                MsrRange::Low => self.write_low[byte] &= !bit,
                MsrRange::High => self.write_high[byte] &= !bit,
            }
        }
    }

    /// Returns true if reading the MSR causes a VM exit.
    pub fn read_exits(&self, msr: Msr) -> bool {
        match Self::locate(msr) {
            Some((MsrRange::Low, byte, bit)) => self.read_low[byte] & bit != 0,
            Some((MsrRange::High, byte, bit)) => self.read_high[byte] & bit != 0,
            None => true,
        }
    }

    /// Returns true if writing the MSR causes a VM exit.
    pub fn write_exits(&self, msr: Msr) -> bool {
        match Self::locate(msr) {
            Some((MsrRange::Low, byte, bit)) => self.write_low[byte] & bit != 0,
            Some((MsrRange::High, byte, bit)) => self.write_high[byte] & bit != 0,
            None => true,
        }
    }

    fn locate(msr: Msr) -> Option<(MsrRange, usize, u8)> {
        let msr = msr.address();
        let byte = ((msr & 0x1FFF) >> 3) as usize;
        let bit = 1 << (msr & 0b111);
        if (LOW_MSR_START..=LOW_MSR_END).contains(&msr) {
            Some((MsrRange::Low, byte, bit))
        } else if (HIGH_MSR_START..=HIGH_MSR_END).contains(&msr) {
            Some((MsrRange::High, byte, bit))
        } else {
            None
        }
    }
}

impl Default for MsrBitmaps {
    fn default() -> Self {
        Self::new()
    }
}

// —————————————————————————————— I/O Bitmaps ——————————————————————————————— //

/// The two I/O bitmaps, A covers ports 0x0000 to 0x7FFF and B covers 0x8000 to 0xFFFF.
///
/// See Intel manual section 24.6.4.
#[repr(C, align(0x1000))]
pub struct IoBitmaps {
    a: [u8; 0x1000],
    b: [u8; 0x1000],
}

impl IoBitmaps {
    /// A bitmap allowing every port.
    pub const fn new() -> Self {
        Self {
            a: [0; 0x1000],
            b: [0; 0x1000],
        }
    }

    /// Let the guest access every port directly.
    pub fn allow_all(&mut self) {
        self.a.fill(0);
        self.b.fill(0);
    }

    /// Trap every port access.
    pub fn deny_all(&mut self) {
        self.a.fill(0xFF);
        self.b.fill(0xFF);
    }

    pub fn deny(&mut self, port: u16) {
        let (bitmap, byte, bit) = self.locate(port);
        bitmap[byte] |= bit;
    }

    pub fn allow(&mut self, port: u16) {
        let (bitmap, byte, bit) = self.locate(port);
        bitmap[byte] &= !bit;
    }

    /// Returns true if an access to the port causes a VM exit.
    pub fn exits(&self, port: u16) -> bool {
        let bitmap = if port < 0x8000 { &self.a } else { &self.b };
        let idx = (port & 0x7FFF) as usize;
        bitmap[idx >> 3] & (1 << (idx & 0b111)) != 0
    }

    /// Bitmap A, to be given to the VMCS.
    pub fn bitmap_a(&self) -> &[u8; 0x1000] {
        &self.a
    }

    /// Bitmap B, to be given to the VMCS.
    pub fn bitmap_b(&self) -> &[u8; 0x1000] {
        &self.b
    }

    fn locate(&mut self, port: u16) -> (&mut [u8; 0x1000], usize, u8) {
        let idx = (port & 0x7FFF) as usize;
        let bitmap = if port < 0x8000 { &mut self.a } else { &mut self.b };
        (bitmap, idx >> 3, 1 << (idx & 0b111))
    }
}

impl Default for IoBitmaps {
    fn default() -> Self {
        Self::new()
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //
