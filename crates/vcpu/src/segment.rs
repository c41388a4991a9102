//! Segment descriptor resolution
//!
//! The VMCS needs the hidden part of each segment register (base, limit and access rights). It is
//! rebuilt from the selector and the descriptor it points to in the GDT.

use crate::regs::{Segment, SegmentAccess};

const SELECTOR_TABLE_INDICATOR: u16 = 1 << 2;
const LOW_32_BITS_MASK: u64 = (1 << 32) - 1;

/// Resolves a selector against a GDT image.
///
/// Null selectors, LDT selectors, selectors out of the table and non-present descriptors give an
/// unusable segment.
pub fn resolve_segment(gdt: &[u64], selector: u16) -> Segment {
    let index = (selector >> 3) as usize;
    if selector & SELECTOR_TABLE_INDICATOR != 0 || index == 0 || index >= gdt.len() {
        return Segment::unusable(selector);
    }

    let desc_low = gdt[index];
    let access = SegmentAccess::from_bits_truncate(((desc_low >> 40) & 0xF0FF) as u32);
    if !access.contains(SegmentAccess::PRESENT) {
        return Segment::unusable(selector);
    }

    // System descriptors (TSS, LDT) are 16 bytes wide in IA-32e mode.
    let desc_high = if access.contains(SegmentAccess::CODE_DATA) {
        None
    } else {
        gdt.get(index + 1).copied()
    };

    Segment {
        selector,
        base: descriptor_base(desc_low, desc_high),
        limit: descriptor_limit(desc_low),
        access,
    }
}

/// Construct the base of a segment from its descriptor.
///
/// See Intel manual 3A sections 3.4.5 and 7.2.3.
fn descriptor_base(desc_low: u64, desc_high: Option<u64>) -> u64 {
    const BASE_2_MASK: u64 = ((1 << 8) - 1) << 56;
    const BASE_1_MASK: u64 = ((1 << 24) - 1) << 16;

    let mut base = 0;
    base |= (desc_low & BASE_2_MASK) >> 32;
    base |= (desc_low & BASE_1_MASK) >> 16;
    if let Some(high) = desc_high {
        base |= (high & LOW_32_BITS_MASK) << 32;
    }
    base
}

/// Byte-granular limit of a segment descriptor.
fn descriptor_limit(desc_low: u64) -> u32 {
    const GRANULARITY: u64 = 1 << 55;

    let limit = (desc_low & 0xFFFF) | ((desc_low >> 32) & 0xF_0000);
    if desc_low & GRANULARITY != 0 {
        ((limit << 12) | 0xFFF) as u32
    } else {
        limit as u32
    }
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;

    #[rustfmt::skip]
    const GDT: [u64; 5] = [
        0x0000_0000_0000_0000, // null
        0x00AF_9A00_0000_FFFF, // 64 bits kernel code
        0x00CF_9200_0000_FFFF, // kernel data
        0x1200_8B34_5678_0067, // busy TSS, low half
        0x0000_0000_FFFF_8000, // busy TSS, high half
    ];

    #[test]
    fn code_and_data() {
        let cs = resolve_segment(&GDT, 0x08);
        assert_eq!(cs.base, 0);
        assert_eq!(cs.limit, 0xFFFF_FFFF);
        assert_eq!(cs.access.bits(), 0xA09A);
        assert!(cs.access.contains(SegmentAccess::LONG_MODE | SegmentAccess::CODE));

        let ds = resolve_segment(&GDT, 0x10);
        assert_eq!(ds.access.bits(), 0xC092);
        assert_eq!(ds.limit, 0xFFFF_FFFF);
    }

    #[test]
    fn task_state_segment() {
        let tr = resolve_segment(&GDT, 0x18);
        assert_eq!(tr.base, 0xFFFF_8000_1234_5678);
        assert_eq!(tr.limit, 0x67);
        assert_eq!(tr.access.bits(), 0x8B);
        assert_eq!(tr.access.segment_type(), 0xB);
    }

    #[test]
    fn unusable_segments() {
        // Null, LDT relative and out of bound selectors
        for selector in [0x0, 0x3, 0x0C, 0x40] {
            let segment = resolve_segment(&GDT, selector);
            assert!(!segment.is_usable());
            assert_eq!(segment.selector, selector);
        }
    }
}
