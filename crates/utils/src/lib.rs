//! Address types shared by the VMX crates.
#![cfg_attr(not(test), no_std)]

mod address;

pub use address::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr};

/// Size of a base page, also the size and alignment of every VMX region.
pub const PAGE_SIZE: usize = 0x1000;
