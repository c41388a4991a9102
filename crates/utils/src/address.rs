//! Address representation
use core::ops::Add;

/// A macro for implementing addresses types.
///
/// An address is just a wrapper around an `usize`, with getter and alignment helpers.
macro_rules! addr_impl {
    ($name:ident) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Default)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Creates an address that points to `0`.
            #[inline]
            pub const fn zero() -> Self {
                Self(0)
            }

            /// Aligns address downwards.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                Self::new(self.0 & !(align - 1))
            }

            /// Returns true if the address is a multiple of `align`.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "`align` must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Offset of the address within its 4 KiB page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & 0xFFF
            }
        }

        impl From<u64> for $name {
            fn from(addr: u64) -> Self {
                Self(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, other: usize) -> Self {
                Self::new(self.0 + other)
            }
        }
    };
}

addr_impl!(GuestVirtAddr);
addr_impl!(GuestPhysAddr);
addr_impl!(HostPhysAddr);
addr_impl!(HostVirtAddr);

impl HostVirtAddr {
    /// Address of a value living in the host address space.
    pub fn of<T>(value: &T) -> Self {
        Self::new(value as *const T as usize)
    }
}
