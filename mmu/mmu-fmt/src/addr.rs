use core::fmt;

/// A virtual address inside the translated address space.
///
/// Zero-cost wrapper around `u64`, used to keep virtual addresses from being
/// mixed up with entry indices and byte sizes in walker code.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wraps a raw 64-bit virtual address.
    #[inline]
    #[must_use]
    pub const fn new(va: u64) -> Self {
        Self(va)
    }

    /// The raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is a multiple of `alignment` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, alignment: u64) -> bool {
        debug_assert!(alignment.is_power_of_two());
        self.0 & (alignment - 1) == 0
    }
}

impl From<u64> for VirtAddr {
    #[inline]
    fn from(va: u64) -> Self {
        Self(va)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
