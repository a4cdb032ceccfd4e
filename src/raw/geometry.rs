/// Identifies one `2^BITS`-byte, naturally aligned slice of the address space.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub(crate) struct ClusterId(usize);

impl ClusterId {
    #[inline]
    pub(crate) const fn to_usize(self) -> usize {
        self.0
    }
}

/// Position of an address inside its cluster.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub(crate) struct Offset(u32);

impl Offset {
    #[inline]
    pub(crate) const fn to_usize(self) -> usize {
        self.0 as usize
    }
}

/// Address decomposition for clusters spanning `2^BITS` bytes.
pub(crate) struct Geometry<const BITS: u32>;

impl<const BITS: u32> Geometry<BITS> {
    /// Referenced by every map constructor so an invalid `BITS` fails to compile.
    pub(crate) const VALID: () = assert!(
        BITS >= 1 && BITS <= u32::BITS && BITS < usize::BITS,
        "`Geometry` - cluster bits must be in 1..=32 and below the pointer width"
    );

    /// Bytes covered by one cluster.
    pub(crate) const SPAN: usize = 1 << BITS;
    pub(crate) const MASK: usize = Self::SPAN - 1;

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn split(address: usize) -> (ClusterId, Offset) {
        // `MASK` fits in `u32` because `BITS <= 32`.
        (ClusterId(address >> BITS), Offset((address & Self::MASK) as u32))
    }

    #[inline]
    pub(crate) const fn join(id: ClusterId, offset: Offset) -> usize {
        (id.0 << BITS) | offset.to_usize()
    }

    /// Highest address inside cluster `id`.
    #[inline]
    pub(crate) const fn last_address(id: ClusterId) -> usize {
        (id.0 << BITS) | Self::MASK
    }
}
