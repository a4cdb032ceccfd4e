//! Allocation capability for the map's own bookkeeping.
//!
//! An [`AddressMap`](crate::AddressMap) never touches the global allocator on its own.
//! Every byte of metadata it holds (index buckets, the cluster directory, cluster entry
//! arrays) is obtained from a [`MetaAlloc`] handed to it at construction. This lets an
//! allocator embed the map in its own slow path without recursing into itself.

use core::alloc::Layout;
use core::ptr::NonNull;

/// Minimum alignment of every block returned by a [`MetaAlloc`].
///
/// This matches what `malloc` guarantees on 64-bit platforms.
pub const META_ALIGN: usize = 16;

/// Error returned by fallible operations when metadata cannot be allocated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    /// The [`MetaAlloc`] could not provide a block of the requested size.
    #[error("metadata allocator could not provide {bytes} bytes")]
    Exhausted {
        /// Size of the failed request.
        bytes: usize,
    },
    /// The requested capacity does not fit in `usize` bytes.
    #[error("metadata capacity overflow")]
    CapacityOverflow,
}

impl AllocError {
    /// Diverges the way `Vec` does on allocation failure.
    pub(crate) fn fatal(self) -> ! {
        match self {
            AllocError::Exhausted { bytes } => match Layout::from_size_align(bytes, META_ALIGN) {
                Ok(layout) => alloc::alloc::handle_alloc_error(layout),
                Err(_) => panic!("metadata capacity overflow"),
            },
            AllocError::CapacityOverflow => panic!("metadata capacity overflow"),
        }
    }
}

/// A raw allocate-by-size / free pair used exclusively for map metadata.
///
/// # Safety
///
/// Implementors must guarantee that every block returned by [`allocate`](Self::allocate):
/// - is valid for reads and writes of at least `bytes` bytes,
/// - is aligned to at least [`META_ALIGN`],
/// - does not overlap any other live block,
/// - stays valid until it is passed to [`release`](Self::release).
pub unsafe trait MetaAlloc {
    /// Allocates a block of at least `bytes` bytes. `bytes` is never zero.
    ///
    /// Returns `None` when the request cannot be satisfied.
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `self.allocate(bytes)` with the same `bytes`
    /// and must not have been released already.
    unsafe fn release(&self, block: NonNull<u8>, bytes: usize);
}

// SAFETY: forwards to `A`, which upholds the contract.
unsafe impl<A: MetaAlloc + ?Sized> MetaAlloc for &A {
    #[inline]
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        (**self).allocate(bytes)
    }

    #[inline]
    unsafe fn release(&self, block: NonNull<u8>, bytes: usize) {
        // SAFETY: same contract as the caller's.
        unsafe { (**self).release(block, bytes) }
    }
}

/// Metadata allocation backed by Rust's global allocator.
///
/// Suitable whenever the map is *not* part of the global allocator itself, e.g. in
/// tooling or tests. An allocator implementation should supply its own [`MetaAlloc`]
/// (or an [`FnAlloc`] around a dedicated arena) instead.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GlobalMeta;

// SAFETY: blocks come from the global allocator with `META_ALIGN` alignment and are
// released with the identical layout.
unsafe impl MetaAlloc for GlobalMeta {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, META_ALIGN).ok()?;
        // SAFETY: `bytes` is never zero per the trait contract.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn release(&self, block: NonNull<u8>, bytes: usize) {
        // SAFETY: `allocate` succeeded with this exact layout, so it is valid.
        unsafe {
            let layout = Layout::from_size_align_unchecked(bytes, META_ALIGN);
            alloc::alloc::dealloc(block.as_ptr(), layout);
        }
    }
}

/// Adapts a pair of C-style functions, `(bytes) -> block` and `(block) -> ()`.
///
/// A null block from `alloc` is reported as allocation failure.
///
/// # Examples
///
/// ```
/// use addrmap::{AddressMap, FnAlloc};
///
/// // SAFETY: `malloc` returns blocks aligned for any fundamental type (>= 16 bytes on
/// // 64-bit targets) that stay valid until passed to `free`.
/// let meta = unsafe {
///     FnAlloc::new(
///         |bytes| unsafe { libc::malloc(bytes) }.cast::<u8>(),
///         |block: *mut u8| unsafe { libc::free(block.cast()) },
///     )
/// };
///
/// let mut map: AddressMap<usize, _> = AddressMap::new_in(meta);
/// map.insert(0x1000, 16);
/// assert_eq!(map.get(0x1000), Some(&16));
/// ```
#[derive(Clone, Copy)]
pub struct FnAlloc<F, G> {
    alloc: F,
    free: G,
}

impl<F, G> FnAlloc<F, G>
where
    F: Fn(usize) -> *mut u8,
    G: Fn(*mut u8),
{
    /// Wraps an allocate/free function pair.
    ///
    /// # Safety
    ///
    /// Every non-null pointer returned by `alloc(bytes)` must satisfy the [`MetaAlloc`]
    /// contract for `bytes`, and `free` must accept every such pointer exactly once.
    pub const unsafe fn new(alloc: F, free: G) -> Self {
        Self { alloc, free }
    }
}

// SAFETY: upheld by the caller of `FnAlloc::new`.
unsafe impl<F, G> MetaAlloc for FnAlloc<F, G>
where
    F: Fn(usize) -> *mut u8,
    G: Fn(*mut u8),
{
    #[inline]
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        NonNull::new((self.alloc)(bytes))
    }

    #[inline]
    unsafe fn release(&self, block: NonNull<u8>, _bytes: usize) {
        (self.free)(block.as_ptr());
    }
}

impl<F, G> core::fmt::Debug for FnAlloc<F, G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnAlloc").finish_non_exhaustive()
    }
}
