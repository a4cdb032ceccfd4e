use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::slice;

use crate::meta_alloc::{AllocError, META_ALIGN, MetaAlloc};

/// Storage for up to `capacity` values of `T`, obtained from a [`MetaAlloc`].
///
/// Only the allocation is tracked here; the owner knows which slots are initialized.
/// There is no `Drop`: the owner hands the memory back with [`RawBuf::release`], using
/// the allocator it was obtained from.
///
/// Elements aligned above [`META_ALIGN`] are placed by over-allocating and rounding the
/// start of the block up.
pub(crate) struct RawBuf<T> {
    /// Block as returned by the allocator.
    block: NonNull<u8>,
    /// First element, `block` rounded up to `align_of::<T>()`.
    ptr: NonNull<T>,
    capacity: usize,
    marker: PhantomData<T>,
}

impl<T> RawBuf<T> {
    const LAYOUT_OK: () = assert!(size_of::<T>() != 0, "`RawBuf` - zero-sized elements are not supported");

    /// Extra bytes needed to align the first element inside a `META_ALIGN` block.
    const PADDING: usize = align_of::<T>().saturating_sub(META_ALIGN);

    /// An empty buffer. Does not allocate.
    pub(crate) const fn new() -> Self {
        Self {
            block: NonNull::dangling(),
            ptr: NonNull::dangling(),
            capacity: 0,
            marker: PhantomData,
        }
    }

    pub(crate) fn try_with_capacity<A: MetaAlloc + ?Sized>(alloc: &A, capacity: usize) -> Result<Self, AllocError> {
        let () = Self::LAYOUT_OK;
        if capacity == 0 {
            return Ok(Self::new());
        }

        let bytes = Self::bytes_for(capacity)?;
        let block = alloc.allocate(bytes).ok_or(AllocError::Exhausted { bytes })?;
        let misalign = block.as_ptr().addr() & (align_of::<T>() - 1);
        let pad = (align_of::<T>() - misalign) & (align_of::<T>() - 1);
        debug_assert!(pad <= Self::PADDING);
        // SAFETY: `block` is `META_ALIGN`-aligned, so `pad <= PADDING` and the first
        // element still starts inside the block.
        let ptr = unsafe { block.add(pad) };
        Ok(Self {
            block,
            ptr: ptr.cast(),
            capacity,
            marker: PhantomData,
        })
    }

    fn bytes_for(capacity: usize) -> Result<usize, AllocError> {
        capacity
            .checked_mul(size_of::<T>())
            .and_then(|bytes| bytes.checked_add(Self::PADDING))
            .filter(|&bytes| isize::try_from(bytes).is_ok())
            .ok_or(AllocError::CapacityOverflow)
    }

    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held from the allocator.
    #[inline]
    pub(crate) const fn bytes(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            self.capacity * size_of::<T>() + Self::PADDING
        }
    }

    #[inline]
    pub(crate) const fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Returns the first `len` elements.
    ///
    /// # Safety
    /// The first `len` slots must be initialized and `len <= capacity`.
    #[inline]
    pub(crate) unsafe fn slice(&self, len: usize) -> &[T] {
        debug_assert!(len <= self.capacity);
        // SAFETY: guaranteed by the caller; a dangling pointer is fine for `len == 0`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// Returns the first `len` elements mutably.
    ///
    /// # Safety
    /// The first `len` slots must be initialized and `len <= capacity`.
    #[inline]
    pub(crate) unsafe fn slice_mut(&mut self, len: usize) -> &mut [T] {
        debug_assert!(len <= self.capacity);
        // SAFETY: guaranteed by the caller.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }

    /// Moves the first `len` elements into fresh storage for `capacity` elements and
    /// releases the old storage. On error nothing changes.
    ///
    /// # Safety
    /// The first `len` slots must be initialized, `len <= capacity`, and `alloc` must be
    /// the allocator this buffer came from.
    pub(crate) unsafe fn try_resize<A: MetaAlloc + ?Sized>(
        &mut self,
        alloc: &A,
        len: usize,
        capacity: usize,
    ) -> Result<(), AllocError> {
        debug_assert!(len <= self.capacity && len <= capacity);
        let mut next = Self::try_with_capacity(alloc, capacity)?;
        // SAFETY: both buffers hold at least `len` slots and never overlap; the moved-out
        // slots in `self` are released without being dropped.
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr(), next.as_mut_ptr(), len);
            self.release(alloc);
        }
        *self = next;
        Ok(())
    }

    /// Returns the storage to `alloc` without dropping any element, leaving `self` empty.
    ///
    /// # Safety
    /// `alloc` must be the allocator this buffer came from.
    pub(crate) unsafe fn release<A: MetaAlloc + ?Sized>(&mut self, alloc: &A) {
        if self.capacity != 0 {
            // SAFETY: `block` came from `alloc.allocate(self.bytes())`.
            unsafe { alloc.release(self.block, self.bytes()) };
        }
        *self = Self::new();
    }
}
