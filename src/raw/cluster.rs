use core::mem;
use core::ptr;

use super::buf::RawBuf;
use super::geometry::Offset;
use crate::meta_alloc::{AllocError, MetaAlloc};

/// Entries allocated for a cluster on its first insert; capacity doubles from here.
pub(crate) const CLUSTER_MIN_CAPACITY: usize = 4;

/// One `(offset, value)` binding.
pub(crate) struct Entry<V> {
    offset: Offset,
    value: V,
}

impl<V> Entry<V> {
    #[inline]
    pub(crate) fn offset(&self) -> Offset {
        self.offset
    }

    #[inline]
    pub(crate) fn value(&self) -> &V {
        &self.value
    }
}

/// Result of searching for an offset in a cluster.
pub(crate) enum SearchResult {
    /// Offset was found at the given index.
    Found(usize),
    /// Offset was not found; index is where it would be inserted.
    NotFound(usize),
}

/// The entries of one cluster, sorted by ascending offset without duplicates.
///
/// Storage comes from the map's [`MetaAlloc`], which every growing or releasing call
/// takes as a parameter. Dropping a `Cluster` without calling [`Cluster::release`] leaks.
pub(crate) struct Cluster<V> {
    entries: RawBuf<Entry<V>>,
    len: usize,
}

impl<V> Cluster<V> {
    /// Creates an empty cluster. Does not allocate.
    pub(crate) const fn new() -> Self {
        Self {
            entries: RawBuf::new(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of entry storage held from the allocator.
    pub(crate) fn bytes(&self) -> usize {
        self.entries.bytes()
    }

    /// Returns all entries in ascending offset order.
    #[inline]
    pub(crate) fn entries(&self) -> &[Entry<V>] {
        // SAFETY: the first `len` slots are always initialized.
        unsafe { self.entries.slice(self.len) }
    }

    #[inline]
    fn entries_mut(&mut self) -> &mut [Entry<V>] {
        // SAFETY: the first `len` slots are always initialized.
        unsafe { self.entries.slice_mut(self.len) }
    }

    /// Binary searches for `offset`.
    #[inline]
    pub(crate) fn search(&self, offset: Offset) -> SearchResult {
        match self.entries().binary_search_by(|e| e.offset.cmp(&offset)) {
            Ok(idx) => SearchResult::Found(idx),
            Err(idx) => SearchResult::NotFound(idx),
        }
    }

    pub(crate) fn get(&self, offset: Offset) -> Option<&V> {
        match self.search(offset) {
            SearchResult::Found(idx) => Some(&self.entries()[idx].value),
            SearchResult::NotFound(_) => None,
        }
    }

    pub(crate) fn get_mut(&mut self, offset: Offset) -> Option<&mut V> {
        match self.search(offset) {
            SearchResult::Found(idx) => Some(&mut self.entries_mut()[idx].value),
            SearchResult::NotFound(_) => None,
        }
    }

    /// Returns the entry with the greatest offset `<= offset`.
    pub(crate) fn preceding_or_equal(&self, offset: Offset) -> Option<(Offset, &V)> {
        let entries = self.entries();
        let idx = entries.partition_point(|e| e.offset <= offset);
        let entry = entries.get(idx.checked_sub(1)?)?;
        Some((entry.offset, &entry.value))
    }

    /// Returns the entry with the greatest offset.
    pub(crate) fn last(&self) -> Option<(Offset, &V)> {
        self.entries().last().map(|e| (e.offset, &e.value))
    }

    /// Inserts or overwrites the value at `offset`, returning the previous value.
    ///
    /// On error the cluster is unchanged and `value` is dropped.
    ///
    /// # Safety
    /// `alloc` must be the allocator every previous call on this cluster used.
    pub(crate) unsafe fn try_insert<A: MetaAlloc + ?Sized>(
        &mut self,
        alloc: &A,
        offset: Offset,
        value: V,
    ) -> Result<Option<V>, AllocError> {
        let idx = match self.search(offset) {
            SearchResult::Found(idx) => {
                return Ok(Some(mem::replace(&mut self.entries_mut()[idx].value, value)));
            }
            SearchResult::NotFound(idx) => idx,
        };

        if self.len == self.entries.capacity() {
            let capacity = self.len.checked_mul(2).ok_or(AllocError::CapacityOverflow)?.max(CLUSTER_MIN_CAPACITY);
            // SAFETY: `len` slots are initialized; the caller vouches for `alloc`.
            unsafe { self.entries.try_resize(alloc, self.len, capacity)? };
        }

        // SAFETY: `len < capacity`, so shifting `idx..len` up by one stays in bounds.
        unsafe {
            let base = self.entries.as_mut_ptr();
            ptr::copy(base.add(idx), base.add(idx + 1), self.len - idx);
            base.add(idx).write(Entry { offset, value });
        }
        self.len += 1;
        Ok(None)
    }

    /// Removes the entry at `offset`, returning its value.
    pub(crate) fn remove(&mut self, offset: Offset) -> Option<V> {
        let SearchResult::Found(idx) = self.search(offset) else {
            return None;
        };

        // SAFETY: `idx < len`; the entry is read out once and the tail shifted over it.
        let entry = unsafe {
            let base = self.entries.as_mut_ptr();
            let entry = base.add(idx).read();
            ptr::copy(base.add(idx + 1), base.add(idx), self.len - idx - 1);
            entry
        };
        self.len -= 1;
        Some(entry.value)
    }

    /// Drops every value and returns the storage to `alloc`, leaving the cluster empty.
    ///
    /// # Safety
    /// `alloc` must be the allocator every previous call on this cluster used.
    pub(crate) unsafe fn release<A: MetaAlloc + ?Sized>(&mut self, alloc: &A) {
        let len = mem::replace(&mut self.len, 0);
        // SAFETY: the first `len` slots were initialized and are no longer reachable.
        unsafe {
            ptr::drop_in_place(self.entries.slice_mut(len));
            self.entries.release(alloc);
        }
    }
}
