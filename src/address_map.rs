use core::fmt;
use core::iter::FusedIterator;
use core::slice;

use crate::meta_alloc::{AllocError, GlobalMeta, MetaAlloc};
use crate::raw::{ClusterId, ClusterIndex, Clusters, Entry, Geometry};

mod capacity;

/// Default `log2` of the bytes covered by one cluster (1 MiB).
pub const DEFAULT_CLUSTER_BITS: u32 = 20;

/// A map from memory addresses to allocator metadata.
///
/// `AddressMap` is built for the bookkeeping of large allocations: keys are addresses
/// that cluster densely in a few regions of the address space, and each value describes
/// an object of some extent starting at its key. Besides exact lookups it answers
/// [containment queries](AddressMap::find_inside): given any address inside a recorded
/// object, find that object.
///
/// The address space is split into clusters of `2^BITS` bytes (1 MiB by default). A
/// hash table locates the cluster of an address in O(1); inside a cluster, entries are
/// kept in a sorted array and found by binary search.
///
/// The map never uses the global allocator on its own. All of its storage comes from the
/// [`MetaAlloc`] given at construction, so it can sit underneath an allocator without
/// recursing into it. [`GlobalMeta`] is the default for code that is not an allocator.
///
/// # Thread safety
///
/// There is no internal locking. Share a map between threads the usual way, behind a
/// lock the caller already holds; `&mut self` on every mutating method enforces the rest.
///
/// # Examples
///
/// ```
/// use addrmap::AddressMap;
///
/// // Record the size of each object.
/// let mut objects = AddressMap::new();
/// objects.insert(0x7f00_0000_1000, 4096usize);
/// objects.insert(0x7f00_0000_3000, 64usize);
///
/// assert_eq!(objects.get(0x7f00_0000_1000), Some(&4096));
///
/// // Which object does this interior pointer belong to?
/// let found = objects.find_inside(|size| *size, 1 << 20, 0x7f00_0000_1a2b);
/// assert_eq!(found, Some((0x7f00_0000_1000, &4096)));
///
/// assert_eq!(objects.remove(0x7f00_0000_3000), Some(64));
/// assert_eq!(objects.len(), 1);
/// ```
pub struct AddressMap<V, A: MetaAlloc = GlobalMeta, const BITS: u32 = DEFAULT_CLUSTER_BITS> {
    index: ClusterIndex<V>,
    len: usize,
    alloc: A,
}

// SAFETY: the map owns its values and its storage exclusively, like a `Vec`.
unsafe impl<V: Send, A: MetaAlloc + Send, const BITS: u32> Send for AddressMap<V, A, BITS> {}
// SAFETY: `&AddressMap` only hands out shared references and calls no allocator method.
unsafe impl<V: Sync, A: MetaAlloc + Sync, const BITS: u32> Sync for AddressMap<V, A, BITS> {}

/// An iterator over the entries of an `AddressMap`, in ascending address order.
///
/// This `struct` is created by the [`iter`] method on [`AddressMap`]. See its
/// documentation for more.
///
/// [`iter`]: AddressMap::iter
pub struct Iter<'a, V, const BITS: u32 = DEFAULT_CLUSTER_BITS> {
    clusters: Clusters<'a, V>,
    current: Option<(ClusterId, slice::Iter<'a, Entry<V>>)>,
    remaining: usize,
}

// SAFETY: `Iter` only reads through shared references into the map.
unsafe impl<V: Sync, const BITS: u32> Send for Iter<'_, V, BITS> {}
// SAFETY: as above.
unsafe impl<V: Sync, const BITS: u32> Sync for Iter<'_, V, BITS> {}

impl<V> AddressMap<V> {
    /// Makes a new, empty `AddressMap` whose metadata comes from the global allocator.
    ///
    /// Does not allocate anything on its own.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x1000, "first");
    /// assert!(!map.is_empty());
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(GlobalMeta)
    }
}

impl<V, A: MetaAlloc, const BITS: u32> AddressMap<V, A, BITS> {
    /// Bytes of address space covered by one cluster.
    pub const CLUSTER_SPAN: usize = Geometry::<BITS>::SPAN;

    /// Makes a new, empty `AddressMap` whose metadata comes from `alloc`.
    ///
    /// Does not allocate anything on its own.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::{AddressMap, GlobalMeta};
    ///
    /// // 64 KiB clusters.
    /// let map: AddressMap<u32, _, 16> = AddressMap::new_in(GlobalMeta);
    /// assert_eq!(AddressMap::<u32, GlobalMeta, 16>::CLUSTER_SPAN, 1 << 16);
    /// assert!(map.is_empty());
    /// ```
    pub fn new_in(alloc: A) -> Self {
        let () = Geometry::<BITS>::VALID;
        Self {
            index: ClusterIndex::new(),
            len: 0,
            alloc,
        }
    }

    /// Returns a reference to the metadata allocator.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Returns the number of entries in the map.
    ///
    /// # Complexity
    ///
    /// O(1)
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the map contains no entries.
    ///
    /// # Complexity
    ///
    /// O(1)
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes every entry and returns all metadata storage to the allocator.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x1000, 1);
    /// map.clear();
    /// assert!(map.is_empty());
    /// assert_eq!(map.metadata_bytes(), 0);
    /// ```
    pub fn clear(&mut self) {
        // SAFETY: `self.alloc` is the only allocator this index has seen.
        unsafe { self.index.release(&self.alloc) };
        self.len = 0;
    }

    /// Associates `value` with `address`, returning the value it replaces, if any.
    ///
    /// Creates the cluster for `address` if it does not exist yet.
    ///
    /// # Panics
    ///
    /// Diverges through [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if the
    /// metadata allocator fails. Use [`try_insert`](Self::try_insert) to handle that.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// assert_eq!(map.insert(0x1000, "a"), None);
    /// assert_eq!(map.insert(0x1000, "b"), Some("a"));
    /// assert_eq!(map.get(0x1000), Some(&"b"));
    /// assert_eq!(map.len(), 1);
    /// ```
    ///
    /// # Complexity
    ///
    /// O(log k) where k is the number of entries in the cluster, plus a shift of the
    /// entries above the insertion point.
    pub fn insert(&mut self, address: usize, value: V) -> Option<V> {
        match self.try_insert(address, value) {
            Ok(previous) => previous,
            Err(err) => err.fatal(),
        }
    }

    /// Like [`insert`](Self::insert), but reports metadata allocation failure.
    ///
    /// On error the map is unchanged and `value` is dropped.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the metadata allocator cannot satisfy a request.
    pub fn try_insert(&mut self, address: usize, value: V) -> Result<Option<V>, AllocError> {
        let (id, offset) = Geometry::<BITS>::split(address);
        // SAFETY: `self.alloc` is the only allocator this index has seen.
        let previous = unsafe { self.index.try_insert(&self.alloc, id, offset, value)? };
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    /// Returns a reference to the value recorded at exactly `address`.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x1000, 16);
    /// assert_eq!(map.get(0x1000), Some(&16));
    /// assert_eq!(map.get(0x1008), None);
    /// ```
    ///
    /// # Complexity
    ///
    /// O(log k) where k is the number of entries in the cluster.
    pub fn get(&self, address: usize) -> Option<&V> {
        let (id, offset) = Geometry::<BITS>::split(address);
        self.index.get(id)?.get(offset)
    }

    /// Returns a mutable reference to the value recorded at exactly `address`.
    pub fn get_mut(&mut self, address: usize) -> Option<&mut V> {
        let (id, offset) = Geometry::<BITS>::split(address);
        self.index.get_mut(id)?.get_mut(offset)
    }

    /// Returns `true` if a value is recorded at exactly `address`.
    pub fn contains_key(&self, address: usize) -> bool {
        self.get(address).is_some()
    }

    /// Removes the entry at exactly `address`, returning its value.
    ///
    /// A cluster is destroyed, and its storage returned to the allocator, as soon as its
    /// last entry is removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x1000, 16);
    /// assert_eq!(map.remove(0x1000), Some(16));
    /// assert_eq!(map.remove(0x1000), None);
    /// assert_eq!(map.cluster_count(), 0);
    /// ```
    pub fn remove(&mut self, address: usize) -> Option<V> {
        let (id, offset) = Geometry::<BITS>::split(address);
        // SAFETY: `self.alloc` is the only allocator this index has seen.
        let removed = unsafe { self.index.remove(&self.alloc, id, offset) }?;
        self.len -= 1;
        Some(removed)
    }

    /// Finds the object that contains `address`.
    ///
    /// The value recorded at `start` describes the object `start..start + size_of(value)`.
    /// Returns the start address and value of the nearest object at or below `address`
    /// whose extent covers it. An object whose start equals `address` always matches,
    /// even with a zero extent.
    ///
    /// The nearest object at or below `address` inside its own cluster is always checked.
    /// If it does not cover `address`, the search walks down through the preceding
    /// clusters, checking the last object of each, and gives up as soon as the next
    /// cluster ends more than `max_search` bytes below `address`.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x1000, 16usize);
    ///
    /// let size_of = |size: &usize| *size;
    /// assert_eq!(map.find_inside(size_of, 1 << 20, 0x1008), Some((0x1000, &16)));
    /// assert_eq!(map.find_inside(size_of, 1 << 20, 0x1010), None);
    /// // The own cluster is searched regardless of the bound.
    /// assert_eq!(map.find_inside(size_of, 4, 0x1008), Some((0x1000, &16)));
    ///
    /// // Reaching the cluster below takes more than 4 bytes of walking.
    /// map.insert(0x10_0000 - 0x40, 0x80);
    /// assert_eq!(map.find_inside(size_of, 4, 0x10_0010), None);
    /// assert_eq!(map.find_inside(size_of, 1 << 20, 0x10_0010), Some((0x0f_ffc0, &0x80)));
    /// ```
    ///
    /// # Complexity
    ///
    /// O(log k) per cluster visited; at most `max_search / CLUSTER_SPAN + 2` clusters are
    /// visited.
    pub fn find_inside<F>(&self, mut size_of: F, max_search: usize, address: usize) -> Option<(usize, &V)>
    where
        F: FnMut(&V) -> usize,
    {
        let mut covers = |start: usize, value: &V| {
            let distance = address - start;
            distance == 0 || distance < size_of(value)
        };

        let (id, offset) = Geometry::<BITS>::split(address);
        if let Some((found, value)) = self.index.get(id).and_then(|cluster| cluster.preceding_or_equal(offset)) {
            let start = Geometry::<BITS>::join(id, found);
            if covers(start, value) {
                return Some((start, value));
            }
        }

        let mut below = id;
        while let Some((prev, cluster)) = self.index.preceding(below) {
            if address - Geometry::<BITS>::last_address(prev) > max_search {
                return None;
            }

            let (found, value) = cluster.last()?;
            let start = Geometry::<BITS>::join(prev, found);
            if covers(start, value) {
                return Some((start, value));
            }
            below = prev;
        }
        None
    }

    /// Gets an iterator over the entries of the map, in ascending address order.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x20_0000, 'c');
    /// map.insert(0x1000, 'a');
    /// map.insert(0x1008, 'b');
    ///
    /// let entries: Vec<_> = map.iter().collect();
    /// assert_eq!(entries, [(0x1000, &'a'), (0x1008, &'b'), (0x20_0000, &'c')]);
    /// ```
    pub fn iter(&self) -> Iter<'_, V, BITS> {
        Iter {
            clusters: self.index.clusters(),
            current: None,
            remaining: self.len,
        }
    }
}

impl<V, A: MetaAlloc, const BITS: u32> Drop for AddressMap<V, A, BITS> {
    fn drop(&mut self) {
        // SAFETY: `self.alloc` is the only allocator this index has seen.
        unsafe { self.index.release(&self.alloc) };
    }
}

impl<V, A: MetaAlloc + Default, const BITS: u32> Default for AddressMap<V, A, BITS> {
    fn default() -> Self {
        Self::new_in(A::default())
    }
}

impl<V: fmt::Debug, A: MetaAlloc, const BITS: u32> fmt::Debug for AddressMap<V, A, BITS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter().map(|(address, value)| (Hex(address), value))).finish()
    }
}

/// Formats an address as `0x…` in `Debug` output.
struct Hex(usize);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl<V, A: MetaAlloc, const BITS: u32> Extend<(usize, V)> for AddressMap<V, A, BITS> {
    fn extend<I: IntoIterator<Item = (usize, V)>>(&mut self, iter: I) {
        for (address, value) in iter {
            self.insert(address, value);
        }
    }
}

impl<'a, V, A: MetaAlloc, const BITS: u32> IntoIterator for &'a AddressMap<V, A, BITS> {
    type Item = (usize, &'a V);
    type IntoIter = Iter<'a, V, BITS>;

    fn into_iter(self) -> Iter<'a, V, BITS> {
        self.iter()
    }
}

impl<'a, V, const BITS: u32> Iterator for Iter<'a, V, BITS> {
    type Item = (usize, &'a V);

    fn next(&mut self) -> Option<(usize, &'a V)> {
        loop {
            if let Some((id, entries)) = &mut self.current
                && let Some(entry) = entries.next()
            {
                self.remaining -= 1;
                return Some((Geometry::<BITS>::join(*id, entry.offset()), entry.value()));
            }

            let (id, cluster) = self.clusters.next()?;
            self.current = Some((id, cluster.entries().iter()));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<V, const BITS: u32> ExactSizeIterator for Iter<'_, V, BITS> {
    fn len(&self) -> usize {
        self.remaining
    }
}

impl<V, const BITS: u32> FusedIterator for Iter<'_, V, BITS> {}

impl<V, const BITS: u32> Clone for Iter<'_, V, BITS> {
    fn clone(&self) -> Self {
        Self {
            clusters: self.clusters.clone(),
            current: self.current.clone(),
            remaining: self.remaining,
        }
    }
}

impl<V: fmt::Debug, const BITS: u32> fmt::Debug for Iter<'_, V, BITS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}
