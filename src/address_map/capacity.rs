use super::AddressMap;
use crate::meta_alloc::{AllocError, MetaAlloc};
use crate::raw::{ClusterIndex, Geometry};

impl<V, A: MetaAlloc, const BITS: u32> AddressMap<V, A, BITS> {
    /// Makes an empty map whose cluster index can hold `clusters` clusters without
    /// growing.
    ///
    /// # Panics
    ///
    /// Diverges through [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if the
    /// metadata allocator fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::{AddressMap, GlobalMeta};
    ///
    /// let map: AddressMap<u32> = AddressMap::with_capacity_in(64, GlobalMeta);
    /// assert!(map.is_empty());
    /// assert!(map.metadata_bytes() > 0);
    /// ```
    ///
    /// # Complexity
    ///
    /// O(clusters)
    pub fn with_capacity_in(clusters: usize, alloc: A) -> Self {
        match Self::try_with_capacity_in(clusters, alloc) {
            Ok(map) => map,
            Err(err) => err.fatal(),
        }
    }

    /// Like [`with_capacity_in`](Self::with_capacity_in), but reports allocation failure.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the metadata allocator cannot satisfy the request.
    pub fn try_with_capacity_in(clusters: usize, alloc: A) -> Result<Self, AllocError> {
        let () = Geometry::<BITS>::VALID;
        let index = ClusterIndex::try_with_capacity(&alloc, clusters)?;
        Ok(Self { index, len: 0, alloc })
    }

    /// Returns the number of live clusters.
    ///
    /// A cluster exists exactly while at least one entry lies in its address range.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrmap::AddressMap;
    ///
    /// let mut map = AddressMap::new();
    /// map.insert(0x10_0000, ());
    /// map.insert(0x10_0040, ());
    /// map.insert(0x30_0000, ());
    /// assert_eq!(map.cluster_count(), 2);
    ///
    /// map.remove(0x30_0000);
    /// assert_eq!(map.cluster_count(), 1);
    /// ```
    pub fn cluster_count(&self) -> usize {
        self.index.len()
    }

    /// Returns the number of bytes currently held from the metadata allocator.
    ///
    /// # Complexity
    ///
    /// O(clusters)
    pub fn metadata_bytes(&self) -> usize {
        self.index.bytes()
    }
}
