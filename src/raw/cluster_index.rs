use core::hash::Hasher;
use core::iter::FusedIterator;
use core::mem;
use core::slice;

use rustc_hash::FxHasher;
use tracing::{debug, trace};

use super::buf::RawBuf;
use super::cluster::Cluster;
use super::geometry::{ClusterId, Offset};
use crate::meta_alloc::{AllocError, MetaAlloc};

/// Smallest non-empty bucket table.
pub(crate) const INDEX_MIN_SLOTS: usize = 16;

/// Smallest non-empty cluster directory.
const ORDER_MIN_CAPACITY: usize = 8;

struct Bucket<V> {
    id: ClusterId,
    cluster: Cluster<V>,
}

/// Sparse table from [`ClusterId`] to an owned, non-empty [`Cluster`].
///
/// Buckets live inline in an open-addressed table (linear probing, backward-shift
/// deletion) kept at most 7/8 full. Alongside it, `order` lists the live ids in
/// ascending order for ordered iteration and predecessor queries.
///
/// All storage comes from the map's [`MetaAlloc`]; every allocating call takes it as a
/// parameter and must always be given the same allocator.
pub(crate) struct ClusterIndex<V> {
    /// `capacity` is zero or a power of two; every slot is initialized.
    slots: RawBuf<Option<Bucket<V>>>,
    /// The first `live` ids, strictly ascending.
    order: RawBuf<ClusterId>,
    /// Number of occupied slots.
    live: usize,
}

#[inline]
fn hash(id: ClusterId) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write_usize(id.to_usize());
    // Truncation is fine, only the low bits select a slot.
    #[allow(clippy::cast_possible_truncation)]
    let hash = hasher.finish() as usize;
    hash
}

/// Slots needed to hold `clusters` buckets under the load limit.
fn slots_for(clusters: usize) -> Result<usize, AllocError> {
    let needed = clusters.checked_mul(8).ok_or(AllocError::CapacityOverflow)? / 7 + 1;
    needed.max(INDEX_MIN_SLOTS).checked_next_power_of_two().ok_or(AllocError::CapacityOverflow)
}

impl<V> ClusterIndex<V> {
    /// Creates an empty index. Does not allocate.
    pub(crate) const fn new() -> Self {
        Self {
            slots: RawBuf::new(),
            order: RawBuf::new(),
            live: 0,
        }
    }

    /// Creates an index with room for `clusters` clusters before it has to grow.
    pub(crate) fn try_with_capacity<A: MetaAlloc + ?Sized>(alloc: &A, clusters: usize) -> Result<Self, AllocError> {
        let mut index = Self::new();
        if clusters == 0 {
            return Ok(index);
        }

        // SAFETY: a fresh index has no storage yet.
        unsafe {
            index.try_rehash(alloc, slots_for(clusters)?)?;
            if let Err(err) = index.order.try_resize(alloc, 0, clusters) {
                index.release(alloc);
                return Err(err);
            }
        }
        Ok(index)
    }

    /// Number of live clusters.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.live
    }

    /// Bytes held from the allocator, including every cluster's entry storage.
    pub(crate) fn bytes(&self) -> usize {
        self.slots.bytes() + self.order.bytes() + self.clusters().map(|(_, c)| c.bytes()).sum::<usize>()
    }

    #[inline]
    fn slots(&self) -> &[Option<Bucket<V>>] {
        // SAFETY: every slot is initialized.
        unsafe { self.slots.slice(self.slots.capacity()) }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Option<Bucket<V>>] {
        // SAFETY: every slot is initialized.
        unsafe { self.slots.slice_mut(self.slots.capacity()) }
    }

    /// Live cluster ids in ascending order.
    #[inline]
    pub(crate) fn ids(&self) -> &[ClusterId] {
        // SAFETY: the first `live` ids are initialized.
        unsafe { self.order.slice(self.live) }
    }

    fn find_slot(&self, id: ClusterId) -> Option<usize> {
        let slots = self.slots();
        if slots.is_empty() {
            return None;
        }

        let mask = slots.len() - 1;
        let mut i = hash(id) & mask;
        loop {
            match &slots[i] {
                None => return None,
                Some(bucket) if bucket.id == id => return Some(i),
                Some(_) => i = (i + 1) & mask,
            }
        }
    }

    pub(crate) fn get(&self, id: ClusterId) -> Option<&Cluster<V>> {
        let i = self.find_slot(id)?;
        self.slots()[i].as_ref().map(|bucket| &bucket.cluster)
    }

    pub(crate) fn get_mut(&mut self, id: ClusterId) -> Option<&mut Cluster<V>> {
        let i = self.find_slot(id)?;
        self.slots_mut()[i].as_mut().map(|bucket| &mut bucket.cluster)
    }

    /// Returns the live cluster with the greatest id strictly below `id`.
    pub(crate) fn preceding(&self, id: ClusterId) -> Option<(ClusterId, &Cluster<V>)> {
        let ids = self.ids();
        let below = ids[..ids.partition_point(|&other| other < id)].last().copied()?;
        self.get(below).map(|cluster| (below, cluster))
    }

    /// Iterates over live clusters in ascending id order.
    pub(crate) fn clusters(&self) -> Clusters<'_, V> {
        Clusters {
            index: self,
            ids: self.ids().iter(),
        }
    }

    /// Inserts or overwrites `value` at `offset` in cluster `id`, creating the cluster if
    /// it does not exist yet. Returns the previous value.
    ///
    /// On error the index is unchanged and `value` is dropped.
    ///
    /// # Safety
    /// `alloc` must be the allocator every previous call on this index used.
    pub(crate) unsafe fn try_insert<A: MetaAlloc + ?Sized>(
        &mut self,
        alloc: &A,
        id: ClusterId,
        offset: Offset,
        value: V,
    ) -> Result<Option<V>, AllocError> {
        if let Some(cluster) = self.get_mut(id) {
            // SAFETY: the caller vouches for `alloc`.
            return unsafe { cluster.try_insert(alloc, offset, value) };
        }

        // SAFETY: the caller vouches for `alloc`. Reserving first keeps a failed entry
        // allocation from leaving an empty cluster behind.
        unsafe {
            self.try_reserve_one(alloc)?;
            let mut cluster = Cluster::new();
            cluster.try_insert(alloc, offset, value)?;
            self.insert_new(id, cluster);
        }
        Ok(None)
    }

    /// Removes the entry at `offset` in cluster `id`, destroying the cluster once it is
    /// empty. Returns the removed value.
    ///
    /// # Safety
    /// `alloc` must be the allocator every previous call on this index used.
    pub(crate) unsafe fn remove<A: MetaAlloc + ?Sized>(&mut self, alloc: &A, id: ClusterId, offset: Offset) -> Option<V> {
        let i = self.find_slot(id)?;
        let bucket = self.slots_mut()[i].as_mut()?;
        let value = bucket.cluster.remove(offset)?;
        if bucket.cluster.is_empty() {
            // SAFETY: the caller vouches for `alloc`.
            unsafe { self.destroy(alloc, i) };
        }
        Some(value)
    }

    /// Drops every cluster and returns all storage to `alloc`, leaving the index empty.
    ///
    /// # Safety
    /// `alloc` must be the allocator every previous call on this index used.
    pub(crate) unsafe fn release<A: MetaAlloc + ?Sized>(&mut self, alloc: &A) {
        for slot in self.slots_mut() {
            if let Some(mut bucket) = slot.take() {
                // SAFETY: the caller vouches for `alloc`.
                unsafe { bucket.cluster.release(alloc) };
            }
        }

        // SAFETY: every slot is `None` and every id is plain data.
        unsafe {
            self.slots.release(alloc);
            self.order.release(alloc);
        }
        self.live = 0;
    }

    /// Makes room for one more cluster in both the table and the directory.
    unsafe fn try_reserve_one<A: MetaAlloc + ?Sized>(&mut self, alloc: &A) -> Result<(), AllocError> {
        let slots = self.slots.capacity();
        if (self.live + 1) * 8 > slots * 7 {
            let grown = slots.checked_mul(2).ok_or(AllocError::CapacityOverflow)?.max(INDEX_MIN_SLOTS);
            // SAFETY: the caller vouches for `alloc`.
            unsafe { self.try_rehash(alloc, grown)? };
        }

        if self.live == self.order.capacity() {
            let grown = self.live.checked_mul(2).ok_or(AllocError::CapacityOverflow)?.max(ORDER_MIN_CAPACITY);
            // SAFETY: the first `live` ids are initialized.
            unsafe { self.order.try_resize(alloc, self.live, grown)? };
        }
        Ok(())
    }

    /// Links a new, non-empty cluster. Room must have been reserved.
    fn insert_new(&mut self, id: ClusterId, cluster: Cluster<V>) {
        debug_assert!(!cluster.is_empty());
        assert!(
            self.live < self.order.capacity() && (self.live + 1) * 8 <= self.slots.capacity() * 7,
            "`ClusterIndex::insert_new()` - no room reserved"
        );

        let at = match self.ids().binary_search(&id) {
            Ok(_) => panic!("`ClusterIndex::insert_new()` - cluster id already present"),
            Err(at) => at,
        };
        // SAFETY: `live < capacity`, so shifting `at..live` up by one stays in bounds.
        unsafe {
            let base = self.order.as_mut_ptr();
            core::ptr::copy(base.add(at), base.add(at + 1), self.live - at);
            base.add(at).write(id);
        }
        self.place(Bucket { id, cluster });
        self.live += 1;

        trace!(cluster = id.to_usize(), clusters = self.live, "created cluster");
    }

    /// Puts `bucket` in the first free slot of its probe sequence.
    fn place(&mut self, bucket: Bucket<V>) {
        let slots = self.slots_mut();
        let mask = slots.len() - 1;
        let mut i = hash(bucket.id) & mask;
        while slots[i].is_some() {
            i = (i + 1) & mask;
        }
        slots[i] = Some(bucket);
    }

    /// Unlinks and frees the (empty) cluster in slot `i`.
    unsafe fn destroy<A: MetaAlloc + ?Sized>(&mut self, alloc: &A, i: usize) {
        let mut bucket = self.slots_mut()[i].take().expect("`ClusterIndex::destroy()` - slot is vacant!");
        // SAFETY: the caller vouches for `alloc`.
        unsafe { bucket.cluster.release(alloc) };

        // Backward-shift deletion: pull later members of the probe run into the hole
        // unless that would move them before their home slot.
        let slots = self.slots_mut();
        let mask = slots.len() - 1;
        let mut hole = i;
        let mut j = (i + 1) & mask;
        while let Some(next) = &slots[j] {
            let home = hash(next.id) & mask;
            if (j.wrapping_sub(home) & mask) >= (j.wrapping_sub(hole) & mask) {
                slots[hole] = slots[j].take();
                hole = j;
            }
            j = (j + 1) & mask;
        }

        let at = self
            .ids()
            .binary_search(&bucket.id)
            .expect("`ClusterIndex::destroy()` - id missing from directory!");
        // SAFETY: `at < live`; ids after it shift down by one.
        unsafe {
            let base = self.order.as_mut_ptr();
            core::ptr::copy(base.add(at + 1), base.add(at), self.live - at - 1);
        }
        self.live -= 1;

        trace!(cluster = bucket.id.to_usize(), clusters = self.live, "released empty cluster");

        let slots = self.slots.capacity();
        if slots > INDEX_MIN_SLOTS && self.live * 8 <= slots {
            // SAFETY: the caller vouches for `alloc`.
            if let Err(err) = unsafe { self.try_rehash(alloc, slots / 2) } {
                debug!(%err, slots, "kept oversized cluster index");
            }
        }

        let ids = self.order.capacity();
        if ids > ORDER_MIN_CAPACITY && self.live * 4 <= ids {
            // SAFETY: the first `live` ids are initialized and `live <= ids / 4`.
            if let Err(err) = unsafe { self.order.try_resize(alloc, self.live, ids / 2) } {
                debug!(%err, ids, "kept oversized cluster directory");
            }
        }
    }

    /// Moves every bucket into a fresh table of `capacity` slots. On error nothing changes.
    unsafe fn try_rehash<A: MetaAlloc + ?Sized>(&mut self, alloc: &A, capacity: usize) -> Result<(), AllocError> {
        debug_assert!(capacity.is_power_of_two() && self.live * 8 <= capacity * 7);

        let mut fresh: RawBuf<Option<Bucket<V>>> = RawBuf::try_with_capacity(alloc, capacity)?;
        // SAFETY: `capacity` slots were just allocated.
        unsafe {
            for i in 0..capacity {
                fresh.as_mut_ptr().add(i).write(None);
            }
        }

        let mut stale = mem::replace(&mut self.slots, fresh);
        // SAFETY: every stale slot is initialized.
        for slot in unsafe { stale.slice_mut(stale.capacity()) } {
            if let Some(bucket) = slot.take() {
                self.place(bucket);
            }
        }
        // SAFETY: every stale slot is now `None`.
        unsafe { stale.release(alloc) };

        debug!(slots = capacity, clusters = self.live, "resized cluster index");
        Ok(())
    }
}

/// Iterator over live clusters in ascending id order.
pub(crate) struct Clusters<'a, V> {
    index: &'a ClusterIndex<V>,
    ids: slice::Iter<'a, ClusterId>,
}

impl<'a, V> Iterator for Clusters<'a, V> {
    type Item = (ClusterId, &'a Cluster<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.ids.next()?;
        let cluster = self.index.get(id).expect("`Clusters::next()` - id missing from table!");
        Some((id, cluster))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl<V> ExactSizeIterator for Clusters<'_, V> {}

impl<V> FusedIterator for Clusters<'_, V> {}

impl<V> Clone for Clusters<'_, V> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            ids: self.ids.clone(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::*;
    use crate::meta_alloc::tests::Counting;
    use crate::raw::geometry::Geometry;
    use alloc::collections::{BTreeMap, BTreeSet};
    use alloc::string::String;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    type G = Geometry<8>;

    fn split(address: usize) -> (ClusterId, Offset) {
        G::split(address)
    }

    impl<V> ClusterIndex<V> {
        /// Validates index invariants. Panics with a descriptive message if any are violated.
        pub(crate) fn validate_invariants(&self) {
            let mut errors: Vec<String> = Vec::new();
            let slots = self.slots();

            if !slots.is_empty() && !slots.len().is_power_of_two() {
                errors.push(alloc::format!("slot count {} is not a power of two", slots.len()));
            }
            if self.live * 8 > slots.len() * 7 {
                errors.push(alloc::format!("load too high: {} of {}", self.live, slots.len()));
            }

            let mut in_table = BTreeSet::new();
            for (i, slot) in slots.iter().enumerate() {
                let Some(bucket) = slot else { continue };
                if bucket.cluster.is_empty() {
                    errors.push(alloc::format!("empty cluster {:?} in slot {}", bucket.id, i));
                }
                if self.find_slot(bucket.id) != Some(i) {
                    errors.push(alloc::format!("cluster {:?} in slot {} is unreachable", bucket.id, i));
                }
                bucket.cluster.validate_invariants();
                in_table.insert(bucket.id);
            }

            if in_table.len() != self.live {
                errors.push(alloc::format!("live={} but table holds {}", self.live, in_table.len()));
            }
            let ordered: Vec<ClusterId> = in_table.into_iter().collect();
            if ordered.as_slice() != self.ids() {
                errors.push(alloc::format!("directory {:?} != table ids {:?}", self.ids(), ordered));
            }

            assert!(errors.is_empty(), "Index invariant violations:\n{}", errors.join("\n"));
        }
    }

    #[test]
    fn empty_index() {
        let index: ClusterIndex<u32> = ClusterIndex::new();
        let (id, _) = split(0x1234);
        assert!(index.get(id).is_none());
        assert!(index.preceding(id).is_none());
        assert_eq!(index.clusters().count(), 0);
        assert_eq!(index.bytes(), 0);
    }

    #[test]
    fn with_capacity_avoids_early_growth() {
        let counting = Counting::default();
        let mut index = ClusterIndex::try_with_capacity(&counting, 100).unwrap();
        let slots = index.slots.capacity();
        assert_eq!(slots, 128);
        for n in 0..100usize {
            let (id, offset) = split(n << 8);
            // SAFETY: `counting` is used for every call.
            unsafe { index.try_insert(&counting, id, offset, n).unwrap() };
        }
        assert_eq!(index.slots.capacity(), slots);
        index.validate_invariants();
        // SAFETY: as above.
        unsafe { index.release(&counting) };
        assert_eq!(counting.bytes.get(), 0);
    }

    #[test]
    fn clusters_are_created_and_destroyed() {
        let counting = Counting::default();
        let mut index = ClusterIndex::new();
        // SAFETY: `counting` is used for every call.
        unsafe {
            for address in [0x100, 0x104, 0x300] {
                let (id, offset) = split(address);
                index.try_insert(&counting, id, offset, address).unwrap();
            }
            assert_eq!(index.len(), 2);

            let (id, offset) = split(0x100);
            assert_eq!(index.remove(&counting, id, offset), Some(0x100));
            assert_eq!(index.len(), 2);
            let (id, offset) = split(0x104);
            assert_eq!(index.remove(&counting, id, offset), Some(0x104));
            assert_eq!(index.len(), 1);
            assert!(index.get(id).is_none());
            assert_eq!(index.remove(&counting, id, offset), None);

            index.validate_invariants();
            index.release(&counting);
        }
        assert_eq!(counting.blocks.get(), 0);
    }

    #[test]
    fn preceding_skips_gaps() {
        let counting = Counting::default();
        let mut index = ClusterIndex::new();
        // SAFETY: `counting` is used for every call.
        unsafe {
            for address in [0x0105, 0x0a00, 0x7fff] {
                let (id, offset) = split(address);
                index.try_insert(&counting, id, offset, address).unwrap();
            }
        }

        let (id, _) = split(0x7f00);
        let (below, cluster) = index.preceding(id).unwrap();
        assert_eq!(below, split(0x0a00).0);
        assert_eq!(cluster.last().map(|(_, v)| *v), Some(0x0a00));

        let (below, _) = index.preceding(below).unwrap();
        assert_eq!(below, split(0x0105).0);
        assert!(index.preceding(below).is_none());

        // SAFETY: as above.
        unsafe { index.release(&counting) };
    }

    #[test]
    fn failed_cluster_creation_leaves_no_empty_cluster() {
        let counting = Counting::with_budget(0);
        let mut index: ClusterIndex<u64> = ClusterIndex::new();
        let (id, offset) = split(0x42);
        // SAFETY: `counting` is used for every call.
        let result = unsafe { index.try_insert(&counting, id, offset, 7) };
        assert!(matches!(result, Err(AllocError::Exhausted { .. })));
        assert_eq!(index.len(), 0);
        assert!(index.get(id).is_none());
        index.validate_invariants();

        counting.budget.set(Some(usize::MAX / 2));
        // SAFETY: as above.
        unsafe {
            assert_eq!(index.try_insert(&counting, id, offset, 7), Ok(None));
            index.release(&counting);
        }
    }

    #[test]
    fn table_shrinks_after_mass_removal() {
        let counting = Counting::default();
        let mut index = ClusterIndex::new();
        // SAFETY: `counting` is used for every call.
        unsafe {
            for n in 0..1000usize {
                let (id, offset) = split(n << 8);
                index.try_insert(&counting, id, offset, n).unwrap();
            }
            let grown = index.slots.capacity();
            assert!(grown >= 1024);

            for n in 0..995usize {
                let (id, offset) = split(n << 8);
                assert_eq!(index.remove(&counting, id, offset), Some(n));
            }
            assert!(index.slots.capacity() < grown);
            assert!(index.slots.capacity() >= INDEX_MIN_SLOTS);
            index.validate_invariants();
            index.release(&counting);
        }
        assert_eq!(counting.bytes.get(), 0);
    }

    #[test]
    fn storage_settles_after_removing_everything() {
        let counting = Counting::default();
        let mut index = ClusterIndex::new();
        // SAFETY: `counting` is used for every call.
        unsafe {
            for n in 0..1000usize {
                let (id, offset) = split(n << 8);
                index.try_insert(&counting, id, offset, n).unwrap();
            }
            assert!(index.order.capacity() >= 1000);

            for n in (0..1000usize).rev() {
                let (id, offset) = split(n << 8);
                assert_eq!(index.remove(&counting, id, offset), Some(n));
                index.validate_invariants();
            }
            assert_eq!(index.slots.capacity(), INDEX_MIN_SLOTS);
            assert_eq!(index.order.capacity(), ORDER_MIN_CAPACITY);
            assert_eq!(index.bytes(), counting.bytes.get());
            index.release(&counting);
        }
        assert_eq!(counting.bytes.get(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert(usize, u32),
        Remove(usize),
        Preceding(usize),
    }

    fn address_strategy() -> impl Strategy<Value = usize> {
        // Clusters of 256 bytes; a few dozen cluster ids with collisions in the table.
        prop_oneof![0usize..0x4000, (0usize..64).prop_map(|n| n * 0x1_0000 + 0x80)]
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (address_strategy(), any::<u32>()).prop_map(|(a, v)| Op::Insert(a, v)),
            3 => address_strategy().prop_map(Op::Remove),
            1 => address_strategy().prop_map(Op::Preceding),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn index_matches_btreemap(ops in prop::collection::vec(op_strategy(), 0..600)) {
            let counting = Counting::default();
            let mut index: ClusterIndex<u32> = ClusterIndex::new();
            let mut model: BTreeMap<usize, u32> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Insert(address, value) => {
                        let (id, offset) = split(address);
                        // SAFETY: `counting` is used for every call.
                        let previous = unsafe { index.try_insert(&counting, id, offset, value) };
                        prop_assert_eq!(previous, Ok(model.insert(address, value)));
                    }
                    Op::Remove(address) => {
                        let (id, offset) = split(address);
                        // SAFETY: as above.
                        let removed = unsafe { index.remove(&counting, id, offset) };
                        prop_assert_eq!(removed, model.remove(&address));
                    }
                    Op::Preceding(address) => {
                        let (id, _) = split(address);
                        let expected = model.range(..G::join(id, split(0).1)).next_back().map(|(&a, _)| split(a).0);
                        prop_assert_eq!(index.preceding(id).map(|(below, _)| below), expected);
                    }
                }
                index.validate_invariants();
            }

            let flattened: Vec<(usize, u32)> = index
                .clusters()
                .flat_map(|(id, cluster)| cluster.entries().iter().map(move |e| (G::join(id, e.offset()), *e.value())))
                .collect();
            let expected: Vec<(usize, u32)> = model.into_iter().collect();
            prop_assert_eq!(flattened, expected);

            // SAFETY: as above.
            unsafe { index.release(&counting) };
            prop_assert_eq!(counting.bytes.get(), 0);
        }
    }
}
