//! Address-keyed metadata maps for memory allocators.
//!
//! This crate provides [`AddressMap`], a map from memory addresses to per-object
//! metadata, built for the bookkeeping side of an allocator:
//!
//! - [`insert`](AddressMap::insert), [`get`](AddressMap::get) and
//!   [`remove`](AddressMap::remove) by exact address
//! - [`find_inside`](AddressMap::find_inside) - Find the object that contains an
//!   arbitrary interior address, searching at most a bounded distance below it
//! - Ordered iteration over all recorded objects
//!
//! # Example
//!
//! ```
//! use addrmap::AddressMap;
//!
//! let mut objects = AddressMap::new();
//! objects.insert(0x1000, 16usize);
//! objects.insert(0x10_0000, 8usize);
//!
//! // Exact lookups.
//! assert_eq!(objects.get(0x1000), Some(&16));
//!
//! // Interior pointers map back to the object that contains them.
//! assert_eq!(objects.find_inside(|size| *size, 64, 0x100f), Some((0x1000, &16)));
//! assert_eq!(objects.find_inside(|size| *size, 64, 0x1010), None);
//! ```
//!
//! # Features
//!
//! - **`no_std` compatible** - Only requires `alloc`, no standard library dependency
//! - **Pluggable metadata storage** - Every byte the map uses comes from a [`MetaAlloc`],
//!   so it can run inside an allocator without re-entering it
//! - **Clustered layout** - O(1) cluster lookup by hash, then binary search in a
//!   contiguous sorted array
//!
//! # Implementation
//!
//! The address space is divided into aligned clusters of `2^BITS` bytes. A cluster
//! exists only while it holds at least one entry, and is found through an
//! open-addressed hash table keyed by cluster number. A sorted directory of cluster
//! numbers lets containment queries step from one occupied cluster to the previous one
//! without scanning empty address ranges.

#![no_std]
// These forbid rules and lint groups are meant to be very restrictive.
// NOTE: Metadata storage is raw memory from a `MetaAlloc`, which needs unsafe code.
// #![forbid(unsafe_code)]
#![forbid(keyword_idents)]
#![forbid(non_ascii_idents)]
#![forbid(unreachable_pub)]
#![warn(clippy::all)]
#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]
// Enable coverage attributes for nightly builds.
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

mod raw;

pub mod address_map;
pub mod meta_alloc;

pub use address_map::{AddressMap, DEFAULT_CLUSTER_BITS};
pub use meta_alloc::{AllocError, FnAlloc, GlobalMeta, META_ALIGN, MetaAlloc};
