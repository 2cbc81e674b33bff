// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

#![no_std]

//! Ownership sets for partitionable resources.
//!
//! A `ResourceSet<C>` is a fixed-capacity bitmap of ids of resource class `C`. Every partition
//! holds one set per class, and the sets of all partitions for a class are pairwise disjoint.
//! Moving ids between partitions goes through `ResourceSet::transfer`, which keeps the two sides
//! of a move in one place. The class parameter keeps CPU ids from being handed to a remote-core
//! set and vice versa.

// For testing use the std crate.
#[cfg(test)]
#[macro_use]
extern crate std;

use core::fmt;
use core::marker::PhantomData;

/// The largest number of ids a set can track.
pub const MAX_RESOURCE_IDS: usize = 256;
/// The largest bitmap, in bytes, a set can be built from.
pub const MAX_BITMAP_BYTES: usize = MAX_RESOURCE_IDS / 8;

const WORD_BITS: usize = u64::BITS as usize;
const NUM_WORDS: usize = MAX_RESOURCE_IDS / WORD_BITS;

/// A class of resource tracked in a `ResourceSet`.
pub trait ResourceClass {
    /// Short name of the class, used in log output.
    const NAME: &'static str;
}

/// General-purpose CPUs.
pub enum Cpu {}

impl ResourceClass for Cpu {
    const NAME: &'static str = "cpu";
}

/// Remote processing cores, either fixed hardware cores or soft cores instantiated in the fabric.
pub enum RemoteCore {}

impl ResourceClass for RemoteCore {
    const NAME: &'static str = "rcpu";
}

/// Reconfigurable fabric regions.
pub enum FabricRegion {}

impl ResourceClass for FabricRegion {
    const NAME: &'static str = "fabric";
}

/// A set of resource ids of class `C` with a capacity fixed at construction.
pub struct ResourceSet<C: ResourceClass> {
    bits: [u64; NUM_WORDS],
    capacity: usize,
    class: PhantomData<C>,
}

impl<C: ResourceClass> ResourceSet<C> {
    /// Creates an empty set able to hold ids `0..capacity`. Capacity is clamped to
    /// `MAX_RESOURCE_IDS`.
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: [0; NUM_WORDS],
            capacity: core::cmp::min(capacity, MAX_RESOURCE_IDS),
            class: PhantomData,
        }
    }

    /// Creates a set from a little-endian bitmap, bit `n` of byte `b` standing for id `8 * b + n`.
    /// The capacity is the number of bits in `bytes`. Returns `None` if the bitmap is larger than
    /// `MAX_BITMAP_BYTES`.
    pub fn from_bitmap(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_BITMAP_BYTES {
            return None;
        }
        let mut set = Self::new(bytes.len() * 8);
        for (i, b) in bytes.iter().enumerate() {
            set.bits[i / 8] |= (*b as u64) << ((i % 8) * 8);
        }
        Some(set)
    }

    /// Returns an empty set with the same capacity as `self`.
    pub fn empty_like(&self) -> Self {
        Self::new(self.capacity)
    }

    /// Returns the number of ids this set can track.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if `id` is in the set.
    pub fn contains(&self, id: usize) -> bool {
        id < self.capacity && self.bits[id / WORD_BITS] & (1 << (id % WORD_BITS)) != 0
    }

    /// Adds `id` to the set. Ids outside the capacity are ignored.
    pub fn set(&mut self, id: usize) {
        debug_assert!(id < self.capacity, "{} id {} out of range", C::NAME, id);
        if id < self.capacity {
            self.bits[id / WORD_BITS] |= 1 << (id % WORD_BITS);
        }
    }

    /// Removes `id` from the set.
    pub fn clear(&mut self, id: usize) {
        if id < self.capacity {
            self.bits[id / WORD_BITS] &= !(1 << (id % WORD_BITS));
        }
    }

    /// Returns true if the set holds no ids.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Returns the number of ids in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Returns true if every id in `self` is also in `other`.
    pub fn subset_of(&self, other: &Self) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Returns true if `self` and `other` share at least one id.
    pub fn intersects(&self, other: &Self) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Returns the union of `self` and `other`, with the larger of the two capacities.
    pub fn union(&self, other: &Self) -> Self {
        let mut out = Self::new(core::cmp::max(self.capacity, other.capacity));
        for (i, w) in out.bits.iter_mut().enumerate() {
            *w = self.bits[i] | other.bits[i];
        }
        out
    }

    /// Returns the ids of `self` that are not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = self.empty_like();
        for (i, w) in out.bits.iter_mut().enumerate() {
            *w = self.bits[i] & !other.bits[i];
        }
        out
    }

    /// Splits the set into the ids below `boundary` and the ids at or above it.
    pub fn split_at(&self, boundary: usize) -> (Self, Self) {
        let mut below = self.empty_like();
        let mut above = self.empty_like();
        for id in self.iter() {
            if id < boundary {
                below.set(id);
            } else {
                above.set(id);
            }
        }
        (below, above)
    }

    /// Returns an iterator over the ids in ascending order.
    pub fn iter(&self) -> Iter<C> {
        self.iter_except(None)
    }

    /// Returns an iterator over the ids in ascending order, skipping `excluded` if present.
    pub fn iter_except(&self, excluded: Option<usize>) -> Iter<C> {
        Iter {
            set: self,
            next: 0,
            excluded,
        }
    }

    /// Moves `ids` from `from` to `to`.
    ///
    /// The caller must have checked that `ids` is a subset of `from`; nothing is validated here.
    pub fn transfer(from: &mut Self, to: &mut Self, ids: &Self) {
        for id in ids.iter() {
            from.clear(id);
            to.set(id);
        }
    }
}

impl<C: ResourceClass> Clone for ResourceSet<C> {
    fn clone(&self) -> Self {
        Self {
            bits: self.bits,
            capacity: self.capacity,
            class: PhantomData,
        }
    }
}

impl<C: ResourceClass> PartialEq for ResourceSet<C> {
    // Capacity is not part of set equality.
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<C: ResourceClass> Eq for ResourceSet<C> {}

impl<C: ResourceClass> fmt::Debug for ResourceSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", C::NAME)?;
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Ascending iterator over the ids in a `ResourceSet`.
pub struct Iter<'a, C: ResourceClass> {
    set: &'a ResourceSet<C>,
    next: usize,
    excluded: Option<usize>,
}

impl<'a, C: ResourceClass> Iterator for Iter<'a, C> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.next < self.set.capacity {
            let word = self.set.bits[self.next / WORD_BITS] >> (self.next % WORD_BITS);
            if word == 0 {
                // Skip to the next word.
                self.next = (self.next / WORD_BITS + 1) * WORD_BITS;
                continue;
            }
            let id = self.next + word.trailing_zeros() as usize;
            self.next = id + 1;
            if id >= self.set.capacity {
                break;
            }
            if Some(id) != self.excluded {
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn cpus(ids: &[usize], capacity: usize) -> ResourceSet<Cpu> {
        let mut set = ResourceSet::new(capacity);
        for id in ids {
            set.set(*id);
        }
        set
    }

    #[test]
    fn membership() {
        let mut set = cpus(&[0, 3, 63, 64], 128);
        assert!(set.contains(0));
        assert!(set.contains(63));
        assert!(set.contains(64));
        assert!(!set.contains(1));
        assert!(!set.contains(200));
        assert_eq!(set.count(), 4);
        set.clear(63);
        assert!(!set.contains(63));
        set.clear(500);
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn from_bitmap() {
        let set = ResourceSet::<RemoteCore>::from_bitmap(&[0x05, 0x80]).unwrap();
        assert_eq!(set.capacity(), 16);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2, 15]);
        let too_big = [0u8; MAX_BITMAP_BYTES + 1];
        assert!(ResourceSet::<RemoteCore>::from_bitmap(&too_big).is_none());
        let full = [0xffu8; MAX_BITMAP_BYTES];
        let set = ResourceSet::<RemoteCore>::from_bitmap(&full).unwrap();
        assert_eq!(set.count(), MAX_RESOURCE_IDS);
    }

    #[test]
    fn iteration_order_and_exclusion() {
        let set = cpus(&[7, 1, 70, 4], 128);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 4, 7, 70]);
        assert_eq!(set.iter_except(Some(4)).collect::<Vec<_>>(), vec![1, 7, 70]);
        assert_eq!(set.iter_except(Some(5)).count(), 4);
        assert_eq!(ResourceSet::<Cpu>::new(0).iter().count(), 0);
    }

    #[test]
    fn subset_across_capacities() {
        let small = cpus(&[1, 2], 8);
        let large = cpus(&[0, 1, 2, 3, 100], 128);
        assert!(small.subset_of(&large));
        assert!(!large.subset_of(&small));
        assert!(ResourceSet::<Cpu>::new(4).subset_of(&small));
        assert!(small.intersects(&large));
        assert!(!small.intersects(&cpus(&[5], 8)));
    }

    #[test]
    fn union_and_difference() {
        let a = cpus(&[0, 1, 2], 8);
        let b = cpus(&[2, 3], 16);
        let u = a.union(&b);
        assert_eq!(u.capacity(), 16);
        assert_eq!(u.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let d = a.difference(&b);
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn transfer_moves_ids() {
        let mut root = cpus(&[0, 1, 2, 3], 4);
        let mut cell = ResourceSet::new(4);
        let ids = cpus(&[2, 3], 4);
        ResourceSet::transfer(&mut root, &mut cell, &ids);
        assert_eq!(root, cpus(&[0, 1], 4));
        assert_eq!(cell, ids);
        assert!(!root.intersects(&cell));
        ResourceSet::transfer(&mut cell, &mut root, &ids);
        assert_eq!(root, cpus(&[0, 1, 2, 3], 4));
        assert!(cell.is_empty());
    }

    #[test]
    fn split_at_boundary() {
        let set = ResourceSet::<RemoteCore>::from_bitmap(&[0b1001_0110]).unwrap();
        let (hw, soft) = set.split_at(3);
        assert_eq!(hw.iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(soft.iter().collect::<Vec<_>>(), vec![4, 7]);
    }

    #[test]
    fn debug_format() {
        let set = cpus(&[1, 3], 4);
        assert_eq!(format!("{:?}", set), "cpu{1, 3}");
    }
}
