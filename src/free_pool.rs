//! Sparse free-address tracking for a single range.
//!
//! A [`FreePool`] never enumerates its range. It records *used* slots as a
//! sorted map of merged, inclusive intervals and finds the next free slot by
//! jumping over at most one interval, so both memory and time scale with the
//! number of used intervals rather than with the size of the range. This is
//! what makes a `/64` (or larger) IPv6 pool practical.
//!
//! A slot is a single address for address pools, or one delegated prefix for
//! prefix pools (consecutive slots are `2^(128 - prefix_length)` apart).
//!
//! # Thread Safety
//!
//! Allocation and release for one pool are serialized by an internal
//! [`Mutex`]. [`contains`](FreePool::contains) and [`size`](FreePool::size)
//! only read immutable data and never take the lock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};
use crate::range::{AddressRange, ordinal};

#[derive(Debug, Default)]
struct FreeState {
    /// Used slot intervals: start slot -> inclusive end slot. Intervals never
    /// overlap and are never adjacent (adjacent intervals are merged).
    used: BTreeMap<u128, u128>,
    used_count: u128,
    /// Every slot below the cursor is used.
    cursor: u128,
}

impl FreeState {
    fn containing(&self, slot: u128) -> Option<(u128, u128)> {
        self.used
            .range(..=slot)
            .next_back()
            .filter(|(_, end)| **end >= slot)
            .map(|(start, end)| (*start, *end))
    }

    /// First free slot in `[from, limit]`.
    fn first_free(&self, from: u128, limit: u128) -> Option<u128> {
        if from > limit {
            return None;
        }
        match self.containing(from) {
            None => Some(from),
            // The slot after a merged interval is always free.
            Some((_, end)) if end < limit => Some(end + 1),
            Some(_) => None,
        }
    }

    fn insert(&mut self, slot: u128) -> bool {
        if self.containing(slot).is_some() {
            return false;
        }

        let mut start = slot;
        let mut end = slot;

        if slot > 0
            && let Some((left_start, _)) = self.containing(slot - 1)
        {
            self.used.remove(&left_start);
            start = left_start;
        }
        if let Some(right_end) = slot.checked_add(1).and_then(|next| self.used.remove(&next)) {
            end = right_end;
        }

        self.used.insert(start, end);
        self.used_count += 1;
        true
    }

    fn remove(&mut self, slot: u128) -> bool {
        let Some((start, end)) = self.containing(slot) else {
            return false;
        };

        self.used.remove(&start);
        if start < slot {
            self.used.insert(start, slot - 1);
        }
        if slot < end {
            self.used.insert(slot + 1, end);
        }
        self.used_count -= 1;
        if slot < self.cursor {
            self.cursor = slot;
        }
        true
    }
}

/// Allocator over one [`AddressRange`].
#[derive(Debug)]
pub struct FreePool {
    range: AddressRange,
    shift: u32,
    slots: u128,
    state: Mutex<FreeState>,
}

impl FreePool {
    /// Creates an address allocator where every address is one slot.
    pub fn new(range: AddressRange) -> Self {
        Self {
            slots: range.size(),
            range,
            shift: 0,
            state: Mutex::new(FreeState::default()),
        }
    }

    /// Creates a prefix allocator handing out `/prefix_length` prefixes from
    /// an IPv6 range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] for IPv4 ranges, for prefix lengths
    /// above 128, or when the range does not start and end on prefix
    /// boundaries.
    pub fn for_prefixes(range: AddressRange, prefix_length: u8) -> Result<Self> {
        if range.is_ipv4() || prefix_length == 0 || prefix_length > 128 {
            return Err(Error::InvalidRange(format!(
                "{range}: cannot delegate /{prefix_length} prefixes"
            )));
        }
        let shift = 128 - u32::from(prefix_length);
        let mask = low_mask(shift);
        if range.start_ordinal() & mask != 0 || range.end_ordinal() & mask != mask {
            return Err(Error::InvalidRange(format!(
                "{range}: not aligned to /{prefix_length} boundaries"
            )));
        }
        let slots = ((range.end_ordinal() - range.start_ordinal()) >> shift) + 1;
        Ok(Self {
            range,
            shift,
            slots,
            state: Mutex::new(FreeState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, FreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_of(&self, ip: IpAddr) -> Option<u128> {
        if !self.range.contains(ip) {
            return None;
        }
        let offset = ordinal(ip) - self.range.start_ordinal();
        if offset & low_mask(self.shift) != 0 {
            return None;
        }
        Some(offset >> self.shift)
    }

    fn address_of(&self, slot: u128) -> IpAddr {
        self.range
            .address(self.range.start_ordinal() + (slot << self.shift))
    }

    pub fn range(&self) -> &AddressRange {
        &self.range
    }

    /// Returns true if `ip` is a slot address of this pool.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.slot_of(ip).is_some()
    }

    /// Total number of slots; constant for the life of the pool.
    pub fn size(&self) -> u128 {
        self.slots
    }

    pub fn used_count(&self) -> u128 {
        self.state().used_count
    }

    pub fn free_count(&self) -> u128 {
        self.slots - self.used_count()
    }

    /// Returns true if `ip` is in the pool and currently used.
    pub fn is_used(&self, ip: IpAddr) -> bool {
        match self.slot_of(ip) {
            Some(slot) => self.state().containing(slot).is_some(),
            None => false,
        }
    }

    /// Claims and returns the lowest free address, or `None` when every slot
    /// is used.
    ///
    /// The search runs from the cursor to the end of the range and then wraps
    /// once to the start.
    pub fn allocate_next(&self) -> Option<IpAddr> {
        let last = self.slots - 1;
        let mut state = self.state();
        let cursor = state.cursor;

        let found = state.first_free(cursor, last).or_else(|| {
            if cursor == 0 {
                None
            } else {
                state.first_free(0, (cursor - 1).min(last))
            }
        })?;

        state.insert(found);
        state.cursor = found + 1;
        Some(self.address_of(found))
    }

    /// Marks `ip` used. Returns true if it was previously free.
    ///
    /// Addresses outside the pool are ignored.
    pub fn mark_used(&self, ip: IpAddr) -> bool {
        match self.slot_of(ip) {
            Some(slot) => self.state().insert(slot),
            None => {
                debug!("Ignoring mark_used for {} outside {}", ip, self.range);
                false
            }
        }
    }

    /// Marks `ip` free. Returns true if it was previously used.
    ///
    /// Addresses outside the pool are ignored.
    pub fn mark_free(&self, ip: IpAddr) -> bool {
        match self.slot_of(ip) {
            Some(slot) => self.state().remove(slot),
            None => {
                debug!("Ignoring mark_free for {} outside {}", ip, self.range);
                false
            }
        }
    }

    /// Number of used intervals currently tracked.
    pub fn interval_count(&self) -> usize {
        self.state().used.len()
    }
}

fn low_mask(shift: u32) -> u128 {
    if shift == 0 {
        0
    } else if shift >= 128 {
        u128::MAX
    } else {
        (1u128 << shift) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    fn pool(text: &str) -> FreePool {
        FreePool::new(AddressRange::parse(text).unwrap())
    }

    #[test]
    fn test_sequential_allocation_then_exhaustion() {
        let pool = pool("10.0.0.10-10.0.0.12");
        assert_eq!(pool.allocate_next(), Some(ip("10.0.0.10")));
        assert_eq!(pool.allocate_next(), Some(ip("10.0.0.11")));
        assert_eq!(pool.allocate_next(), Some(ip("10.0.0.12")));
        assert_eq!(pool.allocate_next(), None);
        assert_eq!(pool.used_count(), 3);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_freed_address_is_offered_first() {
        let pool = pool("10.0.0.10-10.0.0.12");
        for _ in 0..3 {
            pool.allocate_next();
        }
        assert!(pool.mark_free(ip("10.0.0.11")));
        assert_eq!(pool.allocate_next(), Some(ip("10.0.0.11")));
        assert_eq!(pool.allocate_next(), None);
    }

    #[test]
    fn test_allocation_skips_used_intervals() {
        let pool = pool("192.168.1.100-192.168.1.200");
        for last in 100..=150u8 {
            pool.mark_used(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)));
        }
        assert_eq!(pool.interval_count(), 1);
        assert_eq!(pool.allocate_next(), Some(ip("192.168.1.151")));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let pool = pool("10.0.0.0/30");
        assert!(pool.mark_used(ip("10.0.0.2")));
        assert!(!pool.mark_used(ip("10.0.0.2")));
        assert_eq!(pool.used_count(), 1);
        assert!(pool.mark_free(ip("10.0.0.2")));
        assert!(!pool.mark_free(ip("10.0.0.2")));
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_outside_range_is_ignored() {
        let pool = pool("10.0.0.0/30");
        assert!(!pool.mark_used(ip("10.0.0.9")));
        assert!(!pool.mark_free(ip("10.0.0.9")));
        assert!(!pool.mark_used(ip("2001:db8::1")));
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_split_and_merge_intervals() {
        let pool = pool("10.0.0.0/24");
        for last in 0..10u8 {
            pool.mark_used(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)));
        }
        assert_eq!(pool.interval_count(), 1);
        pool.mark_free(ip("10.0.0.5"));
        assert_eq!(pool.interval_count(), 2);
        pool.mark_used(ip("10.0.0.5"));
        assert_eq!(pool.interval_count(), 1);
        assert_eq!(pool.used_count(), 10);
    }

    #[test]
    fn test_huge_ipv6_range() {
        let pool = pool("2001:db8::/64");
        assert_eq!(pool.size(), 1u128 << 64);
        assert_eq!(pool.allocate_next(), Some(ip("2001:db8::")));
        assert_eq!(pool.allocate_next(), Some(ip("2001:db8::1")));
        pool.mark_used(ip("2001:db8::ffff:ffff:ffff:ffff"));
        assert_eq!(pool.free_count(), (1u128 << 64) - 3);
    }

    #[test]
    fn test_prefix_slots() {
        let range = AddressRange::parse("2001:db8:100::/40").unwrap();
        let pool = FreePool::for_prefixes(range, 48).unwrap();
        assert_eq!(pool.size(), 256);
        assert_eq!(pool.allocate_next(), Some(ip("2001:db8:100::")));
        assert_eq!(pool.allocate_next(), Some(ip("2001:db8:101::")));
        assert!(pool.contains(ip("2001:db8:1ff::")));
        assert!(!pool.contains(ip("2001:db8:100::1")));
    }

    #[test]
    fn test_prefix_pool_requires_alignment() {
        let range = AddressRange::parse("2001:db8::1-2001:db8::ffff").unwrap();
        assert!(FreePool::for_prefixes(range, 120).is_err());
        let v4 = AddressRange::parse("10.0.0.0/24").unwrap();
        assert!(FreePool::for_prefixes(v4, 28).is_err());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let pool = Arc::new(pool("10.1.0.0/22"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(addr) = pool.allocate_next() {
                        mine.push(addr);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert!(pool.range().contains(addr));
                assert!(seen.insert(addr), "{addr} handed out twice");
            }
        }
        assert_eq!(seen.len(), 1024);
        assert_eq!(pool.free_count(), 0);
    }
}
