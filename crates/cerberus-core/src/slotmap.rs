//! The slot map (spec.md §4.3), grounded directly on
//! `original_source/core/slot_map.hpp`'s `SlotMap<Type>` template: an
//! ordered `slot -> Address` map keyed by range upper bound, plus an
//! `Address -> Backend` map that can be atomically swapped on refresh.

use crate::addr::Address;
use hashbrown::HashMap;
use rand::RngExt;
use std::collections::BTreeMap;

use crate::slot::SLOT_COUNT;

pub struct SlotMap<T> {
    slot_ranges: BTreeMap<u16, Address>,
    addr_to_val: HashMap<Address, T>,
}

impl<T> SlotMap<T> {
    pub fn new() -> SlotMap<T> {
        SlotMap {
            slot_ranges: BTreeMap::new(),
            addr_to_val: HashMap::new(),
        }
    }

    pub fn all_covered(&self) -> bool {
        self.slot_ranges.contains_key(&SLOT_COUNT)
    }

    /// The first entry with key > `slot`, i.e. the range that contains it:
    /// ranges are keyed by upper bound (`highest_owned_slot + 1`), so the
    /// owner of `slot` is the first key strictly greater than it, not the
    /// first key greater-or-equal. `slot` itself must be a valid slot index
    /// (`< SLOT_COUNT`); the sentinel boundary value `SLOT_COUNT` used as a
    /// range key is never a slot anything can be routed to.
    fn covering_addr(&self, slot: u16) -> Option<&Address> {
        if slot >= SLOT_COUNT {
            return None;
        }
        self.slot_ranges.range(slot + 1..).next().map(|(_, addr)| addr)
    }

    /// Public form of `covering_addr`, for callers that need the owning
    /// address without going through `get_by_slot`'s lazy construction.
    pub fn addr_for_slot(&self, slot: u16) -> Option<&Address> {
        self.covering_addr(slot)
    }

    /// Associates `addr` with `val`, overwriting any existing entry.
    pub fn set(&mut self, addr: Address, val: T) {
        self.addr_to_val.insert(addr, val);
    }

    /// Samples a slot uniformly and returns the covering entry's address,
    /// retrying on miss. Bounded so an uncovered map can't loop forever.
    pub fn random_addr(&self) -> Option<&Address> {
        if self.slot_ranges.is_empty() {
            return None;
        }

        let mut rng = rand::rng();
        for _ in 0..64 {
            let slot = rng.random_range(0..SLOT_COUNT);
            if let Some(addr) = self.covering_addr(slot) {
                return Some(addr);
            }
        }
        None
    }

    /// Atomically replaces the slot range map. Backends whose address is
    /// still referenced by `new_ranges` are carried over (same fd, same
    /// inflight/staged queues); everything else is drained out for the
    /// caller to close.
    pub fn set_map(&mut self, new_ranges: BTreeMap<u16, Address>) -> Vec<T> {
        let mut carried = HashMap::with_capacity(self.addr_to_val.len());
        let mut evicted = Vec::new();

        for (addr, val) in self.addr_to_val.drain() {
            if new_ranges.values().any(|a| *a == addr) {
                carried.insert(addr, val);
            } else {
                evicted.push(val);
            }
        }

        self.addr_to_val = carried;
        self.slot_ranges = new_ranges;
        evicted
    }

    /// Removes a backend by identity without touching the slot ranges
    /// (used when a backend's socket has died outside of a refresh).
    pub fn erase(&mut self, addr: &Address) -> Option<T> {
        self.addr_to_val.remove(addr)
    }

    pub fn get(&self, addr: &Address) -> Option<&T> {
        self.addr_to_val.get(addr)
    }

    pub fn live_addresses(&self) -> impl Iterator<Item = &Address> {
        self.addr_to_val.keys()
    }
}

impl<T> Default for SlotMap<T> {
    fn default() -> SlotMap<T> {
        SlotMap::new()
    }
}
