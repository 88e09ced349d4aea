//! Client id bookkeeping.
//!
//! Used ids are stored as disjoint, non-adjacent inclusive ranges keyed by their first id, so
//! long runs of generated ids cost a single map entry. Id 0 is reserved and never handed out.

use std::collections::BTreeMap;

pub const INVALID_ID: u32 = 0;

#[derive(Clone, Debug, Default)]
pub struct IdAllocator {
    /// start -> end (inclusive)
    used: BTreeMap<u32, u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free id. Returns [`INVALID_ID`] when the space is exhausted.
    pub fn allocate_id(&mut self) -> u32 {
        self.allocate_id_at_or_above(1)
    }

    /// Allocate the lowest free id that is `>= desired`.
    pub fn allocate_id_at_or_above(&mut self, desired: u32) -> u32 {
        let mut candidate = desired.max(1);
        if let Some((_, &end)) = self.range_containing(candidate) {
            if end == u32::MAX {
                return INVALID_ID;
            }
            candidate = end + 1;
        }
        self.insert(candidate);
        candidate
    }

    /// Mark `id` as used. Returns `false` if it is reserved or already in use.
    pub fn mark_as_used(&mut self, id: u32) -> bool {
        if self.in_use(id) {
            return false;
        }
        self.insert(id);
        true
    }

    pub fn free_id(&mut self, id: u32) {
        let Some((&start, &end)) = self.range_containing(id) else {
            return;
        };
        self.used.remove(&start);
        if start < id {
            self.used.insert(start, id - 1);
        }
        if id < end {
            self.used.insert(id + 1, end);
        }
    }

    pub fn in_use(&self, id: u32) -> bool {
        id == INVALID_ID || self.range_containing(id).is_some()
    }

    fn range_containing(&self, id: u32) -> Option<(&u32, &u32)> {
        self.used
            .range(..=id)
            .next_back()
            .filter(|(_, &end)| end >= id)
    }

    fn insert(&mut self, id: u32) {
        let mut start = id;
        let mut end = id;
        let prev = id
            .checked_sub(1)
            .and_then(|p| self.range_containing(p).map(|(&s, _)| s));
        if let Some(prev_start) = prev {
            self.used.remove(&prev_start);
            start = prev_start;
        }
        if let Some(next) = id.checked_add(1) {
            if let Some(next_end) = self.used.remove(&next) {
                end = next_end;
            }
        }
        self.used.insert(start, end);
    }

    #[cfg(test)]
    fn range_count(&self) -> usize {
        self.used.len()
    }
}
