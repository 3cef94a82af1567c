//! Per-struct field id allocation with LIFO reuse.

use serde::{Deserialize, Serialize};

/// Stable field identity within one struct. Zero is never allocated.
pub type FieldId = u64;

/// Small-integer id allocator. Freed ids are reused last-in-first-out, so an
/// id may later refer to a different field; callers validate through
/// generation-checked handles instead of caching raw ids.
///
/// The allocator state persists with the owning struct so reloaded documents
/// keep allocating from where they left off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    last_field_id: FieldId,
    free_ids: Vec<FieldId>,
}

impl IdAllocator {
    pub const INVALID_ID: FieldId = 0;

    pub fn allocate(&mut self) -> FieldId {
        if let Some(id) = self.free_ids.pop() {
            return id;
        }
        self.last_field_id += 1;
        self.last_field_id
    }

    pub fn free(&mut self, id: FieldId) {
        self.free_ids.push(id);
    }

    /// Drops `id` from the free list, for ids re-claimed explicitly during
    /// deserialization.
    pub fn remove_free_id(&mut self, id: FieldId) {
        self.free_ids.retain(|&free| free != id);
    }

    /// Marks `id` as handed out even when it was never allocated, bumping
    /// the high-water mark as needed.
    pub fn claim(&mut self, id: FieldId) {
        self.remove_free_id(id);
        if id > self.last_field_id {
            self.last_field_id = id;
        }
    }

    pub fn clear(&mut self) {
        self.last_field_id = 0;
        self.free_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_count_up() {
        let mut alloc = IdAllocator::default();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn freed_ids_are_reused_lifo() {
        let mut alloc = IdAllocator::default();
        let first = alloc.allocate();
        let second = alloc.allocate();
        alloc.free(first);
        alloc.free(second);
        assert_eq!(alloc.allocate(), second);
        assert_eq!(alloc.allocate(), first);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn remove_free_id_prevents_reuse() {
        let mut alloc = IdAllocator::default();
        let id = alloc.allocate();
        alloc.free(id);
        alloc.remove_free_id(id);
        assert_eq!(alloc.allocate(), 2);
    }

    #[test]
    fn claim_bumps_the_high_water_mark() {
        let mut alloc = IdAllocator::default();
        alloc.claim(7);
        assert_eq!(alloc.allocate(), 8);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut alloc = IdAllocator::default();
        alloc.allocate();
        let id = alloc.allocate();
        alloc.free(id);

        let json = serde_json::to_string(&alloc).unwrap();
        let restored: IdAllocator = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, alloc);
    }
}
