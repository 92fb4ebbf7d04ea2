use crate::firestore::model::TargetId;

const RESERVED_BITS: u32 = 1;

/// Hands out target ids from one of two disjoint sequences: even ids for persisted query
/// targets, odd ids for the sync engine's limbo resolutions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetIdGenerator {
    generator_id: TargetId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    fn new(generator_id: TargetId, seed: TargetId) -> Self {
        let mut generator = Self {
            generator_id,
            next_id: 0,
        };
        generator.seek(seed);
        generator
    }

    /// Even ids strictly greater than `highest`.
    pub fn for_target_cache(highest: TargetId) -> Self {
        Self::new(0, highest + 1)
    }

    /// Odd ids starting at 1. Never persisted, so every session starts over.
    pub fn for_sync_engine() -> Self {
        Self::new(1, 1)
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }

    fn seek(&mut self, seed: TargetId) {
        let mask = (1 << RESERVED_BITS) - 1;
        let candidate = (seed & !mask) | self.generator_id;
        self.next_id = if candidate >= seed {
            candidate
        } else {
            candidate + (1 << RESERVED_BITS)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_ids_are_even_and_increasing() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next_id(), 2);
        assert_eq!(generator.next_id(), 4);

        let mut resumed = TargetIdGenerator::for_target_cache(6);
        assert_eq!(resumed.next_id(), 8);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        let ids: Vec<_> = (0..3).map(|_| generator.next_id()).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }
}
