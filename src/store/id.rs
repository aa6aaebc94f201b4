use std::fmt::Debug;

use rand::Rng;

use crate::data_types::EntityId;

pub trait IdGenerator: Send + Sync + Debug {
    /// A fresh positive surrogate id.
    fn next_id(&self) -> EntityId;
}

#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> EntityId {
        rand::thread_rng().gen_range(1..EntityId::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_random_ids_are_positive_and_distinct() {
        let generator = RandomIdGenerator;
        let ids: HashSet<EntityId> = (0..1000).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| *id > 0));
    }
}
