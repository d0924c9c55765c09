//! Core data types shared by the node and its clients

use serde::{Deserialize, Serialize};

/// Block identifier, unique within one node and always below the pool capacity
pub type BlockId = u64;

/// Point-in-time view of a block pool's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub allocated: usize,
}

impl PoolStats {
    /// Ids popped from the free list whose backing file is still being created.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.free + self.allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_is_the_unaccounted_remainder() {
        let settled = PoolStats {
            capacity: 4,
            free: 1,
            allocated: 3,
        };
        assert_eq!(settled.in_flight(), 0);

        let allocating = PoolStats {
            capacity: 4,
            free: 1,
            allocated: 1,
        };
        assert_eq!(allocating.in_flight(), 2);
    }
}
