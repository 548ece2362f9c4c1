use std::sync::atomic::{AtomicU64, Ordering};

use ulid::Ulid;

/// Hands out identities for resources, capacity windows and allocations.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Ulid;
}

/// Time-ordered random ULIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn next_id(&self) -> Ulid {
        Ulid::new()
    }
}

/// Deterministic ULIDs whose timestamp part is a counter (1, 2, 3, ...).
#[derive(Debug, Default)]
pub struct SequentialIds {
    issued: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after `issued` ids have already been handed out.
    pub fn starting_after(issued: u64) -> Self {
        Self {
            issued: AtomicU64::new(issued),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> Ulid {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        Ulid::from_parts(n, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_are_ordered_and_repeatable() {
        let a = SequentialIds::new();
        let b = SequentialIds::new();
        let first: Vec<Ulid> = (0..3).map(|_| a.next_id()).collect();
        let second: Vec<Ulid> = (0..3).map(|_| b.next_id()).collect();
        assert_eq!(first, second);
        assert!(first[0] < first[1] && first[1] < first[2]);
    }

    #[test]
    fn starting_after_skips_issued() {
        let ids = SequentialIds::starting_after(41);
        assert_eq!(ids.next_id(), Ulid::from_parts(42, 0));
    }
}
