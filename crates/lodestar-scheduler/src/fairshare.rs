//! Inverse-priority fair-share slicing.
//!
//! A queue's share of offered capacity is proportional to the inverse of its
//! priority: heavy recent users (high priority values) get less. Priorities
//! are floored at a minimum so idle queues cannot claim an unbounded share.

use std::collections::HashMap;

use lodestar_proto::ResourceVector;

/// Splits capacity across queues in inverse proportion to priority.
#[derive(Debug, Clone, Copy)]
pub struct FairShareSlicer {
    min_priority: f64,
}

impl FairShareSlicer {
    #[must_use]
    pub const fn new(min_priority: f64) -> Self {
        Self { min_priority }
    }

    #[must_use]
    pub const fn min_priority(&self) -> f64 {
        self.min_priority
    }

    /// Fraction of capacity each queue receives. Fractions sum to one.
    #[must_use]
    pub fn fractions(&self, priorities: &HashMap<String, f64>) -> HashMap<String, f64> {
        let inverse: HashMap<&str, f64> = priorities
            .iter()
            .map(|(queue, priority)| (queue.as_str(), 1.0 / priority.max(self.min_priority)))
            .collect();
        let total: f64 = inverse.values().sum();

        inverse
            .into_iter()
            .map(|(queue, inv)| (queue.to_owned(), inv / total))
            .collect()
    }

    /// Per-queue slice of `capacity`.
    #[must_use]
    pub fn slice(
        &self,
        priorities: &HashMap<String, f64>,
        capacity: &ResourceVector,
    ) -> HashMap<String, ResourceVector> {
        self.fractions(priorities)
            .into_iter()
            .map(|(queue, fraction)| (queue, capacity.scaled(fraction)))
            .collect()
    }
}
