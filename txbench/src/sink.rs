//! Shared metrics sink written by every lane.
use parking_lot::Mutex;

use crate::{aggregate::Aggregate, metric::IterationMetric};

/// Concurrent, append-only sink of [`IterationMetric`]s.
///
/// Every lane owns one slot guarded by its own mutex, so `record` never contends
/// with other lanes and keeps the arrival order of each lane. The snapshot merges
/// the slots in lane order once the run is over.
#[derive(Debug)]
pub struct MetricsSink<A> {
    slots: Vec<Mutex<A>>,
}

impl<A: Aggregate> MetricsSink<A> {
    pub fn new(lanes: usize) -> Self {
        Self {
            slots: (0..lanes.max(1)).map(|_| Mutex::new(A::new())).collect(),
        }
    }

    pub fn lanes(&self) -> usize {
        self.slots.len()
    }

    /// Record one logical iteration. Safe to call from any lane.
    ///
    /// Lane indexes past the configured count wrap around.
    pub fn record(&self, metric: &IterationMetric) {
        let slot = metric.lane % self.slots.len();
        self.slots[slot].lock().consume(metric);
    }

    /// Merge every lane into one aggregate.
    pub fn snapshot(&self) -> A {
        let mut merged = A::new();
        for slot in &self.slots {
            merged.merge(slot.lock().clone());
        }
        merged
    }

    /// Consume the sink, merging without cloning.
    pub fn into_snapshot(self) -> A {
        let mut merged = A::new();
        for slot in self.slots {
            merged.merge(slot.into_inner());
        }
        merged
    }
}
