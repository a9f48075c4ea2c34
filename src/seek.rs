//! Immutable, precomputed per-operation seek plan (§3 "Seek Plan").

pub use crate::clock::OpKind;
use crate::clock::PicoSeconds;

/// One scheduled operation.
#[derive(Debug, Clone, Copy)]
pub struct Seek {
    pub block_location: u64,
    pub op_kind: OpKind,
    pub scheduled_time: PicoSeconds,
}

/// Whether every operation re-resolves `Seek[i]` (the default) or always
/// reseeks to `Seek[0]` (`SEEK_NONE`, used by sequential-only workloads that
/// never want to jump around between ops).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPolicy {
    PerOperation,
    SeekNone,
}

/// An ordered, immutable sequence of scheduled operations, one per worker.
#[derive(Debug)]
pub struct SeekPlan {
    seeks: Vec<Seek>,
    policy: SeekPolicy,
}

impl SeekPlan {
    pub fn new(seeks: Vec<Seek>, policy: SeekPolicy) -> Self {
        SeekPlan { seeks, policy }
    }

    /// A plan that issues sequential, equally spaced block locations with a
    /// fixed throttle schedule of `0` (no pacing) for every operation.
    pub fn sequential(operations: u64, op_kind: OpKind) -> Self {
        let seeks = (0..operations)
            .map(|i| Seek {
                block_location: i,
                op_kind,
                scheduled_time: 0,
            })
            .collect();
        SeekPlan::new(seeks, SeekPolicy::PerOperation)
    }

    /// A plan for one of `stride` workers sharing a target: worker `offset`
    /// is assigned every `stride`-th block, so the target's blocks are
    /// interleaved round-robin across its worker pool rather than each
    /// worker separately restarting at block zero.
    pub fn striped(operations_per_worker: u64, stride: u64, offset: u64, op_kind: OpKind) -> Self {
        let seeks = (0..operations_per_worker)
            .map(|i| Seek {
                block_location: i * stride + offset,
                op_kind,
                scheduled_time: 0,
            })
            .collect();
        SeekPlan::new(seeks, SeekPolicy::PerOperation)
    }

    pub fn len(&self) -> usize {
        self.seeks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeks.is_empty()
    }

    pub fn policy(&self) -> SeekPolicy {
        self.policy
    }

    /// Resolve the seek to use for operation `i`, honoring `SEEK_NONE`.
    pub fn resolve(&self, i: u64) -> Seek {
        let idx = match self.policy {
            SeekPolicy::SeekNone => 0,
            SeekPolicy::PerOperation => i as usize,
        };
        self.seeks[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_none_always_returns_first_entry() {
        let seeks = vec![
            Seek { block_location: 0, op_kind: OpKind::Write, scheduled_time: 0 },
            Seek { block_location: 7, op_kind: OpKind::Write, scheduled_time: 0 },
        ];
        let plan = SeekPlan::new(seeks, SeekPolicy::SeekNone);
        assert_eq!(plan.resolve(0).block_location, 0);
        assert_eq!(plan.resolve(1).block_location, 0);
    }

    #[test]
    fn per_operation_resolves_by_index() {
        let plan = SeekPlan::sequential(4, OpKind::Read);
        assert_eq!(plan.resolve(2).block_location, 2);
    }

    #[test]
    fn striped_interleaves_workers() {
        let worker0 = SeekPlan::striped(3, 2, 0, OpKind::Write);
        let worker1 = SeekPlan::striped(3, 2, 1, OpKind::Write);
        assert_eq!(worker0.resolve(0).block_location, 0);
        assert_eq!(worker0.resolve(1).block_location, 2);
        assert_eq!(worker1.resolve(0).block_location, 1);
        assert_eq!(worker1.resolve(1).block_location, 3);
    }
}
