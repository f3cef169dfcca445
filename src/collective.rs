//! Distributed reduction contract.
//!
//! Cluster identity is an explicit handle, not ambient state: every
//! operation that needs rank, world size, or a reduction takes a
//! [`Communicator`], so tests can inject single- or multi-rank contexts
//! deterministically.
//!
//! The collectives are synchronous and blocking. Every participating worker
//! must issue the same sequence of collective calls in the same order, or
//! the whole job deadlocks; code paths in this crate that start a collective
//! are reached identically by every worker, and implementations of the
//! transport must preserve that property.

/// Handle to the distributed worker group this process belongs to.
pub trait Communicator: Send + Sync {
    /// This worker's index within the group, in `0..world_size()`.
    fn rank(&self) -> usize;

    /// Number of cooperating workers.
    fn world_size(&self) -> usize;

    /// Whether this process is part of a multi-worker job.
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// Elementwise sum of `buf` across all workers; every worker receives
    /// the aggregate in place.
    fn allreduce_sum(&self, buf: &mut [u64]);

    /// Elementwise maximum of `buf` across all workers.
    fn allreduce_max(&self, buf: &mut [u64]);
}

/// The non-distributed default: one worker, reductions are identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleWorker;

impl Communicator for SingleWorker {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _buf: &mut [u64]) {}

    fn allreduce_max(&self, _buf: &mut [u64]) {}
}

/// Deterministic in-process stand-in for a worker group.
///
/// Each simulated peer `r` contributes `contributions[r]` to every
/// collective (shorter contributions are treated as zero-extended). This is
/// enough to exercise the shape-reconciliation protocol, where a worker's
/// contribution is its local column count, from a single test process.
#[derive(Debug, Clone)]
pub struct StaticGroup {
    rank: usize,
    contributions: Vec<Vec<u64>>,
}

impl StaticGroup {
    /// Build the group member for `rank`, given every rank's contribution.
    pub fn new(rank: usize, contributions: Vec<Vec<u64>>) -> Self {
        assert!(rank < contributions.len(), "rank outside the group");
        Self { rank, contributions }
    }

    fn peers(&self) -> impl Iterator<Item = &Vec<u64>> {
        let rank = self.rank;
        self.contributions
            .iter()
            .enumerate()
            .filter(move |(r, _)| *r != rank)
            .map(|(_, c)| c)
    }
}

impl Communicator for StaticGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.contributions.len()
    }

    fn allreduce_sum(&self, buf: &mut [u64]) {
        for peer in self.peers() {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot += peer.get(i).copied().unwrap_or(0);
            }
        }
    }

    fn allreduce_max(&self, buf: &mut [u64]) {
        for peer in self.peers() {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = (*slot).max(peer.get(i).copied().unwrap_or(0));
            }
        }
    }
}
