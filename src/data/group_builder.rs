//! Two-pass lock-free bucket construction.
//!
//! [`ParallelGroupBuilder`] turns unordered (group, value) pairs produced by
//! multiple parallel workers into a bucket layout (per-group offset array
//! plus a flat value array) in exactly two passes:
//!
//! ```text
//! 1. budget pass:  every thread counts its own (thread, group) pairs
//! 2. init_storage: per-group totals, disjoint per-thread sub-ranges,
//!                  one exact-size allocation
//! 3. fill pass:    every thread writes into its pre-assigned sub-ranges
//! ```
//!
//! During the fill pass no thread ever writes outside its own disjoint
//! range, so there are no locks and no reallocation under contention. The
//! price is a strict replay contract: the fill pass must emit, per thread,
//! the exact same (group, thread) call sequence as the budget pass, in the
//! same order. Any divergence silently corrupts the output, which is why
//! [`add_budget`](ParallelGroupBuilder::add_budget) and
//! [`push`](ParallelGroupBuilder::push) are `unsafe`.

/// Wrapper to make raw pointers Send + Sync.
///
/// # Safety
///
/// The caller must ensure that the pointer is valid and that concurrent
/// access to the pointed-to data is safe (i.e., each thread accesses a
/// disjoint region).
#[derive(Clone, Copy)]
struct SendSyncPtr<T>(*mut T);

// SAFETY: disjoint access is guaranteed by the builder's call contract;
// each thread id maps to its own counters and its own output sub-ranges.
unsafe impl<T> Send for SendSyncPtr<T> {}
unsafe impl<T> Sync for SendSyncPtr<T> {}

impl<T> SendSyncPtr<T> {
    fn null() -> Self {
        Self(std::ptr::null_mut())
    }
}

/// Lock-free two-pass builder for variable-length groups.
///
/// `T` is the stored value type. Counters are laid out thread-major
/// (`[tid * n_groups + group]`) so each thread's working set is contiguous.
pub struct ParallelGroupBuilder<T> {
    n_groups: usize,
    n_threads: usize,
    /// Per-(thread, group) entry counts from the budget pass.
    budget: Vec<usize>,
    /// Per-(thread, group) next free absolute slot during the fill pass.
    cursor: Vec<usize>,
    /// Per-group output boundaries, length `n_groups + 1`.
    offsets: Vec<u64>,
    data: Vec<T>,
    budget_ptr: SendSyncPtr<usize>,
    cursor_ptr: SendSyncPtr<usize>,
    data_ptr: SendSyncPtr<T>,
}

impl<T: Copy + Default + Send> ParallelGroupBuilder<T> {
    pub fn new() -> Self {
        Self {
            n_groups: 0,
            n_threads: 0,
            budget: Vec::new(),
            cursor: Vec::new(),
            offsets: Vec::new(),
            data: Vec::new(),
            budget_ptr: SendSyncPtr::null(),
            cursor_ptr: SendSyncPtr::null(),
            data_ptr: SendSyncPtr::null(),
        }
    }

    /// Allocate a zeroed counter per (thread, group) pair.
    pub fn init_budget(&mut self, n_groups: usize, n_threads: usize) {
        self.n_groups = n_groups;
        self.n_threads = n_threads.max(1);
        self.budget = vec![0; self.n_threads * n_groups];
        self.budget_ptr = SendSyncPtr(self.budget.as_mut_ptr());
    }

    /// Count one value for `group` on behalf of thread `tid`.
    ///
    /// # Safety
    ///
    /// `group < n_groups`, `tid < n_threads`, and concurrent callers must
    /// pass distinct `tid`s: each thread may only touch its own counters.
    #[inline]
    pub unsafe fn add_budget(&self, group: usize, tid: usize) {
        debug_assert!(group < self.n_groups);
        debug_assert!(tid < self.n_threads);
        let slot = self.budget_ptr.0.add(tid * self.n_groups + group);
        *slot += 1;
    }

    /// Sum the budget across threads, assign each thread a disjoint
    /// contiguous sub-range inside every group's segment (thread-ordered
    /// striping), and allocate the output arrays at their exact final size.
    pub fn init_storage(&mut self) {
        self.offsets = vec![0u64; self.n_groups + 1];
        for g in 0..self.n_groups {
            let total: usize = (0..self.n_threads)
                .map(|t| self.budget[t * self.n_groups + g])
                .sum();
            self.offsets[g + 1] = self.offsets[g] + total as u64;
        }

        // Thread t's sub-range in group g starts after every lower-numbered
        // thread's share of g. Deterministic layout, not emission order.
        self.cursor = vec![0usize; self.n_threads * self.n_groups];
        for g in 0..self.n_groups {
            let mut pos = self.offsets[g] as usize;
            for t in 0..self.n_threads {
                self.cursor[t * self.n_groups + g] = pos;
                pos += self.budget[t * self.n_groups + g];
            }
        }

        let total = *self.offsets.last().expect("offsets nonempty") as usize;
        self.data = vec![T::default(); total];
        self.cursor_ptr = SendSyncPtr(self.cursor.as_mut_ptr());
        self.data_ptr = SendSyncPtr(self.data.as_mut_ptr());
    }

    /// Write `value` into thread `tid`'s next free slot in `group`.
    ///
    /// # Safety
    ///
    /// [`init_storage`](Self::init_storage) must have run. Concurrent
    /// callers must pass distinct `tid`s, and the overall fill pass must
    /// replay, per thread, the exact (group, tid) sequence of the budget
    /// pass, in the same order.
    #[inline]
    pub unsafe fn push(&self, group: usize, value: T, tid: usize) {
        debug_assert!(group < self.n_groups);
        debug_assert!(tid < self.n_threads);
        let cur = self.cursor_ptr.0.add(tid * self.n_groups + group);
        let slot = *cur;
        *cur += 1;
        debug_assert!(slot < self.data.len());
        *self.data_ptr.0.add(slot) = value;
    }

    /// Consume the builder, returning the per-group offset array (length
    /// `n_groups + 1`, starting at 0) and the flat value array.
    pub fn into_parts(self) -> (Vec<u64>, Vec<T>) {
        (self.offsets, self.data)
    }
}

impl<T: Copy + Default + Send> Default for ParallelGroupBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}
