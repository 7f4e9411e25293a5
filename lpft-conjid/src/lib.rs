//! Conjunction-Id Allocator (§4.2): a free-list backed 32-bit id pool,
//! keyed by `(flow_id, datapath_id)`, with reuse of freed ranges so that
//! ids stay stable across incremental updates rather than drifting
//! upward forever.
//!
//! Exhaustion is the one fatal condition in this whole crate (§4.2, §7):
//! a running system with 2^32 live conjunction-id-bearing flows is
//! inconceivable, so we abort rather than plumb an error through every
//! caller for a case that cannot happen in practice.

use std::collections::BTreeMap;

use fxhash::FxHashMap;
use lpft_core::{ConjId, ConjRange, DatapathId, FlowId};

#[derive(Debug, Default)]
pub struct ConjIdAllocator {
    /// Ranges below `watermark` that have been freed and can be reused,
    /// keyed by start address, coalesced with adjacent free ranges.
    free: BTreeMap<u32, u32>,
    /// The first id never yet handed out.
    watermark: u64,
    owned: FxHashMap<(FlowId, DatapathId), ConjRange>,
}

impl ConjIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, flow: FlowId, dp: DatapathId) -> Option<ConjId> {
        self.owned.get(&(flow, dp)).map(|r| r.first)
    }

    /// Allocates `n` consecutive ids for `(flow, dp)`. Reuses the lowest
    /// free range big enough (first-fit) before extending the watermark.
    pub fn alloc(&mut self, flow: FlowId, dp: DatapathId, n: u32) -> ConjId {
        assert!(n > 0, "cannot allocate zero conjunction ids");
        let first = if let Some(first) = self.take_free(n) {
            first
        } else {
            self.bump_watermark(n)
        };
        let first = ConjId(first);
        self.owned.insert((flow, dp), ConjRange { first, n });
        first
    }

    /// Requests a *specific* range, used by the cache on a hit so a
    /// previously-computed `(first_id, n_conjs)` pair can be reinstated
    /// verbatim (§3 `CacheEntry::Matches`). Fails without side effects if
    /// any id in `[first, first+n)` is already taken.
    pub fn alloc_specified(
        &mut self,
        flow: FlowId,
        dp: DatapathId,
        first: ConjId,
        n: u32,
    ) -> bool {
        if !self.range_is_free(first.0, n) {
            return false;
        }
        self.reserve_range(first.0, n);
        self.owned.insert((flow, dp), ConjRange { first, n });
        true
    }

    /// Releases every range owned by `flow`, across all datapaths (§4.2).
    pub fn free_for_flow(&mut self, flow: FlowId) {
        let keys: Vec<_> =
            self.owned.keys().filter(|(f, _)| *f == flow).cloned().collect();
        for k in keys {
            if let Some(range) = self.owned.remove(&k) {
                self.release(range.first.0, range.n);
            }
        }
    }

    fn range_is_free(&self, first: u32, n: u32) -> bool {
        let end = match first.checked_add(n) {
            Some(e) => e,
            None => return false,
        };
        if (first as u64) >= self.watermark {
            return true;
        }
        if (end as u64) > self.watermark {
            // straddles the watermark: the part above it is free by
            // definition, the part below must be a subset of one free run.
            return self.covers(first, self.watermark as u32 - first);
        }
        self.covers(first, n)
    }

    fn covers(&self, first: u32, n: u32) -> bool {
        let end = first + n;
        match self.free.range(..=first).next_back() {
            Some((&start, &len)) => start <= first && start + len >= end,
            None => false,
        }
    }

    fn reserve_range(&mut self, first: u32, n: u32) {
        let end = first + n;
        if (first as u64) >= self.watermark {
            // purely a tail reservation; advance the watermark to cover it.
            self.watermark = self.watermark.max(end as u64);
            return;
        }
        if let Some((&start, &len)) = self.free.range(..=first).next_back() {
            if start <= first && start + len >= end {
                self.free.remove(&start);
                if start < first {
                    self.free.insert(start, first - start);
                }
                if start + len > end {
                    self.free.insert(end, start + len - end);
                }
            }
        }
        if (end as u64) > self.watermark {
            self.watermark = end as u64;
        }
    }

    fn take_free(&mut self, n: u32) -> Option<u32> {
        let hit = self.free.iter().find(|(_, &len)| len >= n).map(|(&s, &l)| (s, l));
        let (start, len) = hit?;
        self.free.remove(&start);
        if len > n {
            self.free.insert(start + n, len - n);
        }
        Some(start)
    }

    fn bump_watermark(&mut self, n: u32) -> u32 {
        let first = self.watermark;
        let next = first + n as u64;
        if next > u32::MAX as u64 + 1 {
            panic!("conjunction id pool exhausted: cannot allocate {n} more ids");
        }
        self.watermark = next;
        first as u32
    }

    fn release(&mut self, first: u32, n: u32) {
        let mut start = first;
        let mut len = n;
        if let Some((&ps, &pl)) = self.free.range(..start).next_back() {
            if ps + pl == start {
                self.free.remove(&ps);
                start = ps;
                len += pl;
            }
        }
        if let Some(&nl) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += nl;
        }
        self.free.insert(start, len);
    }
}
