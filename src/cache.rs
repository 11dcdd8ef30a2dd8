//! Single-slot cache of bucket ranges.
//!
//! Snapshots with many disjoint keys hit the same histogram variable over and
//! over, so the ranges for the most recent variable are kept around. Only one
//! variable is cached: walks that interleave tuples from several histogram
//! variables evict and resynthesize on every switch.

use std::sync::Arc;

use tracing::trace;

use crate::quantize::RangeTable;
use crate::record::AggVarId;

#[derive(Debug, Default)]
pub struct RangeCache {
    slot: Option<(AggVarId, Arc<RangeTable>)>,
}

impl RangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached ranges for `varid`, if they are the ones held.
    pub fn lookup(&self, varid: AggVarId) -> Option<Arc<RangeTable>> {
        match &self.slot {
            Some((cached, table)) if *cached == varid => Some(Arc::clone(table)),
            _ => None,
        }
    }

    /// Replace whatever is cached with `table`.
    pub fn store(&mut self, varid: AggVarId, table: RangeTable) -> Arc<RangeTable> {
        if let Some((evicted, _)) = &self.slot {
            trace!(evicted = evicted.0, varid = varid.0, "evicting cached bucket ranges");
        }
        let table = Arc::new(table);
        self.slot = Some((varid, Arc::clone(&table)));
        table
    }

    /// Drop the cached ranges. Called at the end of every snapshot walk.
    pub fn flush(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::{lquantize_ranges, quantize_ranges, LQuantizeArg};

    #[test]
    fn test_lookup_same_id_is_same_table() {
        let mut cache = RangeCache::new();
        assert!(cache.lookup(AggVarId(1)).is_none());

        let stored = cache.store(AggVarId(1), quantize_ranges());
        let first = cache.lookup(AggVarId(1)).unwrap();
        let second = cache.lookup(AggVarId(1)).unwrap();
        assert!(Arc::ptr_eq(&stored, &first));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_other_id_misses() {
        let mut cache = RangeCache::new();
        cache.store(AggVarId(1), quantize_ranges());
        assert!(cache.lookup(AggVarId(2)).is_none());

        let replaced = cache.store(AggVarId(2), lquantize_ranges(LQuantizeArg::new(0, 1, 1)));
        assert!(cache.lookup(AggVarId(1)).is_none());
        assert!(Arc::ptr_eq(&replaced, &cache.lookup(AggVarId(2)).unwrap()));
    }

    #[test]
    fn test_flush() {
        let mut cache = RangeCache::new();
        let held = cache.store(AggVarId(7), quantize_ranges());
        cache.flush();
        assert!(cache.is_empty());
        assert!(cache.lookup(AggVarId(7)).is_none());
        // Values already handed out keep their own reference.
        assert_eq!(held.len(), crate::quantize::QUANTIZE_NBUCKETS);
    }
}
