//! Decoding of aggregation tuples.
//!
//! An aggregation tuple is a run of fixed-size records in one buffer: the
//! variable id record first, then zero or more key records, then the record
//! of the aggregating action holding the value. [`AggregationWalker`] turns
//! each tuple into `(variable id, keys, value)` for an [`AggregateSink`].

use std::sync::Arc;

use plain::Plain;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::ActionKind;
use crate::cache::RangeCache;
use crate::engine::{AddressResolver, AggData, AggregateHandler, WalkOutcome};
use crate::error::{Error, Result};
use crate::quantize::{
    llquantize_ranges, lquantize_ranges, quantize_ranges, BucketCountMismatch, BucketRange,
    LLQuantizeArg, LQuantizeArg, RangeTable, QUANTIZE_NBUCKETS,
};
use crate::record::{self, read_plain, AggVarId, DecodedValue, HistogramBucket, RecordDescriptor};

/// Layout of one aggregation tuple, shared by every tuple of the variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggDesc {
    pub varid: AggVarId,
    pub name: String,
    pub records: Vec<RecordDescriptor>,
}

/// Receives every decoded aggregation tuple.
pub trait AggregateSink {
    fn on_aggregate(&mut self, varid: AggVarId, keys: Vec<DecodedValue>, value: DecodedValue);
}

impl<F> AggregateSink for F
where
    F: FnMut(AggVarId, Vec<DecodedValue>, DecodedValue),
{
    fn on_aggregate(&mut self, varid: AggVarId, keys: Vec<DecodedValue>, value: DecodedValue) {
        self(varid, keys, value)
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct AvgData {
    count: i64,
    total: i64,
}

unsafe impl Plain for AvgData {}

const WORD: u32 = std::mem::size_of::<i64>() as u32;

/// Walks the tuples of one snapshot, delivering them to a sink.
///
/// The first failure is kept and every later tuple is refused, so a walk
/// stops at the tuple that went wrong.
pub struct AggregationWalker<'a, S> {
    ranges: &'a mut RangeCache,
    sink: &'a mut S,
    error: Option<Error>,
    delivered: usize,
}

impl<'a, S: AggregateSink> AggregationWalker<'a, S> {
    pub fn new(ranges: &'a mut RangeCache, sink: &'a mut S) -> Self {
        Self {
            ranges,
            sink,
            error: None,
            delivered: 0,
        }
    }

    /// Number of tuples handed to the sink so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<Error> {
        self.error
    }

    fn decode_tuple(
        &mut self,
        resolver: &dyn AddressResolver,
        agg: &AggData<'_>,
    ) -> Result<(Vec<DecodedValue>, DecodedValue)> {
        let desc = agg.desc;
        let nrecs = desc.records.len();
        if nrecs < 2 {
            return Err(Error::TooFewRecords {
                aggregation: desc.name.clone(),
                count: nrecs,
            });
        }

        let keys = &desc.records[1..nrecs - 1];
        if let Some((index, rec)) = keys
            .iter()
            .enumerate()
            .find(|(_, rec)| !rec.action.is_representable())
        {
            return Err(Error::UnsupportedKey {
                action: rec.action,
                index: index + 1,
                aggregation: desc.name.clone(),
            });
        }
        let keys = keys
            .iter()
            .map(|rec| record::decode(resolver, rec, agg.data))
            .collect::<Result<Vec<_>>>()?;

        let value = self.decode_value(desc, &desc.records[nrecs - 1], agg.data)?;
        Ok((keys, value))
    }

    fn decode_value(
        &mut self,
        desc: &AggDesc,
        rec: &RecordDescriptor,
        data: &[u8],
    ) -> Result<DecodedValue> {
        let bytes = rec.bytes(data)?;
        let bad_size = |expected| Error::RecordSize {
            action: rec.action,
            aggregation: desc.name.clone(),
            size: rec.size,
            expected,
        };

        match rec.action {
            ActionKind::Count | ActionKind::Min | ActionKind::Max | ActionKind::Sum => {
                if rec.size != WORD {
                    return Err(bad_size("8"));
                }
                let value = read_plain::<i64>(bytes).ok_or_else(|| bad_size("8"))?;
                Ok(DecodedValue::Integer(value))
            }
            ActionKind::Avg => {
                if rec.size != 2 * WORD {
                    return Err(bad_size("16"));
                }
                let avg = read_plain::<AvgData>(bytes).ok_or_else(|| bad_size("16"))?;
                let value = if avg.count == 0 {
                    f64::NAN
                } else {
                    avg.total as f64 / avg.count as f64
                };
                Ok(DecodedValue::Average(value))
            }
            ActionKind::Quantize => {
                if rec.size as usize != QUANTIZE_NBUCKETS * WORD as usize {
                    return Err(bad_size("1016"));
                }
                let table = self.ranges(desc.varid, || Ok(quantize_ranges()));
                Ok(histogram(&table, &counts(bytes)))
            }
            ActionKind::LQuantize | ActionKind::LLQuantize => {
                if rec.size < 2 * WORD || rec.size % WORD != 0 {
                    return Err(bad_size("a multiple of 8 of at least 16"));
                }
                let arg = read_plain::<u64>(bytes)
                    .ok_or_else(|| bad_size("a multiple of 8 of at least 16"))?;
                let counts = counts(&bytes[WORD as usize..]);
                let table = if rec.action == ActionKind::LQuantize {
                    let table = self.ranges(desc.varid, || {
                        Ok(lquantize_ranges(LQuantizeArg::from_raw(arg)))
                    });
                    if table.len() != counts.len() {
                        let mismatch = BucketCountMismatch {
                            declared: counts.len(),
                            produced: table.len(),
                        };
                        panic!("aggregation variable {}: {mismatch}", desc.varid);
                    }
                    table
                } else {
                    let nbuckets = counts.len();
                    self.ranges(desc.varid, || {
                        llquantize_ranges(LLQuantizeArg::from_raw(arg), nbuckets)
                    })
                };
                Ok(histogram(&table, &counts))
            }
            other => Err(Error::UnsupportedAggregating {
                action: other,
                aggregation: desc.name.clone(),
            }),
        }
    }

    fn ranges(
        &mut self,
        varid: AggVarId,
        synthesize: impl FnOnce() -> std::result::Result<RangeTable, BucketCountMismatch>,
    ) -> Arc<RangeTable> {
        if let Some(table) = self.ranges.lookup(varid) {
            return table;
        }
        debug!(varid = varid.0, "synthesizing bucket ranges");
        match synthesize() {
            Ok(table) => self.ranges.store(varid, table),
            Err(mismatch) => panic!("aggregation variable {varid}: {mismatch}"),
        }
    }
}

impl<S: AggregateSink> AggregateHandler for AggregationWalker<'_, S> {
    fn on_tuple(&mut self, resolver: &dyn AddressResolver, agg: &AggData<'_>) -> WalkOutcome {
        if self.error.is_some() {
            return WalkOutcome::Abort;
        }

        match self.decode_tuple(resolver, agg) {
            Ok((keys, value)) => {
                self.sink.on_aggregate(agg.desc.varid, keys, value);
                self.delivered += 1;
                WalkOutcome::Remove
            }
            Err(err) => {
                self.error = Some(err);
                WalkOutcome::Abort
            }
        }
    }
}

fn counts(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(WORD as usize)
        .filter_map(read_plain::<i64>)
        .collect()
}

/// Pair per-bucket counts with their ranges, dropping empty buckets.
///
/// Counts past the end of the table belong to buckets no `i64` reaches and
/// are folded into the last one.
///
/// # Panics
///
/// Panics if the table has more buckets than there are counts.
fn histogram(table: &[BucketRange], counts: &[i64]) -> DecodedValue {
    if table.len() > counts.len() {
        let mismatch = BucketCountMismatch {
            declared: counts.len(),
            produced: table.len(),
        };
        panic!("{mismatch}");
    }

    let (counts, unreachable) = counts.split_at(table.len());
    let spill = unreachable
        .iter()
        .fold(0i64, |sum, count| sum.saturating_add(*count));
    let last = table.len().saturating_sub(1);

    DecodedValue::Histogram(
        table
            .iter()
            .zip(counts)
            .enumerate()
            .map(|(i, (&range, &count))| HistogramBucket {
                range,
                count: if i == last {
                    count.saturating_add(spill)
                } else {
                    count
                },
            })
            .filter(|bucket| bucket.count != 0)
            .collect(),
    )
}
