//! Bucket boundaries for the three histogram aggregations.
//!
//! The engine stores histograms as bare arrays of per-bucket counts. The
//! value range each slot stands for is implied by the aggregating action and,
//! for `lquantize()` and `llquantize()`, by a control word packed into the
//! first eight bytes of the record. Everything here is pure: the same inputs
//! always produce the same [`RangeTable`].

use std::cmp::Ordering;
use std::fmt;

use bitfield::bitfield;
use serde::Serialize;

/// Number of buckets in a `quantize()` record.
pub const QUANTIZE_NBUCKETS: usize = 127;

/// Index of the bucket holding exactly zero.
pub const QUANTIZE_ZEROBUCKET: usize = 63;

/// Inclusive `[min, max]` range of values counted by one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BucketRange {
    pub min: i64,
    pub max: i64,
}

impl BucketRange {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl fmt::Display for BucketRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Bucket ranges indexed by bucket number.
pub type RangeTable = Vec<BucketRange>;

bitfield! {
    /// Packed `lquantize()` parameters.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct LQuantizeArg(u64);
    impl Debug;
    pub u16, step, set_step: 63, 48;
    pub u16, levels, set_levels: 47, 32;
    u32, base_bits, set_base_bits: 31, 0;
}

impl LQuantizeArg {
    pub fn new(base: i32, step: u16, levels: u16) -> Self {
        let mut arg = LQuantizeArg(0);
        arg.set_base_bits(base as u32);
        arg.set_step(step);
        arg.set_levels(levels);
        arg
    }

    pub fn from_raw(raw: u64) -> Self {
        LQuantizeArg(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn base(&self) -> i32 {
        self.base_bits() as i32
    }
}

bitfield! {
    /// Packed `llquantize()` parameters.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct LLQuantizeArg(u64);
    impl Debug;
    pub u16, factor, set_factor: 63, 48;
    pub u16, low, set_low: 47, 32;
    pub u16, high, set_high: 31, 16;
    pub u16, nsteps, set_nsteps: 15, 0;
}

impl LLQuantizeArg {
    pub fn new(factor: u16, low: u16, high: u16, nsteps: u16) -> Self {
        let mut arg = LLQuantizeArg(0);
        arg.set_factor(factor);
        arg.set_low(low);
        arg.set_high(high);
        arg.set_nsteps(nsteps);
        arg
    }

    pub fn from_raw(raw: u64) -> Self {
        LLQuantizeArg(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The synthesized table and the record disagree on how many buckets exist.
///
/// This means the control word and the declared record size are
/// inconsistent, which the engine never produces on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCountMismatch {
    pub declared: usize,
    pub produced: usize,
}

impl fmt::Display for BucketCountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.produced > self.declared {
            write!(
                f,
                "histogram record declares {} buckets but its control word describes more",
                self.declared
            )
        } else {
            write!(
                f,
                "histogram record declares {} buckets but its control word describes {}",
                self.declared, self.produced
            )
        }
    }
}

impl std::error::Error for BucketCountMismatch {}

/// Lower edge of `quantize()` bucket `bucket`, as the engine defines it.
pub fn quantize_bucket_value(bucket: usize) -> i64 {
    match bucket.cmp(&QUANTIZE_ZEROBUCKET) {
        Ordering::Less => -(1i64 << (QUANTIZE_ZEROBUCKET - 1 - bucket)),
        Ordering::Equal => 0,
        Ordering::Greater => 1i64 << (bucket - QUANTIZE_ZEROBUCKET - 1),
    }
}

/// Ranges for the power-of-two `quantize()` buckets.
pub fn quantize_ranges() -> RangeTable {
    (0..QUANTIZE_NBUCKETS)
        .map(|i| match i.cmp(&QUANTIZE_ZEROBUCKET) {
            // Negative buckets run from just past the previous bucket's value
            // up to and including their own.
            Ordering::Less => {
                let min = if i > 0 {
                    quantize_bucket_value(i - 1) + 1
                } else {
                    i64::MIN
                };
                BucketRange::new(min, quantize_bucket_value(i))
            }
            Ordering::Equal => BucketRange::new(0, 0),
            Ordering::Greater => {
                let max = if i < QUANTIZE_NBUCKETS - 1 {
                    quantize_bucket_value(i + 1) - 1
                } else {
                    i64::MAX
                };
                BucketRange::new(quantize_bucket_value(i), max)
            }
        })
        .collect()
}

/// Ranges for a linear `lquantize()`: one underflow bucket, `levels` buckets
/// of width `step` starting at `base`, and one overflow bucket.
pub fn lquantize_ranges(arg: LQuantizeArg) -> RangeTable {
    let base = i64::from(arg.base());
    let step = i64::from(arg.step());
    let levels = i64::from(arg.levels());

    (0..=levels + 1)
        .map(|i| {
            let min = if i == 0 {
                i64::MIN
            } else {
                base + (i - 1) * step
            };
            let max = if i > levels {
                i64::MAX
            } else {
                base + i * step - 1
            };
            BucketRange::new(min, max)
        })
        .collect()
}

/// Ranges for a log-linear `llquantize()`.
///
/// `nbuckets` is the bucket count implied by the record size; any difference
/// from what the control word describes is reported as a mismatch.
///
/// Buckets that start above `i64::MAX` can never count anything, so the
/// table stops at the last bucket an `i64` can reach and that bucket is left
/// open-ended. The table can therefore be shorter than `nbuckets`.
pub fn llquantize_ranges(
    arg: LLQuantizeArg,
    nbuckets: usize,
) -> Result<RangeTable, BucketCountMismatch> {
    let mut ranges = Vec::with_capacity(nbuckets);
    match llquantize_walk(arg, nbuckets, |range| ranges.push(range)) {
        Some(produced) if produced == nbuckets => Ok(ranges),
        Some(produced) => Err(BucketCountMismatch {
            declared: nbuckets,
            produced,
        }),
        None => Err(BucketCountMismatch {
            declared: nbuckets,
            produced: nbuckets + 1,
        }),
    }
}

/// Number of buckets an `llquantize()` record with this control word holds.
pub fn llquantize_nbuckets(arg: LLQuantizeArg) -> usize {
    llquantize_walk(arg, usize::MAX, |_| {}).unwrap_or(usize::MAX)
}

const I64_TOP: u128 = i64::MAX as u128;

fn clamp_i64(value: u128) -> i64 {
    value.min(I64_TOP) as i64
}

fn order_step(next: u128, nsteps: u128) -> u128 {
    if nsteps > 0 && next > nsteps {
        next / nsteps
    } else {
        1
    }
}

// Walks the engine's bucket layout in bucket order. The arithmetic is done in
// u128 so that factor^(high + 1) does not overflow for any control word the
// engine accepts. Emits the ranges an i64 can reach and returns the engine's
// bucket count, or None once that count would pass `limit`.
fn llquantize_walk(
    arg: LLQuantizeArg,
    limit: usize,
    mut emit: impl FnMut(BucketRange),
) -> Option<usize> {
    let factor = u128::from(arg.factor());
    let nsteps = u128::from(arg.nsteps());
    let high = u32::from(arg.high());
    let mut order = u32::from(arg.low());

    let mut value: u128 = 1;
    for _ in 0..order {
        value = value.saturating_mul(factor);
    }

    // Held back one bucket so the last reachable one can be opened up.
    let mut last = BucketRange::new(i64::MIN, clamp_i64(value.saturating_sub(1)));
    let mut buckets = 1;
    let mut push = |start: u128, end: u128, last: &mut BucketRange| {
        if start <= I64_TOP {
            emit(*last);
            *last = BucketRange::new(start as i64, clamp_i64(end));
        }
    };

    let mut next = value.saturating_mul(factor);
    let mut step = order_step(next, nsteps);

    while order <= high {
        if buckets >= limit {
            return None;
        }
        buckets += 1;
        push(value, value.saturating_add(step) - 1, &mut last);

        value = value.saturating_add(step);
        if value < next {
            continue;
        }

        next = value.saturating_mul(factor);
        step = order_step(next, nsteps);
        order += 1;
    }

    if buckets >= limit {
        return None;
    }
    buckets += 1;
    push(value, u128::MAX, &mut last);

    last.max = i64::MAX;
    emit(last);
    Some(buckets)
}
