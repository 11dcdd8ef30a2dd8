//! Decoding of tracing-engine probe records and aggregation snapshots.
//!
//! The engine hands back raw buffers described by record descriptors. This
//! library turns them into [`DecodedValue`]s: integers, strings, resolved
//! symbols, averages and histograms with synthesized bucket ranges.
//!
//! # Modules
//!
//! - [`quantize`] - bucket range synthesis for the histogram actions
//! - [`record`] - probe records and single-record decoding
//! - [`aggregate`] - aggregation tuple decoding
//! - [`consumer`] - consume and walk passes against an [`Engine`]
//! - [`replay`] - an [`Engine`] over JSON captures
//!
//! # Example
//!
//! ```no_run
//! use dtconsume::{AggVarId, Consumer, DecodedValue, ReplayEngine};
//! use std::path::Path;
//!
//! let mut engine = ReplayEngine::load(Path::new("capture.json"))?;
//! let mut consumer = Consumer::new();
//! consumer.aggregate_walk(
//!     &mut engine,
//!     &mut |varid: AggVarId, keys: Vec<DecodedValue>, value: DecodedValue| {
//!         println!("{varid} {keys:?} {value:?}");
//!     },
//! )?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod action;
pub mod aggregate;
pub mod cache;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod quantize;
pub mod record;
pub mod replay;
pub mod symbolize;

pub use action::ActionKind;
pub use aggregate::{AggDesc, AggregateSink, AggregationWalker};
pub use cache::RangeCache;
pub use consumer::{Config, Consumer, EventSink};
pub use engine::{AddressResolver, Engine, EngineError, EngineStatus};
pub use error::{Error, Result};
pub use quantize::{BucketRange, RangeTable};
pub use record::{AggVarId, DecodedValue, HistogramBucket, ProbeDescriptor, RecordDescriptor};
pub use replay::{Capture, RecordBuffer, ReplayEngine};
pub use symbolize::BlazeResolver;
