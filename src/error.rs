use thiserror::Error;

use crate::action::ActionKind;
use crate::engine::EngineError;
use crate::record::ProbeDescriptor;

/// The first error of a consume or walk pass.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported action {action} as key #{index} in aggregation \"{aggregation}\"")]
    UnsupportedKey {
        action: ActionKind,
        index: usize,
        aggregation: String,
    },

    #[error("unsupported aggregating action {action} in aggregation \"{aggregation}\"")]
    UnsupportedAggregating {
        action: ActionKind,
        aggregation: String,
    },

    #[error("unsupported action {action} in record for {probe}")]
    UnsupportedRecord {
        action: ActionKind,
        probe: ProbeDescriptor,
    },

    #[error("aggregation \"{aggregation}\" has {count} records, expected at least 2")]
    TooFewRecords { aggregation: String, count: usize },

    #[error("{action} record in aggregation \"{aggregation}\" is {size} bytes, expected {expected}")]
    RecordSize {
        action: ActionKind,
        aggregation: String,
        size: u32,
        expected: &'static str,
    },

    #[error("{action} record at offset {offset} ({size} bytes) runs past the end of a {len}-byte buffer")]
    Truncated {
        action: ActionKind,
        offset: u32,
        size: u32,
        len: usize,
    },

    #[error("couldn't {op}: {source}")]
    Engine {
        op: &'static str,
        source: EngineError,
    },
}

impl Error {
    pub(crate) fn engine(op: &'static str) -> impl FnOnce(EngineError) -> Error {
        move |source| Error::Engine { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
