//! Pass-level driving of an [`Engine`].
//!
//! [`Consumer::consume`] pulls pending probe data and hands each decoded
//! record to an [`EventSink`]. [`Consumer::aggregate_walk`] snapshots the
//! aggregation store and hands every tuple to an [`AggregateSink`], removing
//! it from the store once delivered. Both return the first error of the pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::action::ActionKind;
use crate::aggregate::{AggregateSink, AggregationWalker};
use crate::cache::RangeCache;
use crate::engine::{
    AddressResolver, BufferedOutput, ConsumeAction, ConsumeHandler, Engine, ProbeData, WorkStatus,
};
use crate::error::{Error, Result};
use crate::record::{self, DecodedValue, ProbeDescriptor, RecordDescriptor};

/// How long [`Consumer::run`] sleeps at a time while waiting for the next pass.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives decoded probe records and `printf()` output.
pub trait EventSink {
    fn on_event(&mut self, probe: &ProbeDescriptor, value: DecodedValue);

    /// Text formatted by the engine for a `printf()` record.
    fn on_printf(&mut self, probe: &ProbeDescriptor, text: &str);
}

/// Settings for [`Consumer::run`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Time between passes.
    pub interval: Duration,
    /// Walk the aggregations after every consume pass.
    pub aggregate: bool,
    /// Clear the aggregation store after every walk.
    pub clear: bool,
    /// Stop after this many passes, 0 for no limit.
    pub passes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            aggregate: true,
            clear: false,
            passes: 0,
        }
    }
}

// The per-record body of a consume pass.
struct ConsumeLoop<'a, S> {
    sink: &'a mut S,
    error: Option<Error>,
    events: usize,
    printfs: usize,
}

impl<'a, S: EventSink> ConsumeLoop<'a, S> {
    fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            error: None,
            events: 0,
            printfs: 0,
        }
    }

    fn fail(&mut self, err: Error) -> ConsumeAction {
        self.error.get_or_insert(err);
        ConsumeAction::Abort
    }
}

impl<S: EventSink> ConsumeHandler for ConsumeLoop<'_, S> {
    fn on_record(
        &mut self,
        resolver: &dyn AddressResolver,
        probe: &ProbeData<'_>,
        record: Option<&RecordDescriptor>,
    ) -> ConsumeAction {
        if self.error.is_some() {
            return ConsumeAction::Abort;
        }
        let Some(record) = record else {
            return ConsumeAction::Next;
        };

        if !record.action.is_representable() {
            // printf() output is formatted by the engine and comes back
            // through on_buffered.
            if record.action == ActionKind::Printf {
                return ConsumeAction::This;
            }
            return self.fail(Error::UnsupportedRecord {
                action: record.action,
                probe: probe.desc.clone(),
            });
        }

        match record::decode(resolver, record, probe.data) {
            Ok(value) => {
                self.sink.on_event(probe.desc, value);
                self.events += 1;
                ConsumeAction::Next
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_buffered(&mut self, output: &BufferedOutput<'_>) {
        match output.record {
            Some(record) if record.action == ActionKind::Printf => {
                self.sink.on_printf(output.probe, output.text);
                self.printfs += 1;
            }
            _ => {}
        }
    }
}

/// Drives consume and walk passes against an engine.
///
/// The consumer never holds on to the engine; it is passed to every call.
#[derive(Debug, Default)]
pub struct Consumer {
    ranges: RangeCache,
}

impl Consumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver all pending probe data to `sink`.
    pub fn consume<E, S>(&mut self, engine: &mut E, sink: &mut S) -> Result<WorkStatus>
    where
        E: Engine + ?Sized,
        S: EventSink,
    {
        let mut handler = ConsumeLoop::new(sink);
        let status = engine.work(&mut handler);
        debug!(
            events = handler.events,
            printfs = handler.printfs,
            "consume pass finished"
        );

        match (status, handler.error) {
            (Ok(status), None) => Ok(status),
            (Ok(_), Some(err)) | (Err(_), Some(err)) => {
                warn!("consume pass aborted: {err}");
                Err(err)
            }
            (Err(err), None) => Err(Error::engine("consume probe data")(err)),
        }
    }

    /// Snapshot the aggregations and deliver every tuple to `sink`.
    ///
    /// Returns the number of tuples delivered. The range cache is flushed
    /// whether or not the walk succeeds.
    pub fn aggregate_walk<E, S>(&mut self, engine: &mut E, sink: &mut S) -> Result<usize>
    where
        E: Engine + ?Sized,
        S: AggregateSink,
    {
        engine.status().map_err(Error::engine("get status"))?;
        engine
            .snapshot()
            .map_err(Error::engine("snap aggregate"))?;

        let mut walker = AggregationWalker::new(&mut self.ranges, sink);
        let walked = engine.walk(&mut walker);
        let delivered = walker.delivered();
        let pending = walker.into_error();
        self.ranges.flush();

        debug!(delivered, "aggregation walk finished");
        match (walked, pending) {
            (_, Some(err)) => {
                warn!("aggregation walk aborted: {err}");
                Err(err)
            }
            (Err(err), None) => Err(Error::engine("walk aggregate")(err)),
            (Ok(()), None) => Ok(delivered),
        }
    }

    /// Discard everything in the aggregation store.
    pub fn aggregate_clear<E>(&mut self, engine: &mut E) -> Result<()>
    where
        E: Engine + ?Sized,
    {
        engine.status().map_err(Error::engine("get status"))?;
        engine.clear();
        Ok(())
    }

    /// Run passes until `stop` is set, the engine reports that tracing has
    /// finished, or `config.passes` is reached. Returns the number of passes.
    pub fn run<E, S>(
        &mut self,
        engine: &mut E,
        sink: &mut S,
        config: &Config,
        stop: &AtomicBool,
    ) -> Result<u64>
    where
        E: Engine + ?Sized,
        S: EventSink + AggregateSink,
    {
        let mut passes = 0;
        loop {
            // A stop request still gets one last pass over whatever is
            // pending.
            let stopping = stop.load(Ordering::Relaxed);
            let status = engine.status().map_err(Error::engine("get status"))?;

            self.consume(engine, sink)?;
            if config.aggregate {
                self.aggregate_walk(engine, sink)?;
                if config.clear {
                    self.aggregate_clear(engine)?;
                }
            }
            passes += 1;

            if status.is_finished() {
                info!(?status, passes, "tracing finished");
                break;
            }
            if stopping {
                info!(passes, "stop requested");
                break;
            }
            if config.passes > 0 && passes >= config.passes {
                break;
            }
            wait_for_next_pass(config.interval, stop);
        }
        Ok(passes)
    }
}

// Sleeps for `interval`, or until `stop` gets set.
fn wait_for_next_pass(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
    }
}
