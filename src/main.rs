use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dtconsume::{
    AggVarId, AggregateSink, BlazeResolver, Config, Consumer, DecodedValue, EventSink,
    ProbeDescriptor, ReplayEngine,
};

/// Replay a capture through the consumer and print one JSON object per line.
#[derive(Debug, Parser)]
#[command(name = "dtconsume", version)]
struct Command {
    /// Capture file to replay.
    capture: PathBuf,
    #[arg(short, long)]
    verbose: bool,
    #[arg(short, long, default_value = "1000")]
    interval_ms: u64,
    #[arg(long)]
    no_aggregate: bool,
    #[arg(long)]
    clear: bool,
    #[arg(long, default_value = "0")]
    passes: u64,
    /// Resolve addresses missing from the capture against this host.
    #[arg(short, long)]
    symbolize: bool,
}

impl Command {
    fn config(&self) -> Config {
        Config {
            interval: Duration::from_millis(self.interval_ms),
            aggregate: !self.no_aggregate,
            clear: self.clear,
            passes: self.passes,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Line<'a> {
    Event {
        probe: &'a ProbeDescriptor,
        value: DecodedValue,
    },
    Printf {
        probe: &'a ProbeDescriptor,
        text: &'a str,
    },
    Aggregate {
        varid: AggVarId,
        keys: Vec<DecodedValue>,
        value: DecodedValue,
    },
}

// Sink callbacks can't fail, so the first write error is held until the end.
struct JsonLines<W: Write> {
    out: W,
    error: Option<io::Error>,
}

impl<W: Write> JsonLines<W> {
    fn new(out: W) -> Self {
        JsonLines { out, error: None }
    }

    fn emit(&mut self, line: &Line<'_>) {
        if self.error.is_some() {
            return;
        }
        let res = serde_json::to_writer(&mut self.out, line)
            .map_err(io::Error::from)
            .and_then(|_| self.out.write_all(b"\n"));
        if let Err(e) = res {
            self.error = Some(e);
        }
    }

    fn finish(mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => self.out.flush(),
        }
    }
}

impl<W: Write> EventSink for JsonLines<W> {
    fn on_event(&mut self, probe: &ProbeDescriptor, value: DecodedValue) {
        self.emit(&Line::Event { probe, value });
    }

    fn on_printf(&mut self, probe: &ProbeDescriptor, text: &str) {
        self.emit(&Line::Printf { probe, text });
    }
}

impl<W: Write> AggregateSink for JsonLines<W> {
    fn on_aggregate(&mut self, varid: AggVarId, keys: Vec<DecodedValue>, value: DecodedValue) {
        self.emit(&Line::Aggregate { varid, keys, value });
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let level = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut engine = ReplayEngine::load(&opts.capture)?;
    if opts.symbolize {
        engine.set_fallback_resolver(Box::new(BlazeResolver::new()));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = stop.clone();
    // Only fails if a handler is already installed.
    let _ = ctrlc::set_handler(move || {
        stop_handler.store(true, Ordering::Relaxed);
    });

    let config = opts.config();
    let mut sink = JsonLines::new(BufWriter::new(io::stdout().lock()));
    let passes = Consumer::new().run(&mut engine, &mut sink, &config, &stop)?;
    sink.finish().context("Failed to write output")?;

    info!(passes, "done");
    Ok(())
}
