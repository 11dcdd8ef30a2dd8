//! The boundary with the tracing engine.
//!
//! The engine owns the session: it compiles and enables probes, sizes the
//! buffers and moves data out of the kernel. This crate only sees what the
//! engine hands back through [`Engine::work`] and [`Engine::walk`], and never
//! keeps the engine beyond a single call.

use std::fmt;
use std::io;

use crate::aggregate::AggDesc;
use crate::record::{ProbeDescriptor, RecordDescriptor};

/// What the engine should do after a record has been looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAction {
    /// Move on to the next record.
    Next,
    /// Let the engine format this record itself and hand the text to
    /// [`ConsumeHandler::on_buffered`].
    This,
    /// Stop the pass.
    Abort,
}

/// What the engine should do with an aggregation tuple after the walker has
/// seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Continue,
    /// Delivered; remove the entry from the aggregation store.
    Remove,
    /// Stop the walk, the walker holds the error.
    Abort,
}

/// Result of a successful [`Engine::work`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// More data may arrive.
    Okay,
    /// The session is done producing data.
    Done,
}

/// Session state reported by [`Engine::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    None,
    Okay,
    /// The traced program called `exit()`.
    Exited,
    /// A fill buffer filled up.
    Filled,
    Stopped,
}

impl EngineStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, EngineStatus::Exited | EngineStatus::Stopped)
    }
}

/// A failed engine call, with the engine's own description of what went
/// wrong.
#[derive(Debug)]
pub struct EngineError {
    message: String,
    os_error: Option<io::Error>,
}

impl EngineError {
    /// A message ending in a newline or a period reads as complete. Anything
    /// else gets the current OS error appended when displayed.
    pub fn new(message: impl Into<String>) -> Self {
        let mut message = message.into();
        let os_error = if message.ends_with('\n') {
            message.pop();
            None
        } else if message.ends_with('.') {
            None
        } else {
            Some(io::Error::last_os_error())
        };
        Self { message, os_error }
    }

    /// Wrap a message together with a specific OS error.
    pub fn with_os_error(message: impl Into<String>, os_error: io::Error) -> Self {
        Self {
            message: message.into(),
            os_error: Some(os_error),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.os_error {
            Some(os_error) => write!(f, "{}: {}", self.message, os_error),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/// Address-to-name resolution provided by the engine.
///
/// Names are formatted as `module` + a backtick + `symbol`, followed by
/// `+0xoffset` when the address is not at the start of the symbol.
pub trait AddressResolver {
    fn kernel_address(&self, pc: u64) -> String;
    fn user_address(&self, pid: u64, pc: u64) -> String;
}

/// One firing of a probe: its descriptor and the raw buffer its records
/// index into.
#[derive(Debug, Clone, Copy)]
pub struct ProbeData<'a> {
    pub desc: &'a ProbeDescriptor,
    pub data: &'a [u8],
}

/// Text the engine formatted on behalf of a record.
#[derive(Debug, Clone, Copy)]
pub struct BufferedOutput<'a> {
    pub probe: &'a ProbeDescriptor,
    pub record: Option<&'a RecordDescriptor>,
    pub text: &'a str,
}

/// One tuple of an aggregation snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AggData<'a> {
    pub desc: &'a AggDesc,
    pub data: &'a [u8],
}

pub trait ConsumeHandler {
    /// Called for every record of a probe, then once with `None` when the
    /// probe has no records left.
    fn on_record(
        &mut self,
        resolver: &dyn AddressResolver,
        probe: &ProbeData<'_>,
        record: Option<&RecordDescriptor>,
    ) -> ConsumeAction;

    /// Called with engine-formatted text for records answered with
    /// [`ConsumeAction::This`].
    fn on_buffered(&mut self, output: &BufferedOutput<'_>);
}

pub trait AggregateHandler {
    fn on_tuple(&mut self, resolver: &dyn AddressResolver, agg: &AggData<'_>) -> WalkOutcome;
}

/// The pull and snapshot primitives of a tracing session.
pub trait Engine {
    fn status(&mut self) -> Result<EngineStatus, EngineError>;

    /// Deliver whatever probe data is pending. An error means the pass was
    /// halted, either by the engine or by a handler returning
    /// [`ConsumeAction::Abort`].
    fn work(&mut self, handler: &mut dyn ConsumeHandler) -> Result<WorkStatus, EngineError>;

    /// Take a consistent copy of the aggregation store.
    fn snapshot(&mut self) -> Result<(), EngineError>;

    /// Visit every tuple of the last snapshot.
    fn walk(&mut self, handler: &mut dyn AggregateHandler) -> Result<(), EngineError>;

    /// Discard every stored aggregation entry.
    fn clear(&mut self);
}
