//! An [`Engine`] over captured probe data and aggregations.
//!
//! A capture is a JSON document holding probe firings, aggregation tuples
//! and the symbol tables needed to resolve addresses in them. Raw buffers
//! are hex encoded. [`RecordBuffer`] builds the buffers and their record
//! descriptors.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::action::ActionKind;
use crate::aggregate::AggDesc;
use crate::engine::{
    AddressResolver, AggData, AggregateHandler, BufferedOutput, ConsumeAction, ConsumeHandler,
    Engine, EngineError, EngineStatus, ProbeData, WalkOutcome, WorkStatus,
};
use crate::record::{AggVarId, ProbeDescriptor, RecordDescriptor};
use crate::symbolize::format_symbol;

const ALIGN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSymbol {
    pub addr: u64,
    /// Zero means only `addr` itself matches.
    #[serde(default)]
    pub size: u64,
    /// "module`symbol", or just "symbol".
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSymbol {
    pub pid: u64,
    pub addr: u64,
    #[serde(default)]
    pub size: u64,
    pub name: String,
}

/// One probe firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedProbe {
    pub probe: ProbeDescriptor,
    pub records: Vec<RecordDescriptor>,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
    /// Formatted text for each `printf()` record, in record order.
    #[serde(default)]
    pub printf: Vec<String>,
}

/// One aggregation tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedAggregation {
    pub desc: AggDesc,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capture {
    pub kernel_symbols: Vec<KernelSymbol>,
    pub user_symbols: Vec<UserSymbol>,
    pub probes: Vec<CapturedProbe>,
    pub aggregations: Vec<CapturedAggregation>,
}

impl Capture {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read capture {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse capture {}", path.display()))
    }
}

/// Address resolution from a capture's symbol tables.
#[derive(Default)]
pub struct SymbolTable {
    kernel: BTreeMap<u64, (u64, String)>,
    user: HashMap<u64, BTreeMap<u64, (u64, String)>>,
    fallback: Option<Box<dyn AddressResolver>>,
}

fn lookup(symbols: &BTreeMap<u64, (u64, String)>, pc: u64) -> Option<String> {
    let (addr, (size, name)) = symbols.range(..=pc).next_back()?;
    let offset = pc - addr;
    if offset != 0 && offset >= *size {
        return None;
    }
    Some(format_symbol(None, name, offset as usize))
}

impl SymbolTable {
    pub fn new(kernel: &[KernelSymbol], user: &[UserSymbol]) -> Self {
        let mut table = SymbolTable::default();
        for sym in kernel {
            table.kernel.insert(sym.addr, (sym.size, sym.name.clone()));
        }
        for sym in user {
            table
                .user
                .entry(sym.pid)
                .or_default()
                .insert(sym.addr, (sym.size, sym.name.clone()));
        }
        table
    }
}

impl AddressResolver for SymbolTable {
    fn kernel_address(&self, pc: u64) -> String {
        lookup(&self.kernel, pc)
            .or_else(|| self.fallback.as_ref().map(|f| f.kernel_address(pc)))
            .unwrap_or_else(|| format!("{pc:#x}"))
    }

    fn user_address(&self, pid: u64, pc: u64) -> String {
        self.user
            .get(&pid)
            .and_then(|symbols| lookup(symbols, pc))
            .or_else(|| self.fallback.as_ref().map(|f| f.user_address(pid, pc)))
            .unwrap_or_else(|| format!("{pc:#x}"))
    }
}

/// Engine calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineCall {
    Status,
    Work,
    Snapshot,
    Walk,
}

pub struct ReplayEngine {
    symbols: SymbolTable,
    pending: VecDeque<CapturedProbe>,
    store: Vec<(u64, CapturedAggregation)>,
    snapshot: Vec<(u64, CapturedAggregation)>,
    next_id: u64,
    failures: HashMap<EngineCall, String>,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::from_capture(Capture::default())
    }
}

impl ReplayEngine {
    pub fn from_capture(capture: Capture) -> Self {
        let mut engine = ReplayEngine {
            symbols: SymbolTable::new(&capture.kernel_symbols, &capture.user_symbols),
            pending: capture.probes.into(),
            store: Vec::new(),
            snapshot: Vec::new(),
            next_id: 0,
            failures: HashMap::new(),
        };
        for agg in capture.aggregations {
            engine.push_aggregation(agg);
        }
        engine
    }

    pub fn load(path: &Path) -> Result<Self> {
        let capture = Capture::load(path)?;
        debug!(
            probes = capture.probes.len(),
            aggregations = capture.aggregations.len(),
            "loaded capture {}",
            path.display()
        );
        Ok(Self::from_capture(capture))
    }

    pub fn push_probe(&mut self, probe: CapturedProbe) {
        self.pending.push_back(probe);
    }

    pub fn push_aggregation(&mut self, agg: CapturedAggregation) {
        self.store.push((self.next_id, agg));
        self.next_id += 1;
    }

    /// Resolve addresses the capture has no symbols for through `resolver`.
    pub fn set_fallback_resolver(&mut self, resolver: Box<dyn AddressResolver>) {
        self.symbols.fallback = Some(resolver);
    }

    /// Make the next `call` fail with `message`.
    pub fn inject_failure(&mut self, call: EngineCall, message: &str) {
        self.failures.insert(call, message.to_string());
    }

    pub fn pending_probes(&self) -> usize {
        self.pending.len()
    }

    pub fn stored_aggregations(&self) -> impl Iterator<Item = &CapturedAggregation> {
        self.store.iter().map(|(_, agg)| agg)
    }

    fn check(&mut self, call: EngineCall) -> Result<(), EngineError> {
        match self.failures.remove(&call) {
            Some(message) => Err(EngineError::new(message)),
            None => Ok(()),
        }
    }
}

impl Engine for ReplayEngine {
    fn status(&mut self) -> Result<EngineStatus, EngineError> {
        self.check(EngineCall::Status)?;
        if self.pending.is_empty() {
            Ok(EngineStatus::Exited)
        } else {
            Ok(EngineStatus::Okay)
        }
    }

    fn work(&mut self, handler: &mut dyn ConsumeHandler) -> Result<WorkStatus, EngineError> {
        self.check(EngineCall::Work)?;
        let aborted = || EngineError::new("consumer aborted.\n");

        while let Some(captured) = self.pending.pop_front() {
            let probe = ProbeData {
                desc: &captured.probe,
                data: &captured.data,
            };
            let mut printf = captured.printf.iter();

            for rec in &captured.records {
                match handler.on_record(&self.symbols, &probe, Some(rec)) {
                    ConsumeAction::Next => {}
                    ConsumeAction::This => {
                        let text = match rec.action {
                            ActionKind::Printf => printf.next().map(String::as_str),
                            _ => None,
                        };
                        handler.on_buffered(&BufferedOutput {
                            probe: &captured.probe,
                            record: Some(rec),
                            text: text.unwrap_or(""),
                        });
                    }
                    ConsumeAction::Abort => return Err(aborted()),
                }
            }
            if handler.on_record(&self.symbols, &probe, None) == ConsumeAction::Abort {
                return Err(aborted());
            }
        }
        Ok(WorkStatus::Done)
    }

    fn snapshot(&mut self) -> Result<(), EngineError> {
        self.check(EngineCall::Snapshot)?;
        self.snapshot = self.store.clone();
        Ok(())
    }

    fn walk(&mut self, handler: &mut dyn AggregateHandler) -> Result<(), EngineError> {
        self.check(EngineCall::Walk)?;

        let mut removed = HashSet::new();
        let mut result = Ok(());
        for (id, agg) in &self.snapshot {
            let data = AggData {
                desc: &agg.desc,
                data: &agg.data,
            };
            match handler.on_tuple(&self.symbols, &data) {
                WalkOutcome::Continue => {}
                WalkOutcome::Remove => {
                    removed.insert(*id);
                }
                WalkOutcome::Abort => {
                    result = Err(EngineError::new("aggregation walk aborted.\n"));
                    break;
                }
            }
        }

        trace!(removed = removed.len(), "walked aggregation snapshot");
        self.store.retain(|(id, _)| !removed.contains(id));
        result
    }

    fn clear(&mut self) {
        self.store.clear();
    }
}

/// Lays out records back to back in one buffer, each aligned to 8 bytes.
#[derive(Debug, Clone, Default)]
pub struct RecordBuffer {
    records: Vec<RecordDescriptor>,
    data: Vec<u8>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an aggregation tuple with its variable id record.
    pub fn for_aggregation(varid: AggVarId) -> Self {
        Self::new().int(ActionKind::DifExpr, i64::from(varid.0), 4)
    }

    fn push(mut self, action: ActionKind, bytes: &[u8]) -> Self {
        let offset = self.data.len().next_multiple_of(ALIGN);
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);
        self.records
            .push(RecordDescriptor::new(action, bytes.len() as u32, offset as u32));
        self
    }

    /// An integer truncated to `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not 1, 2, 4 or 8.
    pub fn int(self, action: ActionKind, value: i64, size: u32) -> Self {
        let bytes = match size {
            1 => (value as i8).to_ne_bytes().to_vec(),
            2 => (value as i16).to_ne_bytes().to_vec(),
            4 => (value as i32).to_ne_bytes().to_vec(),
            8 => value.to_ne_bytes().to_vec(),
            _ => panic!("no {size}-byte integer"),
        };
        self.push(action, &bytes)
    }

    /// A NUL padded string in a `size`-byte record. Sizes of 1, 2, 4 and 8
    /// bytes decode as integers, not strings.
    pub fn string(self, s: &str, size: u32) -> Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(size as usize, 0);
        self.push(ActionKind::DifExpr, &bytes)
    }

    pub fn kernel_addr(self, action: ActionKind, pc: u64) -> Self {
        self.push(action, &pc.to_ne_bytes())
    }

    pub fn user_addr(self, action: ActionKind, pid: u64, pc: u64) -> Self {
        let mut bytes = pid.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&pc.to_ne_bytes());
        self.push(action, &bytes)
    }

    /// A record of consecutive 64-bit words, as aggregation values are laid
    /// out.
    pub fn words(self, action: ActionKind, words: &[i64]) -> Self {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        self.push(action, &bytes)
    }

    pub fn printf(self) -> Self {
        self.push(ActionKind::Printf, &[])
    }

    pub fn finish(self) -> (Vec<RecordDescriptor>, Vec<u8>) {
        (self.records, self.data)
    }

    pub fn into_probe(self, probe: ProbeDescriptor, printf: Vec<String>) -> CapturedProbe {
        let (records, data) = self.finish();
        CapturedProbe {
            probe,
            records,
            data,
            printf,
        }
    }

    /// # Panics
    ///
    /// Panics if the buffer was not started with [`RecordBuffer::for_aggregation`].
    pub fn into_aggregation(self, name: &str) -> CapturedAggregation {
        let varid = self
            .records
            .first()
            .and_then(|rec| rec.bytes(&self.data).ok())
            .and_then(crate::record::read_plain::<i32>)
            .map(|id| AggVarId(id as u32))
            .expect("aggregation buffer starts with its variable id");
        let (records, data) = self.finish();
        CapturedAggregation {
            desc: AggDesc {
                varid,
                name: name.to_string(),
                records,
            },
            data,
        }
    }
}
