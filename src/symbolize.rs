//! Address resolution on the local machine.
//!
//! Used by captures that carry raw addresses without a symbol table of their
//! own. Kernel addresses resolve against the running kernel and user
//! addresses against the live process, so results are only meaningful when
//! the capture was taken on this host.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use blazesym::symbolize::source::{Kernel, Process, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};
use blazesym::{Addr, Pid};
use tracing::debug;

use crate::engine::AddressResolver;

/// Format a resolved symbol the way the engine does: `module` then a
/// backtick then the symbol, and `+0xoff` unless the address is the start of
/// the symbol.
pub fn format_symbol(module: Option<&str>, name: &str, offset: usize) -> String {
    let mut out = match module {
        Some(module) => format!("{module}`{name}"),
        None => name.to_string(),
    };
    if offset != 0 {
        out.push_str(&format!("+{offset:#x}"));
    }
    out
}

pub struct BlazeResolver {
    symbolizer: Symbolizer,
    kernel_src: Source<'static>,
    src_cache: RefCell<HashMap<u32, Source<'static>>>,
}

impl Default for BlazeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BlazeResolver {
    pub fn new() -> Self {
        BlazeResolver {
            symbolizer: Symbolizer::new(),
            kernel_src: Source::Kernel(Kernel::default()),
            src_cache: RefCell::new(HashMap::new()),
        }
    }

    fn resolve(&self, src: &Source<'_>, pc: u64) -> String {
        let addrs: [Addr; 1] = [pc];
        let sym = match self.symbolizer.symbolize(src, Input::AbsAddr(&addrs)) {
            Ok(mut syms) if !syms.is_empty() => syms.swap_remove(0),
            Ok(_) => return format!("{pc:#x}"),
            Err(e) => {
                debug!("failed to symbolize {pc:#x}: {e}");
                return format!("{pc:#x}");
            }
        };

        match sym {
            Symbolized::Sym(Sym {
                name,
                module,
                offset,
                ..
            }) => {
                let module = module
                    .as_deref()
                    .and_then(|m| Path::new(m).file_name())
                    .and_then(|m| m.to_str());
                format_symbol(module, &name, offset)
            }
            Symbolized::Unknown(reason) => {
                debug!("no symbol for {pc:#x}: {reason}");
                format!("{pc:#x}")
            }
        }
    }
}

impl AddressResolver for BlazeResolver {
    fn kernel_address(&self, pc: u64) -> String {
        self.resolve(&self.kernel_src, pc)
    }

    fn user_address(&self, pid: u64, pc: u64) -> String {
        let Ok(pid) = u32::try_from(pid) else {
            return format!("{pc:#x}");
        };
        let mut cache = self.src_cache.borrow_mut();
        let src = cache
            .entry(pid)
            .or_insert_with(|| Source::Process(Process::new(Pid::from(pid))));
        self.resolve(src, pc)
    }
}
