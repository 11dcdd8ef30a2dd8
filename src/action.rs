//! Action kinds carried by record descriptors.
//!
//! The engine tags every record with the action that produced it. Only a
//! handful of actions produce values this crate knows how to decode on their
//! own; the aggregating actions are only meaningful as the final record of an
//! aggregation tuple.

use std::fmt;

use serde::{Deserialize, Serialize};

const CLASS_MASK: u32 = 0xff00;
const CLASS_PROC: u32 = 0x0100;
const CLASS_KERNEL: u32 = 0x0400;

/// The action that produced a record, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    None,
    DifExpr,
    Exit,
    Printf,
    Printa,
    LibAct,
    UStack,
    JStack,
    USym,
    UMod,
    UAddr,
    Stop,
    Raise,
    System,
    Freopen,
    Stack,
    Sym,
    Mod,
    Count,
    Min,
    Max,
    Avg,
    Sum,
    Stddev,
    Quantize,
    LQuantize,
    LLQuantize,
    Unknown(u32),
}

/// Where an address carried by a symbolic action lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// A single program counter in the kernel.
    Kernel,
    /// A process id followed by a program counter in that process.
    User,
}

impl ActionKind {
    /// Map a raw engine action code.
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => ActionKind::None,
            1 => ActionKind::DifExpr,
            2 => ActionKind::Exit,
            3 => ActionKind::Printf,
            4 => ActionKind::Printa,
            5 => ActionKind::LibAct,
            0x101 => ActionKind::UStack,
            0x102 => ActionKind::JStack,
            0x103 => ActionKind::USym,
            0x104 => ActionKind::UMod,
            0x105 => ActionKind::UAddr,
            0x201 => ActionKind::Stop,
            0x202 => ActionKind::Raise,
            0x203 => ActionKind::System,
            0x204 => ActionKind::Freopen,
            0x401 => ActionKind::Stack,
            0x402 => ActionKind::Sym,
            0x403 => ActionKind::Mod,
            0x701 => ActionKind::Count,
            0x702 => ActionKind::Min,
            0x703 => ActionKind::Max,
            0x704 => ActionKind::Avg,
            0x705 => ActionKind::Sum,
            0x706 => ActionKind::Stddev,
            0x707 => ActionKind::Quantize,
            0x708 => ActionKind::LQuantize,
            0x709 => ActionKind::LLQuantize,
            other => ActionKind::Unknown(other),
        }
    }

    /// The raw engine action code.
    pub fn raw(self) -> u32 {
        match self {
            ActionKind::None => 0,
            ActionKind::DifExpr => 1,
            ActionKind::Exit => 2,
            ActionKind::Printf => 3,
            ActionKind::Printa => 4,
            ActionKind::LibAct => 5,
            ActionKind::UStack => 0x101,
            ActionKind::JStack => 0x102,
            ActionKind::USym => 0x103,
            ActionKind::UMod => 0x104,
            ActionKind::UAddr => 0x105,
            ActionKind::Stop => 0x201,
            ActionKind::Raise => 0x202,
            ActionKind::System => 0x203,
            ActionKind::Freopen => 0x204,
            ActionKind::Stack => 0x401,
            ActionKind::Sym => 0x402,
            ActionKind::Mod => 0x403,
            ActionKind::Count => 0x701,
            ActionKind::Min => 0x702,
            ActionKind::Max => 0x703,
            ActionKind::Avg => 0x704,
            ActionKind::Sum => 0x705,
            ActionKind::Stddev => 0x706,
            ActionKind::Quantize => 0x707,
            ActionKind::LQuantize => 0x708,
            ActionKind::LLQuantize => 0x709,
            ActionKind::Unknown(code) => code,
        }
    }

    /// Whether a record with this action can be decoded into a scalar or
    /// string on its own.
    pub fn is_representable(self) -> bool {
        matches!(
            self,
            ActionKind::DifExpr
                | ActionKind::Sym
                | ActionKind::Mod
                | ActionKind::USym
                | ActionKind::UMod
                | ActionKind::UAddr
        )
    }

    /// Address space of a symbolic action, `None` for everything else.
    pub fn address_space(self) -> Option<AddressSpace> {
        match self {
            ActionKind::Sym | ActionKind::Mod => Some(AddressSpace::Kernel),
            ActionKind::USym | ActionKind::UMod | ActionKind::UAddr => Some(AddressSpace::User),
            _ => None,
        }
    }

    fn class_name(self) -> Option<&'static str> {
        match self.raw() & CLASS_MASK {
            CLASS_PROC => Some("user"),
            CLASS_KERNEL => Some("kernel"),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::None => "<none>",
            ActionKind::DifExpr => "<DIF expression>",
            ActionKind::Exit => "exit()",
            ActionKind::Printf => "printf()",
            ActionKind::Printa => "printa()",
            ActionKind::LibAct => "<library action>",
            ActionKind::UStack => "ustack()",
            ActionKind::JStack => "jstack()",
            ActionKind::USym => "usym()",
            ActionKind::UMod => "umod()",
            ActionKind::UAddr => "uaddr()",
            ActionKind::Stop => "stop()",
            ActionKind::Raise => "raise()",
            ActionKind::System => "system()",
            ActionKind::Freopen => "freopen()",
            ActionKind::Stack => "stack()",
            ActionKind::Sym => "sym()",
            ActionKind::Mod => "mod()",
            ActionKind::Count => "count()",
            ActionKind::Min => "min()",
            ActionKind::Max => "max()",
            ActionKind::Avg => "avg()",
            ActionKind::Sum => "sum()",
            ActionKind::Stddev => "stddev()",
            ActionKind::Quantize => "quantize()",
            ActionKind::LQuantize => "lquantize()",
            ActionKind::LLQuantize => "llquantize()",
            ActionKind::Unknown(code) => {
                return match self.class_name() {
                    Some(class) => write!(f, "<unknown {class} action {code:#x}>"),
                    None => write!(f, "<unknown action {code:#x}>"),
                }
            }
        };
        f.write_str(name)
    }
}
