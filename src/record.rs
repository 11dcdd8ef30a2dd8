//! Probe and record descriptors, and decoding of single records.

use std::fmt;

use plain::Plain;
use serde::{Deserialize, Serialize};

use crate::action::{ActionKind, AddressSpace};
use crate::engine::AddressResolver;
use crate::error::{Error, Result};
use crate::quantize::BucketRange;

/// Returned for `mod()`/`umod()` when the resolved name carries no module.
pub const UNKNOWN_MODULE: &str = "<unknown>";

/// The instrumentation point that fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeDescriptor {
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl ProbeDescriptor {
    pub fn new(provider: &str, module: &str, function: &str, name: &str) -> Self {
        Self {
            provider: provider.to_string(),
            module: module.to_string(),
            function: function.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }
}

/// Where one field lives in a raw buffer and how it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDescriptor {
    pub action: ActionKind,
    pub size: u32,
    pub offset: u32,
}

impl RecordDescriptor {
    pub fn new(action: ActionKind, size: u32, offset: u32) -> Self {
        Self {
            action,
            size,
            offset,
        }
    }

    /// The bytes of this record within `data`.
    pub fn bytes<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.offset as usize;
        start
            .checked_add(self.size as usize)
            .and_then(|end| data.get(start..end))
            .ok_or(Error::Truncated {
                action: self.action,
                offset: self.offset,
                size: self.size,
                len: data.len(),
            })
    }
}

/// Identity of an aggregating expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggVarId(pub u32);

impl fmt::Display for AggVarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One non-empty histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistogramBucket {
    pub range: BucketRange,
    pub count: i64,
}

/// A decoded record or aggregation value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Integer(i64),
    Average(f64),
    String(String),
    /// Non-zero buckets in ascending bucket order.
    Histogram(Vec<HistogramBucket>),
}

impl DecodedValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_histogram(&self) -> Option<&[HistogramBucket]> {
        match self {
            DecodedValue::Histogram(buckets) => Some(buckets),
            _ => None,
        }
    }
}

impl From<i64> for DecodedValue {
    fn from(value: i64) -> Self {
        DecodedValue::Integer(value)
    }
}

impl From<&str> for DecodedValue {
    fn from(value: &str) -> Self {
        DecodedValue::String(value.to_string())
    }
}

/// Copy a `T` out of the front of `bytes`, which need not be aligned.
pub(crate) fn read_plain<T: Plain + Default>(bytes: &[u8]) -> Option<T> {
    let mut value = T::default();
    plain::copy_from_bytes(&mut value, bytes).ok()?;
    Some(value)
}

fn read_u64_at(bytes: &[u8], index: usize) -> Option<u64> {
    bytes.get(index * 8..).and_then(read_plain::<u64>)
}

/// Decode a record whose action is representable.
///
/// # Panics
///
/// Panics if `record.action` is not representable; callers filter those out
/// before getting here.
pub fn decode(
    resolver: &dyn AddressResolver,
    record: &RecordDescriptor,
    data: &[u8],
) -> Result<DecodedValue> {
    let bytes = record.bytes(data)?;
    let truncated = || Error::Truncated {
        action: record.action,
        offset: record.offset,
        size: record.size,
        len: data.len(),
    };

    match record.action {
        ActionKind::DifExpr => Ok(decode_difexpr(bytes)),
        ActionKind::Sym
        | ActionKind::Mod
        | ActionKind::USym
        | ActionKind::UMod
        | ActionKind::UAddr => {
            let name = match record.action.address_space() {
                Some(AddressSpace::Kernel) => {
                    let pc = read_u64_at(bytes, 0).ok_or_else(truncated)?;
                    resolver.kernel_address(pc)
                }
                _ => {
                    let pid = read_u64_at(bytes, 0).ok_or_else(truncated)?;
                    let pc = read_u64_at(bytes, 1).ok_or_else(truncated)?;
                    resolver.user_address(pid, pc)
                }
            };
            Ok(DecodedValue::String(symbol_part(record.action, name)))
        }
        other => unreachable!("record with action {other} is not decodable on its own"),
    }
}

fn decode_difexpr(bytes: &[u8]) -> DecodedValue {
    let value = match bytes.len() {
        1 => read_plain::<i8>(bytes).map(i64::from),
        2 => read_plain::<i16>(bytes).map(i64::from),
        4 => read_plain::<i32>(bytes).map(i64::from),
        8 => read_plain::<i64>(bytes),
        _ => None,
    };
    match value {
        Some(value) => DecodedValue::Integer(value),
        None => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            DecodedValue::String(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
    }
}

// Cut a resolved "module`symbol+0xoff" name down to what the action asks for.
fn symbol_part(action: ActionKind, mut name: String) -> String {
    match action {
        ActionKind::Mod | ActionKind::UMod => match name.find('`') {
            Some(tick) => {
                name.truncate(tick);
                name
            }
            None => UNKNOWN_MODULE.to_string(),
        },
        ActionKind::Sym | ActionKind::USym => {
            if let Some(plus) = name.rfind('+') {
                name.truncate(plus);
            }
            name
        }
        _ => name,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct FixedResolver;

    impl AddressResolver for FixedResolver {
        fn kernel_address(&self, pc: u64) -> String {
            match pc {
                0xffff_0010 => "genunix`bcopy+0x10".to_string(),
                0xffff_0020 => "bare_symbol".to_string(),
                _ => format!("{pc:#x}"),
            }
        }

        fn user_address(&self, pid: u64, pc: u64) -> String {
            format!("libc.so.1`malloc+{:#x}", pc - 0x1000 + pid)
        }
    }

    fn decode_one(action: ActionKind, data: &[u8]) -> DecodedValue {
        let rec = RecordDescriptor::new(action, data.len() as u32, 0);
        decode(&FixedResolver, &rec, data).unwrap()
    }

    #[test]
    fn test_difexpr_integer_widths() {
        assert_eq!(decode_one(ActionKind::DifExpr, &[0xff]), DecodedValue::Integer(-1));
        assert_eq!(
            decode_one(ActionKind::DifExpr, &(-300i16).to_ne_bytes()),
            DecodedValue::Integer(-300)
        );
        assert_eq!(
            decode_one(ActionKind::DifExpr, &70_000i32.to_ne_bytes()),
            DecodedValue::Integer(70_000)
        );
        assert_eq!(
            decode_one(ActionKind::DifExpr, &i64::MIN.to_ne_bytes()),
            DecodedValue::Integer(i64::MIN)
        );
    }

    #[test]
    fn test_difexpr_string() {
        let mut data = b"sshd".to_vec();
        data.resize(32, 0);
        assert_eq!(decode_one(ActionKind::DifExpr, &data), DecodedValue::from("sshd"));

        // No terminator: the whole record is the string.
        assert_eq!(decode_one(ActionKind::DifExpr, b"abc"), DecodedValue::from("abc"));
    }

    #[test]
    fn test_record_offset() {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&42i64.to_ne_bytes());
        let rec = RecordDescriptor::new(ActionKind::DifExpr, 8, 8);
        assert_eq!(decode(&FixedResolver, &rec, &data).unwrap(), DecodedValue::Integer(42));
    }

    #[test]
    fn test_truncated_record() {
        let rec = RecordDescriptor::new(ActionKind::DifExpr, 8, 4);
        let err = decode(&FixedResolver, &rec, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::Truncated { len: 8, .. }));
    }

    #[test]
    fn test_kernel_symbols() {
        let pc = 0xffff_0010u64.to_ne_bytes();
        assert_eq!(decode_one(ActionKind::Sym, &pc), DecodedValue::from("genunix`bcopy"));
        assert_eq!(decode_one(ActionKind::Mod, &pc), DecodedValue::from("genunix"));

        let bare = 0xffff_0020u64.to_ne_bytes();
        assert_eq!(decode_one(ActionKind::Sym, &bare), DecodedValue::from("bare_symbol"));
        assert_eq!(decode_one(ActionKind::Mod, &bare), DecodedValue::from(UNKNOWN_MODULE));
    }

    #[test]
    fn test_user_symbols() {
        let mut data = 4u64.to_ne_bytes().to_vec();
        data.extend_from_slice(&0x1010u64.to_ne_bytes());
        assert_eq!(decode_one(ActionKind::USym, &data), DecodedValue::from("libc.so.1`malloc"));
        assert_eq!(decode_one(ActionKind::UMod, &data), DecodedValue::from("libc.so.1"));
        assert_eq!(
            decode_one(ActionKind::UAddr, &data),
            DecodedValue::from("libc.so.1`malloc+0x14")
        );
    }

    #[test]
    fn test_user_symbol_needs_pid_and_pc() {
        let rec = RecordDescriptor::new(ActionKind::USym, 8, 0);
        let err = decode(&FixedResolver, &rec, &[0u8; 8]).unwrap_err();
        assert!(matches!(err, Error::Truncated { action: ActionKind::USym, .. }));
    }

    #[test]
    #[should_panic(expected = "not decodable")]
    fn test_aggregating_action_is_a_contract_violation() {
        decode_one(ActionKind::Count, &0i64.to_ne_bytes());
    }

    #[test]
    fn test_probe_display() {
        let probe = ProbeDescriptor::new("syscall", "", "read", "entry");
        assert_eq!(probe.to_string(), "syscall::read:entry");
    }
}
