//! Pickle protocol 4 codec for the legacy value model
//!
//! Implements the subset of Python's pickle wire format that the legacy
//! Django-side platform actually exchanges. The encoder emits exactly the
//! byte stream the legacy peer expects (protocol 4 framing, memoized
//! strings, the dict/mark scaffold for containers); the decoder accepts a
//! strictly wider opcode grammar than the encoder emits, since the peer's
//! own encoder uses more opcode variety.
//!
//! Two deliberate divergences from CPython's opcode table, carried over
//! from the legacy reader and required for compatibility with it:
//! - `0x58` is treated as a byte blob (CPython calls it BINUNICODE), so
//!   CPython long strings decode here as [`Value::Bytes`].
//! - BINFLOAT (`0x47`) is parsed and emitted little-endian.

use crate::error::{ErrorCategory, ErrorKind, PickleboxError, Result};
use crate::value::Value;

const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const MEMOIZE: u8 = 0x94;
const STOP: u8 = 0x2e;
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE: u8 = 0x8d;
const BINBYTES: u8 = 0x58;
const BINBYTES8: u8 = 0x8e;
const EMPTY_DICT: u8 = 0x7d;
const SETITEM: u8 = 0x73;
const SETITEMS: u8 = 0x75;
const MARK: u8 = 0x28;
const LIST: u8 = 0x65;
const TUPLE1: u8 = 0x85;
const TUPLE_COUNT: u8 = 0x86;
const TUPLE3: u8 = 0x29;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const BININT: u8 = 0x4a;
const BINFLOAT: u8 = 0x47;
const LONG1: u8 = 0x8a;

/// Protocol version the encoder emits.
const PROTOCOL: u8 = 4;

/// Highest protocol version the decoder accepts.
const HIGHEST_PROTOCOL: u8 = 5;

/// Offset of the first byte covered by the frame length field.
const FRAME_BODY_START: usize = 11;

/// The decodable opcode set, dispatched from exactly one `TryFrom` so an
/// unsupported byte has a single failure point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Frame,
    Memoize,
    Stop,
    ShortBinUnicode,
    BinUnicode,
    BinBytes,
    BinBytes8,
    EmptyDict,
    SetItem,
    SetItems,
    Mark,
    List,
    Tuple1,
    /// Count-prefixed tuple. The legacy reader pops an item count for
    /// `0x86` (unlike CPython's fixed two-tuple); reproduce that.
    TupleCount,
    Tuple3,
    NewTrue,
    NewFalse,
    BinInt,
    BinFloat,
    Long1,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> std::result::Result<Self, u8> {
        Ok(match byte {
            FRAME => Opcode::Frame,
            MEMOIZE => Opcode::Memoize,
            STOP => Opcode::Stop,
            SHORT_BINUNICODE => Opcode::ShortBinUnicode,
            BINUNICODE => Opcode::BinUnicode,
            BINBYTES => Opcode::BinBytes,
            BINBYTES8 => Opcode::BinBytes8,
            EMPTY_DICT => Opcode::EmptyDict,
            SETITEM => Opcode::SetItem,
            SETITEMS => Opcode::SetItems,
            MARK => Opcode::Mark,
            LIST => Opcode::List,
            TUPLE1 => Opcode::Tuple1,
            TUPLE_COUNT => Opcode::TupleCount,
            TUPLE3 => Opcode::Tuple3,
            NEWTRUE => Opcode::NewTrue,
            NEWFALSE => Opcode::NewFalse,
            BININT => Opcode::BinInt,
            BINFLOAT => Opcode::BinFloat,
            LONG1 => Opcode::Long1,
            other => return Err(other),
        })
    }
}

/// Encode a value to pickle protocol 4 bytes.
///
/// The output always decodes back to an equal value via [`decode`].
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&[PROTO, PROTOCOL, FRAME]);
    out.extend_from_slice(&[0u8; 8]);
    write_value(value, &mut out)?;
    out.push(STOP);

    // Backpatch the frame length. It covers everything after the length
    // field, STOP included, matching the CPython framer.
    let frame_len = (out.len() - FRAME_BODY_START) as u64;
    out[3..FRAME_BODY_START].copy_from_slice(&frame_len.to_le_bytes());
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Text(s) => {
            let bytes = s.as_bytes();
            if bytes.len() < 256 {
                out.push(SHORT_BINUNICODE);
                out.push(bytes.len() as u8);
            } else {
                out.push(BINUNICODE);
                out.extend_from_slice(&length_field(bytes.len(), "string")?.to_le_bytes());
            }
            out.extend_from_slice(bytes);
            out.push(MEMOIZE);
        }
        Value::Bytes(bytes) => {
            out.push(BINBYTES);
            out.extend_from_slice(&length_field(bytes.len(), "byte blob")?.to_le_bytes());
            out.extend_from_slice(bytes);
            out.push(MEMOIZE);
        }
        Value::Map(pairs) => {
            out.extend_from_slice(&[EMPTY_DICT, MEMOIZE, MARK]);
            for (key, val) in pairs {
                write_value(key, out)?;
                write_value(val, out)?;
            }
            out.push(SETITEMS);
        }
        Value::List(items) => {
            // The legacy encoder builds lists on a dict/mark scaffold; its
            // peer expects that exact stream, so do not simplify this to a
            // bare mark/LIST sequence.
            out.extend_from_slice(&[EMPTY_DICT, MEMOIZE, MARK]);
            for item in items {
                write_value(item, out)?;
            }
            out.push(LIST);
        }
        Value::Bool(b) => out.push(if *b { NEWTRUE } else { NEWFALSE }),
        Value::Int(n) => {
            if let Ok(small) = i32::try_from(*n) {
                out.push(BININT);
                out.extend_from_slice(&small.to_le_bytes());
            } else {
                let bytes = long1_bytes(*n);
                out.push(LONG1);
                out.push(bytes.len() as u8);
                out.extend_from_slice(&bytes);
            }
        }
        Value::Float(f) => {
            out.push(BINFLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
    }
    Ok(())
}

fn length_field(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        PickleboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::ValueTooLarge,
            format!("{what} of {len} bytes exceeds the 32-bit length field"),
        )
    })
}

/// Minimal little-endian two's-complement encoding of an integer outside
/// the BININT range.
fn long1_bytes(n: i64) -> Vec<u8> {
    let mut bytes = n.to_le_bytes().to_vec();
    if n >= 0 {
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0x00 && bytes[bytes.len() - 2] < 0x80 {
            bytes.pop();
        }
    } else {
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0xff && bytes[bytes.len() - 2] >= 0x80 {
            bytes.pop();
        }
    }
    bytes
}

/// Decode pickle bytes into a value.
///
/// Decoding ends at the first STOP opcode; trailing bytes are ignored.
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut reader = Reader::new(data);

    let header = reader.read_u8("protocol header")?;
    if header != PROTO {
        return Err(PickleboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::UnsupportedProtocol,
            format!("unsupported pickle protocol header 0x{header:02x}"),
        ));
    }
    let version = reader.read_u8("protocol version")?;
    if version > HIGHEST_PROTOCOL {
        return Err(PickleboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::UnsupportedProtocol,
            format!("unsupported pickle protocol version {version}"),
        ));
    }

    let mut stack: Vec<Value> = Vec::new();
    let mut marks: Vec<usize> = Vec::new();

    while !reader.is_empty() {
        let byte = reader.read_u8("opcode")?;
        let opcode = Opcode::try_from(byte).map_err(|b| {
            PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedOpcode,
                format!("unsupported pickle opcode 0x{b:02x}"),
            )
        })?;

        match opcode {
            Opcode::Frame => {
                // Frame length is advisory; skip it.
                reader.read_bytes(8, "frame length")?;
            }
            Opcode::Memoize => {
                // The memo is never read back in the supported grammar.
            }
            Opcode::Stop => return pop(&mut stack, "STOP"),
            Opcode::ShortBinUnicode => {
                let len = reader.read_u8("string length")? as usize;
                let bytes = reader.read_bytes(len, "string body")?;
                stack.push(Value::Text(lossy_text(bytes)));
            }
            Opcode::BinUnicode => {
                let len = reader.read_u32_le("string length")? as usize;
                let bytes = reader.read_bytes(len, "string body")?;
                stack.push(Value::Text(lossy_text(bytes)));
            }
            Opcode::BinBytes => {
                let len = reader.read_u32_le("byte blob length")? as usize;
                let bytes = reader.read_bytes(len, "byte blob body")?;
                stack.push(Value::Bytes(bytes.to_vec()));
            }
            Opcode::BinBytes8 => {
                let len = reader.read_u64_le("byte blob length")?;
                let len = usize::try_from(len).map_err(|_| {
                    PickleboxError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::ValueTooLarge,
                        "BINBYTES8 length exceeds this system's max usize",
                    )
                })?;
                let bytes = reader.read_bytes(len, "byte blob body")?;
                stack.push(Value::Bytes(bytes.to_vec()));
            }
            Opcode::EmptyDict => stack.push(Value::Map(Vec::new())),
            Opcode::SetItem => {
                let val = pop(&mut stack, "SETITEM")?;
                let key = pop(&mut stack, "SETITEM")?;
                match stack.last_mut() {
                    Some(Value::Map(pairs)) => pairs.push((key, val)),
                    _ => return Err(stack_mismatch("SETITEM target is not a dict")),
                }
            }
            Opcode::SetItems => {
                let items = drain_mark(&mut stack, &mut marks, "SETITEMS")?;
                if items.len() % 2 != 0 {
                    return Err(stack_mismatch("SETITEMS with an odd number of items"));
                }
                match stack.last_mut() {
                    Some(Value::Map(pairs)) => {
                        let mut it = items.into_iter();
                        while let (Some(key), Some(val)) = (it.next(), it.next()) {
                            pairs.push((key, val));
                        }
                    }
                    _ => return Err(stack_mismatch("SETITEMS target is not a dict")),
                }
            }
            Opcode::Mark => marks.push(stack.len()),
            Opcode::List => {
                let items = drain_mark(&mut stack, &mut marks, "LIST")?;
                // The legacy list scaffold leaves its empty dict beneath the
                // mark; remove it so a nested list does not leak it into the
                // surrounding container's operands.
                if matches!(stack.last(), Some(Value::Map(pairs)) if pairs.is_empty()) {
                    stack.pop();
                }
                stack.push(Value::List(items));
            }
            Opcode::Tuple1 => {
                let item = pop(&mut stack, "TUPLE1")?;
                stack.push(Value::List(vec![item]));
            }
            Opcode::TupleCount => {
                let count = match pop(&mut stack, "tuple count")? {
                    Value::Int(n) if n >= 0 => n as usize,
                    _ => return Err(stack_mismatch("tuple count is not a non-negative int")),
                };
                if count > stack.len() {
                    return Err(stack_mismatch("tuple count exceeds operand stack depth"));
                }
                let items = stack.split_off(stack.len() - count);
                stack.push(Value::List(items));
            }
            Opcode::Tuple3 => {
                let third = pop(&mut stack, "TUPLE3")?;
                let second = pop(&mut stack, "TUPLE3")?;
                let first = pop(&mut stack, "TUPLE3")?;
                stack.push(Value::List(vec![first, second, third]));
            }
            Opcode::NewTrue => stack.push(Value::Bool(true)),
            Opcode::NewFalse => stack.push(Value::Bool(false)),
            Opcode::BinInt => {
                let n = reader.read_i32_le("BININT body")?;
                stack.push(Value::Int(n as i64));
            }
            Opcode::BinFloat => {
                let f = reader.read_f64_le("BINFLOAT body")?;
                stack.push(Value::Float(f));
            }
            Opcode::Long1 => {
                let len = reader.read_u8("LONG1 length")? as usize;
                if len > 8 {
                    return Err(PickleboxError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::IntegerOverflow,
                        format!("LONG1 length {len} exceeds the 64-bit accumulator"),
                    ));
                }
                let bytes = reader.read_bytes(len, "LONG1 body")?;
                stack.push(Value::Int(long1_value(bytes)));
            }
        }
    }

    Err(PickleboxError::with_kind(
        ErrorCategory::User,
        ErrorKind::MissingStop,
        "STOP opcode not found in pickle data",
    ))
}

/// Little-endian magnitude with two's-complement sign handling. A length
/// of zero is the value 0.
fn long1_value(bytes: &[u8]) -> i64 {
    let mut value: i128 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= (*byte as i128) << (8 * i);
    }
    if bytes.last().is_some_and(|last| last & 0x80 != 0) {
        value -= 1i128 << (8 * bytes.len());
    }
    value as i64
}

/// The legacy reader tolerates invalid UTF-8 by substituting replacement
/// characters; match that rather than rejecting.
fn lossy_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn pop(stack: &mut Vec<Value>, op: &str) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| stack_mismatch(&format!("operand stack empty while handling {op}")))
}

fn drain_mark(stack: &mut Vec<Value>, marks: &mut Vec<usize>, op: &str) -> Result<Vec<Value>> {
    let at = marks
        .pop()
        .ok_or_else(|| stack_mismatch(&format!("{op} without an active mark")))?;
    if at > stack.len() {
        return Err(PickleboxError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "mark index beyond operand stack depth",
        ));
    }
    Ok(stack.split_off(at))
}

fn stack_mismatch(msg: &str) -> PickleboxError {
    PickleboxError::with_kind(ErrorCategory::User, ErrorKind::StackMismatch, msg.to_owned())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(PickleboxError::with_kind(
                ErrorCategory::User,
                ErrorKind::TruncatedInput,
                format!("input likely truncated while reading {what}"),
            ));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.read_bytes(1, what)?[0])
    }

    fn read_u32_le(&mut self, what: &str) -> Result<u32> {
        let bytes: [u8; 4] = self.read_bytes(4, what)?.try_into().unwrap();
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64_le(&mut self, what: &str) -> Result<u64> {
        let bytes: [u8; 8] = self.read_bytes(8, what)?.try_into().unwrap();
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_i32_le(&mut self, what: &str) -> Result<i32> {
        let bytes: [u8; 4] = self.read_bytes(4, what)?.try_into().unwrap();
        Ok(i32::from_le_bytes(bytes))
    }

    fn read_f64_le(&mut self, what: &str) -> Result<f64> {
        let bytes: [u8; 8] = self.read_bytes(8, what)?.try_into().unwrap();
        Ok(f64::from_le_bytes(bytes))
    }
}
