//! Decoder for the subset of Python's `marshal` format that `pstats` dump
//! files use: containers, numbers, strings and back references.

use thiserror::Error;

const FLAG_REF: u8 = 0x80;
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarshalError {
    #[error("unexpected end of data at offset {offset}")]
    Eof { offset: usize },
    #[error("unsupported type code {code:?} at offset {offset}")]
    UnknownType { code: char, offset: usize },
    #[error("reference {index} at offset {offset} points to nothing")]
    BadRef { index: usize, offset: usize },
    #[error("integer at offset {offset} does not fit in 64 bits")]
    LongOverflow { offset: usize },
    #[error("invalid float literal at offset {offset}")]
    Float { offset: usize },
    #[error("nesting deeper than {MAX_DEPTH} at offset {offset}")]
    TooDeep { offset: usize },
    #[error("{trailing} bytes after the value")]
    Trailing { trailing: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int(i) => Some(i),
            Self::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float(f) => Some(f),
            Self::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    /// Elements of a tuple or list.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) | Self::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Decode one marshalled value spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Value, MarshalError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value(0)?;
    let trailing = data.len() - decoder.pos;
    if trailing > 0 {
        return Err(MarshalError::Trailing { trailing });
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    refs: Vec<Option<Value>>,
    /// Version 0-2 string table used by `R` references.
    interned: Vec<String>,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            refs: Vec::new(),
            interned: Vec::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(MarshalError::Eof { offset: self.pos }),
        }
    }

    fn byte(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, MarshalError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn size(&mut self) -> Result<usize, MarshalError> {
        let offset = self.pos;
        let n = self.i32()?;
        usize::try_from(n).map_err(|_| MarshalError::Eof { offset })
    }

    fn value(&mut self, depth: usize) -> Result<Value, MarshalError> {
        let offset = self.pos;
        if depth > MAX_DEPTH {
            return Err(MarshalError::TooDeep { offset });
        }
        let raw = self.byte()?;
        let code = raw & !FLAG_REF;

        let slot = if raw & FLAG_REF != 0 {
            self.refs.push(None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match code {
            b'N' | b'S' | b'.' => Value::None,
            b'F' => Value::Bool(false),
            b'T' => Value::Bool(true),
            b'i' => Value::Int(i64::from(self.i32()?)),
            b'I' => {
                let bytes = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Int(i64::from_le_bytes(buf))
            }
            b'l' => self.long(offset)?,
            b'g' => {
                let bytes = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Float(f64::from_le_bytes(buf))
            }
            b'f' => {
                let n = usize::from(self.byte()?);
                let text = self.take(n)?;
                std::str::from_utf8(text)
                    .ok()
                    .and_then(|t| t.trim().parse().ok())
                    .map(Value::Float)
                    .ok_or(MarshalError::Float { offset })?
            }
            b's' => {
                let n = self.size()?;
                Value::Bytes(self.take(n)?.to_vec())
            }
            b't' => {
                let n = self.size()?;
                let text = String::from_utf8_lossy(self.take(n)?).into_owned();
                self.interned.push(text.clone());
                Value::Str(text)
            }
            b'u' | b'a' | b'A' => {
                let n = self.size()?;
                Value::Str(String::from_utf8_lossy(self.take(n)?).into_owned())
            }
            b'z' | b'Z' => {
                let n = usize::from(self.byte()?);
                Value::Str(String::from_utf8_lossy(self.take(n)?).into_owned())
            }
            b'R' => {
                let index = self.size()?;
                self.interned
                    .get(index)
                    .cloned()
                    .map(Value::Str)
                    .ok_or(MarshalError::BadRef { index, offset })?
            }
            b'r' => {
                let index = self.size()?;
                match self.refs.get(index) {
                    Some(Some(value)) => value.clone(),
                    _ => return Err(MarshalError::BadRef { index, offset }),
                }
            }
            b'(' | b'[' | b'<' | b'>' => {
                let n = self.size()?;
                let items = self.items(n, depth)?;
                match code {
                    b'(' => Value::Tuple(items),
                    b'[' => Value::List(items),
                    _ => Value::Set(items),
                }
            }
            b')' => {
                let n = usize::from(self.byte()?);
                Value::Tuple(self.items(n, depth)?)
            }
            b'{' => {
                let mut pairs = Vec::new();
                loop {
                    if self.data.get(self.pos) == Some(&b'0') {
                        self.pos += 1;
                        break;
                    }
                    let key = self.value(depth + 1)?;
                    let value = self.value(depth + 1)?;
                    pairs.push((key, value));
                }
                Value::Dict(pairs)
            }
            other => {
                return Err(MarshalError::UnknownType {
                    code: char::from(other),
                    offset,
                });
            }
        };

        if let Some(slot) = slot {
            self.refs[slot] = Some(value.clone());
        }
        Ok(value)
    }

    fn items(&mut self, n: usize, depth: usize) -> Result<Vec<Value>, MarshalError> {
        let mut items = Vec::with_capacity(n.min(4096));
        for _ in 0..n {
            items.push(self.value(depth + 1)?);
        }
        Ok(items)
    }

    /// Arbitrary-precision integer stored as 15-bit digits, least
    /// significant first; the sign of the digit count is the sign.
    fn long(&mut self, offset: usize) -> Result<Value, MarshalError> {
        let count = self.i32()?;
        let negative = count < 0;
        let mut total: i64 = 0;
        for i in 0..count.unsigned_abs() {
            let bytes = self.take(2)?;
            let digit = i64::from(u16::from_le_bytes([bytes[0], bytes[1]]));
            let shifted = 1i64
                .checked_shl(15 * i)
                .filter(|_| 15 * i < 63)
                .and_then(|scale| digit.checked_mul(scale))
                .ok_or(MarshalError::LongOverflow { offset })?;
            total = total
                .checked_add(shifted)
                .ok_or(MarshalError::LongOverflow { offset })?;
        }
        Ok(Value::Int(if negative { -total } else { total }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal encoder for building test inputs.
    pub(crate) fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        write(value, &mut out);
        out
    }

    fn write(value: &Value, out: &mut Vec<u8>) {
        match value {
            Value::None => out.push(b'N'),
            Value::Bool(b) => out.push(if *b { b'T' } else { b'F' }),
            Value::Int(i) => {
                out.push(b'i');
                out.extend((*i as i32).to_le_bytes());
            }
            Value::Float(f) => {
                out.push(b'g');
                out.extend(f.to_le_bytes());
            }
            Value::Str(s) => {
                out.push(b'z');
                out.push(s.len() as u8);
                out.extend(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(b's');
                out.extend((b.len() as i32).to_le_bytes());
                out.extend(b);
            }
            Value::Tuple(items) => {
                out.push(b')');
                out.push(items.len() as u8);
                items.iter().for_each(|v| write(v, out));
            }
            Value::List(items) | Value::Set(items) => {
                out.push(b'[');
                out.extend((items.len() as i32).to_le_bytes());
                items.iter().for_each(|v| write(v, out));
            }
            Value::Dict(pairs) => {
                out.push(b'{');
                for (k, v) in pairs {
                    write(k, out);
                    write(v, out);
                }
                out.push(b'0');
            }
        }
    }

    #[test]
    fn scalars() {
        assert_eq!(decode(b"N"), Ok(Value::None));
        assert_eq!(decode(&[b'i', 0xfe, 0xff, 0xff, 0xff]), Ok(Value::Int(-2)));
        assert_eq!(decode(b"f\x041.25"), Ok(Value::Float(1.25)));
        assert_eq!(decode(b"z\x03abc"), Ok(Value::Str("abc".into())));
    }

    #[test]
    fn long_digits() {
        // 2**15 + 3 as two 15-bit digits.
        let data = [b'l', 2, 0, 0, 0, 3, 0, 1, 0];
        assert_eq!(decode(&data), Ok(Value::Int(32_771)));
        let negative = [b'l', 0xff, 0xff, 0xff, 0xff, 7, 0];
        assert_eq!(decode(&negative), Ok(Value::Int(-7)));
    }

    #[test]
    fn flagged_values_can_be_referenced() {
        // (ref-flagged "app.py", r0)
        let mut data = vec![b')', 2, b'z' | FLAG_REF, 6];
        data.extend(b"app.py");
        data.extend([b'r', 0, 0, 0, 0]);
        assert_eq!(
            decode(&data),
            Ok(Value::Tuple(vec![Value::Str("app.py".into()), Value::Str("app.py".into())]))
        );
        assert_eq!(
            decode(&[b'r', 3, 0, 0, 0]),
            Err(MarshalError::BadRef { index: 3, offset: 0 })
        );
    }

    #[test]
    fn interned_string_table() {
        let mut data = vec![b'(', 2, 0, 0, 0, b't', 1, 0, 0, 0, b'x'];
        data.extend([b'R', 0, 0, 0, 0]);
        assert_eq!(
            decode(&data),
            Ok(Value::Tuple(vec![Value::Str("x".into()), Value::Str("x".into())]))
        );
    }

    #[test]
    fn dict_round_trips_through_the_test_encoder() {
        let value = Value::Dict(vec![(
            Value::Tuple(vec![Value::Str("a.py".into()), Value::Int(3), Value::Str("f".into())]),
            Value::Float(0.5),
        )]);
        assert_eq!(decode(&encode(&value)), Ok(value));
    }

    #[test]
    fn truncated_and_unknown_input() {
        assert_eq!(decode(b"z\x05ab"), Err(MarshalError::Eof { offset: 2 }));
        assert_eq!(
            decode(b"c"),
            Err(MarshalError::UnknownType { code: 'c', offset: 0 })
        );
        assert_eq!(decode(b"NN"), Err(MarshalError::Trailing { trailing: 1 }));
    }
}
