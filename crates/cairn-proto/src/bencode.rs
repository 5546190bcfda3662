//! Bencode encoding and decoding.
//!
//! The DHT wire format is bencode: byte strings (`4:spam`), integers
//! (`i42e`), lists (`l...e`) and dictionaries (`d...e`) with byte-string
//! keys. Dictionaries are kept in a `BTreeMap` so encoding is always
//! canonical (keys in raw byte order).
//!
//! Decoding is strict: the decoder rejects trailing bytes, leading zeros
//! in numbers, and nesting deeper than [`MAX_DEPTH`] (a flat message
//! dictionary never comes close to the limit; deeply nested input is an
//! attack, not a message).

use std::collections::BTreeMap;

use crate::{Result, WireError};

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 8;

/// A bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// A byte string. Not necessarily UTF-8.
    Bytes(Vec<u8>),
    /// A signed integer.
    Int(i64),
    /// A list of values.
    List(Vec<Value>),
    /// A dictionary with byte-string keys, ordered canonically.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// View this value as a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// View this value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// View this value as a dictionary.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// View this value as a mutable dictionary.
    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Encode this value, appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                for (key, val) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    val.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Encode this value to a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

/// Decode a single bencode value, requiring the input to be fully consumed.
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != input.len() {
        return Err(WireError::TrailingBytes(input.len() - decoder.pos));
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(WireError::Truncated(self.pos))
    }

    fn take(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(WireError::TooDeep(MAX_DEPTH));
        }
        match self.peek()? {
            b'i' => self.int(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?.to_vec())),
            byte => Err(WireError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn int(&mut self) -> Result<Value> {
        let start = self.pos;
        self.take()?; // 'i'
        let negative = self.peek()? == b'-';
        if negative {
            self.take()?;
        }
        let mut digits: Vec<u8> = Vec::new();
        loop {
            match self.take()? {
                b'e' => break,
                d @ b'0'..=b'9' => digits.push(d),
                _ => return Err(WireError::MalformedNumber(start)),
            }
        }
        if digits.is_empty() || (digits.len() > 1 && digits[0] == b'0') {
            return Err(WireError::MalformedNumber(start));
        }
        if negative && digits == [b'0'] {
            // "i-0e" is not valid bencode.
            return Err(WireError::MalformedNumber(start));
        }
        let magnitude = std::str::from_utf8(&digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(WireError::MalformedNumber(start))?;
        Ok(Value::Int(if negative { -magnitude } else { magnitude }))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.take()? {
                b':' => break,
                d @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(d - b'0')))
                        .ok_or(WireError::MalformedNumber(start))?;
                }
                _ => return Err(WireError::MalformedNumber(start)),
            }
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(WireError::Truncated(self.input.len()))?;
        let slice = &self.input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn list(&mut self, depth: usize) -> Result<Value> {
        self.take()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.take()?; // 'e'
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value> {
        self.take()?; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.bytes()?.to_vec();
            let val = self.value(depth + 1)?;
            entries.insert(key, val);
        }
        self.take()?; // 'e'
        Ok(Value::Dict(entries))
    }
}
