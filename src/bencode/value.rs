use std::collections::BTreeMap;
use thiserror::Error;

/// A bencode value: one of the four shapes the grammar allows.
///
/// Dictionaries use a `BTreeMap` keyed on the raw key bytes rather than a `HashMap`: since
/// `Vec<u8>`'s `Ord` impl is exactly ascending raw-byte comparison, iterating a `BTreeMap`
/// already yields the canonical key order the encoder must emit — no separate sort step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors a bencode parse or encode can raise.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    TruncatedInput,

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("unknown value prefix byte: {0:#04x}")]
    UnknownPrefix(u8),

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("duplicate dictionary key")]
    DuplicateKey,

    #[error("top-level value is neither a dictionary nor a list")]
    SourceNotStructOrSlice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
