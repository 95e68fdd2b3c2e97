use std::io::{Read, Write};

use super::decode::decode;
use super::encode::encode_value;
use super::value::{BencodeError, BencodeResult, Value};

/// Binds a [`Value`] onto a typed record.
///
/// This is the Rust stand-in for the original's reflection-driven field binder: Rust has no
/// runtime reflection, so each record hand-implements this trait, naming its own dictionary
/// tags explicitly instead of reading them off a struct-tag table at runtime. The tolerant
/// "skip on kind mismatch, leave the default" policy lives in each impl: a missing or
/// wrong-shaped key simply never gets written into the destination field.
pub trait FromBencode: Sized {
    fn from_bencode(value: &Value) -> Option<Self>;
}

/// Inverse of [`FromBencode`]: turns a typed record back into a [`Value`] tree.
pub trait ToBencode {
    fn to_bencode(&self) -> Value;
}

impl FromBencode for String {
    fn from_bencode(value: &Value) -> Option<Self> {
        value
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl ToBencode for String {
    fn to_bencode(&self) -> Value {
        Value::Bytes(self.as_bytes().to_vec())
    }
}

impl FromBencode for i64 {
    fn from_bencode(value: &Value) -> Option<Self> {
        value.as_integer()
    }
}

impl ToBencode for i64 {
    fn to_bencode(&self) -> Value {
        Value::Integer(*self)
    }
}

impl<T: ToBencode> ToBencode for Vec<T> {
    fn to_bencode(&self) -> Value {
        Value::List(self.iter().map(ToBencode::to_bencode).collect())
    }
}

/// Binds a bencode list to a `Vec<T>`, dropping elements that don't bind rather than failing
/// the whole sequence (the "recurse per element, skip on mismatch" rule of the type matrix).
/// A free function rather than a blanket `impl<T: FromBencode> FromBencode for Vec<T>`: that
/// blanket impl would make it impossible to ever add a concrete `impl FromBencode for Vec<u8>`
/// (raw-bytes fields) without a coherence conflict, so sequence fields call this explicitly.
pub fn bind_list<T: FromBencode>(value: &Value) -> Vec<T> {
    match value {
        Value::List(items) => items.iter().filter_map(T::from_bencode).collect(),
        _ => Vec::new(),
    }
}

/// Binds a bencode dictionary to a record field, recursing through [`FromBencode`].
pub fn bind_record<T: FromBencode>(value: &Value) -> Option<T> {
    match value {
        Value::Dict(_) => T::from_bencode(value),
        _ => None,
    }
}

/// Parses `reader` to a single bencode value and binds it to `T`.
pub fn unmarshal<R: Read, T: FromBencode>(reader: &mut R) -> BencodeResult<T> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    let value = decode(&buf)?;
    T::from_bencode(&value).ok_or(BencodeError::SourceNotStructOrSlice)
}

/// Converts `value` to its bencode tree and writes the canonical encoding.
pub fn marshal<W: Write, T: ToBencode>(writer: &mut W, value: &T) -> BencodeResult<usize> {
    encode_value(writer, &value.to_bencode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default, PartialEq)]
    struct Demo {
        name: String,
        count: i64,
        tags: Vec<String>,
    }

    impl FromBencode for Demo {
        fn from_bencode(value: &Value) -> Option<Self> {
            let dict = value.as_dict()?;
            let mut out = Demo::default();
            if let Some(v) = dict.get(b"name".as_slice()) {
                if let Some(bound) = String::from_bencode(v) {
                    out.name = bound;
                }
            }
            if let Some(v) = dict.get(b"count".as_slice()) {
                if let Some(bound) = i64::from_bencode(v) {
                    out.count = bound;
                }
            }
            if let Some(v) = dict.get(b"tags".as_slice()) {
                out.tags = bind_list(v);
            }
            Some(out)
        }
    }

    impl ToBencode for Demo {
        fn to_bencode(&self) -> Value {
            let mut dict = BTreeMap::new();
            dict.insert(b"name".to_vec(), self.name.to_bencode());
            dict.insert(b"count".to_vec(), self.count.to_bencode());
            dict.insert(b"tags".to_vec(), self.tags.to_bencode());
            Value::Dict(dict)
        }
    }

    #[test]
    fn unmarshal_binds_known_fields_and_skips_missing() {
        let mut input: &[u8] = b"d4:name5:alice5:counti3eee";
        let demo: Demo = unmarshal(&mut input).unwrap();
        assert_eq!(demo.name, "alice");
        assert_eq!(demo.count, 3);
        assert!(demo.tags.is_empty());
    }

    #[test]
    fn unmarshal_tolerates_kind_mismatch_by_leaving_default() {
        // "count" is a string here instead of an integer: per the type matrix this is a
        // skip, not a failure.
        let mut input: &[u8] = b"d4:name5:alice5:count3:xyze";
        let demo: Demo = unmarshal(&mut input).unwrap();
        assert_eq!(demo.name, "alice");
        assert_eq!(demo.count, 0);
    }

    #[test]
    fn unmarshal_unknown_extra_keys_are_ignored() {
        let mut input: &[u8] = b"d4:name5:alice5:extra3:xyzee";
        let demo: Demo = unmarshal(&mut input).unwrap();
        assert_eq!(demo.name, "alice");
    }

    #[test]
    fn marshal_emits_sorted_struct_keys() {
        let demo = Demo {
            name: "bob".to_string(),
            count: 9,
            tags: vec!["a".to_string(), "b".to_string()],
        };
        let mut buf = Vec::new();
        marshal(&mut buf, &demo).unwrap();
        assert_eq!(buf, b"d5:counti9e4:name3:bob4:tagsl1:a1:bee");
    }

    #[test]
    fn non_dict_top_level_fails_struct_binding() {
        let mut input: &[u8] = b"i5e";
        let result: BencodeResult<Demo> = unmarshal(&mut input);
        assert!(matches!(result, Err(BencodeError::SourceNotStructOrSlice)));
    }

    #[test]
    fn list_binds_homogeneous_sequence() {
        let value = decode(b"l5:alice3:bobe").unwrap();
        let names: Vec<String> = bind_list(&value);
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
    }
}
