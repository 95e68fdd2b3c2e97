use std::collections::BTreeMap;
use std::ops::Range;

use super::value::{BencodeError, BencodeResult, Value};

/// Parses a complete bencode value from `bytes`, starting at offset 0.
///
/// Trailing bytes after the value are ignored, matching the teacher's decoder, which only
/// ever gets called on buffers that hold exactly one encoded value (a torrent file, a tracker
/// response body).
pub fn decode(bytes: &[u8]) -> BencodeResult<Value> {
    let (value, _next) = decode_at(bytes, 0)?;
    Ok(value)
}

/// Parses the outer value as a dictionary and records the byte span of each of its direct
/// children as they appeared in `bytes`.
///
/// This is how [`crate::torrent::parse_metainfo`] recovers the raw, unmodified bytes of the
/// `info` sub-dictionary to hash: re-encoding the parsed value could legitimately reorder or
/// drop unknown keys, which would silently change the hash relative to the source file.
pub fn decode_top_level_with_spans(
    bytes: &[u8],
) -> BencodeResult<(BTreeMap<Vec<u8>, Value>, BTreeMap<Vec<u8>, Range<usize>>)> {
    let first = *bytes.first().ok_or(BencodeError::TruncatedInput)?;
    if first != b'd' {
        return Err(BencodeError::InvalidFormat(
            "top-level value is not a dictionary".to_string(),
        ));
    }

    let mut items = BTreeMap::new();
    let mut spans = BTreeMap::new();
    let mut pos = 1;
    loop {
        let byte = *bytes.get(pos).ok_or(BencodeError::TruncatedInput)?;
        if byte == b'e' {
            pos += 1;
            break;
        }
        let (key, after_key) = decode_bytes(bytes, pos)?;
        let value_start = after_key;
        let (value, after_value) = decode_at(bytes, after_key)?;
        if items.insert(key.clone(), value).is_some() {
            return Err(BencodeError::DuplicateKey);
        }
        spans.insert(key, value_start..after_value);
        pos = after_value;
    }
    Ok((items, spans))
}

/// One level of an in-progress container, kept on an explicit heap stack instead of the call
/// stack so that nesting depth is bounded only by available memory, never by the native
/// thread stack.
enum Frame {
    List(Vec<Value>),
    DictAwaitingKey(BTreeMap<Vec<u8>, Value>),
    DictAwaitingValue {
        items: BTreeMap<Vec<u8>, Value>,
        key: Vec<u8>,
    },
}

/// Iteratively decodes one value starting at `start`, returning it along with the position
/// just past it. Never recurses: `l...e` and `d...e` push a [`Frame`] instead of calling
/// itself, so depth of nesting costs heap, not stack.
fn decode_at(bytes: &[u8], start: usize) -> BencodeResult<(Value, usize)> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut pos = start;

    loop {
        let byte = *bytes.get(pos).ok_or(BencodeError::TruncatedInput)?;

        if byte == b'e' {
            let frame = stack.pop().ok_or_else(|| {
                BencodeError::InvalidFormat("unexpected 'e' with no open container".to_string())
            })?;
            pos += 1;
            let value = match frame {
                Frame::List(items) => Value::List(items),
                Frame::DictAwaitingKey(items) => Value::Dict(items),
                Frame::DictAwaitingValue { .. } => {
                    return Err(BencodeError::InvalidFormat(
                        "dictionary key with no value".to_string(),
                    ))
                }
            };
            if let Some(done) = attach(&mut stack, value)? {
                return Ok((done, pos));
            }
            continue;
        }

        // Inside a dict awaiting a key, the next token must be a byte-string.
        if matches!(stack.last(), Some(Frame::DictAwaitingKey(_))) {
            if !byte.is_ascii_digit() {
                return Err(BencodeError::DictKeyNotString);
            }
            let (key, next_pos) = decode_bytes(bytes, pos)?;
            pos = next_pos;
            if let Some(Frame::DictAwaitingKey(items)) = stack.pop() {
                stack.push(Frame::DictAwaitingValue { items, key });
            }
            continue;
        }

        match byte {
            b'0'..=b'9' => {
                let (s, next_pos) = decode_bytes(bytes, pos)?;
                pos = next_pos;
                if let Some(done) = attach(&mut stack, Value::Bytes(s))? {
                    return Ok((done, pos));
                }
            }
            b'i' => {
                let (i, next_pos) = decode_integer(bytes, pos)?;
                pos = next_pos;
                if let Some(done) = attach(&mut stack, Value::Integer(i))? {
                    return Ok((done, pos));
                }
            }
            b'l' => {
                stack.push(Frame::List(Vec::new()));
                pos += 1;
            }
            b'd' => {
                stack.push(Frame::DictAwaitingKey(BTreeMap::new()));
                pos += 1;
            }
            other => return Err(BencodeError::UnknownPrefix(other)),
        }
    }
}

/// Attaches a completed value to the frame on top of the stack. Returns `Some(value)` if there
/// was no enclosing frame (i.e. `value` is the final, top-level result).
fn attach(stack: &mut Vec<Frame>, value: Value) -> BencodeResult<Option<Value>> {
    match stack.pop() {
        None => Ok(Some(value)),
        Some(Frame::List(mut items)) => {
            items.push(value);
            stack.push(Frame::List(items));
            Ok(None)
        }
        Some(Frame::DictAwaitingValue { mut items, key }) => {
            if items.insert(key, value).is_some() {
                return Err(BencodeError::DuplicateKey);
            }
            stack.push(Frame::DictAwaitingKey(items));
            Ok(None)
        }
        Some(Frame::DictAwaitingKey(_)) => {
            unreachable!("a key is always decoded before attach() is called for its value")
        }
    }
}

fn decode_bytes(bytes: &[u8], pos: usize) -> BencodeResult<(Vec<u8>, usize)> {
    let (len, colon_pos) = decode_length_prefix(bytes, pos)?;
    let start = colon_pos + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::InvalidStringLength)?;
    if end > bytes.len() {
        return Err(BencodeError::TruncatedInput);
    }
    Ok((bytes[start..end].to_vec(), end))
}

fn decode_length_prefix(bytes: &[u8], pos: usize) -> BencodeResult<(usize, usize)> {
    let mut cursor = pos;
    let digits_start = cursor;
    while bytes.get(cursor).is_some_and(u8::is_ascii_digit) {
        cursor += 1;
    }
    if cursor == digits_start {
        return Err(BencodeError::InvalidStringLength);
    }
    match bytes.get(cursor) {
        Some(b':') => {}
        Some(_) => return Err(BencodeError::InvalidStringLength),
        None => return Err(BencodeError::TruncatedInput),
    }
    let digits = std::str::from_utf8(&bytes[digits_start..cursor])
        .map_err(|_| BencodeError::InvalidStringLength)?;
    let len = digits
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    Ok((len, cursor))
}

fn decode_integer(bytes: &[u8], pos: usize) -> BencodeResult<(i64, usize)> {
    debug_assert_eq!(bytes[pos], b'i');
    let digits_start = pos + 1;
    let mut cursor = digits_start;
    while bytes.get(cursor).is_some_and(|&b| b != b'e') {
        cursor += 1;
    }
    if cursor >= bytes.len() {
        return Err(BencodeError::TruncatedInput);
    }
    let digits = &bytes[digits_start..cursor];
    validate_integer_digits(digits)?;
    let text = std::str::from_utf8(digits)
        .map_err(|_| BencodeError::InvalidFormat("integer is not valid UTF-8".to_string()))?;
    let value = text
        .parse::<i64>()
        .map_err(|e| BencodeError::InvalidFormat(format!("invalid integer '{text}': {e}")))?;
    Ok((value, cursor + 1))
}

fn validate_integer_digits(digits: &[u8]) -> BencodeResult<()> {
    if digits.is_empty() {
        return Err(BencodeError::InvalidFormat("empty integer".to_string()));
    }
    if digits == b"-0" {
        return Err(BencodeError::InvalidFormat(
            "negative zero is not a valid integer".to_string(),
        ));
    }
    let (sign, rest) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if sign && rest.is_empty() {
        return Err(BencodeError::InvalidFormat(
            "'-' with no digits".to_string(),
        ));
    }
    if rest.len() > 1 && rest[0] == b'0' {
        return Err(BencodeError::InvalidFormat(
            "leading zeros are not allowed".to_string(),
        ));
    }
    if !rest.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidFormat(
            "non-digit character in integer".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_string() {
        let v = decode(b"5:hello").unwrap();
        assert_eq!(v.as_bytes(), Some(&b"hello"[..]));
    }

    #[test]
    fn decodes_zero_length_string() {
        let v = decode(b"0:").unwrap();
        assert_eq!(v.as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn rejects_negative_string_length() {
        assert!(matches!(
            decode(b"-1:x"),
            Err(BencodeError::InvalidStringLength)
        ));
    }

    #[test]
    fn truncated_string_is_truncated_input() {
        assert!(matches!(
            decode(b"5:ab"),
            Err(BencodeError::TruncatedInput)
        ));
    }

    #[test]
    fn decodes_zero_integer() {
        assert_eq!(decode(b"i0e").unwrap().as_integer(), Some(0));
    }

    #[test]
    fn decodes_negative_integer() {
        assert_eq!(decode(b"i-42e").unwrap().as_integer(), Some(-42));
    }

    #[test]
    fn decodes_full_i64_range() {
        assert_eq!(decode(b"i9223372036854775807e").unwrap().as_integer(), Some(i64::MAX));
        assert_eq!(decode(b"i-9223372036854775808e").unwrap().as_integer(), Some(i64::MIN));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidFormat(_))));
    }

    #[test]
    fn rejects_leading_zero() {
        assert!(matches!(decode(b"i01e"), Err(BencodeError::InvalidFormat(_))));
    }

    #[test]
    fn rejects_empty_integer() {
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidFormat(_))));
    }

    #[test]
    fn decodes_list() {
        let v = decode(b"li42ei-1ee").unwrap();
        let list = v.as_list().unwrap();
        assert_eq!(list[0].as_integer(), Some(42));
        assert_eq!(list[1].as_integer(), Some(-1));
    }

    #[test]
    fn decodes_dict() {
        let v = decode(b"d3:bari1e3:fooi2ee").unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(&b"foo".to_vec()).and_then(Value::as_integer), Some(2));
        assert_eq!(dict.get(&b"bar".to_vec()).and_then(Value::as_integer), Some(1));
    }

    #[test]
    fn rejects_duplicate_top_level_keys() {
        let err = decode_top_level_with_spans(b"d3:fooi1e3:fooi2ee").unwrap_err();
        assert!(matches!(err, BencodeError::DuplicateKey));
    }

    #[test]
    fn generic_decode_also_rejects_duplicate_dict_keys() {
        let err = decode(b"d3:fooi1e3:fooi2ee").unwrap_err();
        assert!(matches!(err, BencodeError::DuplicateKey));
    }

    #[test]
    fn rejects_duplicate_keys_in_a_nested_dictionary() {
        let err = decode(b"d4:listld3:fooi1e3:fooi2eeee").unwrap_err();
        assert!(matches!(err, BencodeError::DuplicateKey));
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(BencodeError::DictKeyNotString)
        ));
    }

    #[test]
    fn deeply_nested_lists_do_not_overflow_the_stack() {
        const DEPTH: usize = 50_000;
        let mut input = String::with_capacity(DEPTH * 2);
        for _ in 0..DEPTH {
            input.push('l');
        }
        for _ in 0..DEPTH {
            input.push('e');
        }
        let v = decode(input.as_bytes()).expect("deep nesting must not overflow the stack");
        // Walk down to the innermost (empty) list without recursing ourselves.
        let mut cur = &v;
        let mut depth = 0;
        loop {
            match cur {
                Value::List(items) if items.is_empty() => break,
                Value::List(items) => {
                    cur = &items[0];
                    depth += 1;
                }
                _ => panic!("expected nested lists"),
            }
        }
        assert_eq!(depth, DEPTH - 1);
    }

    #[test]
    fn top_level_spans_locate_info_dict_bytes() {
        let input = b"d4:infod6:lengthi10ee8:announce3:xyze";
        let (dict, spans) = decode_top_level_with_spans(input).unwrap();
        assert!(dict.contains_key(&b"info".to_vec()));
        let span = spans.get(&b"info".to_vec()).unwrap().clone();
        assert_eq!(&input[span], &b"d6:lengthi10ee"[..]);
    }
}
