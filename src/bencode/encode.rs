use std::io::Write;

use super::value::{BencodeError, BencodeResult, Value};

/// Writes `value` in canonical bencode form, returning the number of bytes written.
///
/// Dictionary keys need no explicit sort: [`Value::Dict`] is a `BTreeMap<Vec<u8>, Value>`,
/// whose iteration order is already ascending raw-byte order.
pub fn encode_value<W: Write>(writer: &mut W, value: &Value) -> BencodeResult<usize> {
    match value {
        Value::Bytes(b) => encode_bytes(writer, b),
        Value::Integer(i) => encode_integer(writer, *i),
        Value::List(items) => encode_list(writer, items),
        Value::Dict(items) => encode_dict(writer, items),
    }
}

fn encode_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> BencodeResult<usize> {
    let prefix = format!("{}:", bytes.len());
    writer.write_all(prefix.as_bytes())?;
    writer.write_all(bytes)?;
    Ok(prefix.len() + bytes.len())
}

fn encode_integer<W: Write>(writer: &mut W, value: i64) -> BencodeResult<usize> {
    let body = format!("i{value}e");
    writer.write_all(body.as_bytes())?;
    Ok(body.len())
}

fn encode_list<W: Write>(writer: &mut W, items: &[Value]) -> BencodeResult<usize> {
    writer.write_all(b"l")?;
    let mut written = 2;
    for item in items {
        written += encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(written)
}

fn encode_dict<W: Write>(
    writer: &mut W,
    items: &std::collections::BTreeMap<Vec<u8>, Value>,
) -> BencodeResult<usize> {
    writer.write_all(b"d")?;
    let mut written = 2;
    for (key, value) in items {
        written += encode_bytes(writer, key)?;
        written += encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(written)
}
