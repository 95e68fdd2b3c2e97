//! Torrent metainfo parsing: the typed view over a `.torrent` file plus its info-hash.
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::instrument;

use crate::bencode::{self, bind_list, bind_record, FromBencode, Value};

/// Errors raised while parsing or interpreting a torrent metainfo file.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid pieces hash length: {0} bytes is not a multiple of 20")]
    InvalidPiecesHashLength(usize),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;

/// A single entry of a multi-file torrent's `files` list.
///
/// Recognized for completeness (see the type matrix in the bencode binder) but not used to
/// drive the download: this client only follows the single-file `length` field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileEntry {
    pub length: i64,
    pub path: Vec<String>,
}

impl FromBencode for FileEntry {
    fn from_bencode(value: &Value) -> Option<Self> {
        let dict = value.as_dict()?;
        let mut out = FileEntry::default();
        if let Some(v) = dict.get(b"length".as_slice()) {
            if let Some(bound) = i64::from_bencode(v) {
                out.length = bound;
            }
        }
        if let Some(v) = dict.get(b"path".as_slice()) {
            out.path = bind_list(v);
        }
        Some(out)
    }
}

/// The `info` sub-dictionary of a metainfo file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Info {
    pub name: String,
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub length: Option<i64>,
    pub files: Vec<FileEntry>,
}

impl FromBencode for Info {
    fn from_bencode(value: &Value) -> Option<Self> {
        let dict = value.as_dict()?;
        let mut out = Info::default();
        if let Some(v) = dict.get(b"name".as_slice()) {
            if let Some(bound) = String::from_bencode(v) {
                out.name = bound;
            }
        }
        if let Some(v) = dict.get(b"piece length".as_slice()) {
            if let Some(bound) = i64::from_bencode(v) {
                out.piece_length = bound;
            }
        }
        if let Some(v) = dict.get(b"pieces".as_slice()) {
            if let Some(bytes) = v.as_bytes() {
                out.pieces = bytes.to_vec();
            }
        }
        if let Some(v) = dict.get(b"private".as_slice()) {
            out.private = v.as_integer() == Some(1);
        }
        if let Some(v) = dict.get(b"length".as_slice()) {
            out.length = i64::from_bencode(v);
        }
        if let Some(v) = dict.get(b"files".as_slice()) {
            out.files = bind_list(v);
        }
        Some(out)
    }
}

/// A parsed `.torrent` file: announce URLs, the `info` dictionary, and derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub comment: String,
    pub created_by: String,
    pub creation_date: Option<SystemTime>,
    pub encoding: String,
    pub info: Info,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

/// Parses nested announce tiers (`announce-list`), tolerant of malformed tiers: any tier or
/// tracker URL of the wrong shape is simply dropped, same spirit as the binder's "skip" rule.
fn parse_announce_list(value: &Value) -> Vec<Vec<String>> {
    let Some(tiers) = value.as_list() else {
        return Vec::new();
    };
    tiers
        .iter()
        .filter_map(|tier| tier.as_list().map(|urls| bind_list::<String>(&Value::List(urls.to_vec()))))
        .collect()
}

fn parse_creation_date(value: &Value) -> Option<SystemTime> {
    let timestamp = value.as_integer()?;
    let secs = u64::try_from(timestamp).ok()?;
    Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
}

/// Splits the concatenated `pieces` byte-string into its 20-byte SHA-1 hashes, one per piece.
fn split_piece_hashes(pieces: &[u8]) -> MetainfoResult<Vec<[u8; 20]>> {
    if pieces.len() % 20 != 0 {
        return Err(MetainfoError::InvalidPiecesHashLength(pieces.len()));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Parses a `.torrent` file's raw bytes into a [`Metainfo`].
///
/// The info-hash is computed from the original byte span of the `info` sub-dictionary, not
/// from a re-encoding of the bound [`Info`] struct: re-emitting a parsed dictionary is free to
/// reorder or drop keys the binder didn't recognize, which would silently produce a different
/// hash than the source torrent file advertises to trackers and peers.
#[instrument(level = "debug", skip(bytes))]
pub fn parse_metainfo(bytes: &[u8]) -> MetainfoResult<Metainfo> {
    let (dict, spans) = bencode::decode_top_level_with_spans(bytes)?;

    let announce = dict
        .get(b"announce".as_slice())
        .and_then(String::from_bencode)
        .ok_or_else(|| MetainfoError::MissingField("announce".to_string()))?;

    let info_value = dict
        .get(b"info".as_slice())
        .ok_or_else(|| MetainfoError::MissingField("info".to_string()))?;
    let info: Info = bind_record(info_value)
        .ok_or_else(|| MetainfoError::MissingField("info (not a dictionary)".to_string()))?;

    let info_span = spans
        .get(b"info".as_slice())
        .ok_or_else(|| MetainfoError::MissingField("info".to_string()))?;
    let mut hasher = Sha1::new();
    hasher.update(&bytes[info_span.clone()]);
    let digest = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);

    let pieces_hash = split_piece_hashes(&info.pieces)?;

    let announce_list = dict
        .get(b"announce-list".as_slice())
        .map(parse_announce_list)
        .unwrap_or_default();
    let comment = dict
        .get(b"comment".as_slice())
        .and_then(String::from_bencode)
        .unwrap_or_default();
    let created_by = dict
        .get(b"created by".as_slice())
        .and_then(String::from_bencode)
        .unwrap_or_default();
    let creation_date = dict.get(b"creation date".as_slice()).and_then(parse_creation_date);
    let encoding = dict
        .get(b"encoding".as_slice())
        .and_then(String::from_bencode)
        .unwrap_or_default();

    Ok(Metainfo {
        announce,
        announce_list,
        comment,
        created_by,
        creation_date,
        encoding,
        info,
        info_hash,
        pieces_hash,
    })
}

impl Metainfo {
    /// Total byte length of the download. Always the top-level `length` field when present —
    /// per the crate's single-file non-goal, a `files` list is recognized for inspection but
    /// never drives the byte count, even when both fields are present in the same metainfo.
    pub fn total_length(&self) -> i64 {
        self.info.length.unwrap_or_else(|| self.info.files.iter().map(|f| f.length).sum())
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Length of piece `index`. Every piece but the last is `info.piece_length`; the last is
    /// whatever remains of `total_length` after the rest, which is never equal to
    /// `piece_length` by coincidence alone and must be computed, not assumed.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            self.total_length() - (self.num_pieces() - 1) as i64 * self.info.piece_length
        }
    }

    /// Half-open byte range `[begin, end)` that piece `index` occupies in the full download.
    pub fn piece_bounds(&self, index: usize) -> (u64, u64) {
        let begin = index as u64 * self.info.piece_length as u64;
        let end = begin + self.piece_size(index) as u64;
        (begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        // One 16-byte piece, single file, no optional fields.
        b"d8:announce20:http://tracker.test/4:infod6:lengthi16e12:piece lengthi16e4:name4:demo6:pieces20:AAAAAAAAAAAAAAAAAAAAee".to_vec()
    }

    #[test]
    fn parses_required_fields() {
        let mi = parse_metainfo(&sample_bytes()).unwrap();
        assert_eq!(mi.announce, "http://tracker.test/");
        assert_eq!(mi.info.name, "demo");
        assert_eq!(mi.info.piece_length, 16);
        assert_eq!(mi.total_length(), 16);
        assert_eq!(mi.num_pieces(), 1);
    }

    #[test]
    fn info_hash_is_computed_over_raw_info_bytes_not_a_reencoding() {
        let mi = parse_metainfo(&sample_bytes()).unwrap();
        // Hand-computed expected slice: the exact bytes of the info dict as they appear
        // in sample_bytes(), not whatever order a fresh encode would choose.
        let raw_info = b"d6:lengthi16e12:piece lengthi16e4:name4:demo6:pieces20:AAAAAAAAAAAAAAAAAAAAe";
        let mut hasher = Sha1::new();
        hasher.update(raw_info);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(mi.info_hash, expected);
    }

    #[test]
    fn last_piece_size_is_remainder_not_piece_length() {
        let input = b"d8:announce3:abc4:infod6:lengthi25e12:piece lengthi16e4:name1:x6:pieces40:AAAAAAAAAAAAAAAAAAAABBBBBBBBBBBBBBBBBBBBee";
        let mi = parse_metainfo(input).unwrap();
        assert_eq!(mi.num_pieces(), 2);
        assert_eq!(mi.piece_size(0), 16);
        assert_eq!(mi.piece_size(1), 9);
        assert_eq!(mi.piece_bounds(0), (0, 16));
        assert_eq!(mi.piece_bounds(1), (16, 25));
    }

    #[test]
    fn total_length_prefers_top_level_length_even_when_files_is_also_present() {
        // A metainfo carrying both a top-level `length` and a non-empty `files` list is
        // malformed in the wild, but per the single-file non-goal `length` always wins: it
        // must never be silently overridden by summing `files`.
        let input = b"d8:announce3:abc4:infod5:filesld6:lengthi999e4:pathl1:aeee6:lengthi16e12:piece lengthi16e4:name1:x6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let mi = parse_metainfo(input).unwrap();
        assert_eq!(mi.total_length(), 16);
    }

    #[test]
    fn rejects_pieces_length_not_multiple_of_twenty() {
        let input = b"d8:announce3:abc4:infod6:lengthi1e12:piece lengthi1e4:name1:x6:pieces3:AAAee";
        let err = parse_metainfo(input).unwrap_err();
        assert!(matches!(err, MetainfoError::InvalidPiecesHashLength(3)));
    }

    #[test]
    fn missing_announce_is_an_error() {
        let input = b"d4:infod6:lengthi1e12:piece lengthi1e4:name1:x6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let err = parse_metainfo(input).unwrap_err();
        assert!(matches!(err, MetainfoError::MissingField(_)));
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let input = b"d8:announce3:abc7:comment4:demo4:infod6:lengthi16e12:piece lengthi16e4:name4:demo6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let mi = parse_metainfo(input).unwrap();
        assert_eq!(mi.comment, "demo");
    }
}
