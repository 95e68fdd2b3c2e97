//! Tracker client: builds the announce request, performs the HTTP GET, and decodes the
//! compact peer list from the bencoded response.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::bencode::{self, FromBencode, Value};
use crate::torrent::Metainfo;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);
const PEER_V4_RECORD_LEN: usize = 6;
const PEER_V6_RECORD_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("failed to decode tracker response: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("malformed peers format: {0} bytes not divisible by record length")]
    MalformedPeersFormat(usize),

    #[error("tracker refused the announce: {0}")]
    FailureReason(String),

    #[error("invalid announce URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer the tracker offered us: an address and a port, v4 or v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerInfo {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// The decoded announce response: how long to wait before the next announce, and the union
/// of `peers` (IPv4) and `peers6` (IPv6) peer lists, IPv4 entries first.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<PeerInfo>,
}

/// Raw shape of the bencoded tracker response, before the compact peer blobs are split into
/// [`PeerInfo`] records.
#[derive(Debug, Clone, Default)]
struct RawAnnounceResponse {
    interval: i64,
    peers: Vec<u8>,
    peers6: Vec<u8>,
    failure_reason: Option<String>,
}

impl FromBencode for RawAnnounceResponse {
    fn from_bencode(value: &Value) -> Option<Self> {
        let dict = value.as_dict()?;
        let mut out = RawAnnounceResponse::default();
        if let Some(v) = dict.get(b"interval".as_slice()) {
            if let Some(i) = i64::from_bencode(v) {
                out.interval = i;
            }
        }
        if let Some(v) = dict.get(b"peers".as_slice()) {
            if let Some(bytes) = v.as_bytes() {
                out.peers = bytes.to_vec();
            }
        }
        if let Some(v) = dict.get(b"peers6".as_slice()) {
            if let Some(bytes) = v.as_bytes() {
                out.peers6 = bytes.to_vec();
            }
        }
        if let Some(v) = dict.get(b"failure reason".as_slice()) {
            out.failure_reason = String::from_bencode(v);
        }
        Some(out)
    }
}

fn parse_compact_v4(bytes: &[u8]) -> TrackerResult<Vec<PeerInfo>> {
    if bytes.len() % PEER_V4_RECORD_LEN != 0 {
        return Err(TrackerError::MalformedPeersFormat(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(PEER_V4_RECORD_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerInfo { ip: IpAddr::V4(ip), port }
        })
        .collect())
}

fn parse_compact_v6(bytes: &[u8]) -> TrackerResult<Vec<PeerInfo>> {
    if bytes.len() % PEER_V6_RECORD_LEN != 0 {
        return Err(TrackerError::MalformedPeersFormat(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(PEER_V6_RECORD_LEN)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            PeerInfo { ip: IpAddr::V6(Ipv6Addr::from(octets)), port }
        })
        .collect())
}

/// Percent-encodes raw bytes per RFC 3986, leaving the unreserved set untouched. Used for
/// `info_hash` and `peer_id`: both are raw 20-byte strings, not UTF-8 text, so the request is
/// assembled by hand rather than through a URL library's own query encoder, which would
/// re-escape an already-escaped value.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// A client for a single torrent's tracker, carrying the identity (peer id, listen port) used
/// across every announce.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    peer_id: [u8; 20],
    port: u16,
}

impl TrackerClient {
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self { peer_id, port }
    }

    /// Builds the announce URL for `metainfo` per §4.D: info_hash, peer_id, port, uploaded=0,
    /// downloaded=0, compact=1, and left=total length.
    ///
    /// `info_hash` and `peer_id` are percent-encoded by hand rather than through `url`'s own
    /// query-pair encoder: both are raw 20-byte strings, and handing already-escaped text to
    /// `query_pairs_mut` would re-escape the `%` signs. Instead the query string is assembled
    /// first and attached verbatim with [`url::Url::set_query`], which keeps `url` doing what
    /// it's good at — parsing and validating the base announce URL — without touching bytes
    /// that are already in their final percent-encoded form.
    fn build_announce_url(&self, metainfo: &Metainfo) -> TrackerResult<String> {
        let mut url = url::Url::parse(&metainfo.announce)?;
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            url_encode(&metainfo.info_hash),
            url_encode(&self.peer_id),
            self.port,
            metainfo.total_length(),
        );
        url.set_query(Some(&query));
        Ok(url.into())
    }

    /// Announces to `metainfo`'s tracker and returns the peer list. A non-2xx response,
    /// connect failure, or body read error all surface as [`TrackerError`].
    #[instrument(level = "debug", skip(self, metainfo), fields(announce = %metainfo.announce))]
    pub async fn announce(&self, metainfo: &Metainfo) -> TrackerResult<AnnounceResponse> {
        let url = self.build_announce_url(metainfo)?;
        debug!(%url, "announcing to tracker");

        let client = reqwest::Client::builder().timeout(ANNOUNCE_TIMEOUT).build()?;
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TrackerError::HttpStatus(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        Self::parse_announce_response(&body)
    }

    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let value = bencode::decode(bytes).map_err(TrackerError::Bencode)?;
        let raw = RawAnnounceResponse::from_bencode(&value).unwrap_or_default();

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::FailureReason(reason));
        }

        let mut peers = parse_compact_v4(&raw.peers)?;
        peers.extend(parse_compact_v6(&raw.peers6)?);

        Ok(AnnounceResponse { interval: raw.interval, peers })
    }
}
