//! Library root for rs-torrent-client.
//!
//! Re-exports the bencode codec, torrent metainfo loader, tracker client, peer-wire protocol,
//! and download orchestrator for use by the `rstc` binary and by tests.
pub mod bencode;
pub mod download;
pub mod peer;
pub mod torrent;
pub mod tracker;
