//! The peer-wire handshake: the 68-byte exchange that precedes all framed messages.
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake exchange timed out")]
    Timeout,

    #[error("unexpected protocol string length {0}, expected 19")]
    BadProtocolLength(u8),

    #[error("unexpected protocol string {0:?}")]
    BadProtocolString(Vec<u8>),

    #[error("info hash mismatch: remote advertised a different torrent")]
    InfoHashMismatch,
}

pub type HandshakeResult<T> = std::result::Result<T, HandshakeError>;

/// The 68-byte handshake message: protocol length, protocol string, reserved bytes, info
/// hash, and peer id. Only the base protocol (no extension bits) is supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // buf[20..28] left zero: reserved bytes, no extensions advertised.
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn parse(buf: &[u8; HANDSHAKE_LEN]) -> HandshakeResult<Self> {
        let protocol_len = buf[0];
        if protocol_len != PROTOCOL.len() as u8 {
            return Err(HandshakeError::BadProtocolLength(protocol_len));
        }
        if &buf[1..20] != PROTOCOL.as_slice() {
            return Err(HandshakeError::BadProtocolString(buf[1..20].to_vec()));
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { info_hash, peer_id })
    }

    /// Sends this handshake, then reads and validates the remote's reply against
    /// `self.info_hash`. The remote's peer id is accepted as-is, per spec.
    pub async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> HandshakeResult<Handshake> {
        timeout(HANDSHAKE_DEADLINE, async {
            stream.write_all(&self.serialize()).await?;
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await?;
            let remote = Handshake::parse(&buf)?;
            if remote.info_hash != self.info_hash {
                return Err(HandshakeError::InfoHashMismatch);
            }
            Ok(remote)
        })
        .await
        .map_err(|_| HandshakeError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scenario_s3_handshake_round_trips_over_a_duplex_pipe() {
        let info_hash = [7u8; 20];
        let our_peer_id = [1u8; 20];
        let their_peer_id = [2u8; 20];

        let (mut a, mut b) = tokio::io::duplex(256);
        let ours = Handshake::new(info_hash, our_peer_id);
        let theirs = Handshake::new(info_hash, their_peer_id);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; HANDSHAKE_LEN];
            b.read_exact(&mut buf).await.unwrap();
            b.write_all(&theirs.serialize()).await.unwrap();
        });

        let remote = ours.exchange(&mut a).await.unwrap();
        server.await.unwrap();

        assert_eq!(remote.info_hash, info_hash);
        assert_eq!(remote.peer_id, their_peer_id);
    }

    #[test]
    fn serialize_matches_scenario_s3_byte_layout() {
        let info_hash = [0x11u8; 20];
        let peer_id = [0x22u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let buf = hs.serialize();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL.as_slice());
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &info_hash);
        assert_eq!(&buf[48..68], &peer_id);
    }

    #[tokio::test]
    async fn rejects_mismatched_info_hash() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let ours = Handshake::new([1u8; 20], [9u8; 20]);
        let theirs = Handshake::new([2u8; 20], [8u8; 20]);

        let server = tokio::spawn(async move {
            let mut buf = [0u8; HANDSHAKE_LEN];
            b.read_exact(&mut buf).await.unwrap();
            b.write_all(&theirs.serialize()).await.unwrap();
        });

        let err = ours.exchange(&mut a).await.unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, HandshakeError::InfoHashMismatch));
    }
}
