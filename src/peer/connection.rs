//! A single peer's TCP connection: handshake, bitfield receipt, and the per-piece download
//! loop. Each connection is owned by exactly one worker for its lifetime (see
//! [`crate::download`]) and closed on every exit path.
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

use super::bitfield::Bitfield;
use super::handshake::{Handshake, HandshakeError};
use super::message::{
    copy_piece_data, read_message, write_message, Message, MessageError, BLOCK_SIZE, MAX_BACKLOG,
};
use crate::tracker::PeerInfo;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
const PIECE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum PeerConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect to peer timed out")]
    ConnectTimeout,

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("framing error: {0}")]
    Message(#[from] MessageError),

    #[error("first message from peer was not bitfield")]
    ExpectedBitfield,

    #[error("timed out waiting for remote bitfield")]
    BitfieldTimeout,

    #[error("piece download timed out")]
    PieceTimeout,
}

pub type PeerConnectionResult<T> = std::result::Result<T, PeerConnectionError>;

/// One piece to fetch: index into the torrent, its expected SHA-1 digest, and its length
/// (equal to `piece_length` except possibly for the final piece).
#[derive(Debug, Clone, Copy)]
pub struct PieceTask {
    pub index: usize,
    pub expected_sha1: [u8; 20],
    pub length: u32,
}

/// A downloaded piece's bytes, paired with its index.
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub index: usize,
    pub data: Vec<u8>,
}

/// A live connection to one peer: socket plus the choke/bitfield state the rest of the spec
/// calls "peer connection state". Generic over the stream type so the piece-download loop can
/// be exercised in tests over an in-memory duplex pipe instead of a real `TcpStream`.
pub struct PeerConnection<S = TcpStream> {
    stream: S,
    pub peer: PeerInfo,
    choked: bool,
    remote_bitfield: Bitfield,
}

impl PeerConnection<TcpStream> {
    /// Connects to `peer`, performs the handshake, and reads the mandatory first bitfield
    /// message. Any failure here is isolated to this peer — see [`crate::download`].
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn connect(
        peer: PeerInfo,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerConnectionResult<Self> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| PeerConnectionError::ConnectTimeout)??;

        let handshake = Handshake::new(info_hash, peer_id);
        handshake.exchange(&mut stream).await?;
        debug!(peer = %peer.socket_addr(), "handshake complete");

        let remote_bitfield = timeout(BITFIELD_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| PeerConnectionError::BitfieldTimeout)??;
        let remote_bitfield = match remote_bitfield {
            Message::Bitfield(bits) => Bitfield::new(bits),
            _ => return Err(PeerConnectionError::ExpectedBitfield),
        };

        Ok(Self { stream, peer, choked: true, remote_bitfield })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    pub fn has_piece(&self, index: usize) -> bool {
        self.remote_bitfield.has_piece(index)
    }

    pub async fn send_interested(&mut self) -> PeerConnectionResult<()> {
        write_message(&mut self.stream, &Message::Interested).await?;
        Ok(())
    }

    /// Pipelined block-request loop for a single piece: keeps up to [`MAX_BACKLOG`] requests
    /// outstanding while unchoked, applying incoming `piece` blocks to the destination buffer
    /// until the whole piece is downloaded or the 15-second deadline expires.
    #[instrument(level = "debug", skip(self, task), fields(index = task.index))]
    pub async fn download_piece(&mut self, task: PieceTask) -> PeerConnectionResult<PieceResult> {
        timeout(PIECE_TIMEOUT, self.download_piece_inner(task))
            .await
            .map_err(|_| PeerConnectionError::PieceTimeout)?
    }

    async fn download_piece_inner(&mut self, task: PieceTask) -> PeerConnectionResult<PieceResult> {
        let length = task.length as usize;
        let mut buf = vec![0u8; length];
        let mut requested: u32 = 0;
        let mut downloaded: u32 = 0;
        let mut in_flight: usize = 0;

        while (downloaded as usize) < length {
            if !self.choked {
                while in_flight < MAX_BACKLOG && (requested as usize) < length {
                    let block_len = BLOCK_SIZE.min(task.length - requested);
                    write_message(
                        &mut self.stream,
                        &Message::request(task.index as u32, requested, block_len),
                    )
                    .await?;
                    in_flight += 1;
                    requested += block_len;
                }
            }

            let msg = read_message(&mut self.stream).await?;
            match msg {
                Message::KeepAlive => {}
                Message::Choke => self.choked = true,
                Message::Unchoke => self.choked = false,
                Message::Have(index) => self.remote_bitfield.set_piece(index as usize),
                Message::Piece { index, begin, block } => {
                    let n = copy_piece_data(task.index as u32, index, begin, &block, &mut buf)?;
                    downloaded += n as u32;
                    in_flight = in_flight.saturating_sub(1);
                }
                _ => trace!("ignoring unexpected message during piece download"),
            }
        }

        Ok(PieceResult { index: task.index, data: buf })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn dummy_peer() -> PeerInfo {
        PeerInfo { ip: Ipv4Addr::LOCALHOST.into(), port: 6881 }
    }

    fn harness(remote_has: &[usize]) -> PeerConnection<tokio::io::DuplexStream> {
        let (client, _server) = tokio::io::duplex(1 << 20);
        let mut field = Bitfield::new(Vec::new());
        for &i in remote_has {
            field.set_piece(i);
        }
        PeerConnection { stream: client, peer: dummy_peer(), choked: true, remote_bitfield: field }
    }

    #[test]
    fn has_piece_reflects_remote_bitfield() {
        let conn = harness(&[0, 5]);
        assert!(conn.has_piece(0));
        assert!(conn.has_piece(5));
        assert!(!conn.has_piece(1));
    }

    /// A remote that sends anything other than `bitfield` as its first post-handshake message
    /// — including an id outside the base message set — must fail the connection rather than
    /// being silently accepted as an empty bitfield.
    #[tokio::test]
    async fn unrecognized_first_message_fails_the_connection_instead_of_aliasing_bitfield() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [3u8; 20];
        let our_peer_id = [1u8; 20];
        let their_peer_id = [2u8; 20];

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake_buf = [0u8; 68];
            stream.read_exact(&mut handshake_buf).await.unwrap();
            let reply = Handshake::new(info_hash, their_peer_id);
            stream.write_all(&reply_bytes(&reply)).await.unwrap();
            write_message(&mut stream, &Message::Unknown(20, vec![1, 2, 3])).await.unwrap();
            // Keep the stream open until the client has read what it needs.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        });

        let peer = PeerInfo { ip: addr.ip(), port: addr.port() };
        let result = PeerConnection::<TcpStream>::connect(peer, info_hash, our_peer_id).await;
        server.await.unwrap();

        assert!(matches!(result, Err(PeerConnectionError::ExpectedBitfield)));
    }

    /// Mirrors `Handshake::serialize`'s private layout so the test above can hand-craft a
    /// reply without reaching into the handshake module's internals.
    fn reply_bytes(handshake: &Handshake) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(b"BitTorrent protocol");
        buf[28..48].copy_from_slice(&handshake.info_hash);
        buf[48..68].copy_from_slice(&handshake.peer_id);
        buf
    }

    /// Drives `download_piece` against an in-memory duplex pipe standing in for the remote
    /// peer: unchokes immediately, then serves every requested block from a canned buffer.
    #[tokio::test]
    async fn download_piece_assembles_pipelined_blocks() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut conn = PeerConnection {
            stream: client,
            peer: dummy_peer(),
            choked: true,
            remote_bitfield: Bitfield::new(Vec::new()),
        };

        let piece_len: u32 = 3 * BLOCK_SIZE;
        let source: Vec<u8> = (0..piece_len).map(|i| (i % 256) as u8).collect();
        let source_for_server = source.clone();

        let server_task = tokio::spawn(async move {
            write_message(&mut server, &Message::Unchoke).await.unwrap();
            let mut served = 0usize;
            while served < 3 {
                match read_message(&mut server).await.unwrap() {
                    Message::Request { index, begin, length } => {
                        let block = source_for_server[begin as usize..(begin + length) as usize].to_vec();
                        write_message(&mut server, &Message::Piece { index, begin, block })
                            .await
                            .unwrap();
                        served += 1;
                    }
                    other => panic!("unexpected message from client: {other:?}"),
                }
            }
        });

        let task = PieceTask { index: 0, expected_sha1: [0u8; 20], length: piece_len };
        let result = conn.download_piece(task).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(result.index, 0);
        assert_eq!(result.data, source);
    }
}
