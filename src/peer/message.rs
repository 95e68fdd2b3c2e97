//! Peer-wire message framing: the length-prefixed envelope that carries every message after
//! the handshake.
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_BACKLOG: usize = 5;
pub const BLOCK_SIZE: u32 = 16 * 1024;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed piece message: {0}")]
    MalformedPieceMessage(String),

    #[error("message frame too short for id {0}")]
    FrameTooShort(u8),
}

pub type MessageResult<T> = std::result::Result<T, MessageError>;

/// One peer-wire message. `KeepAlive` is the zero-length frame that carries no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// An id outside the base message set (e.g. an extension-protocol message). Carried
    /// through rather than rejected outright, since the per-piece download loop is specified
    /// to ignore unrecognized ids rather than fail the connection on them.
    Unknown(u8, Vec<u8>),
}

impl Message {
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        Message::Request { index, begin, length }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => Vec::new(),
            Message::Choke => vec![ID_CHOKE],
            Message::Unchoke => vec![ID_UNCHOKE],
            Message::Interested => vec![ID_INTERESTED],
            Message::NotInterested => vec![ID_NOT_INTERESTED],
            Message::Have(index) => {
                let mut buf = vec![ID_HAVE];
                let mut idx = [0u8; 4];
                BigEndian::write_u32(&mut idx, *index);
                buf.extend_from_slice(&idx);
                buf
            }
            Message::Bitfield(bits) => {
                let mut buf = vec![ID_BITFIELD];
                buf.extend_from_slice(bits);
                buf
            }
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                let id = if matches!(self, Message::Cancel { .. }) { ID_CANCEL } else { ID_REQUEST };
                let mut buf = vec![id];
                let mut fields = [0u8; 12];
                BigEndian::write_u32(&mut fields[0..4], *index);
                BigEndian::write_u32(&mut fields[4..8], *begin);
                BigEndian::write_u32(&mut fields[8..12], *length);
                buf.extend_from_slice(&fields);
                buf
            }
            Message::Piece { index, begin, block } => {
                let mut buf = vec![ID_PIECE];
                let mut fields = [0u8; 8];
                BigEndian::write_u32(&mut fields[0..4], *index);
                BigEndian::write_u32(&mut fields[4..8], *begin);
                buf.extend_from_slice(&fields);
                buf.extend_from_slice(block);
                buf
            }
            Message::Unknown(id, payload) => {
                let mut buf = vec![*id];
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    fn decode(id: u8, payload: Vec<u8>) -> MessageResult<Self> {
        match id {
            ID_CHOKE => Ok(Message::Choke),
            ID_UNCHOKE => Ok(Message::Unchoke),
            ID_INTERESTED => Ok(Message::Interested),
            ID_NOT_INTERESTED => Ok(Message::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(MessageError::FrameTooShort(id));
                }
                Ok(Message::Have(BigEndian::read_u32(&payload)))
            }
            ID_BITFIELD => Ok(Message::Bitfield(payload)),
            ID_REQUEST | ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(MessageError::FrameTooShort(id));
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                if id == ID_CANCEL {
                    Ok(Message::Cancel { index, begin, length })
                } else {
                    Ok(Message::Request { index, begin, length })
                }
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(MessageError::FrameTooShort(id));
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let block = payload[8..].to_vec();
                Ok(Message::Piece { index, begin, block })
            }
            other => Ok(Message::Unknown(other, payload)),
        }
    }
}

/// Writes `message` as a length-prefixed frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> MessageResult<()> {
    let body = message.encode();
    let mut length = [0u8; 4];
    BigEndian::write_u32(&mut length, body.len() as u32);
    writer.write_all(&length).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame. A zero-length frame is a keep-alive with no payload.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> MessageResult<Message> {
    let mut length_buf = [0u8; 4];
    reader.read_exact(&mut length_buf).await?;
    let length = BigEndian::read_u32(&length_buf) as usize;
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    let id = body[0];
    let payload = body.split_off(1);
    Message::decode(id, payload)
}

/// Copies a `piece` message's block into `buf` at `begin`, validating the index and that the
/// block does not run past the end of the destination buffer.
pub fn copy_piece_data(
    expected_index: u32,
    msg_index: u32,
    begin: u32,
    block: &[u8],
    buf: &mut [u8],
) -> MessageResult<usize> {
    if msg_index != expected_index {
        return Err(MessageError::MalformedPieceMessage(format!(
            "expected index {expected_index}, got {msg_index}"
        )));
    }
    let begin = begin as usize;
    if begin > buf.len() {
        return Err(MessageError::MalformedPieceMessage(format!(
            "begin {begin} beyond buffer length {}",
            buf.len()
        )));
    }
    if begin + block.len() > buf.len() {
        return Err(MessageError::MalformedPieceMessage(format!(
            "block of {} bytes at begin {begin} overruns buffer length {}",
            block.len(),
            buf.len()
        )));
    }
    buf[begin..begin + block.len()].copy_from_slice(block);
    Ok(block.len())
}
