//! Framing for the peer connection.
//! Each message is one bincode-encoded `P2pMessage` inside a length-delimited frame.
//! The stream is split so the read and write duties can own their half.

use crate::p2p::messages::P2pMessage;
use bytes::Bytes;
use futures::SinkExt;
use spynode_core::config::{BINCODE_CONFIG, DECODE_CONFIG};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

pub fn encode_message(msg: &P2pMessage) -> Result<Bytes, CodecError> {
    let data = bincode::encode_to_vec(msg, *BINCODE_CONFIG)?;
    Ok(Bytes::from(data))
}

pub fn decode_message(data: &[u8]) -> Result<P2pMessage, CodecError> {
    let (msg, read) = bincode::decode_from_slice::<P2pMessage, _>(data, *DECODE_CONFIG)?;
    if read != data.len() {
        return Err(CodecError::TrailingBytes(data.len() - read));
    }
    Ok(msg)
}

fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

pub struct PeerReader<R> {
    reader: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> PeerReader<R> {
    pub fn new(inner: R, max_frame_length: usize) -> Self {
        Self {
            reader: FramedRead::new(inner, frame_codec(max_frame_length)),
        }
    }

    /// Reads the next message. `Ok(None)` means the peer closed the stream.
    pub async fn next_message(&mut self) -> Result<Option<P2pMessage>, CodecError> {
        use tokio_stream::StreamExt;
        match self.reader.next().await {
            Some(Ok(bytes)) => decode_message(&bytes).map(Some),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

pub struct PeerWriter<W> {
    writer: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> PeerWriter<W> {
    pub fn new(inner: W, max_frame_length: usize) -> Self {
        Self {
            writer: FramedWrite::new(inner, frame_codec(max_frame_length)),
        }
    }

    pub async fn send_message(&mut self, msg: &P2pMessage) -> Result<(), CodecError> {
        let data = encode_message(msg)?;
        self.writer.send(data).await?;
        Ok(())
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        SinkExt::<Bytes>::close(&mut self.writer).await?;
        Ok(())
    }
}

pub fn split(
    stream: TcpStream,
    max_frame_length: usize,
) -> (PeerReader<OwnedReadHalf>, PeerWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = stream.into_split();
    (
        PeerReader::new(read_half, max_frame_length),
        PeerWriter::new(write_half, max_frame_length),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::InventoryType;
    use spynode_core::crypto::Hash;

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = PeerWriter::new(a, 1024);
        let mut reader = PeerReader::new(b, 1024);

        let inv = P2pMessage::Inv {
            object_type: InventoryType::Transaction,
            hashes: vec![Hash([1; 32]), Hash([2; 32])],
        };
        writer.send_message(&P2pMessage::Ping(7)).await.unwrap();
        writer.send_message(&inv).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(reader.next_message().await.unwrap(), Some(P2pMessage::Ping(7)));
        assert_eq!(reader.next_message().await.unwrap(), Some(inv));
        assert_eq!(reader.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let mut writer = PeerWriter::new(a, 16);
        let big = P2pMessage::Addr {
            addresses: vec!["10.0.0.1:8333".to_string(); 8],
        };
        assert!(matches!(
            writer.send_message(&big).await,
            Err(CodecError::Io(_))
        ));
    }

    #[test]
    fn garbage_payload_fails_to_decode() {
        assert!(decode_message(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn huge_length_prefix_is_a_decode_error() {
        // inv, transaction type, then a u64 varint claiming 2^50 hashes
        let mut data = vec![4, 1, 253];
        data.extend_from_slice(&(1u64 << 50).to_le_bytes());
        assert!(matches!(decode_message(&data), Err(CodecError::Decode(_))));
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let mut data = encode_message(&P2pMessage::VerAck).unwrap().to_vec();
        data.push(0);
        assert!(matches!(
            decode_message(&data),
            Err(CodecError::TrailingBytes(1))
        ));
    }
}
