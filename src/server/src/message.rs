use byteordered::byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cluster::Introduction;
use std::io::{Cursor, Read, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt as TokioAsyncReadExt, AsyncWriteExt as TokioAsyncWriteExt};

use crate::opcodes::*;

/// Wire protocol format:
/// 1. code (u16)
/// 2. key_length (u32)
/// 3. value_length (u32)
/// 4. key (bytes)
/// 5. value (bytes)

const HEADER_SIZE: usize = 2 + 4 + 4; // code + key_len + value_len
const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024; // 64 MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Message {
    pub fn new(code: u16, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Message { code, key: key.into(), value: value.into() }
    }

    /// Frame with no key or value
    pub fn empty(code: u16) -> Self {
        Message { code, key: Vec::new(), value: Vec::new() }
    }

    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Message::new(OP_VALUE, Vec::new(), value)
    }

    pub fn error(msg: impl std::fmt::Display) -> Self {
        Message::new(OP_ERROR, Vec::new(), msg.to_string())
    }

    /// Async send for tokio::io::AsyncWrite
    pub async fn send_async<W: AsyncWrite + Unpin + Send>(&self, stream: &mut W) -> Result<()> {
        // Build header in buffer using byteorder (synchronous)
        let mut header = [0u8; HEADER_SIZE];
        {
            let mut cursor = Cursor::new(&mut header[..]);
            WriteBytesExt::write_u16::<BigEndian>(&mut cursor, self.code)?;
            WriteBytesExt::write_u32::<BigEndian>(&mut cursor, self.key.len() as u32)?;
            WriteBytesExt::write_u32::<BigEndian>(&mut cursor, self.value.len() as u32)?;
        }

        TokioAsyncWriteExt::write_all(stream, &header).await?;
        TokioAsyncWriteExt::write_all(stream, &self.key).await?;
        TokioAsyncWriteExt::write_all(stream, &self.value).await?;

        TokioAsyncWriteExt::flush(stream).await?;
        Ok(())
    }

    /// Async receive for tokio::io::AsyncRead
    pub async fn receive_async<R: AsyncRead + Unpin + Send>(stream: &mut R) -> Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        TokioAsyncReadExt::read_exact(stream, &mut header).await?;

        let (code, key_length, value_length) = {
            let mut cursor = Cursor::new(&header[..]);
            let code = ReadBytesExt::read_u16::<BigEndian>(&mut cursor)?;
            let key_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
            let value_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
            (code, key_length, value_length)
        };

        // Validate total message size to prevent OOM attacks
        let total_size = key_length as u64 + value_length as u64;
        if total_size > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message too large: {} bytes (max: {} bytes)", total_size, MAX_MESSAGE_SIZE),
            ));
        }

        let mut key = vec![0u8; key_length as usize];
        TokioAsyncReadExt::read_exact(stream, &mut key).await?;

        let mut value = vec![0u8; value_length as usize];
        TokioAsyncReadExt::read_exact(stream, &mut value).await?;

        Ok(Message { code, key, value })
    }
}

/// ADD_PEER frame: key is the node id, value the velocity hint (u64)
/// followed by the optional announce address.
pub fn encode_introduction(intro: &Introduction) -> Message {
    let addr = intro.addr.as_deref().unwrap_or("");
    let mut value = Vec::with_capacity(8 + addr.len());
    // writing into a Vec cannot fail
    let _ = WriteBytesExt::write_u64::<BigEndian>(&mut value, intro.hint);
    value.extend_from_slice(addr.as_bytes());
    Message::new(OP_ADD_PEER, intro.id.as_bytes(), value)
}

pub fn decode_introduction(message: &Message) -> Result<Introduction> {
    let invalid = |what: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, what.to_string());

    let id = String::from_utf8(message.key.clone()).map_err(|_| invalid("peer id is not UTF-8"))?;
    let mut cursor = Cursor::new(&message.value[..]);
    let hint = ReadBytesExt::read_u64::<BigEndian>(&mut cursor)?;
    let mut addr = String::new();
    Read::read_to_string(&mut cursor, &mut addr).map_err(|_| invalid("peer address is not UTF-8"))?;

    Ok(Introduction {
        id,
        addr: (!addr.is_empty()).then_some(addr),
        hint,
    })
}
