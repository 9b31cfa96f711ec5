use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::network::{FrameHeader, Message};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// id (4 bytes) + payload length (4 bytes)
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Frame codec: `[id: u32][length: u32][payload]`.
///
/// Stateless apart from the byte order and the payload limit, so a single value is copied
/// into every connection.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    byte_order: ByteOrder,
    /// 0 disables the check
    max_packet_size: u32,
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::new(ByteOrder::BigEndian, 0)
    }
}

impl MessageCodec {
    pub fn new(byte_order: ByteOrder, max_packet_size: u32) -> Self {
        MessageCodec {
            byte_order,
            max_packet_size,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        MessageCodec::new(config.byte_order, config.max_packet_size)
    }

    /// Encodes header and payload into one contiguous buffer, so the writer never has to
    /// send a frame in pieces.
    pub fn encode(&self, msg: &Message) -> AppResult<Bytes> {
        let length = u32::try_from(msg.len()).map_err(|_| AppError::FrameTooLarge {
            length: msg.len() as u64,
            max: u32::MAX,
        })?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.len());
        self.encode_header(
            FrameHeader {
                id: msg.id(),
                length,
            },
            &mut buf,
        );
        buf.put_slice(msg.data());
        Ok(buf.freeze())
    }

    pub fn encode_header(&self, header: FrameHeader, dst: &mut BytesMut) {
        match self.byte_order {
            ByteOrder::BigEndian => {
                dst.put_u32(header.id);
                dst.put_u32(header.length);
            }
            ByteOrder::LittleEndian => {
                dst.put_u32_le(header.id);
                dst.put_u32_le(header.length);
            }
        }
    }

    /// Decodes the id and payload length from the first `HEADER_LEN` bytes of `header`.
    ///
    /// Oversized frames are rejected here, before the caller reads any of their payload.
    pub fn decode(&self, header: &[u8]) -> AppResult<FrameHeader> {
        if header.len() < HEADER_LEN {
            return Err(AppError::MalformedProtocol(format!(
                "frame header needs {} bytes, got {}",
                HEADER_LEN,
                header.len()
            )));
        }
        let mut buf = &header[..HEADER_LEN];
        let (id, length) = match self.byte_order {
            ByteOrder::BigEndian => (buf.get_u32(), buf.get_u32()),
            ByteOrder::LittleEndian => (buf.get_u32_le(), buf.get_u32_le()),
        };
        if self.max_packet_size > 0 && length > self.max_packet_size {
            return Err(AppError::FrameTooLarge {
                length: length as u64,
                max: self.max_packet_size,
            });
        }
        Ok(FrameHeader { id, length })
    }
}
