use bytes::Bytes;

/// Header of one frame, as read off the wire before its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u32,
    /// payload byte count that follows the header
    pub length: u32,
}

/// One message: a protocol id plus its payload. The frame length is always the
/// payload's byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data: Bytes,
}

impl Message {
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Message {
            id,
            data: data.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
