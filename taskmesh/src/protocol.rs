//! Wire protocol between the host side and daemons.
//!
//! Every frame is a length-prefixed envelope, big-endian throughout:
//!
//! ```text
//! [magic:4][frame_kind:1][reserved:3][payload_len:8][payload:N]
//! [ext_count:4]{[tag_len:2][tag:L][blob_len:8][blob:B]}*
//! ```
//!
//! Extension entries carry codec side-channel data. On top of the raw
//! [`Frame`] sits the typed [`Message`] layer: task, setup and result
//! payloads embed the task id as a `[id_len:2][id]` prefix, cancel
//! payloads are the id alone, and evaluation errors encode their message
//! and stack frames structurally.

use crate::codec::ExtEntry;
use crate::task::TaskId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TMSH";

/// Upper bound on any single length field; guards against corrupt
/// prefixes allocating unbounded buffers.
pub const MAX_FRAME_PAYLOAD: u64 = 1 << 32;

/// Upper bound on the number of extension entries per frame.
pub const MAX_EXT_ENTRIES: u32 = 1 << 16;

/// Errors while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("length field {0} exceeds frame limit")]
    Oversize(u64),

    #[error("frame body truncated")]
    Truncated,

    #[error("non-utf8 {0} field")]
    BadUtf8(&'static str),
}

/// Frame discriminator; the numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Task = 0,
    Setup = 1,
    Cancel = 2,
    ResultOk = 3,
    ResultErr = 4,
    ResultInterrupt = 5,
    Shutdown = 6,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(FrameKind::Task),
            1 => Ok(FrameKind::Setup),
            2 => Ok(FrameKind::Cancel),
            3 => Ok(FrameKind::ResultOk),
            4 => Ok(FrameKind::ResultErr),
            5 => Ok(FrameKind::ResultInterrupt),
            6 => Ok(FrameKind::Shutdown),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// A raw wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
    pub extensions: Vec<ExtEntry>,
}

impl Frame {
    /// Encodes the frame into a single buffer.
    pub fn encode(&self) -> Bytes {
        let ext_size: usize = self
            .extensions
            .iter()
            .map(|e| 2 + e.tag.len() + 8 + e.blob.len())
            .sum();
        let mut buf = BytesMut::with_capacity(16 + self.payload.len() + 4 + ext_size);

        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&[0u8; 3]);
        buf.put_u64(self.payload.len() as u64);
        buf.put_slice(&self.payload);
        buf.put_u32(self.extensions.len() as u32);
        for entry in &self.extensions {
            buf.put_u16(entry.tag.len() as u16);
            buf.put_slice(entry.tag.as_bytes());
            buf.put_u64(entry.blob.len() as u64);
            buf.put_slice(&entry.blob);
        }
        buf.freeze()
    }
}

/// Reads one frame from the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 16];
    reader.read_exact(&mut header).await?;

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let kind = FrameKind::from_u8(header[4])?;
    let payload_len = u64::from_be_bytes(header[8..16].try_into().expect("8-byte slice"));
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::Oversize(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;

    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf).await?;
    let ext_count = u32::from_be_bytes(count_buf);
    if ext_count > MAX_EXT_ENTRIES {
        return Err(ProtocolError::Oversize(ext_count as u64));
    }

    let mut extensions = Vec::with_capacity(ext_count as usize);
    for _ in 0..ext_count {
        let mut tag_len_buf = [0u8; 2];
        reader.read_exact(&mut tag_len_buf).await?;
        let tag_len = u16::from_be_bytes(tag_len_buf) as usize;
        let mut tag = vec![0u8; tag_len];
        reader.read_exact(&mut tag).await?;
        let tag = String::from_utf8(tag).map_err(|_| ProtocolError::BadUtf8("tag"))?;

        let mut blob_len_buf = [0u8; 8];
        reader.read_exact(&mut blob_len_buf).await?;
        let blob_len = u64::from_be_bytes(blob_len_buf);
        if blob_len > MAX_FRAME_PAYLOAD {
            return Err(ProtocolError::Oversize(blob_len));
        }
        let mut blob = vec![0u8; blob_len as usize];
        reader.read_exact(&mut blob).await?;

        extensions.push(ExtEntry {
            tag,
            blob: Bytes::from(blob),
        });
    }

    Ok(Frame {
        kind,
        payload: Bytes::from(payload),
        extensions,
    })
}

/// Writes one frame to the stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Typed view of the frames the core exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A task to evaluate.
    Task {
        id: TaskId,
        payload: Bytes,
        extensions: Vec<ExtEntry>,
    },

    /// Sticky-setup payload; acked by the daemon with an empty
    /// [`Message::ResultOk`] carrying the same id.
    Setup { id: TaskId, payload: Bytes },

    /// Interrupt the in-flight task with this id.
    Cancel { id: TaskId },

    /// Successful evaluation result.
    ResultOk {
        id: TaskId,
        payload: Bytes,
        extensions: Vec<ExtEntry>,
    },

    /// Structured evaluation failure.
    ResultErr {
        id: TaskId,
        message: String,
        stack: Vec<String>,
    },

    /// Evaluation was interrupted before producing a result.
    ResultInterrupt { id: TaskId },

    /// Orderly teardown of the connection.
    Shutdown,
}

impl Message {
    /// The task id this message refers to, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Message::Task { id, .. }
            | Message::Setup { id, .. }
            | Message::Cancel { id }
            | Message::ResultOk { id, .. }
            | Message::ResultErr { id, .. }
            | Message::ResultInterrupt { id } => Some(id),
            Message::Shutdown => None,
        }
    }

    /// Lowers the message onto the wire envelope.
    pub fn into_frame(self) -> Frame {
        match self {
            Message::Task {
                id,
                payload,
                extensions,
            } => Frame {
                kind: FrameKind::Task,
                payload: prefix_id(&id, &payload),
                extensions,
            },
            Message::Setup { id, payload } => Frame {
                kind: FrameKind::Setup,
                payload: prefix_id(&id, &payload),
                extensions: Vec::new(),
            },
            Message::Cancel { id } => Frame {
                kind: FrameKind::Cancel,
                payload: Bytes::copy_from_slice(id.as_str().as_bytes()),
                extensions: Vec::new(),
            },
            Message::ResultOk {
                id,
                payload,
                extensions,
            } => Frame {
                kind: FrameKind::ResultOk,
                payload: prefix_id(&id, &payload),
                extensions,
            },
            Message::ResultErr { id, message, stack } => {
                let mut body = BytesMut::new();
                body.put_u32(message.len() as u32);
                body.put_slice(message.as_bytes());
                body.put_u32(stack.len() as u32);
                for frame in &stack {
                    body.put_u32(frame.len() as u32);
                    body.put_slice(frame.as_bytes());
                }
                Frame {
                    kind: FrameKind::ResultErr,
                    payload: prefix_id(&id, &body.freeze()),
                    extensions: Vec::new(),
                }
            }
            Message::ResultInterrupt { id } => Frame {
                kind: FrameKind::ResultInterrupt,
                payload: prefix_id(&id, &Bytes::new()),
                extensions: Vec::new(),
            },
            Message::Shutdown => Frame {
                kind: FrameKind::Shutdown,
                payload: Bytes::new(),
                extensions: Vec::new(),
            },
        }
    }

    /// Raises a wire frame back into the typed layer.
    pub fn from_frame(frame: Frame) -> Result<Message, ProtocolError> {
        match frame.kind {
            FrameKind::Task => {
                let (id, payload) = split_id(frame.payload)?;
                Ok(Message::Task {
                    id,
                    payload,
                    extensions: frame.extensions,
                })
            }
            FrameKind::Setup => {
                let (id, payload) = split_id(frame.payload)?;
                Ok(Message::Setup { id, payload })
            }
            FrameKind::Cancel => {
                let id = std::str::from_utf8(&frame.payload)
                    .map_err(|_| ProtocolError::BadUtf8("task id"))?;
                Ok(Message::Cancel { id: TaskId::new(id) })
            }
            FrameKind::ResultOk => {
                let (id, payload) = split_id(frame.payload)?;
                Ok(Message::ResultOk {
                    id,
                    payload,
                    extensions: frame.extensions,
                })
            }
            FrameKind::ResultErr => {
                let (id, body) = split_id(frame.payload)?;
                let mut buf = body;
                let message = read_string(&mut buf, "message")?;
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                let frame_count = buf.get_u32();
                let mut stack = Vec::with_capacity(frame_count.min(MAX_EXT_ENTRIES) as usize);
                for _ in 0..frame_count {
                    stack.push(read_string(&mut buf, "stack frame")?);
                }
                Ok(Message::ResultErr { id, message, stack })
            }
            FrameKind::ResultInterrupt => {
                let (id, _) = split_id(frame.payload)?;
                Ok(Message::ResultInterrupt { id })
            }
            FrameKind::Shutdown => Ok(Message::Shutdown),
        }
    }
}

fn prefix_id(id: &TaskId, body: &Bytes) -> Bytes {
    let id_bytes = id.as_str().as_bytes();
    let mut buf = BytesMut::with_capacity(2 + id_bytes.len() + body.len());
    buf.put_u16(id_bytes.len() as u16);
    buf.put_slice(id_bytes);
    buf.put_slice(body);
    buf.freeze()
}

fn split_id(mut payload: Bytes) -> Result<(TaskId, Bytes), ProtocolError> {
    if payload.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let id_len = payload.get_u16() as usize;
    if payload.remaining() < id_len {
        return Err(ProtocolError::Truncated);
    }
    let id_bytes = payload.split_to(id_len);
    let id = std::str::from_utf8(&id_bytes).map_err(|_| ProtocolError::BadUtf8("task id"))?;
    Ok((TaskId::new(id), payload))
}

fn read_string(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadUtf8(field))
}
