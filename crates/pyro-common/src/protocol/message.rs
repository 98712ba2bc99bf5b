//! Wire message envelope.
//!
//! Every exchange on a connection is one [`Message`]: a fixed 22 byte header,
//! zero or more annotation chunks and the payload.
//!
//! ```text
//! offset  size  field
//!      0     4  tag "PYRO"
//!      4     2  protocol version (502)
//!      6     1  message type
//!      7     1  serializer id
//!      8     2  flags
//!     10     2  sequence number
//!     12     4  payload length
//!     16     2  total annotations length
//!     18     2  reserved (0)
//!     20     2  checksum
//! ```
//!
//! Each annotation chunk is `[4 byte ascii id][u32 length][bytes]`. All
//! integers are big-endian.
//!
//! The checksum is an additive combination of the header fields. It exists
//! for wire compatibility and catches garbage, not tampering.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::ops::{BitOr, BitOrAssign};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{map_io_error, PyroError, Result};
use crate::transport::Transport;

/// Header tag, the first four bytes of every message.
pub const MAGIC: &[u8; 4] = b"PYRO";

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u16 = 502;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 22;

/// Payloads at or below this size are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 200;

/// Default maximum for payload plus annotations (100 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CHECKSUM_MAGIC: u32 = 0x34E9;

/// Kind of a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnectOk = 2,
    ConnectFail = 3,
    Invoke = 4,
    Result = 5,
    Ping = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = PyroError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Connect),
            2 => Ok(MessageType::ConnectOk),
            3 => Ok(MessageType::ConnectFail),
            4 => Ok(MessageType::Invoke),
            5 => Ok(MessageType::Result),
            6 => Ok(MessageType::Ping),
            other => Err(PyroError::Protocol(format!("unsupported message type {}", other))),
        }
    }
}

/// Message flag bitset.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u16);

impl Flags {
    pub const EMPTY: Flags = Flags(0);
    pub const EXCEPTION: Flags = Flags(1 << 0);
    pub const COMPRESSED: Flags = Flags(1 << 1);
    pub const ONEWAY: Flags = Flags(1 << 2);
    pub const BATCH: Flags = Flags(1 << 3);
    pub const ITEM_STREAM_RESULT: Flags = Flags(1 << 4);
    pub const KEEP_SERIALIZED: Flags = Flags(1 << 5);

    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 6] = [
            (Flags::EXCEPTION, "EXCEPTION"),
            (Flags::COMPRESSED, "COMPRESSED"),
            (Flags::ONEWAY, "ONEWAY"),
            (Flags::BATCH, "BATCH"),
            (Flags::ITEM_STREAM_RESULT, "ITEM_STREAM_RESULT"),
            (Flags::KEEP_SERIALIZED, "KEEP_SERIALIZED"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Flags({:#06x} {})", self.0, names.join("|"))
    }
}

/// Out-of-band named byte blobs attached to a message.
///
/// Keys are exactly four ASCII characters. The ids in
/// [`Annotations::RESERVED`] belong to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations(BTreeMap<String, Vec<u8>>);

impl Annotations {
    /// Correlation id of the logical call (16 raw UUID bytes).
    pub const CORRELATION_ID: &'static str = "CORR";
    /// Id of a server-side item stream.
    pub const STREAM_ID: &'static str = "STRM";
    /// Routing info for a pre-serialized blob argument.
    pub const BLOB_INFO: &'static str = "BLBI";
    /// Filler that keeps handshake responses above a minimum size.
    pub const PADDING: &'static str = "PADD";

    pub const RESERVED: [&'static str; 4] = [
        Self::CORRELATION_ID,
        Self::STREAM_ID,
        Self::BLOB_INFO,
        Self::PADDING,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an annotation, validating the key format.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        if key.len() != 4 || !key.is_ascii() {
            return Err(PyroError::Protocol(format!(
                "annotation key must be exactly 4 ascii characters: {:?}",
                key
            )));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Validates a key supplied by application code.
    pub fn check_user_key(key: &str) -> Result<()> {
        if Self::RESERVED.contains(&key) {
            return Err(PyroError::Pyro(format!(
                "annotation key {:?} is reserved for internal use",
                key
            )));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Copies every annotation of `other` into `self`, overwriting duplicates.
    pub fn extend(&mut self, other: &Annotations) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Size of the annotation chunks on the wire.
    pub fn wire_size(&self) -> usize {
        self.0.values().map(|v| 8 + v.len()).sum()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        for (key, value) in &self.0 {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value);
        }
    }

    fn decode(mut data: &[u8]) -> Result<Self> {
        let mut annotations = Annotations::new();
        while !data.is_empty() {
            if data.len() < 8 {
                return Err(PyroError::Protocol("truncated annotation chunk".to_string()));
            }
            let key = std::str::from_utf8(&data[..4])
                .map_err(|_| PyroError::Protocol("annotation key is not ascii".to_string()))?
                .to_string();
            let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
            let rest = &data[8..];
            if rest.len() < len {
                return Err(PyroError::Protocol(format!(
                    "annotation {:?} claims {} bytes, only {} left",
                    key,
                    len,
                    rest.len()
                )));
            }
            annotations.insert(key, rest[..len].to_vec())?;
            data = &rest[len..];
        }
        Ok(annotations)
    }
}

/// Limits and options applied when encoding and decoding messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireOptions {
    /// Maximum payload plus annotations size in bytes
    pub max_message_size: usize,
    /// Compress payloads above [`COMPRESSION_THRESHOLD`] bytes
    pub compression: bool,
}

impl Default for WireOptions {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: false,
        }
    }
}

/// Inflates a compressed payload, refusing output beyond `max` bytes.
fn decompress(payload: &[u8], max: usize) -> Result<Vec<u8>> {
    let failed = |e: std::io::Error| PyroError::Protocol(format!("failed to decompress payload: {}", e));
    let decoder = zstd::stream::read::Decoder::new(payload).map_err(failed)?;
    let mut inflated = Vec::new();
    decoder
        .take(max as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(failed)?;
    if inflated.len() > max {
        return Err(PyroError::MessageTooLarge {
            size: inflated.len(),
            max,
        });
    }
    Ok(inflated)
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub serializer_id: u8,
    pub flags: Flags,
    pub seq: u16,
    pub payload_size: u32,
    pub annotations_size: u16,
}

impl Header {
    fn checksum(&self) -> u16 {
        checksum(
            self.msg_type as u8,
            self.serializer_id,
            self.flags,
            self.seq,
            self.payload_size,
            self.annotations_size,
        )
    }

    /// Payload plus annotations size announced by the header.
    pub fn body_size(&self) -> usize {
        self.payload_size as usize + self.annotations_size as usize
    }
}

fn checksum(
    msg_type: u8,
    serializer_id: u8,
    flags: Flags,
    seq: u16,
    payload_size: u32,
    annotations_size: u16,
) -> u16 {
    let sum = (msg_type as u32)
        .wrapping_add(PROTOCOL_VERSION as u32)
        .wrapping_add(payload_size)
        .wrapping_add(annotations_size as u32)
        .wrapping_add(serializer_id as u32)
        .wrapping_add(flags.bits() as u32)
        .wrapping_add(seq as u32)
        .wrapping_add(CHECKSUM_MAGIC);
    (sum & 0xFFFF) as u16
}

/// A protocol message.
///
/// # Example
///
/// ```
/// use pyro_common::protocol::{Flags, Message, MessageType, WireOptions};
///
/// let msg = Message::new(MessageType::Invoke, b"payload".to_vec(), 2, Flags::ONEWAY, 7);
/// let bytes = msg.to_bytes(&WireOptions::default()).unwrap();
/// let header = Message::decode_header(&bytes[..22]).unwrap();
/// assert_eq!(header.seq, 7);
/// assert_eq!(header.msg_type, MessageType::Invoke);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: Flags,
    pub seq: u16,
    pub serializer_id: u8,
    pub annotations: Annotations,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        payload: Vec<u8>,
        serializer_id: u8,
        flags: Flags,
        seq: u16,
    ) -> Self {
        Self {
            msg_type,
            flags,
            seq,
            serializer_id,
            annotations: Annotations::new(),
            payload,
        }
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// Encodes the message into one contiguous buffer.
    ///
    /// The buffer is meant to go out in a single write; splitting header and
    /// payload over several small writes stalls on some TCP stacks.
    ///
    /// # Errors
    ///
    /// - `MessageTooLarge` if payload plus annotations exceed the maximum
    /// - `Protocol` if the annotations do not fit their 16 bit length field
    pub fn to_bytes(&self, options: &WireOptions) -> Result<Vec<u8>> {
        let annotations_size = self.annotations.wire_size();
        let total = self.payload.len() + annotations_size;
        if total > options.max_message_size {
            return Err(PyroError::MessageTooLarge {
                size: total,
                max: options.max_message_size,
            });
        }
        let annotations_size = u16::try_from(annotations_size).map_err(|_| {
            PyroError::Protocol(format!("annotations too large: {} bytes", annotations_size))
        })?;

        let mut flags = self.flags;
        let mut payload = Cow::Borrowed(self.payload.as_slice());
        if options.compression
            && !flags.contains(Flags::COMPRESSED)
            && payload.len() > COMPRESSION_THRESHOLD
        {
            if let Ok(compressed) = zstd::bulk::compress(&payload, 0) {
                if compressed.len() < payload.len() {
                    payload = Cow::Owned(compressed);
                    flags.insert(Flags::COMPRESSED);
                }
            }
        }
        let payload_size = u32::try_from(payload.len())
            .map_err(|_| PyroError::Protocol(format!("payload too large: {} bytes", payload.len())))?;

        let sum = checksum(
            self.msg_type as u8,
            self.serializer_id,
            flags,
            self.seq,
            payload_size,
            annotations_size,
        );

        let mut buf = Vec::with_capacity(HEADER_SIZE + annotations_size as usize + payload.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf.push(self.msg_type as u8);
        buf.push(self.serializer_id);
        buf.extend_from_slice(&flags.bits().to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&payload_size.to_be_bytes());
        buf.extend_from_slice(&annotations_size.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&sum.to_be_bytes());
        self.annotations.encode_into(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decodes and validates a message header.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the length, tag, version, type or checksum is wrong.
    pub fn decode_header(data: &[u8]) -> Result<Header> {
        if data.len() != HEADER_SIZE {
            return Err(PyroError::Protocol(format!(
                "header must be {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if &data[..4] != MAGIC || version != PROTOCOL_VERSION {
            return Err(PyroError::Protocol(
                "invalid data or unsupported protocol version".to_string(),
            ));
        }
        let header = Header {
            msg_type: MessageType::try_from(data[6])?,
            serializer_id: data[7],
            flags: Flags::from_bits(u16::from_be_bytes([data[8], data[9]])),
            seq: u16::from_be_bytes([data[10], data[11]]),
            payload_size: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            annotations_size: u16::from_be_bytes([data[16], data[17]]),
        };
        let sum = u16::from_be_bytes([data[20], data[21]]);
        if sum != header.checksum() {
            return Err(PyroError::Protocol("header checksum mismatch".to_string()));
        }
        Ok(header)
    }

    /// Receives one complete message from a transport.
    ///
    /// When the announced size exceeds the maximum the transport is closed
    /// before failing: once a frame has been skipped the stream can no longer
    /// be trusted to stay in sequence.
    ///
    /// # Arguments
    ///
    /// * `transport` - The connection to read from
    /// * `required` - Accepted message types, or `None` for any type
    /// * `options` - Size limit
    pub fn recv<T: Transport + ?Sized>(
        transport: &mut T,
        required: Option<&[MessageType]>,
        options: &WireOptions,
    ) -> Result<Message> {
        let header_bytes = transport.recv(HEADER_SIZE)?;
        let header = Self::decode_header(&header_bytes)?;
        if header.body_size() > options.max_message_size {
            tracing::warn!(
                size = header.body_size(),
                max = options.max_message_size,
                "Received message exceeds maximum size, closing connection"
            );
            transport.close();
            return Err(PyroError::MessageTooLarge {
                size: header.body_size(),
                max: options.max_message_size,
            });
        }
        let annotation_bytes = if header.annotations_size > 0 {
            transport.recv(header.annotations_size as usize)?
        } else {
            Vec::new()
        };
        let payload = transport.recv(header.payload_size as usize)?;
        Self::from_parts(header, &annotation_bytes, payload, required, options)
    }

    /// Async version of [`recv`](Self::recv), used by the multiplexed server.
    ///
    /// On an oversized message the stream is shut down before failing.
    pub async fn recv_async<S>(
        stream: &mut S,
        required: Option<&[MessageType]>,
        options: &WireOptions,
    ) -> Result<Message>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut header_bytes = [0u8; HEADER_SIZE];
        stream
            .read_exact(&mut header_bytes)
            .await
            .map_err(|e| map_io_error(e, "reading header"))?;
        let header = Self::decode_header(&header_bytes)?;
        if header.body_size() > options.max_message_size {
            tracing::warn!(
                size = header.body_size(),
                max = options.max_message_size,
                "Received message exceeds maximum size, closing connection"
            );
            let _ = stream.shutdown().await;
            return Err(PyroError::MessageTooLarge {
                size: header.body_size(),
                max: options.max_message_size,
            });
        }
        let mut annotation_bytes = vec![0u8; header.annotations_size as usize];
        stream
            .read_exact(&mut annotation_bytes)
            .await
            .map_err(|e| map_io_error(e, "reading annotations"))?;
        let mut payload = vec![0u8; header.payload_size as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| map_io_error(e, "reading payload"))?;
        Self::from_parts(header, &annotation_bytes, payload, required, options)
    }

    fn from_parts(
        header: Header,
        annotation_bytes: &[u8],
        payload: Vec<u8>,
        required: Option<&[MessageType]>,
        options: &WireOptions,
    ) -> Result<Message> {
        if let Some(required) = required {
            if !required.contains(&header.msg_type) {
                return Err(PyroError::Protocol(format!(
                    "invalid msg type {:?} received",
                    header.msg_type
                )));
            }
        }
        let annotations = Annotations::decode(annotation_bytes)?;
        let mut flags = header.flags;
        let payload = if flags.contains(Flags::COMPRESSED) {
            flags.remove(Flags::COMPRESSED);
            decompress(&payload, options.max_message_size)?
        } else {
            payload
        };
        Ok(Message {
            msg_type: header.msg_type,
            flags,
            seq: header.seq,
            serializer_id: header.serializer_id,
            annotations,
            payload,
        })
    }
}
