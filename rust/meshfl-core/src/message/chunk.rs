//! Fragmentation of encoded messages into size-limited chunks.
//!
//! Peer transports only carry messages up to a negotiated size. A [`Chunker`]
//! splits an encoded message into chunks that fit, and a [`Reassembler`] on the
//! other side rejoins them, regardless of the order in which they arrive.
//!
//! Every chunk starts with a header. The first chunk of a message also announces
//! how many chunks the message has:
//!
//! ```no_rust
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           message_id          |  chunk_id = 0 |     total     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      data (variable length)                   |
//! ```
//!
//! ```no_rust
//!  0                   1                   2
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           message_id          |   chunk_id    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              data (variable length)           |
//! ```
//!
//! - `message_id`: big endian, increases with every message sent on a transport
//! - `chunk_id`: index of the chunk within the message
//! - `total`: number of chunks of the message

use std::{
    cmp,
    collections::{BTreeMap, HashMap},
};

use anyhow::anyhow;
use thiserror::Error;

use crate::message::DecodeError;

pub(crate) mod ranges {
    use std::ops::Range;

    /// Byte range corresponding to the message ID in a chunk
    pub const MESSAGE_ID: Range<usize> = 0..2;
    /// Byte position of the chunk ID in a chunk
    pub const CHUNK_ID: usize = MESSAGE_ID.end;
    /// Byte position of the total number of chunks in the first chunk of a message
    pub const TOTAL: usize = CHUNK_ID + 1;
}

/// Length in bytes of the header of the first chunk of a message.
pub const FIRST_HEADER_LENGTH: usize = ranges::TOTAL + 1;
/// Length in bytes of the header of the other chunks of a message.
pub const HEADER_LENGTH: usize = ranges::CHUNK_ID + 1;
/// Maximum number of chunks of a single message.
pub const MAX_CHUNKS: usize = u8::MAX as usize;
/// Maximum number of messages that can be sent with a single [`Chunker`].
pub const MAX_MESSAGES: u32 = u16::MAX as u32;

#[derive(Debug, Error)]
/// Errors related to fragmentation and reassembly.
pub enum ChunkError {
    #[error("invalid maximum chunk size {0}: it must exceed the header length")]
    ChunkSizeTooSmall(usize),
    #[error("too big message: {0} chunks needed but at most 255 are allowed")]
    MessageTooBig(usize),
    #[error("message ids exhausted: at most 65535 messages can be sent")]
    MessageIdsExhausted,
    #[error("duplicate chunk {chunk} for message {message}")]
    DuplicateChunk { message: u16, chunk: u8 },
    #[error("chunk {chunk} of message {message} exceeds the announced total of {total} chunks")]
    ChunkOutOfBounds { message: u16, chunk: u8, total: u8 },
    #[error("message {0} announces zero chunks")]
    NoChunks(u16),
    #[error(transparent)]
    Invalid(#[from] DecodeError),
}

/// A wrapper around a buffer that contains a chunk.
pub struct ChunkBuffer<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> ChunkBuffer<T> {
    /// Performs bound checks for the header fields on `bytes` and returns a new
    /// [`ChunkBuffer`].
    ///
    /// # Errors
    /// Fails if the `bytes` are shorter than the header.
    pub fn new(bytes: T) -> Result<Self, DecodeError> {
        let buffer = Self { inner: bytes };
        buffer.check_buffer_length()?;
        Ok(buffer)
    }

    /// Performs bound checks to ensure the fields can be accessed without panicking.
    pub fn check_buffer_length(&self) -> Result<(), DecodeError> {
        let bytes = self.inner.as_ref();
        if bytes.len() < HEADER_LENGTH {
            return Err(anyhow!(
                "invalid chunk length: {} < {}",
                bytes.len(),
                HEADER_LENGTH
            ));
        }
        if bytes[ranges::CHUNK_ID] == 0 && bytes.len() < FIRST_HEADER_LENGTH {
            return Err(anyhow!(
                "invalid first chunk length: {} < {}",
                bytes.len(),
                FIRST_HEADER_LENGTH
            ));
        }
        Ok(())
    }

    /// Gets the message ID field.
    pub fn message_id(&self) -> u16 {
        let id = &self.inner.as_ref()[ranges::MESSAGE_ID];
        u16::from_be_bytes([id[0], id[1]])
    }

    /// Gets the chunk ID field.
    pub fn chunk_id(&self) -> u8 {
        self.inner.as_ref()[ranges::CHUNK_ID]
    }

    /// Gets the total number of chunks, which only the first chunk carries.
    pub fn total(&self) -> Option<u8> {
        if self.chunk_id() == 0 {
            Some(self.inner.as_ref()[ranges::TOTAL])
        } else {
            None
        }
    }

    /// Gets the data following the header.
    pub fn payload(&self) -> &[u8] {
        if self.chunk_id() == 0 {
            &self.inner.as_ref()[FIRST_HEADER_LENGTH..]
        } else {
            &self.inner.as_ref()[HEADER_LENGTH..]
        }
    }
}

#[derive(Debug)]
/// Splits messages into chunks of at most `max_chunk_size` bytes, headers included.
pub struct Chunker {
    max_chunk_size: usize,
    next_message_id: u32,
}

impl Chunker {
    /// Creates a new chunker.
    ///
    /// # Errors
    /// Fails if a chunk of `max_chunk_size` bytes can't hold a header and at least
    /// one byte of data.
    pub fn new(max_chunk_size: usize) -> Result<Self, ChunkError> {
        if max_chunk_size <= FIRST_HEADER_LENGTH {
            return Err(ChunkError::ChunkSizeTooSmall(max_chunk_size));
        }
        Ok(Self {
            max_chunk_size,
            next_message_id: 0,
        })
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Gets the number of chunks needed for a message of `len` bytes.
    pub fn nb_chunks(&self, len: usize) -> usize {
        let first = self.max_chunk_size - FIRST_HEADER_LENGTH;
        if len <= first {
            1
        } else {
            1 + ceiling_div(len - first, self.max_chunk_size - HEADER_LENGTH)
        }
    }

    /// Splits `message` into chunks and assigns it the next message ID.
    ///
    /// # Errors
    /// Fails if the message needs more than [`MAX_CHUNKS`] chunks or if
    /// [`MAX_MESSAGES`] messages have already been chunked.
    pub fn chunk(&mut self, message: &[u8]) -> Result<Vec<Vec<u8>>, ChunkError> {
        let total = self.nb_chunks(message.len());
        if total > MAX_CHUNKS {
            return Err(ChunkError::MessageTooBig(total));
        }
        if self.next_message_id >= MAX_MESSAGES {
            return Err(ChunkError::MessageIdsExhausted);
        }
        let message_id = (self.next_message_id as u16).to_be_bytes();
        self.next_message_id += 1;

        let split = cmp::min(message.len(), self.max_chunk_size - FIRST_HEADER_LENGTH);
        let (head, tail) = message.split_at(split);

        let mut chunks = Vec::with_capacity(total);
        let mut first = Vec::with_capacity(FIRST_HEADER_LENGTH + head.len());
        first.extend_from_slice(&message_id);
        first.push(0);
        first.push(total as u8);
        first.extend_from_slice(head);
        chunks.push(first);

        for (index, data) in tail
            .chunks(self.max_chunk_size - HEADER_LENGTH)
            .enumerate()
        {
            let mut chunk = Vec::with_capacity(HEADER_LENGTH + data.len());
            chunk.extend_from_slice(&message_id);
            chunk.push((index + 1) as u8);
            chunk.extend_from_slice(data);
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Performs division with ceil.
fn ceiling_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

#[derive(Debug, Default)]
struct PartialMessage {
    total: Option<u8>,
    chunks: BTreeMap<u8, Vec<u8>>,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        self.total
            .map(|total| self.chunks.len() == total as usize)
            .unwrap_or(false)
    }

    fn into_message(self) -> Vec<u8> {
        self.chunks.into_iter().flat_map(|(_, data)| data).collect()
    }
}

#[derive(Debug, Default)]
/// Rejoins chunks into messages.
pub struct Reassembler {
    messages: HashMap<u16, PartialMessage>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk and returns the message it completes, if any.
    ///
    /// A completed message is forgotten as soon as it is returned.
    ///
    /// # Errors
    /// Fails if the chunk is malformed, if it was already received, or if it lies
    /// beyond the total number of chunks announced for its message.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, ChunkError> {
        let buffer = ChunkBuffer::new(bytes)?;
        let message = buffer.message_id();
        let chunk = buffer.chunk_id();
        let partial = self.messages.entry(message).or_default();

        if partial.chunks.contains_key(&chunk) {
            return Err(ChunkError::DuplicateChunk { message, chunk });
        }
        match buffer.total() {
            Some(0) => return Err(ChunkError::NoChunks(message)),
            Some(total) => {
                if let Some(&highest) = partial.chunks.keys().next_back() {
                    if highest >= total {
                        return Err(ChunkError::ChunkOutOfBounds {
                            message,
                            chunk: highest,
                            total,
                        });
                    }
                }
                partial.total = Some(total);
            }
            None => {
                if let Some(total) = partial.total {
                    if chunk >= total {
                        return Err(ChunkError::ChunkOutOfBounds {
                            message,
                            chunk,
                            total,
                        });
                    }
                }
            }
        }
        partial.chunks.insert(chunk, buffer.payload().to_vec());

        if partial.is_complete() {
            Ok(self.messages.remove(&message).map(PartialMessage::into_message))
        } else {
            Ok(None)
        }
    }

    /// Gets the number of partially received messages.
    pub fn pending(&self) -> usize {
        self.messages.len()
    }
}
