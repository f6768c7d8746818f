//! Bulk data stream framing
//!
//! High-throughput transfers can be carried as a `BulkDataStart` /
//! `BulkDataChunk`* / `BulkDataEnd` sequence, each chunk compressed
//! independently so a receiver never needs cross-frame state beyond
//! the assembler below. Streams are chunked at 64 KiB of uncompressed
//! data; the `End` message closes the stream with an empty chunk.

use crate::compress::{self, Algorithm};
use crate::error::{ProtocolError, Result};
use crate::messages::Message;
use crate::types::BulkDataHeader;

/// Uncompressed chunk size for outgoing streams (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Split a byte stream into bulk data messages
///
/// The first chunk travels in `BulkDataStart`, subsequent chunks in
/// `BulkDataChunk`, and an empty `BulkDataEnd` at the final offset
/// closes the stream. An empty input yields an empty `Start` and the
/// closing `End`.
pub fn chunk_stream(stream_id: u64, data: &[u8], algorithm: Algorithm) -> Result<Vec<Message>> {
    let total_size = data.len() as u32;
    let mut messages = Vec::with_capacity(data.len() / CHUNK_SIZE + 2);

    let mut chunks: Vec<(usize, &[u8])> = data
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, c)| (i * CHUNK_SIZE, c))
        .collect();
    if chunks.is_empty() {
        chunks.push((0, &[]));
    }

    for (index, (offset, chunk)) in chunks.into_iter().enumerate() {
        let header = BulkDataHeader {
            stream_id,
            total_size,
            chunk_size: chunk.len() as u32,
            chunk_offset: offset as u32,
            compression: algorithm as u8,
        };
        let data = compress::compress(chunk, algorithm)?;
        messages.push(if index == 0 {
            Message::BulkDataStart { header, data }
        } else {
            Message::BulkDataChunk { header, data }
        });
    }

    messages.push(Message::BulkDataEnd {
        header: BulkDataHeader {
            stream_id,
            total_size,
            chunk_size: 0,
            chunk_offset: total_size,
            compression: Algorithm::None as u8,
        },
        data: Vec::new(),
    });

    Ok(messages)
}

/// Reassembles one bulk data stream from its message sequence
///
/// Chunks must arrive in order on one connection; any stream-id,
/// offset or size mismatch aborts the stream.
#[derive(Debug)]
pub struct StreamAssembler {
    stream_id: u64,
    total_size: usize,
    buffer: Vec<u8>,
}

impl StreamAssembler {
    /// Start assembling from a `BulkDataStart` message
    pub fn start(header: &BulkDataHeader, data: &[u8]) -> Result<Self> {
        let mut assembler = Self {
            stream_id: header.stream_id,
            total_size: header.total_size as usize,
            buffer: Vec::with_capacity(header.total_size as usize),
        };
        assembler.accept(header, data)?;
        Ok(assembler)
    }

    /// Feed a `BulkDataChunk` or `BulkDataEnd` payload
    pub fn accept(&mut self, header: &BulkDataHeader, data: &[u8]) -> Result<()> {
        if header.stream_id != self.stream_id {
            return Err(ProtocolError::BulkStream(format!(
                "stream id {} does not match open stream {}",
                header.stream_id, self.stream_id
            )));
        }
        if header.chunk_offset as usize != self.buffer.len() {
            return Err(ProtocolError::BulkStream(format!(
                "chunk offset {} out of order (expected {})",
                header.chunk_offset,
                self.buffer.len()
            )));
        }

        let algorithm = Algorithm::try_from(header.compression)?;
        let chunk = compress::decompress(data, algorithm)?;
        if chunk.len() != header.chunk_size as usize {
            return Err(ProtocolError::BulkStream(format!(
                "chunk decompressed to {} bytes, header declared {}",
                chunk.len(),
                header.chunk_size
            )));
        }
        if self.buffer.len() + chunk.len() > self.total_size {
            return Err(ProtocolError::BulkStream(format!(
                "stream overrun: {} bytes past declared total {}",
                self.buffer.len() + chunk.len() - self.total_size,
                self.total_size
            )));
        }

        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    /// Finish the stream, returning the reassembled bytes
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.buffer.len() != self.total_size {
            return Err(ProtocolError::BulkStream(format!(
                "stream ended with {} of {} bytes",
                self.buffer.len(),
                self.total_size
            )));
        }
        Ok(self.buffer)
    }
}

/// Run a full message sequence through the assembler
pub fn assemble_stream(messages: &[Message]) -> Result<Vec<u8>> {
    let mut assembler: Option<StreamAssembler> = None;

    for message in messages {
        match message {
            Message::BulkDataStart { header, data } => {
                if assembler.is_some() {
                    return Err(ProtocolError::BulkStream(
                        "nested bulk stream start".to_string(),
                    ));
                }
                assembler = Some(StreamAssembler::start(header, data)?);
            }
            Message::BulkDataChunk { header, data } => match assembler.as_mut() {
                Some(a) => a.accept(header, data)?,
                None => {
                    return Err(ProtocolError::BulkStream(
                        "chunk without stream start".to_string(),
                    ))
                }
            },
            Message::BulkDataEnd { header, data } => match assembler.take() {
                Some(mut a) => {
                    a.accept(header, data)?;
                    return a.finish();
                }
                None => {
                    return Err(ProtocolError::BulkStream(
                        "end without stream start".to_string(),
                    ))
                }
            },
            other => {
                return Err(ProtocolError::BulkStream(format!(
                    "unexpected message kind {:#04x} in bulk stream",
                    other.kind() as u8
                )))
            }
        }
    }

    Err(ProtocolError::BulkStream("stream never ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn test_small_stream_roundtrip() {
        let data = sample(1000);
        for alg in [Algorithm::None, Algorithm::Lz4, Algorithm::Zstd] {
            let messages = chunk_stream(99, &data, alg).unwrap();
            assert_eq!(messages.len(), 2); // start + end
            assert_eq!(assemble_stream(&messages).unwrap(), data);
        }
    }

    #[test]
    fn test_multi_chunk_stream_roundtrip() {
        let data = sample(CHUNK_SIZE * 2 + 500);
        let messages = chunk_stream(7, &data, Algorithm::Lz4).unwrap();
        assert_eq!(messages.len(), 4); // start + 2 chunks + end
        assert!(matches!(messages[0], Message::BulkDataStart { .. }));
        assert!(matches!(messages[1], Message::BulkDataChunk { .. }));
        assert!(matches!(messages[3], Message::BulkDataEnd { .. }));
        assert_eq!(assemble_stream(&messages).unwrap(), data);
    }

    #[test]
    fn test_empty_stream() {
        let messages = chunk_stream(1, &[], Algorithm::Lz4).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(assemble_stream(&messages).unwrap().is_empty());
    }

    #[test]
    fn test_stream_id_mismatch_rejected() {
        let data = sample(CHUNK_SIZE + 10);
        let mut messages = chunk_stream(5, &data, Algorithm::None).unwrap();
        let last = messages.len() - 1;
        if let Message::BulkDataEnd { header, .. } = &mut messages[last] {
            header.stream_id = 6;
        } else {
            panic!("last message should be BulkDataEnd");
        }
        assert!(matches!(
            assemble_stream(&messages),
            Err(ProtocolError::BulkStream(_))
        ));
    }

    #[test]
    fn test_out_of_order_chunk_rejected() {
        let data = sample(CHUNK_SIZE * 3);
        let mut messages = chunk_stream(5, &data, Algorithm::None).unwrap();
        messages.swap(1, 2);
        assert!(matches!(
            assemble_stream(&messages),
            Err(ProtocolError::BulkStream(_))
        ));
    }

    #[test]
    fn test_missing_end_rejected() {
        let data = sample(CHUNK_SIZE * 2);
        let mut messages = chunk_stream(5, &data, Algorithm::None).unwrap();
        messages.pop();
        assert!(matches!(
            assemble_stream(&messages),
            Err(ProtocolError::BulkStream(_))
        ));
    }

    #[test]
    fn test_chunk_without_start_rejected() {
        let data = sample(CHUNK_SIZE * 2);
        let messages = chunk_stream(5, &data, Algorithm::None).unwrap();
        assert!(matches!(
            assemble_stream(&messages[1..]),
            Err(ProtocolError::BulkStream(_))
        ));
    }

    #[test]
    fn test_declared_size_mismatch_rejected() {
        let data = sample(100);
        let mut messages = chunk_stream(5, &data, Algorithm::None).unwrap();
        if let Message::BulkDataStart { header, .. } = &mut messages[0] {
            header.chunk_size = 50;
        }
        assert!(matches!(
            assemble_stream(&messages),
            Err(ProtocolError::BulkStream(_))
        ));
    }
}
