//! Chunked wire framing.
//!
//! Every chunk is `[4-byte header][ciphertext]`. The header is a big-endian
//! word: bits 0-15 carry the ciphertext length, bit 16 says more chunks follow
//! for the current logical message, all other bits must be zero. The plaintext
//! of a logical message starts with its own 4-byte big-endian payload length.

use std::io::{self, Read};

use crate::constants::{
    CHUNK_HEADER_LEN, CHUNK_LENGTH_MASK, CONTINUATION_FLAG, MAX_CHUNK_SIZE, MESSAGE_HEADER_LEN,
};
use crate::error::{Result, TransportError};
use crate::security::engine::{CipherStatus, SessionCipher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub len: u16,
    pub more: bool,
}

impl ChunkHeader {
    pub fn new(len: u16, more: bool) -> Self {
        Self { len, more }
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut word = u32::from(self.len);
        if self.more {
            word |= CONTINUATION_FLAG;
        }
        word.to_be_bytes()
    }

    /// Parse a header, rejecting reserved bits and lengths above `MAX_CHUNK_SIZE`.
    pub fn decode(raw: [u8; CHUNK_HEADER_LEN]) -> Result<Self> {
        let word = u32::from_be_bytes(raw);
        if word & !(CONTINUATION_FLAG | CHUNK_LENGTH_MASK) != 0 {
            return Err(TransportError::MalformedHeader(word));
        }
        let len = (word & CHUNK_LENGTH_MASK) as u16;
        if usize::from(len) > MAX_CHUNK_SIZE {
            return Err(TransportError::ChunkTooLarge {
                len: usize::from(len),
                max: MAX_CHUNK_SIZE,
            });
        }
        Ok(Self {
            len,
            more: word & CONTINUATION_FLAG != 0,
        })
    }
}

/// Concatenate `parts` behind a 4-byte length prefix.
pub fn seal_message(parts: &[&[u8]]) -> Result<Vec<u8>> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let declared = u32::try_from(total).map_err(|_| TransportError::MessageTooLarge {
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + total);
    out.extend_from_slice(&declared.to_be_bytes());
    for part in parts {
        out.extend_from_slice(part);
    }
    Ok(out)
}

/// Check and strip the length prefix of a reassembled message.
pub fn open_message(mut plaintext: Vec<u8>) -> Result<Vec<u8>> {
    if plaintext.len() < MESSAGE_HEADER_LEN {
        return Err(TransportError::malformed_message(format!(
            "{} bytes is shorter than the message header",
            plaintext.len()
        )));
    }
    let declared =
        u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]) as usize;
    let actual = plaintext.len() - MESSAGE_HEADER_LEN;
    if declared != actual {
        return Err(TransportError::malformed_message(format!(
            "declared {} bytes, received {}",
            declared, actual
        )));
    }
    plaintext.drain(..MESSAGE_HEADER_LEN);
    Ok(plaintext)
}

/// Encrypt `message` and append its chunks to `out`, returning the number of
/// chunks written. Ciphertext from one wrap call that exceeds `max_chunk` is
/// split across several chunks.
pub fn write_chunks<C: SessionCipher + ?Sized>(
    cipher: &mut C,
    message: &[u8],
    max_chunk: usize,
    out: &mut Vec<u8>,
) -> Result<usize> {
    let max_chunk = max_chunk.clamp(1, MAX_CHUNK_SIZE);
    let mut remaining = message;
    let mut ciphertext = Vec::new();
    let mut chunks = 0;
    loop {
        ciphertext.clear();
        let consumed = cipher.wrap(remaining, &mut ciphertext)?;
        remaining = &remaining[consumed..];
        let last_wrap = remaining.is_empty();
        if ciphertext.is_empty() {
            if last_wrap {
                out.extend_from_slice(&ChunkHeader::new(0, false).encode());
                return Ok(chunks + 1);
            }
            continue;
        }
        let mut pieces = ciphertext.chunks(max_chunk).peekable();
        while let Some(piece) = pieces.next() {
            let more = !last_wrap || pieces.peek().is_some();
            let len = u16::try_from(piece.len())
                .map_err(|_| TransportError::engine("chunk length exceeds 16 bits"))?;
            out.extend_from_slice(&ChunkHeader::new(len, more).encode());
            out.extend_from_slice(piece);
            chunks += 1;
        }
        if last_wrap {
            return Ok(chunks);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Header,
    Payload { len: usize, more: bool },
}

/// Incremental reader for the chunk stream of one connection.
///
/// Keeps partial headers, partial payloads and partially reassembled messages
/// between calls, so it can be fed from a non-blocking socket.
#[derive(Debug)]
pub struct FrameReader {
    phase: ReadPhase,
    raw: Vec<u8>,
    filled: usize,
    plaintext: Vec<u8>,
    reassembling: bool,
    max_message: usize,
}

impl FrameReader {
    pub fn new(max_message: usize) -> Self {
        Self {
            phase: ReadPhase::Header,
            raw: vec![0; CHUNK_HEADER_LEN],
            filled: 0,
            plaintext: Vec::new(),
            reassembling: false,
            max_message,
        }
    }

    /// True while a logical message has been started but not completed.
    pub fn is_reassembling(&self) -> bool {
        self.reassembling
    }

    /// Read until one logical message completes or the source would block.
    ///
    /// Returns `Ok(None)` on `WouldBlock`; state is kept for the next call.
    /// End of stream is `PeerClosed` wherever it happens.
    pub fn read_from<R, C>(&mut self, src: &mut R, cipher: &mut C) -> Result<Option<Vec<u8>>>
    where
        R: Read + ?Sized,
        C: SessionCipher + ?Sized,
    {
        loop {
            match self.phase {
                ReadPhase::Header => {
                    if !self.fill(src, CHUNK_HEADER_LEN)? {
                        return Ok(None);
                    }
                    let header =
                        ChunkHeader::decode([self.raw[0], self.raw[1], self.raw[2], self.raw[3]])?;
                    let len = usize::from(header.len);
                    if self.raw.len() < len {
                        let grown = (self.raw.len() * 2).clamp(len, MAX_CHUNK_SIZE);
                        self.raw.resize(grown, 0);
                    }
                    self.filled = 0;
                    self.reassembling = true;
                    self.phase = ReadPhase::Payload {
                        len,
                        more: header.more,
                    };
                }
                ReadPhase::Payload { len, more } => {
                    if !self.fill(src, len)? {
                        return Ok(None);
                    }
                    self.filled = 0;
                    self.phase = ReadPhase::Header;
                    let status = cipher.unwrap(&self.raw[..len], &mut self.plaintext)?;
                    if status == CipherStatus::Closed {
                        return Err(TransportError::PeerClosed);
                    }
                    if self.plaintext.len() > self.max_message.saturating_add(MESSAGE_HEADER_LEN)
                    {
                        return Err(TransportError::MessageTooLarge {
                            max: self.max_message,
                        });
                    }
                    if !more {
                        self.reassembling = false;
                        let message = std::mem::take(&mut self.plaintext);
                        return open_message(message).map(Some);
                    }
                }
            }
        }
    }

    fn fill<R: Read + ?Sized>(&mut self, src: &mut R, want: usize) -> Result<bool> {
        while self.filled < want {
            match src.read(&mut self.raw[self.filled..want]) {
                Ok(0) => return Err(TransportError::PeerClosed),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}
