// tests/framing.rs
// Chunk framing over an identity cipher, so wire layout and reassembly can be
// checked byte for byte without TLS in the way.

use std::io::{self, Cursor, Read};

use agentlink::constants::{
    CHUNK_HEADER_LEN, CHUNK_LENGTH_MASK, CONTINUATION_FLAG, MAX_CHUNK_SIZE,
};
use agentlink::network::frame::{
    open_message, seal_message, write_chunks, ChunkHeader, FrameReader,
};
use agentlink::security::{CipherStatus, SessionCipher};
use agentlink::{Result, TransportError};
use rand::RngCore;

/// Copies plaintext through unchanged, at most `per_wrap` bytes per call.
struct PlainCipher {
    per_wrap: usize,
}

impl PlainCipher {
    fn new() -> Self {
        Self { per_wrap: 16_384 }
    }
}

impl SessionCipher for PlainCipher {
    fn wrap(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let n = plaintext.len().min(self.per_wrap);
        out.extend_from_slice(&plaintext[..n]);
        Ok(n)
    }

    fn unwrap(&mut self, ciphertext: &[u8], plaintext: &mut Vec<u8>) -> Result<CipherStatus> {
        plaintext.extend_from_slice(ciphertext);
        Ok(CipherStatus::Open)
    }
}

/// Hands out `step` bytes per read with a WouldBlock between every read,
/// and WouldBlock (never EOF) once drained.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
    block_next: bool,
}

impl Trickle {
    fn new(data: Vec<u8>, step: usize) -> Self {
        Self {
            data,
            pos: 0,
            step,
            block_next: true,
        }
    }
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.block_next || self.pos == self.data.len() {
            self.block_next = false;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.block_next = true;
        let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn encode(message: &[u8], max_chunk: usize) -> (Vec<u8>, usize) {
    let sealed = seal_message(&[message]).expect("seal");
    let mut wire = Vec::new();
    let chunks = write_chunks(&mut PlainCipher::new(), &sealed, max_chunk, &mut wire).expect("chunks");
    (wire, chunks)
}

/// Walk the wire bytes and return every chunk header.
fn headers(wire: &[u8]) -> Vec<ChunkHeader> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < wire.len() {
        let raw = [wire[pos], wire[pos + 1], wire[pos + 2], wire[pos + 3]];
        let header = ChunkHeader::decode(raw).expect("header");
        pos += CHUNK_HEADER_LEN + usize::from(header.len);
        out.push(header);
    }
    assert_eq!(pos, wire.len(), "chunks must tile the buffer exactly");
    out
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[test]
fn header_layout_is_big_endian_with_continuation_bit() {
    let header = ChunkHeader::new(1234, true);
    assert_eq!(header.encode(), (0x1_0000u32 | 1234).to_be_bytes());
    assert_eq!(ChunkHeader::decode(header.encode()).unwrap(), header);

    let last = ChunkHeader::new(18_000, false);
    assert_eq!(last.encode(), 18_000u32.to_be_bytes());
    assert_eq!(ChunkHeader::decode(last.encode()).unwrap(), last);

    let word = u32::from_be_bytes(header.encode());
    assert_eq!(word & CHUNK_LENGTH_MASK, 1234);
    assert_eq!(word & CONTINUATION_FLAG, CONTINUATION_FLAG);
    assert_eq!(word & !(CHUNK_LENGTH_MASK | CONTINUATION_FLAG), 0);
}

#[test]
fn header_with_reserved_bits_is_rejected() {
    for raw in [[0x00, 0x02, 0x00, 0x01], [0x80, 0x00, 0x00, 0x01], [0x00, 0x03, 0x00, 0x00]] {
        assert!(
            matches!(ChunkHeader::decode(raw), Err(TransportError::MalformedHeader(_))),
            "{:02x?} must be rejected",
            raw
        );
    }
}

#[test]
fn header_above_chunk_limit_is_rejected() {
    let raw = ((MAX_CHUNK_SIZE + 1) as u32).to_be_bytes();
    match ChunkHeader::decode(raw) {
        Err(TransportError::ChunkTooLarge { len, max }) => {
            assert_eq!(len, MAX_CHUNK_SIZE + 1);
            assert_eq!(max, MAX_CHUNK_SIZE);
        }
        other => panic!("expected ChunkTooLarge, got {:?}", other),
    }
}

#[test]
fn one_byte_message_is_a_single_final_chunk() {
    let (wire, chunks) = encode(&[42], MAX_CHUNK_SIZE);
    assert_eq!(chunks, 1);
    assert_eq!(headers(&wire), vec![ChunkHeader::new(5, false)]);

    let mut reader = FrameReader::new(1024);
    let got = reader
        .read_from(&mut Cursor::new(wire), &mut PlainCipher::new())
        .unwrap();
    assert_eq!(got, Some(vec![42]));
    assert!(!reader.is_reassembling());
}

#[test]
fn large_message_spans_continuation_chunks() {
    let payload = random_bytes(40_000);
    let (wire, chunks) = encode(&payload, MAX_CHUNK_SIZE);
    assert!(chunks >= 3, "40000 bytes took only {} chunks", chunks);

    let hs = headers(&wire);
    assert_eq!(hs.len(), chunks);
    let (last, rest) = hs.split_last().unwrap();
    assert!(rest.iter().all(|h| h.more));
    assert!(!last.more);

    let mut reader = FrameReader::new(1 << 20);
    let got = reader
        .read_from(&mut Cursor::new(wire), &mut PlainCipher::new())
        .unwrap();
    assert_eq!(got.as_deref(), Some(&payload[..]));
}

#[test]
fn oversized_ciphertext_is_split_at_max_chunk() {
    let payload = random_bytes(3_000);
    let (wire, chunks) = encode(&payload, 500);
    let hs = headers(&wire);
    assert_eq!(hs.len(), chunks);
    assert!(hs.iter().all(|h| h.len <= 500));
    assert_eq!(hs.iter().filter(|h| !h.more).count(), 1);
    assert!(!hs.last().unwrap().more);

    let got = FrameReader::new(1 << 20)
        .read_from(&mut Cursor::new(wire), &mut PlainCipher::new())
        .unwrap();
    assert_eq!(got, Some(payload));
}

#[test]
fn empty_message_round_trips() {
    let (wire, _) = encode(&[], MAX_CHUNK_SIZE);
    let got = FrameReader::new(16)
        .read_from(&mut Cursor::new(wire), &mut PlainCipher::new())
        .unwrap();
    assert_eq!(got, Some(Vec::new()));
}

#[test]
fn reader_resumes_across_would_block() {
    let first = random_bytes(20_000);
    let second = b"second".to_vec();
    let mut wire = encode(&first, MAX_CHUNK_SIZE).0;
    wire.extend(encode(&second, MAX_CHUNK_SIZE).0);

    let mut src = Trickle::new(wire, 7);
    let mut cipher = PlainCipher::new();
    let mut reader = FrameReader::new(1 << 20);
    let mut delivered = Vec::new();
    let mut would_block = 0;
    for _ in 0..100_000 {
        match reader.read_from(&mut src, &mut cipher).unwrap() {
            Some(message) => delivered.push(message),
            None => would_block += 1,
        }
        if delivered.len() == 2 {
            break;
        }
    }
    assert!(would_block > 0);
    assert_eq!(delivered, vec![first, second]);
    assert!(!reader.is_reassembling());
}

#[test]
fn messages_are_delivered_in_wire_order() {
    let mut wire = Vec::new();
    for i in 0..20u32 {
        wire.extend(encode(format!("message-{}", i).as_bytes(), MAX_CHUNK_SIZE).0);
    }
    let mut src = Cursor::new(wire);
    let mut cipher = PlainCipher::new();
    let mut reader = FrameReader::new(1024);
    for i in 0..20u32 {
        let got = reader.read_from(&mut src, &mut cipher).unwrap().unwrap();
        assert_eq!(got, format!("message-{}", i).into_bytes());
    }
    assert!(matches!(
        reader.read_from(&mut src, &mut cipher),
        Err(TransportError::PeerClosed)
    ));
}

#[test]
fn end_of_stream_is_peer_closed() {
    let mut cipher = PlainCipher::new();
    let empty = FrameReader::new(1024).read_from(&mut Cursor::new(Vec::new()), &mut cipher);
    assert!(matches!(empty, Err(TransportError::PeerClosed)));

    let (mut wire, _) = encode(&random_bytes(100), MAX_CHUNK_SIZE);
    wire.truncate(50);
    let mut reader = FrameReader::new(1024);
    let cut = reader.read_from(&mut Cursor::new(wire), &mut cipher);
    assert!(matches!(cut, Err(TransportError::PeerClosed)));
    assert!(reader.is_reassembling());
}

#[test]
fn oversized_header_in_stream_fails_before_payload() {
    let mut wire = ((MAX_CHUNK_SIZE + 1) as u32).to_be_bytes().to_vec();
    wire.extend(vec![0u8; 64]);
    let got = FrameReader::new(1 << 20).read_from(&mut Cursor::new(wire), &mut PlainCipher::new());
    assert!(matches!(got, Err(TransportError::ChunkTooLarge { .. })));
}

#[test]
fn inner_length_mismatch_is_rejected() {
    let plaintext = [0u8, 0, 0, 5, 1, 2];
    let mut wire = ChunkHeader::new(plaintext.len() as u16, false).encode().to_vec();
    wire.extend_from_slice(&plaintext);
    let got = FrameReader::new(1024).read_from(&mut Cursor::new(wire), &mut PlainCipher::new());
    assert!(matches!(got, Err(TransportError::MalformedMessage(_))));

    assert!(matches!(
        open_message(vec![0, 0]),
        Err(TransportError::MalformedMessage(_))
    ));
}

#[test]
fn reassembly_above_message_cap_is_rejected() {
    let (wire, _) = encode(&random_bytes(64), 16);
    let got = FrameReader::new(32).read_from(&mut Cursor::new(wire), &mut PlainCipher::new());
    assert!(matches!(got, Err(TransportError::MessageTooLarge { max: 32 })));
}

#[test]
fn sealed_parts_are_concatenated_behind_length_prefix() {
    let sealed = seal_message(&[b"ab", b"", b"cde"]).unwrap();
    assert_eq!(sealed, vec![0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e']);
    assert_eq!(open_message(sealed).unwrap(), b"abcde".to_vec());
}
