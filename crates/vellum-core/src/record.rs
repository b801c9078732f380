//! Event records and their on-disk framing.
//!
//! Every record in a segment is framed as:
//!
//! ```text
//! magic(2) | flags(1) | reserved(1) | length(4) |
//! global_pos(8) | stream_rev(8) | timestamp_ms(8) |
//! stream_id_len(2) | tenant_id_len(2) | command_id_len(2) | payload_len(4) |
//! stream_id | tenant_id | command_id | payload | crc32c(4)
//! ```
//!
//! Integers are little-endian. `length` is the total record length in bytes,
//! header through CRC, so a scanner can skip records without parsing bodies.
//! The CRC covers all preceding bytes of the record.
//!
//! A record with the trailer flag set closes a committed batch: its payload
//! lists the `(global_pos, file_offset)` pairs of the batch plus a batch CRC
//! over the concatenated record bytes. Trailers double as the segment's
//! periodic index blocks.

use serde::{Deserialize, Serialize};

/// First two bytes of every framed record.
pub(crate) const RECORD_MAGIC: [u8; 2] = *b"ve";

/// Fixed header length: magic through payload_len.
pub(crate) const HEADER_LEN: usize = 2 + 1 + 1 + 4 + 8 + 8 + 8 + 2 + 2 + 2 + 4;

/// Trailing CRC length.
pub(crate) const CRC_LEN: usize = 4;

/// Flag bit marking a batch-trailer record.
pub(crate) const FLAG_TRAILER: u8 = 0b0000_0001;

/// The atomic unit stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-wide position assigned at commit; strictly increasing.
    pub global_pos: u64,
    /// Logical aggregate this event belongs to.
    pub stream_id: String,
    /// 1-based, contiguous per-stream sequence.
    pub stream_rev: u64,
    /// Isolation boundary; copied into every record.
    pub tenant_id: String,
    /// Caller-supplied idempotency key, scoped to the stream.
    pub command_id: String,
    /// Milliseconds since epoch, assigned by the writer at commit.
    pub timestamp_ms: u64,
    /// Opaque event body.
    #[serde(with = "serde_bytes_b64")]
    pub payload: Vec<u8>,
}

/// Base64 payload encoding for snapshot/debug serialization. The log itself
/// stores raw bytes; this only affects serde representations.
mod serde_bytes_b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(D::Error::custom)
    }
}

/// A decoded batch trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrailerFrame {
    /// Global position of the last record in the closed batch.
    pub last_global_pos: u64,
    /// `(global_pos, file_offset)` pairs for the batch, in write order.
    pub entries: Vec<(u64, u64)>,
    /// CRC-32C over the concatenated encoded record bytes of the batch.
    pub batch_crc: u32,
}

/// One framed unit read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Event(EventRecord),
    Trailer(TrailerFrame),
}

/// Framing failures. Recovery treats every variant as the torn-write
/// boundary; readers surface them as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    /// Fewer bytes available than a complete record needs.
    Truncated,
    /// First two bytes are not the record magic.
    BadMagic,
    /// Declared length is impossible (shorter than the header or longer
    /// than the remaining bytes).
    BadLength,
    /// CRC over the record bytes does not match the stored CRC.
    BadCrc,
    /// Trailer payload does not parse.
    BadTrailer,
}

/// Append the framed encoding of `record` to `out`.
pub(crate) fn encode_event(record: &EventRecord, out: &mut Vec<u8>) {
    debug_assert!(record.stream_id.len() <= u16::MAX as usize);
    debug_assert!(record.tenant_id.len() <= u16::MAX as usize);
    debug_assert!(record.command_id.len() <= u16::MAX as usize);

    let start = out.len();
    let total = HEADER_LEN
        + record.stream_id.len()
        + record.tenant_id.len()
        + record.command_id.len()
        + record.payload.len()
        + CRC_LEN;

    out.extend_from_slice(&RECORD_MAGIC);
    out.push(0); // flags
    out.push(0); // reserved
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&record.global_pos.to_le_bytes());
    out.extend_from_slice(&record.stream_rev.to_le_bytes());
    out.extend_from_slice(&record.timestamp_ms.to_le_bytes());
    out.extend_from_slice(&(record.stream_id.len() as u16).to_le_bytes());
    out.extend_from_slice(&(record.tenant_id.len() as u16).to_le_bytes());
    out.extend_from_slice(&(record.command_id.len() as u16).to_le_bytes());
    out.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(record.stream_id.as_bytes());
    out.extend_from_slice(record.tenant_id.as_bytes());
    out.extend_from_slice(record.command_id.as_bytes());
    out.extend_from_slice(&record.payload);

    let crc = crc32c::crc32c(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
}

/// Append a framed batch trailer to `out`.
///
/// `batch_crc` must be the CRC-32C over the encoded record bytes the trailer
/// closes; `timestamp_ms` is the commit timestamp shared by the batch.
pub(crate) fn encode_trailer(
    last_global_pos: u64,
    timestamp_ms: u64,
    entries: &[(u64, u64)],
    batch_crc: u32,
    out: &mut Vec<u8>,
) {
    let payload_len = 4 + entries.len() * 16 + 4;
    let total = HEADER_LEN + payload_len + CRC_LEN;
    let start = out.len();

    out.extend_from_slice(&RECORD_MAGIC);
    out.push(FLAG_TRAILER);
    out.push(0);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&last_global_pos.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // stream_rev unused
    out.extend_from_slice(&timestamp_ms.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // stream_id_len
    out.extend_from_slice(&0u16.to_le_bytes()); // tenant_id_len
    out.extend_from_slice(&0u16.to_le_bytes()); // command_id_len
    out.extend_from_slice(&(payload_len as u32).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (pos, offset) in entries {
        out.extend_from_slice(&pos.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend_from_slice(&batch_crc.to_le_bytes());

    let crc = crc32c::crc32c(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied.
pub(crate) fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if buf[0..2] != RECORD_MAGIC {
        return Err(FrameError::BadMagic);
    }
    let flags = buf[2];
    let total = read_u32(buf, 4) as usize;
    if total < HEADER_LEN + CRC_LEN {
        return Err(FrameError::BadLength);
    }
    if total > buf.len() {
        // Could be a torn tail or a corrupt length field; either way the
        // scanner must stop here.
        return Err(FrameError::BadLength);
    }

    let body = &buf[..total - CRC_LEN];
    let stored_crc = read_u32(buf, total - CRC_LEN);
    if crc32c::crc32c(body) != stored_crc {
        return Err(FrameError::BadCrc);
    }

    let global_pos = read_u64(buf, 8);
    let stream_rev = read_u64(buf, 16);
    let timestamp_ms = read_u64(buf, 24);
    let stream_id_len = read_u16(buf, 32) as usize;
    let tenant_id_len = read_u16(buf, 34) as usize;
    let command_id_len = read_u16(buf, 36) as usize;
    let payload_len = read_u32(buf, 38) as usize;

    let var_len = stream_id_len + tenant_id_len + command_id_len + payload_len;
    if HEADER_LEN + var_len + CRC_LEN != total {
        return Err(FrameError::BadLength);
    }

    if flags & FLAG_TRAILER != 0 {
        let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
        if payload.len() < 8 {
            return Err(FrameError::BadTrailer);
        }
        let count = read_u32(payload, 0) as usize;
        if payload.len() != 4 + count * 16 + 4 {
            return Err(FrameError::BadTrailer);
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let base = 4 + i * 16;
            entries.push((read_u64(payload, base), read_u64(payload, base + 8)));
        }
        let batch_crc = read_u32(payload, 4 + count * 16);
        return Ok((
            Frame::Trailer(TrailerFrame {
                last_global_pos: global_pos,
                entries,
                batch_crc,
            }),
            total,
        ));
    }

    let sid_end = HEADER_LEN + stream_id_len;
    let tid_end = sid_end + tenant_id_len;
    let cid_end = tid_end + command_id_len;
    let stream_id = String::from_utf8(buf[HEADER_LEN..sid_end].to_vec())
        .map_err(|_| FrameError::BadLength)?;
    let tenant_id =
        String::from_utf8(buf[sid_end..tid_end].to_vec()).map_err(|_| FrameError::BadLength)?;
    let command_id =
        String::from_utf8(buf[tid_end..cid_end].to_vec()).map_err(|_| FrameError::BadLength)?;
    let payload = buf[cid_end..cid_end + payload_len].to_vec();

    Ok((
        Frame::Event(EventRecord {
            global_pos,
            stream_id,
            stream_rev,
            tenant_id,
            command_id,
            timestamp_ms,
            payload,
        }),
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> EventRecord {
        EventRecord {
            global_pos: 7,
            stream_id: "user-42".to_string(),
            stream_rev: 3,
            tenant_id: "tenantX".to_string(),
            command_id: "cmd-abc".to_string(),
            timestamp_ms: 1_700_000_000_000,
            payload: br#"{"hello":"world"}"#.to_vec(),
        }
    }

    // ---- Event framing ----

    #[test]
    fn event_roundtrip() {
        let record = sample_record();
        let mut buf = Vec::new();
        encode_event(&record, &mut buf);

        let (frame, used) = decode_frame(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(frame, Frame::Event(record));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let record = EventRecord {
            payload: Vec::new(),
            ..sample_record()
        };
        let mut buf = Vec::new();
        encode_event(&record, &mut buf);
        let (frame, _) = decode_frame(&buf).unwrap();
        assert_eq!(frame, Frame::Event(record));
    }

    #[test]
    fn length_field_spans_whole_record() {
        let mut buf = Vec::new();
        encode_event(&sample_record(), &mut buf);
        let declared = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        assert_eq!(declared, buf.len());
    }

    // ---- Trailer framing ----

    #[test]
    fn trailer_roundtrip() {
        let entries = vec![(5u64, 0u64), (6, 120), (7, 233)];
        let mut buf = Vec::new();
        encode_trailer(7, 1_700_000_000_000, &entries, 0xDEAD_BEEF, &mut buf);

        let (frame, used) = decode_frame(&buf).unwrap();
        assert_eq!(used, buf.len());
        match frame {
            Frame::Trailer(t) => {
                assert_eq!(t.last_global_pos, 7);
                assert_eq!(t.entries, entries);
                assert_eq!(t.batch_crc, 0xDEAD_BEEF);
            }
            Frame::Event(_) => panic!("expected trailer"),
        }
    }

    // ---- Corruption detection ----

    #[test]
    fn flipped_byte_fails_crc() {
        let mut buf = Vec::new();
        encode_event(&sample_record(), &mut buf);
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        assert_eq!(decode_frame(&buf).unwrap_err(), FrameError::BadCrc);
    }

    #[test]
    fn truncated_buffer_detected() {
        let mut buf = Vec::new();
        encode_event(&sample_record(), &mut buf);
        // Cut inside the payload: the declared length overruns what is left.
        assert_eq!(
            decode_frame(&buf[..buf.len() - 5]).unwrap_err(),
            FrameError::BadLength
        );
        // Cut inside the header.
        assert_eq!(
            decode_frame(&buf[..HEADER_LEN - 1]).unwrap_err(),
            FrameError::Truncated
        );
    }

    #[test]
    fn bad_magic_detected() {
        let mut buf = Vec::new();
        encode_event(&sample_record(), &mut buf);
        buf[0] = b'x';
        assert_eq!(decode_frame(&buf).unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn garbage_length_detected() {
        let mut buf = Vec::new();
        encode_event(&sample_record(), &mut buf);
        // Claim a length far past the end of the buffer.
        buf[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(decode_frame(&buf).unwrap_err(), FrameError::BadLength);
    }

    // ---- Serde ----

    #[test]
    fn record_serde_roundtrip_preserves_payload_bytes() {
        let record = EventRecord {
            payload: vec![0, 1, 2, 250, 251, 252, 253, 254, 255],
            ..sample_record()
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    // ---- prop ----

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_payload_roundtrips(
                payload in proptest::collection::vec(any::<u8>(), 0..2048),
                pos in 1u64..u64::MAX / 2,
                rev in 1u64..u64::MAX / 2,
            ) {
                let record = EventRecord {
                    global_pos: pos,
                    stream_id: "s".to_string(),
                    stream_rev: rev,
                    tenant_id: "t".to_string(),
                    command_id: "c".to_string(),
                    timestamp_ms: 1,
                    payload,
                };
                let mut buf = Vec::new();
                encode_event(&record, &mut buf);
                let (frame, used) = decode_frame(&buf).unwrap();
                prop_assert_eq!(used, buf.len());
                prop_assert_eq!(frame, Frame::Event(record));
            }

            #[test]
            fn single_bit_flip_never_decodes_silently(
                flip_bit in 0usize..64,
            ) {
                let record = EventRecord {
                    global_pos: 9,
                    stream_id: "stream".to_string(),
                    stream_rev: 2,
                    tenant_id: "tenant".to_string(),
                    command_id: "cmd".to_string(),
                    timestamp_ms: 77,
                    payload: vec![1, 2, 3, 4],
                };
                let mut buf = Vec::new();
                encode_event(&record, &mut buf);
                let byte = flip_bit / 8 % buf.len();
                buf[byte] ^= 1 << (flip_bit % 8);
                // Any flip must be rejected, never decoded as a different record.
                if let Ok((Frame::Event(decoded), _)) = decode_frame(&buf) {
                    prop_assert_eq!(decoded, record);
                }
            }
        }
    }
}
