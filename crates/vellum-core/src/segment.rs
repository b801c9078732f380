//! Log segments: append-only files, batch trailers, and torn-tail recovery.
//!
//! The log is a sequence of segments named `events-<first_global_pos>.seg`.
//! Every committed batch is written as its framed records followed by one
//! batch-trailer record; a batch whose trailer never made it to disk (or
//! fails its CRC) is truncated away as a whole on open. Recovery therefore
//! only ever re-reads the tail written since the last complete trailer, not
//! the entire history of a segment.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StoreError, classify_io};
use crate::record::{CRC_LEN, EventRecord, Frame, FrameError, HEADER_LEN, decode_frame};

const SEGMENT_PREFIX: &str = "events-";
const SEGMENT_SUFFIX: &str = ".seg";

/// File name for the segment whose first record has `first_pos`.
pub(crate) fn segment_file_name(first_pos: u64) -> String {
    format!("{SEGMENT_PREFIX}{first_pos:08}{SEGMENT_SUFFIX}")
}

/// Parse a segment file name back into its first global position.
pub(crate) fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// List segment files under `dir`, sorted by first global position.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(first_pos) = parse_segment_name(name) {
            out.push((first_pos, entry.path()));
        }
    }
    out.sort_by_key(|(first, _)| *first);
    Ok(out)
}

/// Fsync a directory so freshly created segment files survive a crash.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir).and_then(|d| d.sync_all()).map_err(classify_io)
}

// =============================================================================
// Recovery scan
// =============================================================================

/// What a recovery scan learned about one segment.
#[derive(Debug)]
pub(crate) struct SegmentScan {
    /// Dense file offsets: `offsets[i]` locates the record at
    /// `first_pos + i`.
    pub offsets: Vec<u64>,
    /// Byte length of the valid prefix (the file is truncated to this).
    pub valid_len: u64,
    /// Whether a torn tail was cut off.
    pub truncated: bool,
}

/// Read one frame from `file`, returning the frame, its raw bytes, and its
/// length. `Ok(None)` is a clean end of file.
fn read_frame(file: &mut File, remaining: u64) -> std::result::Result<Option<(Frame, Vec<u8>)>, FrameError> {
    if remaining == 0 {
        return Ok(None);
    }
    if remaining < HEADER_LEN as u64 {
        return Err(FrameError::Truncated);
    }

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(|_| FrameError::Truncated)?;

    let total = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    if total < (HEADER_LEN + CRC_LEN) as u64 || total > remaining {
        return Err(FrameError::BadLength);
    }

    let mut bytes = Vec::with_capacity(total as usize);
    bytes.extend_from_slice(&header);
    bytes.resize(total as usize, 0);
    file.read_exact(&mut bytes[HEADER_LEN..])
        .map_err(|_| FrameError::Truncated)?;

    let (frame, used) = decode_frame(&bytes)?;
    debug_assert_eq!(used, bytes.len());
    Ok(Some((frame, bytes)))
}

/// Scan a segment forward, verifying every record CRC and every batch
/// trailer, invoking `on_event` for each durably committed record in order.
///
/// The first record that fails its CRC, overruns the file, or belongs to a
/// batch with no valid trailer marks the torn-write boundary: the file is
/// truncated at the start of that batch and fsynced. A partially written
/// batch is lost as a whole.
pub(crate) fn recover_segment(
    first_pos: u64,
    path: &Path,
    on_event: &mut dyn FnMut(EventRecord, u64),
) -> Result<SegmentScan> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(classify_io)?;
    let file_len = file.metadata().map_err(classify_io)?.len();

    let mut offsets: Vec<u64> = Vec::new();
    let mut cursor = 0u64;
    // Records of the batch currently being scanned, provisional until its
    // trailer checks out.
    let mut pending: Vec<(EventRecord, u64)> = Vec::new();
    let mut batch_start = 0u64;
    let mut batch_crc_acc = 0u32;
    let mut expected_next = first_pos + offsets.len() as u64;

    let torn_at = loop {
        match read_frame(&mut file, file_len - cursor) {
            Ok(None) => {
                if pending.is_empty() {
                    break None;
                }
                // Records with no trailer: the batch never committed.
                break Some((batch_start, "batch without trailer at end of segment"));
            }
            Ok(Some((Frame::Event(record), bytes))) => {
                if record.global_pos != expected_next {
                    break Some((batch_start, "global position out of sequence"));
                }
                expected_next += 1;
                batch_crc_acc = crc32c::crc32c_append(batch_crc_acc, &bytes);
                pending.push((record, cursor));
                cursor += bytes.len() as u64;
            }
            Ok(Some((Frame::Trailer(trailer), bytes))) => {
                let batch_crc = std::mem::take(&mut batch_crc_acc);
                let entries_match = trailer.entries.len() == pending.len()
                    && trailer
                        .entries
                        .iter()
                        .zip(pending.iter())
                        .all(|(&(pos, off), (rec, rec_off))| pos == rec.global_pos && off == *rec_off);
                if batch_crc != trailer.batch_crc || !entries_match {
                    break Some((batch_start, "batch trailer does not match its records"));
                }
                cursor += bytes.len() as u64;
                for (record, offset) in pending.drain(..) {
                    offsets.push(offset);
                    on_event(record, offset);
                }
                batch_start = cursor;
            }
            Err(err) => {
                break Some((batch_start, frame_error_reason(err)));
            }
        }
    };

    let truncated = if let Some((at, reason)) = torn_at {
        warn!(
            segment = %path.display(),
            offset = at,
            reason,
            "truncating torn segment tail"
        );
        file.set_len(at).map_err(classify_io)?;
        file.sync_data().map_err(classify_io)?;
        true
    } else {
        false
    };

    let valid_len = if truncated { batch_start } else { cursor };
    debug!(
        segment = %path.display(),
        records = offsets.len(),
        valid_len,
        truncated,
        "segment scan complete"
    );

    Ok(SegmentScan {
        offsets,
        valid_len,
        truncated,
    })
}

fn frame_error_reason(err: FrameError) -> &'static str {
    match err {
        FrameError::Truncated => "record truncated by torn write",
        FrameError::BadMagic => "bad record magic",
        FrameError::BadLength => "record length overruns file",
        FrameError::BadCrc => "record crc mismatch",
        FrameError::BadTrailer => "malformed batch trailer",
    }
}

// =============================================================================
// Random-access reads
// =============================================================================

/// Read and decode the event record at `offset` in the segment at `path`.
///
/// Used by readers resolving locators; the offset must come from the index,
/// so any framing failure here is corruption, not a torn tail.
pub(crate) fn read_event_at(file: &mut File, path: &Path, offset: u64) -> Result<EventRecord> {
    file.seek(SeekFrom::Start(offset)).map_err(classify_io)?;

    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header).map_err(classify_io)?;
    let total = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if total < HEADER_LEN + CRC_LEN {
        return Err(corrupted(path, offset, "record length too short"));
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&header);
    bytes.resize(total, 0);
    file.read_exact(&mut bytes[HEADER_LEN..]).map_err(classify_io)?;

    match decode_frame(&bytes) {
        Ok((Frame::Event(record), _)) => Ok(record),
        Ok((Frame::Trailer(_), _)) => Err(corrupted(path, offset, "locator points at a trailer")),
        Err(err) => Err(corrupted(path, offset, frame_error_reason(err))),
    }
}

fn corrupted(path: &Path, offset: u64, reason: &str) -> StoreError {
    StoreError::Corrupted {
        segment: path.to_path_buf(),
        offset,
        reason: reason.to_string(),
    }
}

// =============================================================================
// SegmentWriter
// =============================================================================

/// The active segment, owned exclusively by the writer.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    dir: PathBuf,
    file: File,
    path: PathBuf,
    first_pos: u64,
    len: u64,
    max_bytes: u64,
}

impl SegmentWriter {
    /// Create a fresh segment whose first record will sit at `first_pos`.
    pub fn create(dir: &Path, first_pos: u64, max_bytes: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(first_pos));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(classify_io)?;
        sync_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            first_pos,
            len: 0,
            max_bytes,
        })
    }

    /// Reopen a recovered segment for further appends.
    pub fn reopen(dir: &Path, first_pos: u64, valid_len: u64, max_bytes: u64) -> Result<Self> {
        let path = dir.join(segment_file_name(first_pos));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(classify_io)?;
        file.seek(SeekFrom::Start(valid_len)).map_err(classify_io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            path,
            first_pos,
            len: valid_len,
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_pos(&self) -> u64 {
        self.first_pos
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Whether writing `incoming` more bytes should go to a fresh segment.
    pub fn should_roll(&self, incoming: u64) -> bool {
        self.len > 0 && self.len + incoming > self.max_bytes
    }

    /// Append `buf`, returning the file offset it starts at. Not durable
    /// until [`Self::sync`] returns.
    pub fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let at = self.len;
        self.file.write_all(buf).map_err(classify_io)?;
        self.len += buf.len() as u64;
        Ok(at)
    }

    /// Fsync the segment file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data().map_err(classify_io)
    }

    /// Close the active segment durably and start a new one at `next_pos`.
    pub fn roll(&mut self, next_pos: u64) -> Result<()> {
        self.sync()?;
        debug!(
            closed = %self.path.display(),
            next_first_pos = next_pos,
            "rolling segment"
        );
        let next = Self::create(&self.dir, next_pos, self.max_bytes)?;
        *self = next;
        Ok(())
    }
}
