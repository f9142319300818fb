// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk append log backing the durable queue.
//!
//! # Format
//!
//! ```text
//! file header:  | magic "LSQ1" (4) | version (2) | base offset (8) | next sequence (8) |
//! record:       | payload len (4) | crc32 (4) | sequence (8) | payload (N) |
//! ```
//!
//! All integers are little-endian. The CRC covers the sequence bytes and the payload.
//!
//! Offsets handed out by the log are *logical*: they keep growing across compactions. The
//! header stores the logical offset of the first record in the file, so a checkpoint written
//! before a compaction still points at the right place afterwards. It also stores the next
//! sequence number as of the last compaction, so a drained and compacted log never hands out
//! a sequence twice, even without a readable checkpoint.
//!
//! # Recovery
//!
//! The log is read forward one record at a time from the requested start offset. The first
//! record that is incomplete, fails its CRC, or breaks sequence order ends the valid log: the
//! file is truncated there and the number of dropped bytes is reported to the caller.
//! Records the checkpoint lists as acknowledged are validated but their payloads are not kept.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::checkpoint::Checkpoint;
use crate::error::QueueError;

pub(crate) const LOG_FILE: &str = "queue.log";
const COMPACT_FILE: &str = "queue.log.compact";

const MAGIC: [u8; 4] = *b"LSQ1";
const VERSION: u16 = 1;
const FILE_HEADER_LEN: u64 = 4 + 2 + 8 + 8;
const RECORD_HEADER_LEN: usize = 4 + 4 + 8;
const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogRecord {
    pub sequence: u64,
    pub offset: u64,
    pub end: u64,
    pub payload: Vec<u8>,
}

/// Result of opening an existing log.
#[derive(Debug)]
pub(crate) struct Recovered {
    /// Valid records that are not acknowledged yet, in log order.
    pub records: Vec<LogRecord>,
    pub truncated_bytes: u64,
    /// Lowest sequence number not used by any record of the log.
    pub next_sequence: u64,
}

#[derive(Debug)]
pub(crate) struct AppendLog {
    path: PathBuf,
    file: File,
    base_offset: u64,
    end_offset: u64,
}

impl AppendLog {
    /// Opens (or creates) the log in `dir` and returns every valid record at or after the
    /// checkpoint's consumed offset, except those listed in `acked_above`.
    ///
    /// A newly created log starts at the checkpoint's appended offset and next sequence.
    pub(crate) fn open(dir: &Path, saved: &Checkpoint) -> Result<(Self, Recovered), QueueError> {
        let path = dir.join(LOG_FILE);
        let start_offset = saved.consumed_offset;
        let acked: HashSet<u64> = saved.acked_above.iter().copied().collect();
        let existing_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(QueueError::io(&path, e)),
        };

        if existing_len < FILE_HEADER_LEN {
            if existing_len > 0 {
                warn!(
                    "QUEUE | Log {} has an incomplete header, recreating it",
                    path.display()
                );
            }
            let log = Self::create(&path, saved.appended_offset, saved.next_sequence)?;
            return Ok((
                log,
                Recovered {
                    records: Vec::new(),
                    truncated_bytes: 0,
                    next_sequence: saved.next_sequence,
                },
            ));
        }

        let mut reader = File::open(&path).map_err(|e| QueueError::io(&path, e))?;
        let (base_offset, sequence_floor) = read_file_header(&path, &mut reader)?;
        let file_end = base_offset + (existing_len - FILE_HEADER_LEN);

        let start = if start_offset > file_end {
            warn!(
                "QUEUE | Checkpoint offset {} is past the end of {} ({}), nothing to replay",
                start_offset,
                path.display(),
                file_end
            );
            file_end
        } else {
            start_offset.max(base_offset)
        };

        reader
            .seek(SeekFrom::Start(physical(base_offset, start)))
            .map_err(|e| QueueError::io(&path, e))?;
        let mut reader = BufReader::new(reader);

        let mut records = Vec::new();
        let mut offset = start;
        let mut last_sequence = None;
        loop {
            match read_record(&mut reader, offset) {
                Ok(Some(record)) => {
                    if last_sequence.is_some_and(|last| record.sequence <= last) {
                        warn!(
                            "QUEUE | Out of order sequence {} at offset {} in {}",
                            record.sequence,
                            offset,
                            path.display()
                        );
                        break;
                    }
                    last_sequence = Some(record.sequence);
                    offset = record.end;
                    if !acked.contains(&record.sequence) {
                        records.push(record);
                    }
                }
                Ok(None) => break,
                Err(RecordError::Io(e)) => return Err(QueueError::io(&path, e)),
                Err(RecordError::Corrupt(reason)) => {
                    warn!(
                        "QUEUE | Corrupted record at offset {} in {}: {}",
                        offset,
                        path.display(),
                        reason
                    );
                    break;
                }
            }
        }

        let truncated_bytes = file_end - offset;
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| QueueError::io(&path, e))?;
        if truncated_bytes > 0 {
            file.set_len(physical(base_offset, offset))
                .map_err(|e| QueueError::io(&path, e))?;
            file.sync_all().map_err(|e| QueueError::io(&path, e))?;
        }

        debug!(
            "QUEUE | Opened {} base={} end={} records={}",
            path.display(),
            base_offset,
            offset,
            records.len()
        );

        Ok((
            AppendLog {
                path,
                file,
                base_offset,
                end_offset: offset,
            },
            Recovered {
                records,
                truncated_bytes,
                next_sequence: last_sequence.map_or(sequence_floor, |last| {
                    sequence_floor.max(last.saturating_add(1))
                }),
            },
        ))
    }

    fn create(path: &Path, base_offset: u64, next_sequence: u64) -> Result<Self, QueueError> {
        let mut file = File::create(path).map_err(|e| QueueError::io(path, e))?;
        write_file_header(&mut file, base_offset, next_sequence)
            .map_err(|e| QueueError::io(path, e))?;
        file.sync_all().map_err(|e| QueueError::io(path, e))?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| QueueError::io(path, e))?;
        if let Some(dir) = path.parent() {
            sync_dir(dir);
        }
        Ok(AppendLog {
            path: path.to_path_buf(),
            file,
            base_offset,
            end_offset: base_offset,
        })
    }

    /// Appends a record and returns its logical `(offset, end)`.
    ///
    /// The bytes are handed to the OS before returning; [`AppendLog::sync`] makes them durable.
    pub(crate) fn append(&mut self, sequence: u64, payload: &[u8]) -> Result<(u64, u64), QueueError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| QueueError::InvalidFile {
                path: self.path.display().to_string(),
                reason: format!("batch of {} bytes exceeds the record limit", payload.len()),
            })?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&checksum(sequence, payload).to_le_bytes());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(payload);

        self.file
            .write_all(&buf)
            .map_err(|e| QueueError::io(&self.path, e))?;

        let offset = self.end_offset;
        self.end_offset += buf.len() as u64;
        Ok((offset, self.end_offset))
    }

    pub(crate) fn sync(&self) -> Result<(), QueueError> {
        self.file
            .sync_data()
            .map_err(|e| QueueError::io(&self.path, e))
    }

    pub(crate) fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub(crate) fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Drops every byte before the logical offset `new_base`. Returns the bytes reclaimed.
    ///
    /// `next_sequence` is recorded in the new header as a floor for sequences handed out after
    /// a reopen. The tail is copied to a side file which then replaces the log atomically, so a
    /// crash at any point leaves either the old or the new log in place.
    pub(crate) fn compact(&mut self, new_base: u64, next_sequence: u64) -> Result<u64, QueueError> {
        if new_base <= self.base_offset || new_base > self.end_offset {
            return Ok(0);
        }
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let compact_path = dir.join(COMPACT_FILE);

        let mut source = File::open(&self.path).map_err(|e| QueueError::io(&self.path, e))?;
        source
            .seek(SeekFrom::Start(physical(self.base_offset, new_base)))
            .map_err(|e| QueueError::io(&self.path, e))?;

        let mut target = File::create(&compact_path).map_err(|e| QueueError::io(&compact_path, e))?;
        write_file_header(&mut target, new_base, next_sequence)
            .map_err(|e| QueueError::io(&compact_path, e))?;
        io::copy(&mut source, &mut target).map_err(|e| QueueError::io(&compact_path, e))?;
        target
            .sync_all()
            .map_err(|e| QueueError::io(&compact_path, e))?;
        drop(target);

        fs::rename(&compact_path, &self.path).map_err(|e| QueueError::io(&self.path, e))?;
        sync_dir(&dir);

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| QueueError::io(&self.path, e))?;
        let reclaimed = new_base - self.base_offset;
        self.base_offset = new_base;
        debug!(
            "QUEUE | Compacted {}: reclaimed {} bytes, new base {}",
            self.path.display(),
            reclaimed,
            new_base
        );
        Ok(reclaimed)
    }
}

enum RecordError {
    Io(io::Error),
    Corrupt(String),
}

/// Reads one record. `Ok(None)` is a clean end of file.
fn read_record(reader: &mut impl Read, offset: u64) -> Result<Option<LogRecord>, RecordError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    match read_full(reader, &mut header).map_err(RecordError::Io)? {
        0 => return Ok(None),
        n if n < RECORD_HEADER_LEN => {
            return Err(RecordError::Corrupt(format!(
                "incomplete record header ({n} bytes)"
            )))
        }
        _ => {}
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(&header[8..16]);
    let sequence = u64::from_le_bytes(sequence_bytes);

    if len > MAX_PAYLOAD_LEN {
        return Err(RecordError::Corrupt(format!("record length {len} is too large")));
    }

    let mut payload = vec![0u8; len as usize];
    let read = read_full(reader, &mut payload).map_err(RecordError::Io)?;
    if read < payload.len() {
        return Err(RecordError::Corrupt(format!(
            "incomplete payload ({read} of {len} bytes)"
        )));
    }

    if checksum(sequence, &payload) != crc {
        return Err(RecordError::Corrupt(format!(
            "checksum mismatch for sequence {sequence}"
        )));
    }

    Ok(Some(LogRecord {
        sequence,
        offset,
        end: offset + (RECORD_HEADER_LEN + payload.len()) as u64,
        payload,
    }))
}

/// Like `read_exact`, but reports how many bytes were read before end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Returns the base offset and the sequence floor.
fn read_file_header(path: &Path, reader: &mut impl Read) -> Result<(u64, u64), QueueError> {
    let mut header = [0u8; FILE_HEADER_LEN as usize];
    reader
        .read_exact(&mut header)
        .map_err(|e| QueueError::io(path, e))?;
    if header[0..4] != MAGIC {
        return Err(QueueError::InvalidFile {
            path: path.display().to_string(),
            reason: "bad magic bytes".to_string(),
        });
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(QueueError::InvalidFile {
            path: path.display().to_string(),
            reason: format!("unsupported version {version}"),
        });
    }
    let mut base = [0u8; 8];
    base.copy_from_slice(&header[6..14]);
    let mut floor = [0u8; 8];
    floor.copy_from_slice(&header[14..22]);
    Ok((u64::from_le_bytes(base), u64::from_le_bytes(floor)))
}

fn write_file_header(
    writer: &mut impl Write,
    base_offset: u64,
    next_sequence: u64,
) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&base_offset.to_le_bytes())?;
    writer.write_all(&next_sequence.to_le_bytes())
}

fn checksum(sequence: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&sequence.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn physical(base_offset: u64, logical: u64) -> u64 {
    FILE_HEADER_LEN + (logical - base_offset)
}

/// Persists a rename or creation in `dir`. Best effort: not every platform can open a directory.
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open(dir: &Path, start: u64) -> (AppendLog, Recovered) {
        let saved = Checkpoint {
            consumed_offset: start,
            ..Default::default()
        };
        AppendLog::open(dir, &saved).unwrap()
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, recovered) = open(dir.path(), 0);
        assert!(recovered.records.is_empty());

        let (first, first_end) = log.append(1, b"[{\"a\":1}]").unwrap();
        let (second, _) = log.append(2, b"[]").unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, first_end);
        drop(log);

        let (log, recovered) = open(dir.path(), 0);
        let sequences: Vec<u64> = recovered.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [1, 2]);
        assert_eq!(recovered.records[0].payload, b"[{\"a\":1}]");
        assert_eq!(recovered.truncated_bytes, 0);
        assert_eq!(log.end_offset(), recovered.records[1].end);
    }

    #[test]
    fn test_replay_starts_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"one").unwrap();
        let (second, _) = log.append(2, b"two").unwrap();
        log.append(3, b"three").unwrap();
        drop(log);

        let (_, recovered) = open(dir.path(), second);
        let sequences: Vec<u64> = recovered.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [2, 3]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"complete").unwrap();
        let (_, good_end) = log.append(2, b"also complete").unwrap();
        drop(log);

        // Half a header and a few bytes of a third record.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        file.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let (mut log, recovered) = open(dir.path(), 0);
        assert_eq!(recovered.records.len(), 2);
        assert_eq!(recovered.truncated_bytes, 6);
        assert_eq!(log.end_offset(), good_end);

        // New appends land right after the last valid record.
        let (offset, _) = log.append(3, b"next").unwrap();
        assert_eq!(offset, good_end);
        drop(log);
        let (_, recovered) = open(dir.path(), 0);
        assert_eq!(recovered.records.len(), 3);
    }

    #[test]
    fn test_checksum_mismatch_truncates_at_last_valid_record() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"first").unwrap();
        let (second, _) = log.append(2, b"second").unwrap();
        log.append(3, b"third").unwrap();
        drop(log);

        // Flip a payload byte of the second record.
        let path = dir.path().join(LOG_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let idx = (physical(0, second) as usize) + RECORD_HEADER_LEN;
        bytes[idx] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let (log, recovered) = open(dir.path(), 0);
        assert_eq!(recovered.records.len(), 1);
        assert!(recovered.truncated_bytes > 0);
        assert_eq!(log.end_offset(), second);
        assert_eq!(fs::metadata(&path).unwrap().len(), physical(0, second));
    }

    #[test]
    fn test_bad_magic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), b"NOTALOGFILE-HEADER").unwrap();
        let err = AppendLog::open(dir.path(), &Checkpoint::default()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidFile { .. }));
    }

    #[test]
    fn test_compact_keeps_logical_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"acked").unwrap();
        let (second, _) = log.append(2, b"pending").unwrap();
        let size_before = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();

        let reclaimed = log.compact(second, 3).unwrap();
        assert_eq!(reclaimed, second);
        assert_eq!(log.base_offset(), second);
        let size_after = fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        assert_eq!(size_before - size_after, second);

        let (third, _) = log.append(3, b"new").unwrap();
        drop(log);

        // A stale checkpoint that still points before the new base replays from the base.
        let (log, recovered) = open(dir.path(), 0);
        let offsets: Vec<(u64, u64)> = recovered
            .records
            .iter()
            .map(|r| (r.sequence, r.offset))
            .collect();
        assert_eq!(offsets, [(2, second), (3, third)]);
        assert_eq!(log.base_offset(), second);
    }

    #[test]
    fn test_fresh_log_starts_at_checkpoint_position() {
        let dir = tempfile::tempdir().unwrap();
        let saved = Checkpoint {
            appended_offset: 500,
            consumed_offset: 500,
            next_sequence: 7,
            ..Default::default()
        };
        let (mut log, recovered) = AppendLog::open(dir.path(), &saved).unwrap();
        assert_eq!(log.base_offset(), 500);
        assert_eq!(recovered.next_sequence, 7);
        let (offset, _) = log.append(7, b"x").unwrap();
        assert_eq!(offset, 500);
    }

    #[test]
    fn test_acked_records_are_skipped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"stalled head").unwrap();
        log.append(2, b"acked out of order").unwrap();
        log.append(3, b"acked out of order too").unwrap();
        log.append(4, b"pending").unwrap();
        drop(log);

        let saved = Checkpoint {
            acked_above: vec![2, 3],
            ..Default::default()
        };
        let (_, recovered) = AppendLog::open(dir.path(), &saved).unwrap();
        let sequences: Vec<u64> = recovered.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [1, 4]);
        assert_eq!(recovered.next_sequence, 5);

        // Skipped records still count towards the next sequence.
        let saved = Checkpoint {
            acked_above: vec![4],
            ..Default::default()
        };
        let (_, recovered) = AppendLog::open(dir.path(), &saved).unwrap();
        assert_eq!(recovered.records.len(), 3);
        assert_eq!(recovered.next_sequence, 5);
    }

    #[test]
    fn test_compacted_empty_log_keeps_sequence_floor() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, _) = open(dir.path(), 0);
        log.append(1, b"one").unwrap();
        let (_, end) = log.append(2, b"two").unwrap();
        log.compact(end, 3).unwrap();
        drop(log);

        // Without a usable checkpoint the header alone prevents sequence reuse.
        let (log, recovered) = open(dir.path(), 0);
        assert!(recovered.records.is_empty());
        assert_eq!(recovered.next_sequence, 3);
        assert_eq!(log.end_offset(), end);
    }
}
