//! The backup stream wire format.
//!
//! ```text
//! HYPERLAYER/1.0
//! Name: vol
//! Volume size: 104857600
//! ...                                   caller metadata lines
//!                                       blank line
//! D <hex offset> <hex length> CRC32 <hex value>   zero or more
//!                                       blank line, only after D lines
//! <hex offset> <hex length>\n<payload>\n          repeated
//! ```
//!
//! Offsets and lengths are in 512 byte sectors. The record list has no
//! terminator: the first line that is not two hex numbers ends it.

use std::io::{self, BufRead, Read, Write};

use log::debug;
use serde::Serialize;

use crate::{
    blkdev::SECTOR_SIZE,
    checksum::{BlockHash, DetectLevel},
    error::{Error, Result},
};

pub(crate) const PROTOCOL_MARKER: &str = "HYPERLAYER/1.0";

const KEY_NAME: &str = "Name";
const KEY_VOLUME_SIZE: &str = "Volume size";
const KEY_CHUNK_SIZE: &str = "Chunk size";
const KEY_BLOCK_COUNT: &str = "Delta blocks";
const KEY_VOLUME_UUID: &str = "VolumeUUID";
const KEY_SOURCE_UUID: &str = "Backing volume UUID";
const KEY_DETECT_LEVEL: &str = "Detect level";

const RESERVED_KEYS: [&str; 7] = [
    KEY_NAME,
    KEY_VOLUME_SIZE,
    KEY_CHUNK_SIZE,
    KEY_BLOCK_COUNT,
    KEY_VOLUME_UUID,
    KEY_SOURCE_UUID,
    KEY_DETECT_LEVEL,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct StreamHeader {
    /// Name of the volume the stream was taken from.
    pub name: String,
    /// In bytes.
    pub volume_size: u64,
    /// In bytes; the pool chunk size.
    pub block_size: u64,
    /// Number of block records that follow.
    pub block_count: u64,
    pub volume_uuid: String,
    /// Empty for a full stream.
    pub delta_source_uuid: String,
    pub detect_level: DetectLevel,
    /// Caller supplied `key: value` pairs, in order.
    pub metadata: Vec<(String, String)>,
}

impl StreamHeader {
    pub fn is_incremental(&self) -> bool {
        !self.delta_source_uuid.is_empty()
    }

    /// Checks a caller supplied metadata pair can travel in a header.
    pub fn check_metadata(key: &str, value: &str) -> std::result::Result<(), String> {
        if key.is_empty() || key.contains(':') || key.trim() != key {
            return Err(format!("invalid metadata key {key:?}"));
        }
        if RESERVED_KEYS.contains(&key) {
            return Err(format!("metadata key {key:?} is reserved"));
        }
        if key.contains('\n') || value.contains('\n') || value.trim() != value {
            return Err(format!("invalid metadata value {value:?}"));
        }
        Ok(())
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "{PROTOCOL_MARKER}")?;
        writeln!(out, "{KEY_NAME}: {}", self.name)?;
        writeln!(out, "{KEY_VOLUME_SIZE}: {}", self.volume_size)?;
        writeln!(out, "{KEY_CHUNK_SIZE}: {}", self.block_size)?;
        writeln!(out, "{KEY_BLOCK_COUNT}: {}", self.block_count)?;
        writeln!(out, "{KEY_VOLUME_UUID}: {}", self.volume_uuid)?;
        writeln!(out, "{KEY_SOURCE_UUID}: {}", self.delta_source_uuid)?;
        writeln!(out, "{KEY_DETECT_LEVEL}: {}", self.detect_level)?;
        for (key, value) in &self.metadata {
            writeln!(out, "{key}: {value}")?;
        }
        writeln!(out)
    }

    fn read_from(input: &mut impl BufRead) -> Result<Self> {
        match read_text_line(input)? {
            Some(line) if line == PROTOCOL_MARKER => {}
            Some(line) => {
                return Err(Error::scheme(format!(
                    "not a backup stream (starts with {line:?})"
                )))
            }
            None => return Err(Error::scheme("empty stream")),
        }

        let mut header = StreamHeader::default();
        let mut seen = Vec::new();
        loop {
            let line = read_text_line(input)?
                .ok_or_else(|| Error::scheme("stream ends inside the header"))?;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::scheme(format!("malformed header line {line:?}")))?;
            let (key, value) = (key.trim(), value.trim());
            if RESERVED_KEYS.contains(&key) {
                if seen.contains(&key.to_string()) {
                    return Err(Error::scheme(format!("header field {key} repeated")));
                }
                seen.push(key.to_string());
            }
            match key {
                KEY_NAME => header.name = value.to_string(),
                KEY_VOLUME_SIZE => header.volume_size = parse_number(key, value)?,
                KEY_CHUNK_SIZE => header.block_size = parse_number(key, value)?,
                KEY_BLOCK_COUNT => header.block_count = parse_number(key, value)?,
                KEY_VOLUME_UUID => header.volume_uuid = value.to_string(),
                KEY_SOURCE_UUID => header.delta_source_uuid = value.to_string(),
                KEY_DETECT_LEVEL => {
                    let level: u8 = parse_number(key, value)?;
                    header.detect_level = DetectLevel::try_from(level).map_err(Error::Scheme)?;
                }
                _ => header.metadata.push((key.to_string(), value.to_string())),
            }
        }

        for key in [KEY_NAME, KEY_VOLUME_SIZE, KEY_CHUNK_SIZE, KEY_BLOCK_COUNT, KEY_VOLUME_UUID] {
            if !seen.iter().any(|k| k == key) {
                return Err(Error::scheme(format!("header field {key} missing")));
            }
        }
        if header.name.is_empty() {
            return Err(Error::scheme("header field Name is empty"));
        }
        if header.block_size == 0 || header.block_size % SECTOR_SIZE != 0 {
            return Err(Error::scheme(format!(
                "chunk size {} is not a multiple of {SECTOR_SIZE}",
                header.block_size
            )));
        }
        Ok(header)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::scheme(format!("header field {key}: {value:?}: {e}")))
}

/// Reads a line, without its terminator. None at end of input.
fn read_raw_line(input: &mut impl BufRead) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if input.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(Some(line))
}

fn read_text_line(input: &mut impl BufRead) -> Result<Option<String>> {
    match read_raw_line(input)? {
        Some(line) => String::from_utf8(line)
            .map(Some)
            .map_err(|_| Error::scheme("header is not valid UTF-8")),
        None => Ok(None),
    }
}

fn format_hash_line(hash: &BlockHash) -> String {
    format!(
        "D {:X} {:X} {} {}",
        hash.offset, hash.length, hash.hash_type, hash.value
    )
}

/// Parses a `D` line; None when the line has another shape.
fn parse_hash_line(line: &[u8]) -> Option<std::result::Result<BlockHash, String>> {
    let line = std::str::from_utf8(line).ok()?;
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() != 5 || fields[0] != "D" {
        return None;
    }
    let hex = |s: &str| u64::from_str_radix(s, 16).map_err(|e| format!("{line:?}: {e}"));
    Some((|| -> std::result::Result<BlockHash, String> {
        Ok(BlockHash {
            offset: hex(fields[1])?,
            length: hex(fields[2])?,
            hash_type: fields[3].to_string(),
            value: fields[4].to_string(),
        })
    })())
}

/// Parses a record line into (offset, length) in sectors.
fn parse_record_line(line: &[u8]) -> Option<(u64, u64)> {
    let line = std::str::from_utf8(line).ok()?;
    let mut fields = line.split_ascii_whitespace();
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let length = u64::from_str_radix(fields.next()?, 16).ok()?;
    match fields.next() {
        None => Some((offset, length)),
        Some(_) => None,
    }
}

/// Where a block record goes, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockRecord {
    pub offset: u64,
    pub length: u64,
}

/// Totals of a written or read stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StreamSummary {
    pub blocks: u64,
    pub payload_bytes: u64,
    /// CRC32 over all payload bytes in stream order.
    pub digest: u32,
}

/// Produces a stream.
pub(crate) struct StreamWriter<W: Write> {
    out: W,
    digest: crc32fast::Hasher,
    blocks: u64,
    payload_bytes: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            digest: crc32fast::Hasher::new(),
            blocks: 0,
            payload_bytes: 0,
        }
    }

    pub fn write_header(&mut self, header: &StreamHeader) -> Result<()> {
        header.write_to(&mut self.out)?;
        Ok(())
    }

    pub fn write_basis_hashes(&mut self, hashes: &[BlockHash]) -> Result<()> {
        for hash in hashes {
            writeln!(self.out, "{}", format_hash_line(hash))?;
        }
        if !hashes.is_empty() {
            writeln!(self.out)?;
        }
        Ok(())
    }

    /// Writes one block record; `offset` is in bytes.
    pub fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let length = data.len() as u64;
        if offset % SECTOR_SIZE != 0 || length % SECTOR_SIZE != 0 {
            return Err(Error::scheme(format!(
                "block at {offset} of {length} bytes is not sector aligned"
            )));
        }
        writeln!(
            self.out,
            "{:X} {:X}",
            offset / SECTOR_SIZE,
            length / SECTOR_SIZE
        )?;
        self.out.write_all(data)?;
        self.out.write_all(b"\n")?;

        self.digest.update(data);
        self.blocks += 1;
        self.payload_bytes += length;
        Ok(())
    }

    pub fn finish(mut self) -> Result<StreamSummary> {
        self.out.flush()?;
        Ok(StreamSummary {
            blocks: self.blocks,
            payload_bytes: self.payload_bytes,
            digest: self.digest.finalize(),
        })
    }
}

/// Consumes a stream: header and basis hashes on open, then records one by one.
pub(crate) struct StreamReader<R: BufRead> {
    input: R,
    header: StreamHeader,
    basis_hashes: Vec<BlockHash>,
    /// First record line, read while looking for basis hashes.
    pending: Option<Vec<u8>>,
    /// Set while a record's payload has not been consumed.
    current: Option<BlockRecord>,
    received: u64,
    payload_bytes: u64,
    digest: crc32fast::Hasher,
}

impl<R: BufRead> StreamReader<R> {
    /// Reads and validates everything up to the first block record.
    pub fn open(mut input: R) -> Result<Self> {
        let header = StreamHeader::read_from(&mut input)?;
        debug!("Stream header: {:?}", header);

        let mut basis_hashes = Vec::new();
        let mut pending = None;
        if let Some(line) = read_raw_line(&mut input)? {
            match parse_hash_line(&line) {
                Some(first) => {
                    basis_hashes.push(first.map_err(Error::Scheme)?);
                    loop {
                        let line = read_raw_line(&mut input)?
                            .ok_or_else(|| Error::scheme("stream ends inside the basis hashes"))?;
                        if line.is_empty() {
                            break;
                        }
                        let hash = parse_hash_line(&line)
                            .ok_or_else(|| {
                                Error::scheme(format!(
                                    "malformed basis hash line {:?}",
                                    String::from_utf8_lossy(&line)
                                ))
                            })?
                            .map_err(Error::Scheme)?;
                        basis_hashes.push(hash);
                    }
                }
                None => pending = Some(line),
            }
        }
        for hash in &basis_hashes {
            match hash.byte_range() {
                Some(range) if range.end <= header.volume_size => {}
                _ => {
                    return Err(Error::scheme(format!(
                        "basis hash {:X} {:X} out of range",
                        hash.offset, hash.length
                    )))
                }
            }
        }
        debug!("{} basis hashes", basis_hashes.len());

        Ok(Self {
            input,
            header,
            basis_hashes,
            pending,
            current: None,
            received: 0,
            payload_bytes: 0,
            digest: crc32fast::Hasher::new(),
        })
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    pub fn basis_hashes(&self) -> &[BlockHash] {
        &self.basis_hashes
    }

    /// The next record, or None once the record list has ended.
    ///
    /// The payload of the previous record must have been consumed with
    /// [`Self::read_payload`]. Ending with a record count different from
    /// the header is an error.
    pub fn next_block(&mut self) -> Result<Option<BlockRecord>> {
        if let Some(rec) = self.current {
            return Err(Error::scheme(format!(
                "payload of block at {} not consumed",
                rec.offset
            )));
        }
        let line = match self.pending.take() {
            Some(line) => Some(line),
            None => read_raw_line(&mut self.input)?,
        };
        let Some((offset, length)) = line.as_deref().and_then(parse_record_line) else {
            if self.received != self.header.block_count {
                return Err(Error::scheme(format!(
                    "stream carries {} blocks, header announced {}",
                    self.received, self.header.block_count
                )));
            }
            return Ok(None);
        };

        let too_big = || Error::scheme(format!("block record {offset:X} {length:X} out of range"));
        let rec = BlockRecord {
            offset: offset.checked_mul(SECTOR_SIZE).ok_or_else(too_big)?,
            length: length.checked_mul(SECTOR_SIZE).ok_or_else(too_big)?,
        };
        if rec.offset.checked_add(rec.length).ok_or_else(too_big)? > self.header.volume_size {
            return Err(too_big());
        }
        self.current = Some(rec);
        Ok(Some(rec))
    }

    /// Hands the payload of the current record to `f`, then checks its delimiter.
    ///
    /// `f` gets a reader limited to the payload and must consume all of it.
    pub fn read_payload<T>(&mut self, f: impl FnOnce(&mut dyn Read) -> Result<T>) -> Result<T> {
        let rec = self
            .current
            .take()
            .ok_or_else(|| Error::scheme("no block record to read"))?;
        let mut payload = DigestReader {
            inner: (&mut self.input).take(rec.length),
            digest: &mut self.digest,
        };
        let result = f(&mut payload)?;
        if payload.inner.limit() != 0 {
            return Err(Error::scheme(format!(
                "payload of block at {} not fully consumed",
                rec.offset
            )));
        }

        let mut delimiter = [0u8; 1];
        match self.input.read_exact(&mut delimiter) {
            Ok(()) if delimiter[0] == b'\n' => {}
            Ok(()) => {
                return Err(Error::scheme(format!(
                    "block at {} is not followed by a newline",
                    rec.offset
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::scheme(format!(
                    "stream truncated after block at {}",
                    rec.offset
                )))
            }
            Err(e) => return Err(e.into()),
        }

        self.received += 1;
        self.payload_bytes += rec.length;
        Ok(result)
    }

    /// Totals so far; complete once `next_block` has returned None.
    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            blocks: self.received,
            payload_bytes: self.payload_bytes,
            digest: self.digest.clone().finalize(),
        }
    }
}

/// Passes reads through while hashing them.
struct DigestReader<'a, R: Read> {
    inner: R,
    digest: &'a mut crc32fast::Hasher,
}

impl<R: Read> Read for DigestReader<'_, io::Take<R>> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}
