use std::io::{self, BufRead, Write};

use indicatif::HumanBytes;
use log::info;
use serde::Serialize;

use crate::{
    checksum::BlockHash,
    error::Result,
    stream::{StreamHeader, StreamReader},
};

#[derive(Debug, Serialize)]
struct RecordInfo {
    /// In bytes.
    offset: u64,
    length: u64,
}

#[derive(Debug, Serialize)]
struct PayloadInfo {
    blocks: u64,
    bytes: u64,
    crc32: String,
}

/// What `info` found in a stream.
#[derive(Debug, Serialize)]
pub(crate) struct StreamInfo {
    header: StreamHeader,
    basis_hashes: Vec<BlockHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<RecordInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<PayloadInfo>,
}

/// Describes the stream on `input`.
///
/// Only the header and basis hashes are read unless `walk_records` is
/// set, in which case every record is read and the block count checked.
pub(crate) fn do_info(
    input: impl BufRead,
    out: &mut impl Write,
    walk_records: bool,
    json: bool,
) -> Result<StreamInfo> {
    let mut reader = StreamReader::open(input)?;

    let (records, payload) = if walk_records {
        let mut records = Vec::new();
        while let Some(rec) = reader.next_block()? {
            reader.read_payload(|r| Ok(io::copy(r, &mut io::sink())?))?;
            records.push(RecordInfo {
                offset: rec.offset,
                length: rec.length,
            });
        }
        let summary = reader.summary();
        info!("{} records check out", summary.blocks);
        (
            Some(records),
            Some(PayloadInfo {
                blocks: summary.blocks,
                bytes: summary.payload_bytes,
                crc32: format!("{:08x}", summary.digest),
            }),
        )
    } else {
        (None, None)
    };

    let result = StreamInfo {
        header: reader.header().clone(),
        basis_hashes: reader.basis_hashes().to_vec(),
        records,
        payload,
    };
    if json {
        serde_json::to_writer_pretty(&mut *out, &result).map_err(io::Error::from)?;
        writeln!(out)?;
    } else {
        print_text(out, &result)?;
    }
    Ok(result)
}

fn print_text(out: &mut impl Write, result: &StreamInfo) -> io::Result<()> {
    let h = &result.header;
    writeln!(out, "Name:             {}", h.name)?;
    writeln!(
        out,
        "Volume size:      {} ({} bytes)",
        HumanBytes(h.volume_size),
        h.volume_size
    )?;
    writeln!(out, "Chunk size:       {}", HumanBytes(h.block_size))?;
    writeln!(out, "Delta blocks:     {}", h.block_count)?;
    writeln!(out, "Volume UUID:      {}", h.volume_uuid)?;
    if h.is_incremental() {
        writeln!(out, "Type:             incremental against {}", h.delta_source_uuid)?;
    } else {
        writeln!(out, "Type:             full")?;
    }
    writeln!(out, "Detect level:     {}", h.detect_level)?;
    for (key, value) in &h.metadata {
        writeln!(out, "{:<18}{}", format!("{key}:"), value)?;
    }

    writeln!(out, "Basis hashes:     {}", result.basis_hashes.len())?;
    for hash in &result.basis_hashes {
        writeln!(
            out,
            "  {:>12X} {:>8X} {} {}",
            hash.offset, hash.length, hash.hash_type, hash.value
        )?;
    }

    if let Some(records) = &result.records {
        writeln!(out, "Records:")?;
        for rec in records {
            writeln!(out, "  {:>16} {:>10}", rec.offset, rec.length)?;
        }
    }
    if let Some(payload) = &result.payload {
        writeln!(
            out,
            "Payload:          {} blocks, {}, CRC32 {}",
            payload.blocks,
            HumanBytes(payload.bytes),
            payload.crc32
        )?;
    }
    Ok(())
}
