//! Block-level difference between two thin volumes of the same pool,
//! computed from the pool's mapping metadata rather than volume contents.

use log::{debug, info};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    lvm::{PoolControl, PoolDevices, Reservation},
};

mod xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) enum DeltaOp {
    /// Mapped only in the target.
    Create,
    /// Mapped in both, to different data blocks.
    Update,
    /// Mapped only in the basis.
    Delete,
    /// Unchanged; present only so sampling can cover it.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct DeltaEntry {
    pub origin_block: u64,
    pub op: DeltaOp,
}

/// A run of `length` consecutive blocks starting at `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeMapping {
    pub begin: u64,
    pub length: u64,
}

impl RangeMapping {
    fn entries(self, op: DeltaOp) -> impl Iterator<Item = DeltaEntry> {
        (self.begin..self.begin + self.length).map(move |origin_block| DeltaEntry { origin_block, op })
    }
}

/// `thin_delta` output, split by kind. Left is the basis, right the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DiffRanges {
    pub same: Vec<RangeMapping>,
    pub different: Vec<RangeMapping>,
    pub left_only: Vec<RangeMapping>,
    pub right_only: Vec<RangeMapping>,
}

/// One block of a volume and where it lives in the pool's data device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub origin_block: u64,
    pub data_block: u64,
}

/// Per-device mappings from `thin_dump`, range mappings expanded.
#[derive(Debug, Clone)]
pub(crate) struct PoolDump {
    /// In bytes.
    pub data_block_size: u64,
    pub devices: Vec<DeviceMappings>,
}

#[derive(Debug, Clone)]
pub(crate) struct DeviceMappings {
    pub dev_id: u64,
    /// Ascending by origin block.
    pub mappings: Vec<Mapping>,
}

impl PoolDump {
    pub fn device(&self, dev_id: u64) -> Result<&DeviceMappings> {
        self.devices
            .iter()
            .find(|d| d.dev_id == dev_id)
            .ok_or_else(|| Error::tool("thin_dump", format!("device {dev_id} not in metadata")))
    }
}

/// How the per-block difference is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub(crate) enum DiffMethod {
    /// Let `thin_delta` compare the two devices.
    #[default]
    Delta,
    /// Dump both devices with `thin_dump` and merge the mappings here.
    Dump,
}

pub(crate) struct DiffRequest<'a> {
    pub pool: &'a PoolDevices,
    pub target: u64,
    /// None for a full backup.
    pub basis: Option<u64>,
    pub method: DiffMethod,
    /// Emit Ignore entries for unchanged blocks.
    pub include_unchanged: bool,
}

/// Sorted delta between two volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Delta {
    entries: Vec<DeltaEntry>,
}

impl Delta {
    /// Sorts and checks entries; the same block twice means the tool output was inconsistent.
    fn new(mut entries: Vec<DeltaEntry>) -> Result<Self> {
        entries.sort_by_key(|e| e.origin_block);
        if let Some(w) = entries
            .windows(2)
            .find(|w| w[0].origin_block == w[1].origin_block)
        {
            return Err(Error::tool(
                "thin_delta",
                format!("block {} reported more than once", w[0].origin_block),
            ));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DeltaEntry] {
        &self.entries
    }

    /// Number of block records a stream of this delta carries.
    pub fn block_count(&self) -> u64 {
        self.streamed().count() as u64
    }

    /// Drops entries at or past `blocks`, e.g. deletions beyond a target
    /// that is smaller than its basis.
    pub fn truncate(&mut self, blocks: u64) {
        let keep = self.entries.partition_point(|e| e.origin_block < blocks);
        self.entries.truncate(keep);
    }

    /// Entries that become block records, in wire order.
    pub fn streamed(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.entries.iter().filter(|e| e.op != DeltaOp::Ignore)
    }
}

/// Parses `thin_delta` (non-verbose) output.
pub(crate) fn parse_thin_delta(text: &str) -> Result<DiffRanges> {
    let doc: xml::DeltaDocument = quick_xml::de::from_str(text)
        .map_err(|e| Error::tool("thin_delta", format!("unparseable output: {e}")))?;
    debug!(
        "thin_delta: left {} right {}, {} ranges",
        doc.diff.left,
        doc.diff.right,
        doc.diff.ranges.len()
    );

    let mut ranges = DiffRanges::default();
    for r in doc.diff.ranges {
        let (list, span) = match r {
            xml::DiffRange::Same(s) => (&mut ranges.same, s),
            xml::DiffRange::Different(s) => (&mut ranges.different, s),
            xml::DiffRange::LeftOnly(s) => (&mut ranges.left_only, s),
            xml::DiffRange::RightOnly(s) => (&mut ranges.right_only, s),
        };
        list.push(RangeMapping {
            begin: span.begin,
            length: span.length,
        });
    }
    Ok(ranges)
}

/// Expands diff ranges into single block entries.
pub(crate) fn expand_ranges(ranges: &DiffRanges, include_unchanged: bool) -> Result<Delta> {
    let mut entries = Vec::new();
    for (list, op) in [
        (&ranges.different, DeltaOp::Update),
        (&ranges.left_only, DeltaOp::Delete),
        (&ranges.right_only, DeltaOp::Create),
    ] {
        entries.extend(list.iter().flat_map(|r| r.entries(op)));
    }
    if include_unchanged {
        entries.extend(ranges.same.iter().flat_map(|r| r.entries(DeltaOp::Ignore)));
    }
    Delta::new(entries)
}

/// Parses `thin_dump` output, expanding range mappings.
pub(crate) fn parse_thin_dump(text: &str) -> Result<PoolDump> {
    let doc: xml::DumpDocument = quick_xml::de::from_str(text)
        .map_err(|e| Error::tool("thin_dump", format!("unparseable output: {e}")))?;

    let mut devices = Vec::with_capacity(doc.devices.len());
    for dev in doc.devices {
        let mut mappings = Vec::new();
        for m in dev.mappings {
            match m {
                xml::DumpMapping::Single {
                    origin_block,
                    data_block,
                } => mappings.push(Mapping {
                    origin_block,
                    data_block,
                }),
                xml::DumpMapping::Range {
                    origin_begin,
                    data_begin,
                    length,
                } => mappings.extend((0..length).map(|i| Mapping {
                    origin_block: origin_begin + i,
                    data_block: data_begin + i,
                })),
            }
        }
        if mappings.len() as u64 != dev.mapped_blocks {
            return Err(Error::tool(
                "thin_dump",
                format!(
                    "device {}: {} mappings listed, {} mapped blocks declared",
                    dev.dev_id,
                    mappings.len(),
                    dev.mapped_blocks
                ),
            ));
        }
        mappings.sort_by_key(|m| m.origin_block);
        devices.push(DeviceMappings {
            dev_id: dev.dev_id,
            mappings,
        });
    }

    Ok(PoolDump {
        data_block_size: doc.data_block_size * 512,
        devices,
    })
}

/// Two-pointer merge of ascending mapping lists.
///
/// Without a basis every target mapping is a Create.
pub(crate) fn merge_mappings(
    basis: Option<&[Mapping]>,
    target: &[Mapping],
    include_unchanged: bool,
) -> Vec<DeltaEntry> {
    let entry = |origin_block, op| DeltaEntry { origin_block, op };
    let Some(basis) = basis else {
        return target
            .iter()
            .map(|m| entry(m.origin_block, DeltaOp::Create))
            .collect();
    };

    let mut entries = Vec::with_capacity(basis.len().max(target.len()));
    let (mut i, mut j) = (0, 0);
    while i < basis.len() && j < target.len() {
        let (b, t) = (basis[i], target[j]);
        if b.origin_block < t.origin_block {
            entries.push(entry(b.origin_block, DeltaOp::Delete));
            i += 1;
        } else if b.origin_block > t.origin_block {
            entries.push(entry(t.origin_block, DeltaOp::Create));
            j += 1;
        } else {
            if b.data_block != t.data_block {
                entries.push(entry(t.origin_block, DeltaOp::Update));
            } else if include_unchanged {
                entries.push(entry(t.origin_block, DeltaOp::Ignore));
            }
            i += 1;
            j += 1;
        }
    }
    entries.extend(basis[i..].iter().map(|m| entry(m.origin_block, DeltaOp::Delete)));
    entries.extend(target[j..].iter().map(|m| entry(m.origin_block, DeltaOp::Create)));
    entries
}

/// Computes the delta under a metadata snapshot reservation.
///
/// The reservation is released on every path out of here.
pub(crate) fn compute_delta<P: PoolControl + ?Sized>(ctl: &P, req: &DiffRequest) -> Result<Delta> {
    let _reservation = Reservation::acquire(ctl, req.pool)?;

    let delta = match (req.basis, req.method) {
        (Some(basis), DiffMethod::Delta) => {
            let text = ctl.thin_delta(req.pool, basis, req.target)?;
            expand_ranges(&parse_thin_delta(&text)?, req.include_unchanged)?
        }
        (Some(basis), DiffMethod::Dump) => {
            let dump = parse_thin_dump(&ctl.thin_dump(req.pool, None)?)?;
            let entries = merge_mappings(
                Some(&dump.device(basis)?.mappings),
                &dump.device(req.target)?.mappings,
                req.include_unchanged,
            );
            Delta::new(entries)?
        }
        (None, _) => {
            let dump = parse_thin_dump(&ctl.thin_dump(req.pool, Some(req.target))?)?;
            Delta::new(merge_mappings(None, &dump.device(req.target)?.mappings, false))?
        }
    };

    info!(
        "Delta of device {} against {}: {} blocks to send ({} entries)",
        req.target,
        req.basis
            .map(|b| format!("device {b}"))
            .unwrap_or_else(|| "nothing".to_string()),
        delta.block_count(),
        delta.entries().len()
    );
    Ok(delta)
}
