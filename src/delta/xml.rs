//! Document shapes written by `thin_delta` and `thin_dump`.
//!
//! Only the attributes we use are declared; everything else is ignored.

use serde::Deserialize;

/// Root of `thin_delta` output.
#[derive(Debug, Deserialize)]
pub(super) struct DeltaDocument {
    pub diff: Diff,
}

#[derive(Debug, Deserialize)]
pub(super) struct Diff {
    #[serde(rename = "@left")]
    pub left: u64,
    #[serde(rename = "@right")]
    pub right: u64,
    #[serde(rename = "$value", default)]
    pub ranges: Vec<DiffRange>,
}

#[derive(Debug, Deserialize)]
pub(super) enum DiffRange {
    #[serde(rename = "same")]
    Same(Span),
    #[serde(rename = "different")]
    Different(Span),
    #[serde(rename = "left_only")]
    LeftOnly(Span),
    #[serde(rename = "right_only")]
    RightOnly(Span),
}

#[derive(Debug, Deserialize)]
pub(super) struct Span {
    #[serde(rename = "@begin")]
    pub begin: u64,
    #[serde(rename = "@length")]
    pub length: u64,
}

/// Root of `thin_dump` output.
#[derive(Debug, Deserialize)]
pub(super) struct DumpDocument {
    /// In 512 byte sectors.
    #[serde(rename = "@data_block_size")]
    pub data_block_size: u64,
    #[serde(rename = "device", default)]
    pub devices: Vec<DumpDevice>,
}

#[derive(Debug, Deserialize)]
pub(super) struct DumpDevice {
    #[serde(rename = "@dev_id")]
    pub dev_id: u64,
    #[serde(rename = "@mapped_blocks")]
    pub mapped_blocks: u64,
    #[serde(rename = "$value", default)]
    pub mappings: Vec<DumpMapping>,
}

#[derive(Debug, Deserialize)]
pub(super) enum DumpMapping {
    #[serde(rename = "single_mapping")]
    Single {
        #[serde(rename = "@origin_block")]
        origin_block: u64,
        #[serde(rename = "@data_block")]
        data_block: u64,
    },
    #[serde(rename = "range_mapping")]
    Range {
        #[serde(rename = "@origin_begin")]
        origin_begin: u64,
        #[serde(rename = "@data_begin")]
        data_begin: u64,
        #[serde(rename = "@length")]
        length: u64,
    },
}
