//! In-memory stand-ins for block devices and the LVM tool chain.
//!
//! [`SimLvm`] keeps volumes, their block mappings and their contents in
//! memory and answers with the same text the real tools print (LVM
//! config, `thin_delta` and `thin_dump` XML), so the real parsers run in
//! every test. Writes through an opened volume remap the touched chunks
//! to fresh data blocks, like a thin volume breaking sharing.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt::Write as _,
    io::{self, ErrorKind},
    ops::Range,
    rc::Rc,
};

use crate::{
    blkdev::AccessFlags,
    device::BlockDevice,
    error::{Error, Result},
    lvm::{tpool_device_path, PoolControl, PoolDevices, VolumeManager},
    vgcfg::ThinPoolInfo,
};

/// A shared, growable byte vector posing as a block device.
///
/// Clones share contents, so a test can keep one to look at what a
/// session wrote.
#[derive(Clone)]
pub(crate) struct MemDevice {
    data: Rc<RefCell<Vec<u8>>>,
    lbs: usize,
}

impl MemDevice {
    pub fn new(size: u64, lbs: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0; size as usize])),
            lbs,
        }
    }

    pub fn fill(&self, offset: u64, len: u64, byte: u8) {
        let start = offset as usize;
        self.data.borrow_mut()[start..start + len as usize].fill(byte);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub fn resize(&self, size: u64) {
        self.data.borrow_mut().resize(size as usize, 0);
    }

    fn deep_copy(&self) -> Self {
        Self {
            data: Rc::new(RefCell::new(self.contents())),
            lbs: self.lbs,
        }
    }

    /// Like `O_DIRECT`: offset and length must be block aligned and in range.
    fn range(&self, offset: u64, len: usize) -> io::Result<Range<usize>> {
        if offset % self.lbs as u64 != 0 || len % self.lbs != 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("unaligned transfer of {len} bytes at {offset}"),
            ));
        }
        let start = offset as usize;
        if start + len > self.data.borrow().len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("transfer of {len} bytes at {offset} past end of device"),
            ));
        }
        Ok(start..start + len)
    }
}

impl BlockDevice for MemDevice {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data.borrow()[range]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data.borrow_mut()[range].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.borrow().len() as u64
    }

    fn logical_block_size(&self) -> usize {
        self.lbs
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

struct SimVolume {
    pool: String,
    dev_id: u64,
    uuid: String,
    transaction_id: u64,
    origin: Option<String>,
    extents: u64,
    /// Origin block to data block.
    mappings: BTreeMap<u64, u64>,
    data: MemDevice,
    active: bool,
}

#[derive(Default)]
struct SimState {
    pools: Vec<String>,
    /// In bytes.
    extent_size: u64,
    volumes: BTreeMap<String, SimVolume>,
    transaction: u64,
    next_data_block: u64,
    reserved: bool,
    fail_reserve: bool,
    fail_tools: bool,
    calls: Vec<String>,
}

impl SimState {
    fn volume(&self, lv: &str) -> Result<&SimVolume> {
        self.volumes
            .get(lv)
            .ok_or_else(|| Error::tool("lvm", format!("Failed to find logical volume \"{lv}\"")))
    }

    fn volume_mut(&mut self, lv: &str) -> Result<&mut SimVolume> {
        self.volumes
            .get_mut(lv)
            .ok_or_else(|| Error::tool("lvm", format!("Failed to find logical volume \"{lv}\"")))
    }

    fn by_dev_id(&self, tool: &str, dev_id: u64) -> Result<&SimVolume> {
        self.volumes
            .values()
            .find(|v| v.dev_id == dev_id)
            .ok_or_else(|| Error::tool(tool, format!("unknown device {dev_id}")))
    }

    fn next_transaction(&mut self) -> u64 {
        self.transaction += 1;
        self.transaction
    }
}

/// Simulated volume group with thin pools of one chunk size.
pub(crate) struct SimLvm {
    vg: String,
    chunk_size: u64,
    state: Rc<RefCell<SimState>>,
}

/// Stable fill byte for a data block, so contents follow mappings.
fn data_byte(data_block: u64) -> u8 {
    (data_block % 255) as u8 + 1
}

impl SimLvm {
    pub fn new(vg: &str, pool: &str, chunk_size: u64) -> Self {
        let state = SimState {
            pools: vec![pool.to_string()],
            extent_size: chunk_size,
            next_data_block: 1000,
            ..Default::default()
        };
        Self {
            vg: vg.to_string(),
            chunk_size,
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn add_pool(&self, pool: &str) {
        self.state.borrow_mut().pools.push(pool.to_string());
    }

    /// Extents default to one chunk; smaller ones allow volumes that end
    /// inside a chunk.
    pub fn set_extent_size(&self, bytes: u64) {
        self.state.borrow_mut().extent_size = bytes;
    }

    /// Adds a thin volume of `blocks` chunks to the first pool.
    ///
    /// Each mapped chunk is filled with a byte derived from its data block.
    pub fn add_volume(&self, name: &str, dev_id: u64, blocks: u64, mappings: &[(u64, u64)]) {
        self.add_volume_of_size(name, dev_id, blocks * self.chunk_size, mappings);
    }

    /// Like [`Self::add_volume`], with the size in bytes rounded up to whole extents.
    pub fn add_volume_of_size(&self, name: &str, dev_id: u64, size: u64, mappings: &[(u64, u64)]) {
        let mut state = self.state.borrow_mut();
        let extents = size.div_ceil(state.extent_size);
        let size = extents * state.extent_size;
        let data = MemDevice::new(size, 512);
        for (origin, data_block) in mappings {
            let start = origin * self.chunk_size;
            let len = u64::min(self.chunk_size, size - start);
            data.fill(start, len, data_byte(*data_block));
        }
        let volume = SimVolume {
            pool: state.pools[0].clone(),
            dev_id,
            uuid: format!("{name}-uuid"),
            transaction_id: state.next_transaction(),
            origin: None,
            extents,
            mappings: mappings.iter().copied().collect(),
            data,
            active: false,
        };
        state.volumes.insert(name.to_string(), volume);
    }

    pub fn set_pool(&self, lv: &str, pool: &str) {
        if let Some(v) = self.state.borrow_mut().volumes.get_mut(lv) {
            v.pool = pool.to_string();
        }
    }

    pub fn pool_info(&self) -> ThinPoolInfo {
        let pool = self.state.borrow().pools[0].clone();
        ThinPoolInfo {
            uuid: format!("{pool}-uuid"),
            metadata_lv: format!("{pool}_tmeta"),
            data_lv: format!("{pool}_tdata"),
            name: pool,
            chunk_size: self.chunk_size,
            extent_count: 1024,
            zero_new_blocks: true,
        }
    }

    pub fn has_volume(&self, lv: &str) -> bool {
        self.state.borrow().volumes.contains_key(lv)
    }

    pub fn is_active(&self, lv: &str) -> bool {
        self.state
            .borrow()
            .volumes
            .get(lv)
            .map(|v| v.active)
            .unwrap_or(false)
    }

    pub fn any_active(&self) -> bool {
        self.state.borrow().volumes.values().any(|v| v.active)
    }

    pub fn contents(&self, lv: &str) -> Vec<u8> {
        self.state.borrow().volumes[lv].data.contents()
    }

    pub fn origin(&self, lv: &str) -> Option<String> {
        self.state.borrow().volumes[lv].origin.clone()
    }

    /// Writes as a user of the volume would, remapping touched chunks.
    pub fn write(&self, lv: &str, offset: u64, data: &[u8]) {
        let dev = self.state.borrow().volumes[lv].data.clone();
        dev.data.borrow_mut()[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        self.remap(lv, offset, data.len() as u64);
    }

    fn remap(&self, lv: &str, offset: u64, len: u64) {
        let mut state = self.state.borrow_mut();
        let first = offset / self.chunk_size;
        let last = (offset + len).div_ceil(self.chunk_size);
        for block in first..last {
            let data_block = state.next_data_block;
            state.next_data_block += 1;
            if let Some(v) = state.volumes.get_mut(lv) {
                v.mappings.insert(block, data_block);
            }
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.state.borrow().reserved
    }

    pub fn set_reserved(&self, reserved: bool) {
        self.state.borrow_mut().reserved = reserved;
    }

    pub fn fail_reserve(&self, fail: bool) {
        self.state.borrow_mut().fail_reserve = fail;
    }

    /// Makes `thin_delta` and `thin_dump` fail.
    pub fn fail_tools(&self, fail: bool) {
        self.state.borrow_mut().fail_tools = fail;
    }

    /// Mutating calls made so far, e.g. `create_snapshot base snap`.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn check_vg(&self, tool: &str, vg: &str) -> Result<()> {
        if vg != self.vg {
            return Err(Error::tool(tool, format!("Volume group \"{vg}\" not found")));
        }
        Ok(())
    }

    fn pool_of(&self, tool: &str, devs: &PoolDevices) -> Result<String> {
        self.state
            .borrow()
            .pools
            .iter()
            .find(|p| tpool_device_path(&self.vg, p) == devs.tpool)
            .cloned()
            .ok_or_else(|| Error::tool(tool, format!("{} is not a thin pool", devs.tpool.display())))
    }

    fn check_tools(&self, tool: &str) -> Result<()> {
        if self.state.borrow().fail_tools {
            return Err(Error::tool(tool, "exited with exit status: 1"));
        }
        Ok(())
    }

    fn superblock_open(&self, out: &mut String, nr_data_blocks: usize) {
        let _ = writeln!(
            out,
            "<superblock uuid=\"\" time=\"0\" transaction=\"{}\" flags=\"0\" version=\"2\" data_block_size=\"{}\" nr_data_blocks=\"{}\">",
            self.state.borrow().transaction,
            self.chunk_size / 512,
            nr_data_blocks
        );
    }
}

/// Consecutive runs of equal `kind` over ascending blocks.
fn runs<K: PartialEq + Copy>(items: &[(u64, K)]) -> Vec<(K, u64, u64)> {
    let mut result: Vec<(K, u64, u64)> = Vec::new();
    for (block, kind) in items {
        match result.last_mut() {
            Some((k, begin, length)) if *k == *kind && *begin + *length == *block => *length += 1,
            _ => result.push((*kind, *block, 1)),
        }
    }
    result
}

impl VolumeManager for SimLvm {
    fn volume_group_config(&self, vg: &str) -> Result<String> {
        self.check_vg("vgcfgbackup", vg)?;
        let state = self.state.borrow();
        let chunk_sectors = self.chunk_size / 512;
        let extent_sectors = state.extent_size / 512;

        let mut out = String::new();
        let _ = writeln!(out, "# Generated by the simulator\n");
        let _ = writeln!(out, "contents = \"Text Format Volume Group\"\nversion = 1\n");
        let _ = writeln!(out, "{} {{", self.vg);
        let _ = writeln!(out, "\tid = \"{}-uuid\"", self.vg);
        let _ = writeln!(out, "\tseqno = {}", state.transaction);
        let _ = writeln!(out, "\tstatus = [\"RESIZEABLE\", \"READ\", \"WRITE\"]");
        let _ = writeln!(out, "\textent_size = {extent_sectors}");
        let _ = writeln!(out, "\n\tlogical_volumes {{");
        for pool in &state.pools {
            let _ = writeln!(out, "\n\t\t{pool} {{");
            let _ = writeln!(out, "\t\t\tid = \"{pool}-uuid\"");
            let _ = writeln!(out, "\t\t\tsegment_count = 1\n");
            let _ = writeln!(out, "\t\t\tsegment1 {{");
            let _ = writeln!(out, "\t\t\t\tstart_extent = 0\n\t\t\t\textent_count = 1024\n");
            let _ = writeln!(out, "\t\t\t\ttype = \"thin-pool\"");
            let _ = writeln!(out, "\t\t\t\tmetadata = \"{pool}_tmeta\"");
            let _ = writeln!(out, "\t\t\t\tpool = \"{pool}_tdata\"");
            let _ = writeln!(out, "\t\t\t\ttransaction_id = {}", state.transaction);
            let _ = writeln!(out, "\t\t\t\tchunk_size = {chunk_sectors}");
            let _ = writeln!(out, "\t\t\t\tzero_new_blocks = 1");
            let _ = writeln!(out, "\t\t\t}}\n\t\t}}");
        }
        for (name, v) in &state.volumes {
            let _ = writeln!(out, "\n\t\t{name} {{");
            let _ = writeln!(out, "\t\t\tid = \"{}\"", v.uuid);
            let _ = writeln!(out, "\t\t\tstatus = [\"READ\", \"WRITE\", \"VISIBLE\"]");
            let _ = writeln!(out, "\t\t\tsegment_count = 1\n");
            let _ = writeln!(out, "\t\t\tsegment1 {{");
            let _ = writeln!(out, "\t\t\t\tstart_extent = 0\n\t\t\t\textent_count = {}\n", v.extents);
            let _ = writeln!(out, "\t\t\t\ttype = \"thin\"");
            let _ = writeln!(out, "\t\t\t\tthin_pool = \"{}\"", v.pool);
            let _ = writeln!(out, "\t\t\t\ttransaction_id = {}", v.transaction_id);
            let _ = writeln!(out, "\t\t\t\tdevice_id = {}", v.dev_id);
            if let Some(origin) = &v.origin {
                let _ = writeln!(out, "\t\t\t\torigin = \"{origin}\"");
            }
            let _ = writeln!(out, "\t\t\t}}\n\t\t}}");
        }
        let _ = writeln!(out, "\t}}\n}}");
        Ok(out)
    }

    fn activate(&self, vg: &str, lv: &str) -> Result<()> {
        self.check_vg("lvchange", vg)?;
        self.state.borrow_mut().volume_mut(lv)?.active = true;
        Ok(())
    }

    fn deactivate(&self, vg: &str, lv: &str) -> Result<()> {
        self.check_vg("lvchange", vg)?;
        self.state.borrow_mut().volume_mut(lv)?.active = false;
        Ok(())
    }

    fn create_thin_volume(&self, vg: &str, pool: &str, lv: &str, size: u64) -> Result<()> {
        self.check_vg("lvcreate", vg)?;
        let mut state = self.state.borrow_mut();
        if !state.pools.iter().any(|p| p == pool) {
            return Err(Error::tool("lvcreate", format!("Thin pool {pool} not found")));
        }
        if state.volumes.contains_key(lv) {
            return Err(Error::tool("lvcreate", format!("Logical volume \"{lv}\" already exists")));
        }
        let extents = size.div_ceil(state.extent_size);
        let data = MemDevice::new(extents * state.extent_size, 512);
        let dev_id = state.volumes.values().map(|v| v.dev_id).max().unwrap_or(0) + 1;
        let volume = SimVolume {
            pool: pool.to_string(),
            dev_id,
            uuid: format!("{lv}-uuid"),
            transaction_id: state.next_transaction(),
            origin: None,
            extents,
            mappings: BTreeMap::new(),
            data,
            active: false,
        };
        state.volumes.insert(lv.to_string(), volume);
        state.calls.push(format!("create_thin_volume {pool} {lv} {size}"));
        Ok(())
    }

    fn create_snapshot(&self, vg: &str, origin: &str, name: &str) -> Result<()> {
        self.check_vg("lvcreate", vg)?;
        let mut state = self.state.borrow_mut();
        if state.volumes.contains_key(name) {
            return Err(Error::tool("lvcreate", format!("Logical volume \"{name}\" already exists")));
        }
        let dev_id = state.volumes.values().map(|v| v.dev_id).max().unwrap_or(0) + 1;
        let source = state.volume(origin)?;
        let (pool, extents, mappings, data) = (
            source.pool.clone(),
            source.extents,
            source.mappings.clone(),
            source.data.deep_copy(),
        );
        let volume = SimVolume {
            pool,
            dev_id,
            uuid: format!("{name}-uuid"),
            transaction_id: state.next_transaction(),
            origin: Some(origin.to_string()),
            extents,
            mappings,
            data,
            active: false,
        };
        state.volumes.insert(name.to_string(), volume);
        state.calls.push(format!("create_snapshot {origin} {name}"));
        Ok(())
    }

    fn resize(&self, vg: &str, lv: &str, size: u64) -> Result<()> {
        self.check_vg("lvresize", vg)?;
        let chunk_size = self.chunk_size;
        let mut state = self.state.borrow_mut();
        let extent_size = state.extent_size;
        let volume = state.volume_mut(lv)?;
        volume.extents = size.div_ceil(extent_size);
        let size = volume.extents * extent_size;
        volume.data.resize(size);
        volume.mappings.retain(|origin, _| *origin < size.div_ceil(chunk_size));
        state.calls.push(format!("resize {lv} {size}"));
        Ok(())
    }

    fn open_volume(&self, vg: &str, lv: &str, access: AccessFlags) -> Result<Box<dyn BlockDevice>> {
        self.check_vg("open", vg)?;
        let state = self.state.borrow();
        let volume = state.volume(lv)?;
        if !volume.active {
            return Err(io::Error::new(ErrorKind::NotFound, format!("{vg}/{lv} is not active")).into());
        }
        Ok(Box::new(SimVolumeDevice {
            data: volume.data.clone(),
            lvm: SimLvm {
                vg: self.vg.clone(),
                chunk_size: self.chunk_size,
                state: Rc::clone(&self.state),
            },
            lv: lv.to_string(),
            writable: access.contains(AccessFlags::WRITE),
        }))
    }
}

impl PoolControl for SimLvm {
    fn reserve_metadata_snap(&self, pool: &PoolDevices) -> Result<()> {
        self.pool_of("dmsetup", pool)?;
        let mut state = self.state.borrow_mut();
        if state.fail_reserve || state.reserved {
            return Err(Error::tool("dmsetup", "device-mapper: message ioctl failed: Device or resource busy"));
        }
        state.reserved = true;
        Ok(())
    }

    fn release_metadata_snap(&self, pool: &PoolDevices) -> Result<()> {
        self.pool_of("dmsetup", pool)?;
        let mut state = self.state.borrow_mut();
        if !state.reserved {
            return Err(Error::tool("dmsetup", "device-mapper: message ioctl failed: Invalid argument"));
        }
        state.reserved = false;
        Ok(())
    }

    fn thin_delta(&self, pool: &PoolDevices, basis: u64, target: u64) -> Result<String> {
        self.check_tools("thin_delta")?;
        self.pool_of("thin_delta", pool)?;
        let state = self.state.borrow();
        if !state.reserved {
            return Err(Error::tool("thin_delta", "no metadata snapshot"));
        }
        let left = &state.by_dev_id("thin_delta", basis)?.mappings;
        let right = &state.by_dev_id("thin_delta", target)?.mappings;

        let mut blocks: Vec<u64> = left.keys().chain(right.keys()).copied().collect();
        blocks.sort_unstable();
        blocks.dedup();
        let kinds: Vec<(u64, &str)> = blocks
            .into_iter()
            .map(|b| {
                let kind = match (left.get(&b), right.get(&b)) {
                    (Some(l), Some(r)) if l == r => "same",
                    (Some(_), Some(_)) => "different",
                    (Some(_), None) => "left_only",
                    _ => "right_only",
                };
                (b, kind)
            })
            .collect();
        drop(state);

        let mut out = String::new();
        self.superblock_open(&mut out, 0);
        let _ = writeln!(out, "  <diff left=\"{basis}\" right=\"{target}\">");
        for (kind, begin, length) in runs(&kinds) {
            let _ = writeln!(out, "    <{kind} begin=\"{begin}\" length=\"{length}\"/>");
        }
        let _ = writeln!(out, "  </diff>\n</superblock>");
        Ok(out)
    }

    fn thin_dump(&self, pool: &PoolDevices, dev_id: Option<u64>) -> Result<String> {
        self.check_tools("thin_dump")?;
        let pool_name = self.pool_of("thin_dump", pool)?;
        let state = self.state.borrow();
        if !state.reserved {
            return Err(Error::tool("thin_dump", "no metadata snapshot"));
        }
        let mut volumes: Vec<&SimVolume> = match dev_id {
            Some(id) => vec![state.by_dev_id("thin_dump", id)?],
            None => state.volumes.values().filter(|v| v.pool == pool_name).collect(),
        };
        volumes.sort_by_key(|v| v.dev_id);

        let mut out = String::new();
        let nr_data_blocks: usize = state.volumes.values().map(|v| v.mappings.len()).sum();
        self.superblock_open(&mut out, nr_data_blocks);
        for v in volumes {
            let _ = writeln!(
                out,
                "  <device dev_id=\"{}\" mapped_blocks=\"{}\" transaction=\"{}\" creation_time=\"0\" snap_time=\"0\">",
                v.dev_id,
                v.mappings.len(),
                v.transaction_id
            );
            // a run keeps origin and data block in step
            let steps: Vec<(u64, i128)> = v
                .mappings
                .iter()
                .map(|(o, d)| (*o, *d as i128 - *o as i128))
                .collect();
            for (skew, begin, length) in runs(&steps) {
                let data_begin = (begin as i128 + skew) as u64;
                if length == 1 {
                    let _ = writeln!(
                        out,
                        "    <single_mapping origin_block=\"{begin}\" data_block=\"{data_begin}\" time=\"0\"/>"
                    );
                } else {
                    let _ = writeln!(
                        out,
                        "    <range_mapping origin_begin=\"{begin}\" data_begin=\"{data_begin}\" length=\"{length}\" time=\"0\"/>"
                    );
                }
            }
            let _ = writeln!(out, "  </device>");
        }
        let _ = writeln!(out, "</superblock>");
        Ok(out)
    }
}

/// An opened simulated volume.
struct SimVolumeDevice {
    data: MemDevice,
    lvm: SimLvm,
    lv: String,
    writable: bool,
}

impl BlockDevice for SimVolumeDevice {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.data.read_exact_at(buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(ErrorKind::PermissionDenied, "opened read-only"));
        }
        self.data.write_all_at(buf, offset)?;
        self.lvm.remap(&self.lv, offset, buf.len() as u64);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.size()
    }

    fn logical_block_size(&self) -> usize {
        self.data.logical_block_size()
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        delta::{parse_thin_delta, parse_thin_dump},
        lvm::{PoolControl, PoolDevices, VolumeManager},
        vgcfg::VgConfig,
    };

    use super::SimLvm;

    #[test]
    fn renders_parseable_config() {
        let sim = SimLvm::new("vg0", "pool0", 65536);
        sim.add_volume("base", 1, 16, &[]);
        sim.add_volume("snap-1", 2, 16, &[]);
        sim.create_snapshot("vg0", "base", "restored").unwrap();

        let cfg = VgConfig::parse(&sim.volume_group_config("vg0").unwrap()).unwrap();
        assert_eq!(cfg.find_thin_pool("pool0").unwrap(), sim.pool_info());
        let restored = cfg.find_thin_volume("restored").unwrap();
        assert_eq!(restored.device_id, 3);
        assert_eq!(restored.origin.as_deref(), Some("base"));
        assert_eq!(cfg.volume_size(&restored).unwrap(), 16 * 65536);
    }

    #[test]
    fn dump_collapses_runs() {
        let sim = SimLvm::new("vg0", "pool0", 65536);
        sim.add_volume("a", 1, 8, &[(0, 10), (1, 11), (2, 12), (4, 3)]);
        let devs = PoolDevices::new("vg0", &sim.pool_info());
        sim.reserve_metadata_snap(&devs).unwrap();
        let text = sim.thin_dump(&devs, None).unwrap();
        assert!(text.contains("<range_mapping origin_begin=\"0\" data_begin=\"10\" length=\"3\""));
        let dump = parse_thin_dump(&text).unwrap();
        assert_eq!(dump.device(1).unwrap().mappings.len(), 4);
    }

    #[test]
    fn writes_break_sharing() {
        let sim = SimLvm::new("vg0", "pool0", 4096);
        sim.add_volume("a", 1, 4, &[(0, 1), (1, 2)]);
        sim.create_snapshot("vg0", "a", "b").unwrap();
        sim.write("b", 4096, &[7u8; 10]);

        let devs = PoolDevices::new("vg0", &sim.pool_info());
        sim.reserve_metadata_snap(&devs).unwrap();
        let ranges = parse_thin_delta(&sim.thin_delta(&devs, 1, 2).unwrap()).unwrap();
        assert_eq!(ranges.same.len(), 1);
        assert_eq!(ranges.different.len(), 1);
        assert_eq!(ranges.different[0].begin, 1);
    }
}
