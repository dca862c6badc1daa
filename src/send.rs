//! Backup session: diff, sample and stream a thin volume.

use std::io::Write;

use log::{debug, info, warn};

use crate::{
    blkdev::AccessFlags,
    checksum::{self, DetectLevel},
    delta::{compute_delta, Delta, DeltaOp, DiffMethod, DiffRequest},
    device::DeviceOps,
    error::{Error, Result, SessionError},
    lvm::{load_config, Activation, PoolControl, PoolDevices, VolumeManager},
    stream::{StreamHeader, StreamSummary, StreamWriter},
    utils::{IoStats, SimpleProgress},
};

#[derive(Debug, Clone, Default)]
pub(crate) struct SendOptions {
    pub vg: String,
    pub lv: String,
    /// Volume to diff against; None for a full backup.
    pub basis: Option<String>,
    pub detect_level: DetectLevel,
    pub method: DiffMethod,
    /// Sample unchanged blocks too.
    pub include_unchanged: bool,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Prepared,
    HeaderEmitted,
    BasisHashesEmitted,
    Streaming,
    Done,
    Failed,
}

/// What `prepare` resolved, threaded through the later phases.
struct BackupContext {
    header: StreamHeader,
    delta: Delta,
    basis: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct SendSummary {
    pub header: StreamHeader,
    pub stream: StreamSummary,
}

pub(crate) struct BackupSession<'a, L: VolumeManager + PoolControl + ?Sized> {
    lvm: &'a L,
    opts: &'a SendOptions,
    phase: Phase,
}

impl<'a, L: VolumeManager + PoolControl + ?Sized> BackupSession<'a, L> {
    pub fn new(lvm: &'a L, opts: &'a SendOptions) -> Self {
        Self {
            lvm,
            opts,
            phase: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!("Backup: {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Writes a complete stream of the volume to `out`.
    ///
    /// Any volume activated on the way is deactivated again, whatever the outcome.
    pub fn run(&mut self, out: impl Write) -> std::result::Result<SendSummary, SessionError> {
        let ctx = self.prepare().map_err(|e| self.fail(SessionError::setup(e)))?;
        self.advance(Phase::Prepared);
        let summary = self
            .emit(&ctx, out)
            .map_err(|e| self.fail(SessionError::run(e)))?;
        self.advance(Phase::Done);
        info!("All done.");
        Ok(SendSummary {
            header: ctx.header,
            stream: summary,
        })
    }

    fn fail(&mut self, e: SessionError) -> SessionError {
        debug!("Backup failed after {:?}: {}", self.phase, e);
        self.phase = Phase::Failed;
        e
    }

    /// Looks up the volumes and computes the delta; touches no device.
    fn prepare(&self) -> Result<BackupContext> {
        let opts = self.opts;
        let cfg = load_config(self.lvm, &opts.vg)?;

        let target = cfg.find_thin_volume(&opts.lv)?;
        let basis = opts
            .basis
            .as_deref()
            .map(|name| cfg.find_thin_volume(name))
            .transpose()?;
        if let Some(basis) = &basis {
            if basis.pool != target.pool {
                return Err(Error::ConfigLookup(format!(
                    "{} is in pool {} and {} in pool {}; incremental backups need both in one pool",
                    target.name, target.pool, basis.name, basis.pool
                )));
            }
        }
        let pool = cfg.find_thin_pool(&target.pool)?;
        let volume_size = cfg.volume_size(&target)?;
        info!(
            "Backing up {}/{} ({} bytes) in pool {}, chunk size {}",
            opts.vg, target.name, volume_size, pool.name, pool.chunk_size
        );

        let devices = PoolDevices::new(&opts.vg, &pool);
        let mut delta = compute_delta(
            self.lvm,
            &DiffRequest {
                pool: &devices,
                target: target.device_id,
                basis: basis.as_ref().map(|b| b.device_id),
                method: opts.method,
                include_unchanged: opts.include_unchanged,
            },
        )?;
        delta.truncate(volume_size.div_ceil(pool.chunk_size));

        let detect_level = match &basis {
            Some(_) => opts.detect_level,
            None => {
                if opts.detect_level != DetectLevel::Off {
                    warn!("Full backup, there is no basis to sample");
                }
                DetectLevel::Off
            }
        };

        let header = StreamHeader {
            name: target.name.clone(),
            volume_size,
            block_size: pool.chunk_size,
            block_count: delta.block_count(),
            volume_uuid: target.uuid.clone(),
            delta_source_uuid: basis.as_ref().map(|b| b.uuid.clone()).unwrap_or_default(),
            detect_level,
            metadata: opts.metadata.clone(),
        };
        Ok(BackupContext {
            header,
            delta,
            basis: basis.map(|b| b.name),
        })
    }

    fn emit(&mut self, ctx: &BackupContext, out: impl Write) -> Result<StreamSummary> {
        let (lvm, opts) = (self.lvm, self.opts);
        let vg = &opts.vg;
        let block_size = ctx.header.block_size;
        let chunk_len = usize::try_from(block_size)
            .map_err(|_| Error::scheme(format!("chunk size {block_size} too large")))?;

        // the origin goes first so the snapshot can be activated after it
        let _basis_active = match &ctx.basis {
            Some(basis) => Some(Activation::new(lvm, vg, basis)?),
            None => None,
        };
        let _target_active = Activation::new(lvm, vg, &opts.lv)?;

        // nothing is written until sampling and the target checks have passed
        let mut stats = IoStats::default();
        let hashes = match &ctx.basis {
            Some(basis) if ctx.header.detect_level != DetectLevel::Off => {
                let dev = lvm.open_volume(vg, basis, AccessFlags::READ)?;
                let mut ops = DeviceOps::new(dev, chunk_len)?;
                let hashes = checksum::sample(
                    &mut ops,
                    block_size,
                    ctx.delta.entries(),
                    ctx.header.detect_level,
                )?;
                stats = ops.stats();
                hashes
            }
            _ => Vec::new(),
        };
        let dev = lvm.open_volume(vg, &opts.lv, AccessFlags::READ)?;
        let mut ops = DeviceOps::new(dev, chunk_len)?;
        ops.require_size(ctx.header.volume_size)?;

        let mut writer = StreamWriter::new(out);
        writer.write_header(&ctx.header)?;
        self.advance(Phase::HeaderEmitted);
        writer.write_basis_hashes(&hashes)?;
        self.advance(Phase::BasisHashesEmitted);
        stats.log("Basis sampling");

        self.advance(Phase::Streaming);
        info!("Streaming {} blocks", ctx.header.block_count);
        let mut pb = SimpleProgress::new(ctx.header.block_count);
        for (n, entry) in ctx.delta.streamed().enumerate() {
            pb.update(n as u64);
            let offset = entry.origin_block * block_size;
            // the last chunk of a volume can be cut short by its size
            let len = ctx.header.volume_size.saturating_sub(offset).min(block_size) as usize;
            let data = match entry.op {
                DeltaOp::Delete => ops.zero_chunk(len)?,
                _ => ops.read_chunk(offset, len)?,
            };
            writer.write_block(offset, data)?;
        }
        pb.finish();

        let summary = writer.finish()?;
        info!(
            "Sent {} blocks, payload CRC32 {:08x}",
            summary.blocks, summary.digest
        );
        ops.stats().log("Streaming");
        Ok(summary)
    }
}
