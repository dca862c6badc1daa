//! Restore session: validate a stream against local storage, then patch
//! it onto a new snapshot of the basis.
//!
//! Nothing on the volume group changes until the header has been parsed,
//! the pool's chunk size matched and the basis verified.

use std::io::BufRead;

use log::{debug, info, warn};

use crate::{
    blkdev::AccessFlags,
    checksum,
    device::DeviceOps,
    error::{ConsistencyError, Error, Result, SessionError},
    lvm::{load_config, Activation, VolumeManager},
    stream::{StreamReader, StreamSummary},
    utils::SimpleProgress,
    vgcfg::ThinLvInfo,
};

#[derive(Debug, Clone, Default)]
pub(crate) struct RecvOptions {
    pub vg: String,
    /// Local volume the stream was diffed against.
    pub basis: Option<String>,
    /// Pool for full streams.
    pub pool: Option<String>,
    /// Overrides the name recorded in the stream.
    pub name: Option<String>,
    /// Check the basis hashes before touching anything.
    pub verify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    HeaderParsed,
    PoolValidated,
    BasisVerified,
    SnapshotCreated,
    Activated,
    Patching,
    Done,
    Failed,
}

/// How the new volume comes into being.
enum Origin {
    /// Copy-on-write snapshot of the basis, resized if the stream says so.
    Snapshot { basis: ThinLvInfo, resize: bool },
    /// A fresh thin volume in the named pool.
    Fresh { pool: String },
}

struct RestorePlan {
    name: String,
    origin: Origin,
    chunk_len: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct RecvSummary {
    pub name: String,
    pub stream: StreamSummary,
}

pub(crate) struct RestoreSession<'a, L: VolumeManager + ?Sized> {
    lvm: &'a L,
    opts: &'a RecvOptions,
    phase: Phase,
}

impl<'a, L: VolumeManager + ?Sized> RestoreSession<'a, L> {
    pub fn new(lvm: &'a L, opts: &'a RecvOptions) -> Self {
        Self {
            lvm,
            opts,
            phase: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug!("Restore: {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn fail(&mut self, e: SessionError) -> SessionError {
        debug!("Restore failed after {:?}: {}", self.phase, e);
        self.phase = Phase::Failed;
        e
    }

    /// Reads a stream from `input` and materialises it as a new volume.
    ///
    /// A failure while patching leaves the new volume partially written.
    pub fn run(&mut self, input: impl BufRead) -> std::result::Result<RecvSummary, SessionError> {
        let (mut reader, plan) = self
            .validate(input)
            .map_err(|e| self.fail(SessionError::setup(e)))?;
        let stream = self
            .patch(&mut reader, &plan)
            .map_err(|e| self.fail(SessionError::run(e)))?;
        self.advance(Phase::Done);
        info!("All done.");
        Ok(RecvSummary {
            name: plan.name,
            stream,
        })
    }

    fn validate<R: BufRead>(&mut self, input: R) -> Result<(StreamReader<R>, RestorePlan)> {
        let (lvm, opts) = (self.lvm, self.opts);
        let reader = StreamReader::open(input)?;
        let header = reader.header();
        info!(
            "Stream of {} ({} bytes), {} blocks of {} bytes, {}",
            header.name,
            header.volume_size,
            header.block_count,
            header.block_size,
            if header.is_incremental() {
                "incremental"
            } else {
                "full"
            }
        );
        self.advance(Phase::HeaderParsed);

        let cfg = load_config(lvm, &opts.vg)?;
        let basis = opts
            .basis
            .as_deref()
            .map(|name| cfg.find_thin_volume(name))
            .transpose()?;
        let pool_name = match (&basis, &opts.pool) {
            (Some(basis), Some(pool)) if basis.pool != *pool => {
                return Err(Error::ConfigLookup(format!(
                    "{} is in pool {}, not {}",
                    basis.name, basis.pool, pool
                )))
            }
            (Some(basis), _) => basis.pool.clone(),
            (None, Some(pool)) if !header.is_incremental() => pool.clone(),
            (None, _) if header.is_incremental() => {
                return Err(Error::ConfigLookup(
                    "an incremental stream needs its basis volume".into(),
                ))
            }
            (None, _) => {
                return Err(Error::ConfigLookup(
                    "a full stream needs a basis volume or a pool".into(),
                ))
            }
        };
        let pool = cfg.find_thin_pool(&pool_name)?;
        if pool.chunk_size != header.block_size {
            return Err(ConsistencyError::ChunkSizeMismatch {
                stream: header.block_size,
                pool: pool.chunk_size,
            }
            .into());
        }
        let chunk_len = usize::try_from(header.block_size)
            .map_err(|_| Error::scheme(format!("chunk size {} too large", header.block_size)))?;
        self.advance(Phase::PoolValidated);

        let name = opts.name.clone().unwrap_or_else(|| header.name.clone());
        if cfg.has_volume(&name)? {
            return Err(Error::ConfigLookup(format!("volume {name} already exists")));
        }

        let origin = match basis {
            Some(basis) if header.is_incremental() => {
                if basis.uuid != header.delta_source_uuid {
                    warn!(
                        "{} has UUID {}, the stream was taken against {}",
                        basis.name, basis.uuid, header.delta_source_uuid
                    );
                }
                self.verify_basis(&reader, &basis, chunk_len)?;
                let resize = cfg.volume_size(&basis)? != header.volume_size;
                Origin::Snapshot { basis, resize }
            }
            _ => Origin::Fresh { pool: pool.name },
        };
        self.advance(Phase::BasisVerified);

        Ok((
            reader,
            RestorePlan {
                name,
                origin,
                chunk_len,
            },
        ))
    }

    fn verify_basis<R: BufRead>(
        &self,
        reader: &StreamReader<R>,
        basis: &ThinLvInfo,
        chunk_len: usize,
    ) -> Result<()> {
        let hashes = reader.basis_hashes();
        if !self.opts.verify {
            warn!("Basis check disabled, {} hashes not verified", hashes.len());
            return Ok(());
        }
        if hashes.is_empty() {
            info!("Stream carries no basis hashes");
            return Ok(());
        }
        let _active = Activation::new(self.lvm, &self.opts.vg, &basis.name)?;
        let dev = self
            .lvm
            .open_volume(&self.opts.vg, &basis.name, AccessFlags::READ)?;
        let mut ops = DeviceOps::new(dev, chunk_len)?;
        checksum::verify(&mut ops, hashes)?;
        ops.stats().log("Basis verification");
        Ok(())
    }

    fn patch<R: BufRead>(
        &mut self,
        reader: &mut StreamReader<R>,
        plan: &RestorePlan,
    ) -> Result<StreamSummary> {
        let (lvm, opts) = (self.lvm, self.opts);
        let vg = &opts.vg;
        let header = reader.header().clone();

        match &plan.origin {
            Origin::Snapshot { basis, resize } => {
                info!("Creating snapshot {} of {}", plan.name, basis.name);
                lvm.create_snapshot(vg, &basis.name, &plan.name)?;
                if *resize {
                    info!("Resizing {} to {} bytes", plan.name, header.volume_size);
                    lvm.resize(vg, &plan.name, header.volume_size)?;
                }
            }
            Origin::Fresh { pool } => {
                info!("Creating thin volume {} in {}", plan.name, pool);
                lvm.create_thin_volume(vg, pool, &plan.name, header.volume_size)?;
            }
        }
        self.advance(Phase::SnapshotCreated);

        let _active = Activation::new(lvm, vg, &plan.name)?;
        let dev = lvm.open_volume(vg, &plan.name, AccessFlags::READ | AccessFlags::WRITE)?;
        let mut ops = DeviceOps::new(dev, plan.chunk_len)?;
        ops.require_size(header.volume_size)?;
        self.advance(Phase::Activated);

        self.advance(Phase::Patching);
        let mut pb = SimpleProgress::new(header.block_count);
        let mut n = 0;
        while let Some(rec) = reader.next_block()? {
            pb.update(n);
            let len = usize::try_from(rec.length)
                .map_err(|_| Error::scheme(format!("block of {} bytes too large", rec.length)))?;
            reader.read_payload(|payload| ops.copy_in(payload, rec.offset, len))?;
            n += 1;
        }
        pb.finish();
        ops.sync()?;

        let summary = reader.summary();
        info!(
            "Patched {} blocks, payload CRC32 {:08x}",
            summary.blocks, summary.digest
        );
        ops.stats().log("Patching");
        Ok(summary)
    }
}
