use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use log::{debug, warn};

use crate::{
    blkdev::{AccessFlags, RawDevice},
    device::BlockDevice,
    error::{Error, Result},
    vgcfg::{ThinPoolInfo, VgConfig},
};

/// Volume lifecycle operations, keyed by volume group and volume name.
pub(crate) trait VolumeManager {
    /// The volume group's metadata in LVM text format.
    fn volume_group_config(&self, vg: &str) -> Result<String>;
    fn activate(&self, vg: &str, lv: &str) -> Result<()>;
    fn deactivate(&self, vg: &str, lv: &str) -> Result<()>;
    fn create_thin_volume(&self, vg: &str, pool: &str, lv: &str, size: u64) -> Result<()>;
    /// Creates `name` as a thin (copy-on-write) snapshot of `origin`.
    fn create_snapshot(&self, vg: &str, origin: &str, name: &str) -> Result<()>;
    fn resize(&self, vg: &str, lv: &str, size: u64) -> Result<()>;
    /// Opens an active volume for block I/O.
    fn open_volume(&self, vg: &str, lv: &str, access: AccessFlags) -> Result<Box<dyn BlockDevice>>;
}

/// Control channel of a thin pool: metadata snapshot reservation and
/// the metadata inspection tools that need it.
pub(crate) trait PoolControl {
    fn reserve_metadata_snap(&self, pool: &PoolDevices) -> Result<()>;
    fn release_metadata_snap(&self, pool: &PoolDevices) -> Result<()>;
    /// `thin_delta` XML comparing `basis` (left) with `target` (right).
    fn thin_delta(&self, pool: &PoolDevices, basis: u64, target: u64) -> Result<String>;
    /// `thin_dump` XML of the whole pool, or of a single device.
    fn thin_dump(&self, pool: &PoolDevices, dev_id: Option<u64>) -> Result<String>;
}

/// Fetches and parses the metadata of volume group `vg`.
pub(crate) fn load_config<L: VolumeManager + ?Sized>(lvm: &L, vg: &str) -> Result<VgConfig> {
    let cfg = VgConfig::parse(&lvm.volume_group_config(vg)?)?;
    let name = cfg.vg_name()?;
    if name != vg {
        return Err(Error::ConfigLookup(format!(
            "metadata describes volume group {name}, not {vg}"
        )));
    }
    Ok(cfg)
}

/// Device nodes that identify a thin pool to the kernel and the tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolDevices {
    pub tpool: PathBuf,
    pub tmeta: PathBuf,
}

impl PoolDevices {
    pub fn new(vg: &str, pool: &ThinPoolInfo) -> Self {
        Self {
            tpool: tpool_device_path(vg, &pool.name),
            tmeta: lv_device_path(vg, &pool.metadata_lv),
        }
    }
}

/// Device-mapper doubles hyphens inside volume group and volume names.
fn dm_escape(name: &str) -> String {
    name.replace('-', "--")
}

pub(crate) fn lv_device_path(vg: &str, lv: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}-{}", dm_escape(vg), dm_escape(lv)))
}

pub(crate) fn tpool_device_path(vg: &str, pool: &str) -> PathBuf {
    PathBuf::from(format!(
        "/dev/mapper/{}-{}-tpool",
        dm_escape(vg),
        dm_escape(pool)
    ))
}

/// Keeps a volume active for as long as it lives.
pub(crate) struct Activation<'a, L: VolumeManager + ?Sized> {
    lvm: &'a L,
    vg: String,
    lv: String,
}

impl<'a, L: VolumeManager + ?Sized> Activation<'a, L> {
    pub fn new(lvm: &'a L, vg: &str, lv: &str) -> Result<Self> {
        lvm.activate(vg, lv)?;
        debug!("Activated {}/{}", vg, lv);
        Ok(Self {
            lvm,
            vg: vg.to_string(),
            lv: lv.to_string(),
        })
    }
}

impl<L: VolumeManager + ?Sized> Drop for Activation<'_, L> {
    fn drop(&mut self) {
        match self.lvm.deactivate(&self.vg, &self.lv) {
            Ok(()) => debug!("Deactivated {}/{}", self.vg, self.lv),
            Err(e) => warn!("Failed to deactivate {}/{}: {}", self.vg, self.lv, e),
        }
    }
}

/// Holds the pool's metadata snapshot reservation for as long as it lives.
///
/// Any stale reservation left behind by an earlier crash is released
/// first; that release may fail and is ignored. The reservation itself
/// failing means someone else is using the pool.
pub(crate) struct Reservation<'a, P: PoolControl + ?Sized> {
    ctl: &'a P,
    pool: &'a PoolDevices,
}

impl<'a, P: PoolControl + ?Sized> Reservation<'a, P> {
    pub fn acquire(ctl: &'a P, pool: &'a PoolDevices) -> Result<Self> {
        if let Err(e) = ctl.release_metadata_snap(pool) {
            debug!("Releasing stale metadata snapshot: {}", e);
        }
        ctl.reserve_metadata_snap(pool).map_err(|e| {
            Error::tool(
                "reserve_metadata_snap",
                format!("can not reserve metadata snapshot of {}: {}", pool.tpool.display(), e),
            )
        })?;
        debug!("Reserved metadata snapshot of {}", pool.tpool.display());
        Ok(Self { ctl, pool })
    }
}

impl<P: PoolControl + ?Sized> Drop for Reservation<'_, P> {
    fn drop(&mut self) {
        match self.ctl.release_metadata_snap(self.pool) {
            Ok(()) => debug!("Released metadata snapshot of {}", self.pool.tpool.display()),
            Err(e) => warn!(
                "Failed to release metadata snapshot of {}: {}",
                self.pool.tpool.display(),
                e
            ),
        }
    }
}

/// The real backend: LVM2, device-mapper and thin-provisioning-tools binaries.
pub(crate) struct LvmTools;

impl LvmTools {
    fn command(tool: &str, args: &[&str]) -> Command {
        debug!("Running {} {}", tool, args.join(" "));
        let mut cmd = Command::new(tool);
        cmd.args(args);
        cmd
    }

    fn spawn_error(tool: &str, e: io::Error) -> Error {
        match e.kind() {
            ErrorKind::NotFound => Error::tool(tool, "not found in PATH"),
            _ => Error::tool(tool, e.to_string()),
        }
    }

    /// Runs a tool with stderr passed through to ours.
    fn run(tool: &str, args: &[&str]) -> Result<()> {
        let status = Self::command(tool, args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| Self::spawn_error(tool, e))?;
        if !status.success() {
            return Err(Error::tool(tool, format!("exited with {}", status)));
        }
        Ok(())
    }

    /// Runs a tool and collects its stdout.
    fn output(tool: &str, args: &[&str]) -> Result<String> {
        let out = Self::command(tool, args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Self::spawn_error(tool, e))?;
        if !out.status.success() {
            return Err(Error::tool(
                tool,
                format!(
                    "exited with {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            ));
        }
        String::from_utf8(out.stdout).map_err(|e| Error::tool(tool, e.to_string()))
    }

    fn path_arg(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| Error::ConfigLookup(format!("non UTF-8 device path {}", path.display())))
    }
}

impl VolumeManager for LvmTools {
    fn volume_group_config(&self, vg: &str) -> Result<String> {
        let tmp = tempfile::Builder::new().prefix("vgcfg_").tempfile()?;
        Self::run("vgcfgbackup", &["-f", Self::path_arg(tmp.path())?, vg])?;
        Ok(fs::read_to_string(tmp.path())?)
    }

    fn activate(&self, vg: &str, lv: &str) -> Result<()> {
        Self::run("lvchange", &["-ay", "-K", &format!("{vg}/{lv}")])
    }

    fn deactivate(&self, vg: &str, lv: &str) -> Result<()> {
        Self::run("lvchange", &["-an", &format!("{vg}/{lv}")])
    }

    fn create_thin_volume(&self, vg: &str, pool: &str, lv: &str, size: u64) -> Result<()> {
        Self::run(
            "lvcreate",
            &[
                "--virtualsize",
                &format!("{size}b"),
                "--name",
                lv,
                "--thinpool",
                &format!("{vg}/{pool}"),
            ],
        )
    }

    fn create_snapshot(&self, vg: &str, origin: &str, name: &str) -> Result<()> {
        Self::run(
            "lvcreate",
            &["--snapshot", &format!("{vg}/{origin}"), "--name", name],
        )
    }

    fn resize(&self, vg: &str, lv: &str, size: u64) -> Result<()> {
        Self::run(
            "lvresize",
            &["--size", &format!("{size}b"), &format!("{vg}/{lv}")],
        )
    }

    fn open_volume(&self, vg: &str, lv: &str, access: AccessFlags) -> Result<Box<dyn BlockDevice>> {
        let dev = RawDevice::open(&lv_device_path(vg, lv), access | AccessFlags::DIRECT)?;
        Ok(Box::new(dev))
    }
}

impl PoolControl for LvmTools {
    fn reserve_metadata_snap(&self, pool: &PoolDevices) -> Result<()> {
        let tpool = Self::path_arg(&pool.tpool)?;
        Self::run("dmsetup", &["message", tpool, "0", "reserve_metadata_snap"])
    }

    fn release_metadata_snap(&self, pool: &PoolDevices) -> Result<()> {
        let tpool = Self::path_arg(&pool.tpool)?;
        Self::run("dmsetup", &["message", tpool, "0", "release_metadata_snap"])
    }

    fn thin_delta(&self, pool: &PoolDevices, basis: u64, target: u64) -> Result<String> {
        Self::output(
            "thin_delta",
            &[
                "-m",
                "--snap1",
                &basis.to_string(),
                "--snap2",
                &target.to_string(),
                Self::path_arg(&pool.tmeta)?,
            ],
        )
    }

    fn thin_dump(&self, pool: &PoolDevices, dev_id: Option<u64>) -> Result<String> {
        let tmeta = Self::path_arg(&pool.tmeta)?;
        match dev_id {
            Some(id) => Self::output("thin_dump", &["-m", "--dev-id", &id.to_string(), tmeta]),
            None => Self::output("thin_dump", &["-m", tmeta]),
        }
    }
}
