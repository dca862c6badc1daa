// Definitions taken from `/usr/include/linux/fs.h`.
use bitflags::bitflags;
use log::debug;
use std::{
    ffi::c_int,
    fs::{File, OpenOptions},
    io,
    os::{
        fd::AsRawFd,
        raw::c_ulong,
        unix::fs::{FileExt, FileTypeExt, OpenOptionsExt},
    },
    path::Path,
};

use crate::device::BlockDevice;

extern "C" {
    fn ioctl(fd: c_int, request: c_ulong, ...) -> c_int;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct AccessFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        /// Bypass the page cache (`O_DIRECT`).
        const DIRECT = 0x4;
    }
}

/// Sector size every offset on the wire is expressed in.
pub(crate) const SECTOR_SIZE: u64 = 512;

/// The value of the BLKSSZGET constant, `_IO(0x12, 104)`.
fn blk_ssz_get() -> c_ulong {
    (0x12 << 8) | 104
}

/// The value of the BLKGETSIZE64 constant, `_IOR(0x12, 114, size_t)`.
///
/// Calculated rather than copied so that the size of the argument
/// type is checked against the platform.
fn blk_get_size64() -> c_ulong {
    // access mode (read)
    (0b10 << 30) |
        // size of argument
        ((c_ulong::try_from(std::mem::size_of::<u64>()).unwrap_or(8) & 0x3FFF) << 16) |
        // type (block layer)
        (0x12 << 8) |
        // BLKGETSIZE64 code.
        114
}

/// A volume opened for raw access.
///
/// Regular files are accepted too (useful for stream testing against
/// image files); they report a 512 byte logical block size.
pub(crate) struct RawDevice {
    file: File,
    logical_block_size: usize,
    size: u64,
}

impl RawDevice {
    pub fn open(path: &Path, access: AccessFlags) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options
            .read(access.contains(AccessFlags::READ))
            .write(access.contains(AccessFlags::WRITE));
        if access.contains(AccessFlags::DIRECT) {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path)?;

        let (logical_block_size, size) = if file.metadata()?.file_type().is_block_device() {
            (logical_block_size(&file)?, device_size(&file)?)
        } else {
            (SECTOR_SIZE as usize, file.metadata()?.len())
        };
        debug!(
            "Opened {} ({:?}): {} bytes, logical block size {}",
            path.display(),
            access,
            size,
            logical_block_size
        );

        Ok(Self {
            file,
            logical_block_size,
            size,
        })
    }
}

impl BlockDevice for RawDevice {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn logical_block_size(&self) -> usize {
        self.logical_block_size
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

fn logical_block_size(file: &File) -> io::Result<usize> {
    let mut value: c_int = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), blk_ssz_get(), &mut value as *mut c_int) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    usize::try_from(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn device_size(file: &File) -> io::Result<u64> {
    let mut value: u64 = 0;
    let result = unsafe { ioctl(file.as_raw_fd(), blk_get_size64(), &mut value as *mut u64) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}
