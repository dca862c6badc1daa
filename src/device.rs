use std::io::{self, Read};

use crate::{
    error::{ConsistencyError, Result},
    utils::{round_up, AlignedBuf, IoStats},
};

/// Positioned access to a volume.
///
/// Callers only ever pass buffers obtained from [`DeviceOps`], which are
/// aligned and sized to `logical_block_size`.
pub(crate) trait BlockDevice {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn size(&self) -> u64;
    fn logical_block_size(&self) -> usize;
    fn sync(&self) -> io::Result<()>;
}

/// Owns a device, an aligned transfer buffer and traffic counters.
///
/// Every transfer goes through the one buffer, so lengths are rounded to
/// the device's logical block size and the buffer grows on demand.
pub(crate) struct DeviceOps {
    dev: Box<dyn BlockDevice>,
    buf: AlignedBuf,
    chunk_len: usize,
    stats: IoStats,
}

impl DeviceOps {
    /// `chunk_len` is the usual transfer size (the pool chunk size).
    pub fn new(dev: Box<dyn BlockDevice>, chunk_len: usize) -> Result<Self> {
        let lbs = dev.logical_block_size();
        if chunk_len == 0 || chunk_len % lbs != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk size {chunk_len} is not a multiple of the logical block size {lbs}"),
            )
            .into());
        }
        let buf = AlignedBuf::zeroed(lbs, chunk_len)?;
        Ok(Self {
            dev,
            buf,
            chunk_len,
            stats: IoStats::default(),
        })
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    pub fn size(&self) -> u64 {
        self.dev.size()
    }

    /// Fails unless the device can hold `required` bytes.
    pub fn require_size(&self, required: u64) -> Result<()> {
        let actual = self.dev.size();
        if actual < required {
            return Err(ConsistencyError::VolumeTooSmall { actual, required }.into());
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            let lbs = self.dev.logical_block_size();
            self.buf = AlignedBuf::zeroed(lbs, round_up(len, lbs))?;
        }
        Ok(())
    }

    /// Reads up to one chunk at `offset` and returns it.
    ///
    /// `len` is shorter than a chunk only for the tail of a volume whose
    /// size is not a chunk multiple.
    pub fn read_chunk(&mut self, offset: u64, len: usize) -> Result<&[u8]> {
        let len = self.chunk_bound(len)?;
        let chunk = &mut self.buf.as_mut_slice()[..len];
        self.dev.read_exact_at(chunk, offset)?;
        self.stats.read_ops += 1;
        self.stats.read_bytes += len as u64;
        Ok(&self.buf.as_slice()[..len])
    }

    /// `len` zeros, for blocks that no longer exist in the target.
    pub fn zero_chunk(&mut self, len: usize) -> Result<&[u8]> {
        let len = self.chunk_bound(len)?;
        let chunk = &mut self.buf.as_mut_slice()[..len];
        chunk.fill(0);
        Ok(chunk)
    }

    fn chunk_bound(&self, len: usize) -> Result<usize> {
        if len > self.chunk_len || len % self.dev.logical_block_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("transfer of {len} bytes does not fit a chunk of {}", self.chunk_len),
            )
            .into());
        }
        Ok(len)
    }

    /// CRC32 (IEEE) over `length` bytes starting at `offset`, read chunk by chunk.
    pub fn checksum_range(&mut self, offset: u64, length: u64) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        let mut read = 0u64;
        while read < length {
            let step = u64::min(self.chunk_len as u64, length - read) as usize;
            let step = round_up(step, self.dev.logical_block_size());
            let chunk = &mut self.buf.as_mut_slice()[..step];
            self.dev.read_exact_at(chunk, offset + read)?;
            let wanted = u64::min(step as u64, length - read) as usize;
            hasher.update(&chunk[..wanted]);

            read += wanted as u64;
            self.stats.read_ops += 1;
            self.stats.read_bytes += step as u64;
        }
        Ok(hasher.finalize())
    }

    /// Fills the buffer with exactly `len` bytes from `input` and writes them at `offset`.
    ///
    /// `read_exact` loops over short reads, so a block split across
    /// several transport reads is reassembled before it reaches the device.
    pub fn copy_in<R: Read + ?Sized>(&mut self, input: &mut R, offset: u64, len: usize) -> Result<()> {
        self.ensure_capacity(len)?;
        let block = &mut self.buf.as_mut_slice()[..len];
        input.read_exact(block)?;
        self.dev.write_all_at(block, offset)?;
        self.stats.write_ops += 1;
        self.stats.write_bytes += len as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.dev.sync()?)
    }
}
