use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    io,
    ptr::NonNull,
};

use indicatif::{HumanBytes, HumanCount, ProgressBar};
use log::info;

/// Heap buffer whose start address is aligned for `O_DIRECT` transfers.
pub(crate) struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocates `len` zeroed bytes aligned to `alignment` (a power of two).
    pub fn zeroed(alignment: usize, len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(1), alignment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "aligned allocation failed")
        })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Rounds `value` up to a multiple of `unit`.
pub(crate) fn round_up(value: usize, unit: usize) -> usize {
    value.div_ceil(unit) * unit
}

/// Counters for device traffic, logged at the end of a session.
#[derive(Default, Debug, Clone, Copy)]
pub(crate) struct IoStats {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
}

impl IoStats {
    pub fn log(&self, what: &str) {
        if self.read_ops > 0 {
            info!(
                "{}: read {} in {} operations ({} per operation)",
                what,
                HumanBytes(self.read_bytes),
                HumanCount(self.read_ops),
                HumanBytes(self.read_bytes / self.read_ops)
            );
        }
        if self.write_ops > 0 {
            info!(
                "{}: wrote {} in {} operations ({} per operation)",
                what,
                HumanBytes(self.write_bytes),
                HumanCount(self.write_ops),
                HumanBytes(self.write_bytes / self.write_ops)
            );
        }
    }
}

pub(crate) struct SimpleProgress {
    pb: ProgressBar,
    max: u64,
    last: Option<u64>,
}

impl SimpleProgress {
    pub fn new(max: u64) -> Self {
        Self {
            pb: ProgressBar::new(100),
            max,
            last: None,
        }
    }

    pub fn update(&mut self, value: u64) {
        if value > self.max {
            return self.update(self.max);
        }

        let value = match self.max {
            0 => 100,
            max => (value * 100) / max,
        };

        match self.last {
            Some(v) if v == value => {
                // no change
            }
            _ => {
                self.pb.set_position(value);
                self.last = Some(value);
            }
        }
    }

    pub fn finish(self) {
        self.pb.finish();
    }
}
