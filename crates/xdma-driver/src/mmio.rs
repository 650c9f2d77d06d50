//! Memory-mapped register access
//!
//! [`Mmio`] is the register window every other module talks to. Two
//! implementations live here: [`MappedRegion`] (an `mmap` of a device file,
//! sysfs `resourceN` or a VFIO region) and [`RamRegion`] (plain memory, used
//! for user/bypass BARs of the hardware model).
//!
//! All accessors assert bounds and natural alignment. Callers that take
//! offsets from user requests validate them first (see `bar`).

// MMIO registers are naturally aligned (asserted), so pointer casts are sound
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{Result, XdmaError};
use crate::sync::lock;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;
use std::sync::Mutex;

/// A register window.
pub trait Mmio: Send + Sync + std::fmt::Debug {
    /// Length of the window in bytes.
    fn len(&self) -> usize;

    /// Read an 8-bit register.
    fn read8(&self, offset: usize) -> u8;
    /// Read a 16-bit register.
    fn read16(&self, offset: usize) -> u16;
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write an 8-bit register.
    fn write8(&self, offset: usize, value: u8);
    /// Write a 16-bit register.
    fn write16(&self, offset: usize, value: u16);
    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Whether the window is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a 64-bit value split over two 32-bit registers (low first).
    fn read64_split(&self, lo: usize, hi: usize) -> u64 {
        u64::from(self.read32(lo)) | (u64::from(self.read32(hi)) << 32)
    }

    /// Write a 64-bit value split over two 32-bit registers (low first).
    fn write64_split(&self, lo: usize, hi: usize, value: u64) {
        self.write32(lo, value as u32);
        self.write32(hi, (value >> 32) as u32);
    }
}

#[inline]
fn check(offset: usize, width: usize, len: usize) {
    assert!(
        offset.checked_add(width).is_some_and(|end| end <= len) && offset % width == 0,
        "Register access out of bounds or misaligned: offset={offset:#x} width={width} len={len:#x}"
    );
}

/// Mapped device memory
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    label: String,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("label", &self.label)
            .finish()
    }
}

// SAFETY: Send - the mapping is process-wide; moving the owner between threads does
// not invalidate it. No thread-local state.
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a single bounds-checked volatile load or store of a
// naturally aligned register. Concurrent register accesses are allowed by the device.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `file` starting at `offset`.
    ///
    /// The mapping outlives the file descriptor; the caller may close `file`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `len` is zero or `mmap` fails.
    pub fn map(file: &File, offset: u64, len: usize, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        if len == 0 {
            return Err(XdmaError::configuration(format!("{label}: region size is 0")));
        }

        // SAFETY: mmap necessary for MMIO - maps the device region into our address space.
        // Invariants: (1) file is an open descriptor for the region; (2) len > 0 (checked);
        // (3) MAP_SHARED so stores reach the device; (4) result is valid for len bytes or Err.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
        }
        .map_err(|e| XdmaError::configuration(format!("{label}: mmap failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| XdmaError::configuration(format!("{label}: mmap returned null")))?;

        tracing::info!("Mapped {label} at {ptr:p}, size={len:#x}");

        Ok(Self { ptr, len, label })
    }

    /// Human-readable origin of the mapping.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Mmio for MappedRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn read8(&self, offset: usize) -> u8 {
        check(offset, 1, self.len);
        // SAFETY: read_volatile necessary for MMIO - hardware can change the value.
        // Invariants: (1) ptr from mmap, valid for len; (2) offset+1 <= len (asserted).
        unsafe { self.ptr.as_ptr().add(offset).read_volatile() }
    }

    fn read16(&self, offset: usize) -> u16 {
        check(offset, 2, self.len);
        // SAFETY: as read8; offset+2 <= len and offset is 2-aligned (asserted).
        unsafe { self.ptr.as_ptr().add(offset).cast::<u16>().read_volatile() }
    }

    fn read32(&self, offset: usize) -> u32 {
        check(offset, 4, self.len);
        // SAFETY: as read8; offset+4 <= len and offset is 4-aligned (asserted).
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("{}: read32 @ {offset:#x} = {value:#x}", self.label);
        value
    }

    fn write8(&self, offset: usize, value: u8) {
        check(offset, 1, self.len);
        // SAFETY: write_volatile necessary for MMIO - stores have device side effects.
        // Invariants: (1) ptr from mmap, valid for len; (2) offset+1 <= len (asserted).
        unsafe { self.ptr.as_ptr().add(offset).write_volatile(value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        check(offset, 2, self.len);
        // SAFETY: as write8; offset+2 <= len and offset is 2-aligned (asserted).
        unsafe { self.ptr.as_ptr().add(offset).cast::<u16>().write_volatile(value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        check(offset, 4, self.len);
        tracing::trace!("{}: write32 @ {offset:#x} = {value:#x}", self.label);
        // SAFETY: as write8; offset+4 <= len and offset is 4-aligned (asserted).
        unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap of exactly the range returned by mmap in map(); no references
        // into the mapping outlive self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!("{}: munmap failed: {e}", self.label);
        } else {
            tracing::debug!("Unmapped {}", self.label);
        }
    }
}

/// Register window backed by ordinary memory
#[derive(Debug)]
pub struct RamRegion {
    bytes: Mutex<Vec<u8>>,
}

impl RamRegion {
    /// Zero-filled window of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
        }
    }

    fn load<const N: usize>(&self, offset: usize) -> [u8; N] {
        let bytes = lock(&self.bytes);
        check(offset, N, bytes.len());
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[offset..offset + N]);
        out
    }

    fn store<const N: usize>(&self, offset: usize, value: [u8; N]) {
        let mut bytes = lock(&self.bytes);
        check(offset, N, bytes.len());
        bytes[offset..offset + N].copy_from_slice(&value);
    }
}

impl Mmio for RamRegion {
    fn len(&self) -> usize {
        lock(&self.bytes).len()
    }

    fn read8(&self, offset: usize) -> u8 {
        self.load::<1>(offset)[0]
    }

    fn read16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.load(offset))
    }

    fn read32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.load(offset))
    }

    fn write8(&self, offset: usize, value: u8) {
        self.store(offset, [value]);
    }

    fn write16(&self, offset: usize, value: u16) {
        self.store(offset, value.to_le_bytes());
    }

    fn write32(&self, offset: usize, value: u32) {
        self.store(offset, value.to_le_bytes());
    }
}
