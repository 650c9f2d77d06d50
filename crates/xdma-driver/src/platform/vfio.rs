//! VFIO platform: BARs, pinned DMA memory and MSI through `vfio-pci`
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Function bound to `vfio-pci` (see [`bind_to_vfio`])
//! 3. Access to `/dev/vfio/$IOMMU_GROUP`
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ XdmaDevice  │────▶│  VFIO API   │────▶│   IOMMU     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │ eventfd           ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ irq thread  │◀────│ MSI vector  │     │  XDMA IP    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! VFIO ioctls use libc: they are all `_IO` numbers with struct, int or
//! C-string arguments, which rustix does not wrap.

// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use super::{DmaMemory, DmaSegment, InterruptHandler, MemoryResource, Platform, PAGE_SIZE};
use crate::error::{Result, XdmaError};
use crate::mmio::{MappedRegion, Mmio};
use crate::sync::lock;
use rustix::event::{eventfd, EventfdFlags};
use rustix::mm::{mlock, munlock};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// All VFIO ioctls are `_IO(';', VFIO_BASE + n)`.
mod ioctls {
    use std::os::raw::c_ulong;

    /// Helper to create ioctl number: _IO(type, nr) = (type << 8) | nr
    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_REGION_INFO_FLAG_MMAP: u32 = 1 << 2;

    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;

    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// `struct vfio_irq_set` with room for one eventfd.
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    data: [i32; 1],
}

/// First IOVA handed out.
const IOVA_BASE: u64 = 0x1000_0000;

// ── IOVA space ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct IovaSpace {
    /// Start of the never-used tail.
    next: u64,
    /// Freed ranges below `next`, start -> length, never adjacent.
    free: BTreeMap<u64, u64>,
}

/// Device address ranges for DMA buffers.
///
/// Freed ranges are reused first-fit and merged with their neighbours; a
/// range that ends at the tail shrinks the tail instead.
#[derive(Debug)]
struct IovaAllocator {
    space: Mutex<IovaSpace>,
}

impl IovaAllocator {
    fn new(base: u64) -> Self {
        Self {
            space: Mutex::new(IovaSpace {
                next: base,
                free: BTreeMap::new(),
            }),
        }
    }

    fn alloc(&self, size: u64) -> u64 {
        let mut sp = lock(&self.space);
        let hit = sp
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = hit {
            sp.free.remove(&start);
            if len > size {
                sp.free.insert(start + size, len - size);
            }
            return start;
        }
        let start = sp.next;
        sp.next += size;
        start
    }

    fn release(&self, start: u64, size: u64) {
        let mut sp = lock(&self.space);
        let (mut start, mut size) = (start, size);
        if let Some(len) = sp.free.remove(&(start + size)) {
            size += len;
        }
        let before = sp
            .free
            .range(..start)
            .next_back()
            .map(|(&prev, &len)| (prev, len));
        if let Some((prev, len)) = before {
            if prev + len == start {
                sp.free.remove(&prev);
                start = prev;
                size += len;
            }
        }
        if start + size == sp.next {
            sp.next = start;
        } else {
            sp.free.insert(start, size);
        }
    }
}

// ── DMA buffers ──────────────────────────────────────────────────────────────

/// Page-aligned, pinned host memory mapped into the IOMMU
#[derive(Debug)]
pub struct DmaBuffer {
    vaddr: *mut u8,
    size: usize,
    segments: [DmaSegment; 1],
    container: Arc<File>,
    iova_space: Arc<IovaAllocator>,
}

impl DmaBuffer {
    fn new(container: Arc<File>, iova_space: Arc<IovaAllocator>, size: usize) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| XdmaError::transfer_failed(format!("Invalid DMA buffer layout: {e}")))?;

        // SAFETY: Raw alloc_zeroed necessary for page-aligned DMA memory. Invariants:
        // (1) Layout from from_size_align, size > 0 (rounded up by caller), align 4096;
        // (2) returns valid ptr for layout.size() bytes or null; (3) dealloc in Drop.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(XdmaError::transfer_failed("Failed to allocate DMA buffer"));
        }

        // SAFETY: mlock keeps the pages resident while the device may address them.
        // Invariants: (1) vaddr valid for size bytes; (2) range entirely within allocation.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: vaddr allocated above with layout; no other references exist.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            return Err(XdmaError::transfer_failed(format!(
                "Failed to lock DMA memory: {e}"
            )));
        }

        let iova = iova_space.alloc(size as u64);
        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };

        // SAFETY: VFIO_IOMMU_MAP_DMA ioctl - kernel maps [vaddr, vaddr+size) at iova.
        // Invariants: (1) container fd valid and has an IOMMU set; (2) dma_map fully
        // initialized from our allocation; (3) layout matches the kernel struct.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            tracing::warn!("DMA map failed: {err} (ret={ret})");
            // SAFETY: vaddr allocated and mlock'd above; unwind both before returning.
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            };
            iova_space.release(iova, size as u64);
            return Err(XdmaError::transfer_failed(format!("Failed to map DMA: {err}")));
        }

        tracing::debug!("Created DMA buffer: vaddr={vaddr:p}, iova={iova:#x}, size={size:#x}");

        Ok(Self {
            vaddr,
            size,
            segments: [DmaSegment {
                bus_addr: iova,
                offset: 0,
                len: size,
            }],
            container,
            iova_space,
        })
    }

    /// Device-visible address.
    pub const fn iova(&self) -> u64 {
        self.segments[0].bus_addr
    }
}

impl DmaMemory for DmaBuffer {
    fn len(&self) -> usize {
        self.size
    }

    fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.size, "DMA read out of bounds");
        // SAFETY: (1) vaddr valid for size bytes; (2) offset+len <= size (asserted);
        // (3) buf is a distinct caller allocation, so no overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(self.vaddr.add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size, "DMA write out of bounds");
        // SAFETY: as read; the destination range lies inside our allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.vaddr.add(offset), data.len());
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova(),
            size: self.size as u64,
        };

        // SAFETY: VFIO_IOMMU_UNMAP_DMA ioctl - removes our IOVA range before the memory
        // is freed. Invariants: (1) container fd valid (Arc held); (2) iova/size match map.
        unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            );
        }

        // SAFETY: munlock matches the mlock in new().
        unsafe {
            let _ = munlock(self.vaddr.cast(), self.size);
        };

        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, PAGE_SIZE) {
            // SAFETY: dealloc matches alloc_zeroed in new() with the same layout; the
            // device can no longer reach the pages (unmapped above).
            unsafe { std::alloc::dealloc(self.vaddr, layout) };
        }
        self.iova_space.release(self.iova(), self.size as u64);

        tracing::debug!("Freed DMA buffer at iova={:#x}", self.iova());
    }
}

// SAFETY: DmaBuffer owns its allocation; the raw pointer is only dereferenced through
// bounds-checked copies.
unsafe impl Send for DmaBuffer {}

// SAFETY: concurrent copies to disjoint or overlapping ranges race only with the device
// itself, which is the DMA contract; no Rust references into the memory are handed out.
unsafe impl Sync for DmaBuffer {}

struct IrqThread {
    stop: Arc<AtomicBool>,
    efd: Arc<OwnedFd>,
    join: JoinHandle<()>,
}

/// VFIO container, group and device for one function
pub struct VfioPlatform {
    address: String,
    container: Arc<File>,
    #[allow(dead_code)] // Needed for VFIO lifetime
    group: File,
    device: File,
    iova_space: Arc<IovaAllocator>,
    irq: Mutex<Option<IrqThread>>,
}

impl std::fmt::Debug for VfioPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfioPlatform")
            .field("address", &self.address)
            .field("iova_space", &self.iova_space)
            .finish_non_exhaustive()
    }
}

impl VfioPlatform {
    /// Open the function at `address` through VFIO.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any VFIO step fails.
    pub fn open(address: &str) -> Result<Self> {
        tracing::info!("Opening {address} through VFIO");

        let iommu_group = iommu_group(address)?;
        tracing::debug!("IOMMU group: {iommu_group}");

        let container = open_rw("/dev/vfio/vfio")?;

        // SAFETY: VFIO_GET_API_VERSION takes no argument and returns the version or -errno.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(XdmaError::configuration(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: VFIO_CHECK_EXTENSION takes an extension id by value; returns 1 if supported.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(XdmaError::configuration("VFIO Type1v2 IOMMU not supported"));
        }

        let group = open_rw(&format!("/dev/vfio/{iommu_group}"))?;

        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: VFIO_GROUP_GET_STATUS fills group_status; argsz set, layout matches kernel.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };
        if ret < 0 || (group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE) == 0 {
            return Err(XdmaError::configuration(
                "VFIO group not viable (all functions in the group must be bound to vfio-pci)",
            ));
        }

        // SAFETY: VFIO_GROUP_SET_CONTAINER reads an int fd through the pointer.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to set container"));
        }

        // SAFETY: VFIO_SET_IOMMU takes the IOMMU type by value; group is attached.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to set IOMMU"));
        }

        let address_cstr = std::ffi::CString::new(address)
            .map_err(|e| XdmaError::invalid_parameter(format!("Invalid PCIe address: {e}")))?;

        // SAFETY: VFIO_GROUP_GET_DEVICE_FD reads a NUL-terminated name; returns fd or -1.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                address_cstr.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(last_os_error("Failed to get device fd"));
        }

        // SAFETY: device_fd >= 0 was just returned to us; File takes sole ownership.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut device_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: VFIO_DEVICE_GET_INFO fills device_info; argsz set, layout matches kernel.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut device_info,
            )
        };
        if ret < 0 {
            return Err(last_os_error("Failed to get device info"));
        }

        tracing::info!(
            "VFIO device {address}: {} regions, {} IRQs",
            device_info.num_regions,
            device_info.num_irqs
        );

        Ok(Self {
            address: address.to_string(),
            container: Arc::new(container),
            group,
            device,
            iova_space: Arc::new(IovaAllocator::new(IOVA_BASE)),
            irq: Mutex::new(None),
        })
    }

    fn region_info(&self, index: u32) -> Result<VfioRegionInfo> {
        let mut info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: VFIO_DEVICE_GET_REGION_INFO fills info for `index`; argsz set.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut info,
            )
        };
        if ret < 0 {
            return Err(last_os_error(&format!("Failed to get BAR{index} info")));
        }
        Ok(info)
    }

    fn set_msi(&self, fd: Option<i32>) -> Result<()> {
        let irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags: ioctls::VFIO_IRQ_SET_ACTION_TRIGGER
                | if fd.is_some() {
                    ioctls::VFIO_IRQ_SET_DATA_EVENTFD
                } else {
                    ioctls::VFIO_IRQ_SET_DATA_NONE
                },
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count: u32::from(fd.is_some()),
            data: [fd.unwrap_or(-1)],
        };
        // SAFETY: VFIO_DEVICE_SET_IRQS reads irq_set and `count` trailing fds; count <= 1
        // and data holds one slot.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };
        if ret < 0 {
            return Err(last_os_error("VFIO_DEVICE_SET_IRQS failed"));
        }
        Ok(())
    }
}

impl Platform for VfioPlatform {
    fn name(&self) -> String {
        format!("vfio:{}", self.address)
    }

    fn memory_resources(&self) -> Result<Vec<MemoryResource>> {
        let mut out = Vec::new();
        for bar in 0..6u32 {
            let info = self.region_info(bar)?;
            if info.size == 0 || info.flags & ioctls::VFIO_REGION_INFO_FLAG_MMAP == 0 {
                continue;
            }
            tracing::debug!(
                "BAR{bar}: size={:#x}, offset={:#x}, flags={:#x}",
                info.size,
                info.offset,
                info.flags
            );
            out.push(MemoryResource {
                bar: bar as usize,
                start: info.offset,
                len: info.size as usize,
            });
        }
        Ok(out)
    }

    fn map(&self, resource: &MemoryResource) -> Result<Arc<dyn Mmio>> {
        // `start` is the region offset within the device fd
        let region = MappedRegion::map(
            &self.device,
            resource.start,
            resource.len,
            format!("{} BAR{}", self.address, resource.bar),
        )?;
        Ok(Arc::new(region))
    }

    fn alloc_dma(&self, len: usize, _contiguous: bool) -> Result<Arc<dyn DmaMemory>> {
        // IOVA space is contiguous regardless of the backing pages
        let size = len.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        Ok(Arc::new(DmaBuffer::new(
            Arc::clone(&self.container),
            Arc::clone(&self.iova_space),
            size,
        )?))
    }

    fn connect_interrupt(&self, handler: InterruptHandler) -> Result<()> {
        let mut slot = lock(&self.irq);
        if slot.is_some() {
            return Err(XdmaError::invalid_request("interrupt already connected"));
        }

        let efd = Arc::new(
            eventfd(0, EventfdFlags::CLOEXEC)
                .map_err(|e| XdmaError::configuration(format!("eventfd failed: {e}")))?,
        );
        self.set_msi(Some(efd.as_raw_fd()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let (stop, efd) = (Arc::clone(&stop), Arc::clone(&efd));
            std::thread::Builder::new()
                .name(format!("xdma-irq-{}", self.address))
                .spawn(move || {
                    let mut buf = [0u8; 8];
                    while !stop.load(Ordering::Acquire) {
                        match rustix::io::read(&*efd, &mut buf) {
                            Ok(8) if !stop.load(Ordering::Acquire) => handler(),
                            Ok(_) => {}
                            Err(rustix::io::Errno::INTR) => {}
                            Err(e) => {
                                tracing::error!("eventfd read failed: {e}");
                                break;
                            }
                        }
                    }
                })?
        };

        tracing::info!("MSI routed to eventfd for {}", self.address);
        *slot = Some(IrqThread { stop, efd, join });
        Ok(())
    }

    fn disconnect_interrupt(&self) {
        let Some(irq) = lock(&self.irq).take() else {
            return;
        };
        if let Err(e) = self.set_msi(None) {
            tracing::warn!("Disabling MSI: {e}");
        }
        irq.stop.store(true, Ordering::Release);
        let _ = rustix::io::write(&*irq.efd, &1u64.to_ne_bytes());
        if irq.join.join().is_err() {
            tracing::warn!("Interrupt thread panicked");
        }
    }
}

impl Drop for VfioPlatform {
    fn drop(&mut self) {
        self.disconnect_interrupt();
    }
}

fn open_rw(path: &str) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| XdmaError::configuration(format!("Cannot open {path}: {e}")))
}

fn last_os_error(what: &str) -> XdmaError {
    XdmaError::configuration(format!("{what}: {}", std::io::Error::last_os_error()))
}

// ── VFIO binding helpers ──────────────────────────────────────────────────────

/// Bind a function to `vfio-pci` through `driver_override`.
///
/// Requires root or `CAP_SYS_ADMIN`.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(address: &str) -> Result<()> {
    tracing::info!("Binding {address} to vfio-pci");
    let dev = format!("/sys/bus/pci/devices/{address}");

    let driver_unbind = format!("{dev}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, address).map_err(|e| {
            XdmaError::configuration(format!("Cannot unbind {address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    std::fs::write(format!("{dev}/driver_override"), "vfio-pci")
        .map_err(|e| XdmaError::configuration(format!("Cannot set driver_override: {e}")))?;
    std::fs::write("/sys/bus/pci/drivers_probe", address)
        .map_err(|e| XdmaError::configuration(format!("Cannot probe {address}: {e}")))?;

    tracing::info!("{address} bound to vfio-pci");
    Ok(())
}

/// Release a function from `vfio-pci` and let the kernel pick a driver again.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(address: &str) -> Result<()> {
    let dev = format!("/sys/bus/pci/devices/{address}");
    std::fs::write("/sys/bus/pci/drivers/vfio-pci/unbind", address)
        .map_err(|e| XdmaError::configuration(format!("Cannot unbind from vfio-pci: {e}")))?;
    std::fs::write(format!("{dev}/driver_override"), "\n")
        .map_err(|e| XdmaError::configuration(format!("Cannot clear driver_override: {e}")))?;
    let _ = std::fs::write("/sys/bus/pci/drivers_probe", address);
    tracing::info!("{address} released from vfio-pci");
    Ok(())
}

/// IOMMU group number of a function.
///
/// # Errors
///
/// Returns an error if the `iommu_group` link is missing (IOMMU disabled).
pub fn iommu_group(address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        XdmaError::configuration(format!(
            "Cannot read IOMMU group for {address}: {e}. Is IOMMU enabled?"
        ))
    })?;

    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| {
            XdmaError::configuration(format!("Cannot parse IOMMU group from {target:?}"))
        })?;

    tracing::debug!("{address} → IOMMU group {group}");
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers() {
        assert_eq!(ioctls::VFIO_GET_API_VERSION, 0x3b64);
        assert_eq!(ioctls::VFIO_DEVICE_GET_REGION_INFO, 0x3b6c);
        assert_eq!(ioctls::VFIO_DEVICE_SET_IRQS, 0x3b6e);
        assert_eq!(ioctls::VFIO_IOMMU_MAP_DMA, 0x3b71);
    }

    #[test]
    fn irq_set_layout_matches_kernel() {
        // five u32 header fields followed by the fd array
        assert_eq!(std::mem::size_of::<VfioIrqSet>(), 24);
        assert_eq!(std::mem::size_of::<VfioRegionInfo>(), 32);
    }

    #[test]
    fn freed_iova_ranges_are_reused() {
        let space = IovaAllocator::new(IOVA_BASE);
        let a = space.alloc(0x2000);
        let b = space.alloc(0x1000);
        let c = space.alloc(0x3000);
        assert_eq!((a, b, c), (IOVA_BASE, IOVA_BASE + 0x2000, IOVA_BASE + 0x3000));

        // a hole is filled first-fit and split
        space.release(a, 0x2000);
        assert_eq!(space.alloc(0x1000), a);
        assert_eq!(space.alloc(0x1000), a + 0x1000);

        // freeing everything merges back into an empty space
        space.release(b, 0x1000);
        space.release(a, 0x1000);
        space.release(a + 0x1000, 0x1000);
        space.release(c, 0x3000);
        let sp = lock(&space.space);
        assert!(sp.free.is_empty());
        assert_eq!(sp.next, IOVA_BASE);
    }

    #[test]
    fn steady_traffic_stays_in_bounded_iova_space() {
        let space = IovaAllocator::new(IOVA_BASE);
        for i in 0..10_000u64 {
            let data = space.alloc(0x1000 * (1 + i % 7));
            let desc = space.alloc(0x1000);
            space.release(data, 0x1000 * (1 + i % 7));
            space.release(desc, 0x1000);
        }
        assert_eq!(lock(&space.space).next, IOVA_BASE);
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_bound_function() {
        let address = std::env::var("XDMA_TEST_ADDR").unwrap_or_else(|_| "0000:01:00.0".into());
        let platform = VfioPlatform::open(&address).unwrap();
        let bars = platform.memory_resources().unwrap();
        assert!(!bars.is_empty());
        let dma = platform.alloc_dma(4096, true).unwrap();
        dma.write(0, &[1, 2, 3]);
        let mut back = [0u8; 3];
        dma.read(0, &mut back);
        assert_eq!(back, [1, 2, 3]);
    }
}
