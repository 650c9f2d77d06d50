// SPDX-License-Identifier: AGPL-3.0-only

//! In-process model of the XDMA IP
//!
//! `SimPlatform` stands in for a card: it exposes a config BAR with the
//! register map the driver programs, RAM-backed user/bypass BARs, host DMA
//! memory with bus addresses, and worker threads that walk descriptor chains
//! and raise the device interrupt.
//!
//! ```text
//! MM H2C      host ──▶ card memory
//! MM C2H      card memory ──▶ host          (write then read = loopback)
//! Stream H2C  host ──▶ FIFO[ch]
//! Stream C2H  FIFO[ch] ──▶ host block + write-back slot
//! ```
//!
//! DMA that touches a bus address with no live allocation behind it sets an
//! error bit in the engine status instead of touching memory.

mod regs;
mod worker;

use super::{coalesce_pages, DmaMemory, DmaSegment, InterruptHandler, MemoryResource, Platform};
use super::PAGE_SIZE;
use crate::error::{Result, XdmaError};
use crate::mmio::{Mmio, RamRegion};
use crate::sync::lock;
use regs::SimState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use xdma_chip::regs::{IpVersion, CONFIG_BAR_MIN_SIZE};
use xdma_chip::{Direction, MAX_CHANNELS, MAX_USER_IRQ};

/// What a modelled BAR contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBar {
    /// The DMA config register space.
    Config,
    /// Plain memory of the given size (user logic or bypass).
    Ram(usize),
}

/// Interface of one modelled engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimChannel {
    /// Engine not instantiated.
    Absent,
    /// AXI4 memory-mapped engine.
    MemoryMapped,
    /// AXI4-Stream engine.
    Streaming,
}

/// Shape of the modelled card.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// BARs in enumeration order.
    pub bars: Vec<SimBar>,
    /// H2C engine per channel.
    pub h2c: [SimChannel; MAX_CHANNELS],
    /// C2H engine per channel.
    pub c2h: [SimChannel; MAX_CHANNELS],
    /// Identifier version byte.
    pub ip_version: u8,
    /// Card memory reachable by memory-mapped engines.
    pub card_memory: usize,
    /// Time the engine spends on each descriptor.
    pub desc_latency: Duration,
}

impl Default for SimConfig {
    /// User, config and bypass BARs; channel 0 memory-mapped, channel 1 streaming.
    fn default() -> Self {
        use SimChannel::{Absent, MemoryMapped, Streaming};
        Self {
            bars: vec![SimBar::Ram(0x1_0000), SimBar::Config, SimBar::Ram(0x1_0000)],
            h2c: [MemoryMapped, Streaming, Absent, Absent],
            c2h: [MemoryMapped, Streaming, Absent, Absent],
            ip_version: IpVersion::TARGET.raw(),
            card_memory: 16 << 20,
            desc_latency: Duration::ZERO,
        }
    }
}

impl SimConfig {
    /// Replace the BAR layout.
    #[must_use]
    pub fn with_bars(mut self, bars: Vec<SimBar>) -> Self {
        self.bars = bars;
        self
    }

    /// Set one engine.
    #[must_use]
    pub fn with_engine(mut self, dir: Direction, channel: usize, kind: SimChannel) -> Self {
        match dir {
            Direction::H2C => self.h2c[channel] = kind,
            Direction::C2H => self.c2h[channel] = kind,
        }
        self
    }

    /// Set the per-descriptor latency.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.desc_latency = latency;
        self
    }

    /// Set the identifier version byte.
    #[must_use]
    pub const fn with_ip_version(mut self, version: u8) -> Self {
        self.ip_version = version;
        self
    }

    fn engine(&self, dir: Direction, channel: usize) -> SimChannel {
        match dir {
            Direction::H2C => self.h2c[channel],
            Direction::C2H => self.c2h[channel],
        }
    }
}

/// Host memory addressable by the modelled card, one page per entry.
#[derive(Debug, Default)]
pub(crate) struct HostMemory {
    pages: Mutex<HashMap<u64, Box<[u8]>>>,
    next_page: AtomicU64,
}

/// Bus address that has no live allocation behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Unmapped(pub u64);

impl HostMemory {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            // keep bus address 0 unused
            next_page: AtomicU64::new(16),
        }
    }

    fn alloc(&self, len: usize, contiguous: bool) -> Vec<u64> {
        let n = len.max(1).div_ceil(PAGE_SIZE) as u64;
        // non-contiguous allocations leave a hole after every page
        let stride = if contiguous { 1 } else { 2 };
        let first = self.next_page.fetch_add(n * stride + 1, Ordering::Relaxed);
        let frames: Vec<u64> = (0..n).map(|i| first + i * stride).collect();

        let mut pages = lock(&self.pages);
        for &f in &frames {
            pages.insert(f, vec![0u8; PAGE_SIZE].into_boxed_slice());
        }
        frames.into_iter().map(|f| f * PAGE_SIZE as u64).collect()
    }

    fn free(&self, addrs: &[u64]) {
        let mut pages = lock(&self.pages);
        for a in addrs {
            pages.remove(&(a / PAGE_SIZE as u64));
        }
    }

    /// Copy from bus address `addr`.
    pub(crate) fn read(&self, mut addr: u64, buf: &mut [u8]) -> std::result::Result<(), Unmapped> {
        let pages = lock(&self.pages);
        let mut done = 0;
        while done < buf.len() {
            let off = (addr % PAGE_SIZE as u64) as usize;
            let page = pages.get(&(addr / PAGE_SIZE as u64)).ok_or(Unmapped(addr))?;
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&page[off..off + n]);
            done += n;
            addr += n as u64;
        }
        Ok(())
    }

    /// Copy to bus address `addr`.
    pub(crate) fn write(&self, mut addr: u64, data: &[u8]) -> std::result::Result<(), Unmapped> {
        let mut pages = lock(&self.pages);
        // validate first so a fault leaves memory untouched
        let mut probe = addr;
        let end = addr + data.len() as u64;
        while probe < end {
            if !pages.contains_key(&(probe / PAGE_SIZE as u64)) {
                return Err(Unmapped(probe));
            }
            probe = (probe / PAGE_SIZE as u64 + 1) * PAGE_SIZE as u64;
        }
        let mut done = 0;
        while done < data.len() {
            let off = (addr % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - off).min(data.len() - done);
            if let Some(page) = pages.get_mut(&(addr / PAGE_SIZE as u64)) {
                page[off..off + n].copy_from_slice(&data[done..done + n]);
            }
            done += n;
            addr += n as u64;
        }
        Ok(())
    }
}

/// DMA memory handed out by [`SimPlatform`]
#[derive(Debug)]
struct SimDma {
    host: Arc<HostMemory>,
    pages: Vec<u64>,
    segments: Vec<DmaSegment>,
    len: usize,
}

impl DmaMemory for SimDma {
    fn len(&self) -> usize {
        self.len
    }

    fn segments(&self) -> &[DmaSegment] {
        &self.segments
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len, "DMA read out of bounds");
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done;
            let n = (PAGE_SIZE - at % PAGE_SIZE).min(buf.len() - done);
            let bus = self.pages[at / PAGE_SIZE] + (at % PAGE_SIZE) as u64;
            // our own pages stay mapped until drop
            let _ = self.host.read(bus, &mut buf[done..done + n]);
            done += n;
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "DMA write out of bounds");
        let mut done = 0;
        while done < data.len() {
            let at = offset + done;
            let n = (PAGE_SIZE - at % PAGE_SIZE).min(data.len() - done);
            let bus = self.pages[at / PAGE_SIZE] + (at % PAGE_SIZE) as u64;
            let _ = self.host.write(bus, &data[done..done + n]);
            done += n;
        }
    }
}

impl Drop for SimDma {
    fn drop(&mut self) {
        self.host.free(&self.pages);
    }
}

/// State shared between the platform, its BAR windows and the worker threads.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: SimConfig,
    pub(crate) state: Mutex<SimState>,
    /// Wakes the workers on any register, FIFO or interrupt change.
    pub(crate) wake: Condvar,
    /// Signalled when an interrupt handler call returns.
    pub(crate) idle: Condvar,
    pub(crate) host: Arc<HostMemory>,
    pub(crate) card: Mutex<Vec<u8>>,
}

/// Config BAR window of the model
#[derive(Debug)]
struct ConfigBar {
    shared: Arc<Shared>,
    len: usize,
}

impl ConfigBar {
    fn reg(&self, offset: usize) -> u32 {
        lock(&self.shared.state).read(&self.shared.cfg, offset & !3)
    }

    fn set(&self, offset: usize, value: u32) {
        let mut st = lock(&self.shared.state);
        st.write(&self.shared.cfg, offset & !3, value);
        st.update_irq();
        drop(st);
        self.shared.wake.notify_all();
    }
}

impl Mmio for ConfigBar {
    fn len(&self) -> usize {
        self.len
    }

    fn read8(&self, offset: usize) -> u8 {
        (self.reg(offset) >> ((offset & 3) * 8)) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        (self.reg(offset) >> ((offset & 2) * 8)) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "Register offset out of bounds");
        self.reg(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        let shift = (offset & 3) * 8;
        let merged = (self.reg(offset) & !(0xFF << shift)) | (u32::from(value) << shift);
        self.set(offset, merged);
    }

    fn write16(&self, offset: usize, value: u16) {
        let shift = (offset & 2) * 8;
        let merged = (self.reg(offset) & !(0xFFFF << shift)) | (u32::from(value) << shift);
        self.set(offset, merged);
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "Register offset out of bounds");
        self.set(offset, value);
    }
}

/// Hardware model platform
#[derive(Debug)]
pub struct SimPlatform {
    shared: Arc<Shared>,
    bars: Vec<Arc<dyn Mmio>>,
    workers: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
}

/// Size of the modelled config BAR.
const CONFIG_BAR_LEN: usize = 0x1_0000;

impl SimPlatform {
    /// Start a model shaped by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(cfg: SimConfig) -> Result<Arc<Self>> {
        let state = SimState::new(&cfg);
        let shared = Arc::new(Shared {
            card: Mutex::new(vec![0; cfg.card_memory]),
            state: Mutex::new(state),
            wake: Condvar::new(),
            idle: Condvar::new(),
            host: Arc::new(HostMemory::new()),
            cfg,
        });

        debug_assert!(CONFIG_BAR_LEN >= CONFIG_BAR_MIN_SIZE);
        let bars = shared
            .cfg
            .bars
            .iter()
            .map(|b| -> Arc<dyn Mmio> {
                match *b {
                    SimBar::Config => Arc::new(ConfigBar {
                        shared: Arc::clone(&shared),
                        len: CONFIG_BAR_LEN,
                    }),
                    SimBar::Ram(len) => Arc::new(RamRegion::new(len)),
                }
            })
            .collect();

        let mut workers = Vec::with_capacity(2);
        for (name, body) in [
            ("xdma-sim-dma", worker::run_engines as fn(&Shared)),
            ("xdma-sim-irq", worker::run_interrupts as fn(&Shared)),
        ] {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(name.into())
                .spawn(move || body(shared.as_ref()))?;
            workers.push((handle.thread().id(), handle));
        }

        tracing::debug!("Hardware model started: {:?}", shared.cfg.bars);

        Ok(Arc::new(Self {
            shared,
            bars,
            workers: Mutex::new(workers),
        }))
    }

    /// Start a model with [`SimConfig::default`].
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn with_defaults() -> Result<Arc<Self>> {
        Self::new(SimConfig::default())
    }

    /// Shape of the model.
    pub fn config(&self) -> &SimConfig {
        &self.shared.cfg
    }

    /// Assert user interrupt `line`, as user logic would.
    ///
    /// # Panics
    ///
    /// Panics if `line` is not below 16.
    pub fn trigger_user_irq(&self, line: usize) {
        assert!(line < MAX_USER_IRQ, "user interrupt line out of range");
        let mut st = lock(&self.shared.state);
        st.user_request |= 1 << line;
        st.update_irq();
        drop(st);
        self.shared.wake.notify_all();
    }

    /// Feed the C2H stream FIFO of `channel`, as the user logic would.
    pub fn push_stream(&self, channel: usize, data: &[u8]) {
        let mut st = lock(&self.shared.state);
        st.fifos[channel].extend(data.iter().copied());
        drop(st);
        self.shared.wake.notify_all();
    }

    /// Bytes waiting in the stream FIFO of `channel`.
    pub fn stream_backlog(&self, channel: usize) -> usize {
        lock(&self.shared.state).fifos[channel].len()
    }

    /// Copy out of card memory.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside card memory.
    pub fn card_read(&self, addr: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&lock(&self.shared.card)[addr..addr + buf.len()]);
    }

    /// Copy into card memory.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside card memory.
    pub fn card_write(&self, addr: usize, data: &[u8]) {
        lock(&self.shared.card)[addr..addr + data.len()].copy_from_slice(data);
    }

    /// Number of interrupts delivered so far.
    pub fn interrupts_delivered(&self) -> u64 {
        lock(&self.shared.state).delivered_count
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> String {
        "sim".into()
    }

    fn memory_resources(&self) -> Result<Vec<MemoryResource>> {
        Ok(self
            .bars
            .iter()
            .enumerate()
            .map(|(bar, region)| MemoryResource {
                bar,
                start: 0xE000_0000 + (bar as u64) * 0x10_0000,
                len: region.len(),
            })
            .collect())
    }

    fn map(&self, resource: &MemoryResource) -> Result<Arc<dyn Mmio>> {
        self.bars
            .get(resource.bar)
            .cloned()
            .ok_or_else(|| XdmaError::configuration(format!("No BAR{}", resource.bar)))
    }

    fn alloc_dma(&self, len: usize, contiguous: bool) -> Result<Arc<dyn DmaMemory>> {
        if len == 0 {
            return Err(XdmaError::invalid_request("zero-length DMA allocation"));
        }
        let pages = self.shared.host.alloc(len, contiguous);
        let segments = coalesce_pages(&pages, PAGE_SIZE, len);
        Ok(Arc::new(SimDma {
            host: Arc::clone(&self.shared.host),
            pages,
            segments,
            len,
        }))
    }

    fn connect_interrupt(&self, handler: InterruptHandler) -> Result<()> {
        let mut st = lock(&self.shared.state);
        if st.handler.is_some() {
            return Err(XdmaError::invalid_request("interrupt already connected"));
        }
        st.handler = Some(handler);
        st.update_irq();
        drop(st);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn disconnect_interrupt(&self) {
        let me = std::thread::current().id();
        let on_worker = lock(&self.workers).iter().any(|(id, _)| *id == me);
        let mut st = lock(&self.shared.state);
        st.handler = None;
        while st.delivering && !on_worker {
            st = self
                .shared
                .idle
                .wait(st)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

impl Drop for SimPlatform {
    fn drop(&mut self) {
        lock(&self.shared.state).shutdown = true;
        self.shared.wake.notify_all();
        let me = std::thread::current().id();
        for (id, handle) in lock(&self.workers).drain(..) {
            // the last reference can be dropped from inside an interrupt handler
            if id != me && handle.join().is_err() {
                tracing::warn!("Hardware model worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xdma_chip::regs::{self as r, Identifier};

    #[test]
    fn host_memory_faults_on_freed_pages() {
        let sim = SimPlatform::with_defaults().unwrap();
        let dma = sim.alloc_dma(3 * PAGE_SIZE, false).unwrap();
        assert_eq!(dma.segments().len(), 3);
        let addr = dma.bus_addr(0).unwrap();

        dma.write(PAGE_SIZE - 2, &[1, 2, 3, 4]);
        let mut back = [0u8; 4];
        dma.read(PAGE_SIZE - 2, &mut back);
        assert_eq!(back, [1, 2, 3, 4]);

        drop(dma);
        assert_eq!(sim.shared.host.read(addr, &mut back), Err(Unmapped(addr)));
    }

    #[test]
    fn contiguous_allocation_is_one_segment() {
        let sim = SimPlatform::with_defaults().unwrap();
        let dma = sim.alloc_dma(5 * PAGE_SIZE + 7, true).unwrap();
        assert_eq!(dma.segments().len(), 1);
        assert_eq!(dma.segments()[0].len, 5 * PAGE_SIZE + 7);
    }

    #[test]
    fn config_bar_identifies_blocks() {
        let sim = SimPlatform::with_defaults().unwrap();
        let res = sim.memory_resources().unwrap();
        let bar = sim.map(&res[1]).unwrap();

        assert!(Identifier(bar.read32(r::IRQ_BLOCK_OFFSET)).is_xdma());
        assert!(Identifier(bar.read32(r::CONFIG_BLOCK_OFFSET)).is_xdma());
        let c2h1 = Identifier(bar.read32(r::engine_offset(Direction::C2H, 1)));
        assert!(c2h1.is_stream());
        assert_eq!(c2h1.target(), r::target::C2H);
        assert_eq!(bar.read32(r::engine_offset(Direction::H2C, 2)), 0);

        let user = sim.map(&res[0]).unwrap();
        assert!(!Identifier(user.read32(r::IRQ_BLOCK_OFFSET)).is_xdma());
    }

    #[test]
    fn status_read_clear() {
        let sim = SimPlatform::with_defaults().unwrap();
        let bar = sim.map(&sim.memory_resources().unwrap()[1]).unwrap();
        let eng = r::engine_offset(Direction::H2C, 0);

        lock(&sim.shared.state).engine_mut(Direction::H2C, 0).status = r::status::DESC_STOPPED;
        assert_eq!(bar.read32(eng + r::engine::STATUS_RC), r::status::DESC_STOPPED);
        assert_eq!(bar.read32(eng + r::engine::STATUS), 0);
    }
}
