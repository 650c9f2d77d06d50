//! Per-channel scatter/gather DMA engines
//!
//! An [`Engine`] owns at most one active transfer. Issue programs the
//! descriptor list and starts the engine; completion is found either by the
//! interrupt demultiplexer calling [`Engine::service`] or by the issuing
//! thread polling the same check. Whichever path (completion or cancel)
//! first claims the transfer's [`Completion`] finalizes it, and always while
//! holding the engine's active-transfer lock.
//!
//! ```text
//! issue ──► Programmed ──► Running ──┬─► Completed   (status DESC_STOPPED, count matches)
//!                                    ├─► Failed      (error bits, short count, poll budget)
//!                                    └─► Cancelled   (RUN cleared, engine idle)
//! ```

pub mod ring;
pub mod transfer;

use crate::config::DriverConfig;
use crate::error::{Result, XdmaError};
use crate::mmio::Mmio;
use crate::perf::{PerfAccumulator, PerfData};
use crate::platform::{Platform, PAGE_SIZE};
use crate::sync::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use xdma_chip::regs::{
    self, control, engine as ereg, irq, perf, sgdma, sgdma_common, status, Alignments, Identifier,
};
use xdma_chip::{Direction, MAX_CHANNELS};

pub use ring::{ConsumeStatus, StreamRing};
pub use transfer::{build_descriptors, Completed, Completion, DmaRequest, TransferState};

use transfer::Transfer;

/// Engine address: channel number and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
    /// Channel number (0..3).
    pub channel: usize,
    /// Transfer direction.
    pub dir: Direction,
}

impl EngineId {
    /// Engine `dir` of `channel`.
    pub const fn new(dir: Direction, channel: usize) -> Self {
        Self { channel, dir }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.dir, self.channel)
    }
}

/// AXI interface behind an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// AXI4 memory mapped: fixed-length transfers to card addresses.
    BlockTransfer,
    /// AXI4-Stream: C2H engines feed a ring instead of serving reads.
    Streaming,
}

bitflags::bitflags! {
    /// Decoded engine status register, for diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EngineStatus: u32 {
        /// Processing descriptors.
        const BUSY = status::BUSY;
        /// Stopped on a STOP descriptor.
        const DESC_STOPPED = status::DESC_STOPPED;
        /// Completed a COMPLETED descriptor.
        const DESC_COMPLETED = status::DESC_COMPLETED;
        /// Source/destination alignment mismatch.
        const ALIGN_MISMATCH = status::ALIGN_MISMATCH;
        /// Descriptor magic mismatch.
        const MAGIC_STOPPED = status::MAGIC_STOPPED;
        /// Invalid descriptor length.
        const INVALID_LENGTH = status::INVALID_LENGTH;
        /// Idle after stop.
        const IDLE_STOPPED = status::IDLE_STOPPED;
        /// Data read/write error.
        const READ_ERROR = status::READ_ERROR;
        /// Descriptor fetch error.
        const DESC_ERROR = status::DESC_ERROR;
    }
}

impl EngineStatus {
    /// Any of the failure bits.
    pub const fn is_error(self) -> bool {
        self.bits() & status::ERROR_MASK != 0
    }
}

// ── Register access ──────────────────────────────────────────────────────────

/// Register windows of one engine inside the config BAR.
#[derive(Debug, Clone)]
pub(crate) struct EngineRegs {
    bar: Arc<dyn Mmio>,
    id: EngineId,
    engine: usize,
    sgdma: usize,
}

impl EngineRegs {
    fn new(bar: Arc<dyn Mmio>, id: EngineId) -> Self {
        Self {
            engine: regs::engine_offset(id.dir, id.channel),
            sgdma: regs::sgdma_offset(id.dir, id.channel),
            bar,
            id,
        }
    }

    pub fn read(&self, reg: usize) -> u32 {
        self.bar.read32(self.engine + reg)
    }

    pub fn write(&self, reg: usize, value: u32) {
        self.bar.write32(self.engine + reg, value);
    }

    pub fn sgdma_write(&self, reg: usize, value: u32) {
        self.bar.write32(self.sgdma + reg, value);
    }

    pub fn set_first_desc(&self, addr: u64) {
        self.bar.write64_split(
            self.sgdma + sgdma::FIRST_DESC_LO,
            self.sgdma + sgdma::FIRST_DESC_HI,
            addr,
        );
        self.sgdma_write(sgdma::FIRST_DESC_ADJACENT, 0);
    }

    pub fn set_credit_mode(&self, on: bool) {
        let reg = if on {
            sgdma_common::CREDIT_MODE_ENABLE_W1S
        } else {
            sgdma_common::CREDIT_MODE_ENABLE_W1C
        };
        self.bar.write32(
            regs::SGDMA_COMMON_BLOCK_OFFSET + reg,
            sgdma_common::credit_bit(self.id.dir, self.id.channel),
        );
    }

    fn set_channel_irq(&self, bit: u32, on: bool) {
        let reg = if on {
            irq::CHANNEL_INT_ENABLE_W1S
        } else {
            irq::CHANNEL_INT_ENABLE_W1C
        };
        self.bar.write32(regs::IRQ_BLOCK_OFFSET + reg, bit);
    }

    fn read64(&self, lo: usize, hi: usize) -> u64 {
        self.bar.read64_split(self.engine + lo, self.engine + hi)
    }

    /// Clear RUN and wait for BUSY to drop. Returns whether the engine went idle.
    pub fn stop(&self, max_polls: u32) -> bool {
        self.write(ereg::CONTROL_W1C, control::RUN);
        let idle = self
            .poll(&PollConfig {
                reg: ereg::STATUS,
                done: |s| s & status::BUSY == 0,
                max_polls,
                yield_interval: 64,
            })
            .is_some();
        // acknowledge whatever the stop left behind
        let _ = self.read(ereg::STATUS_RC);
        idle
    }

    fn poll(&self, cfg: &PollConfig) -> Option<u32> {
        for i in 0..cfg.max_polls {
            let value = self.read(cfg.reg);
            if (cfg.done)(value) {
                return Some(i + 1);
            }
            if i % cfg.yield_interval == 0 {
                std::thread::yield_now();
            }
        }
        None
    }
}

/// Bounded register poll.
struct PollConfig {
    reg: usize,
    done: fn(u32) -> bool,
    max_polls: u32,
    yield_interval: u32,
}

// ── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Active {
    transfer: Transfer,
    completion: Arc<Completion>,
}

#[derive(Debug, Default)]
struct RingSlot {
    opens: usize,
    ring: Option<Arc<StreamRing>>,
}

/// One channel engine.
#[derive(Debug)]
pub struct Engine {
    id: EngineId,
    kind: EngineKind,
    alignments: Alignments,
    irq_bit: u32,
    regs: EngineRegs,
    platform: Arc<dyn Platform>,
    config: DriverConfig,
    poll_mode: AtomicBool,
    non_incr: AtomicBool,
    retired: AtomicBool,
    active: Mutex<Option<Active>>,
    perf: Mutex<PerfAccumulator>,
    ring: Mutex<RingSlot>,
}

impl Engine {
    /// Probe engine `id`. Returns `None` when the hardware does not implement it.
    ///
    /// `h2c_count` is the number of H2C engines already found, which offsets
    /// the channel interrupt bit of C2H engines.
    pub fn probe(
        bar: &Arc<dyn Mmio>,
        id: EngineId,
        h2c_count: usize,
        platform: &Arc<dyn Platform>,
        config: &DriverConfig,
    ) -> Option<Self> {
        let regs = EngineRegs::new(Arc::clone(bar), id);
        let ident = Identifier(regs.read(ereg::IDENTIFIER));
        if !ident.is_xdma() || ident.target() != id.dir as u32 {
            return None;
        }

        let kind = if ident.is_stream() {
            EngineKind::Streaming
        } else {
            EngineKind::BlockTransfer
        };
        let alignments = Alignments::from_raw(regs.read(ereg::ALIGNMENTS));

        // leftovers from a previous owner
        regs.write(ereg::CONTROL_W1C, control::RUN);
        let _ = regs.read(ereg::STATUS_RC);

        tracing::info!(
            "Engine {id}: {kind:?}, alignment addr={} len={} bits={}",
            alignments.address,
            alignments.length,
            alignments.address_bits
        );

        Some(Self {
            id,
            kind,
            alignments,
            irq_bit: irq::channel_bit(id.dir, id.channel, h2c_count),
            regs,
            platform: Arc::clone(platform),
            config: config.clone(),
            poll_mode: AtomicBool::new(config.poll_mode),
            non_incr: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            active: Mutex::new(None),
            perf: Mutex::new(PerfAccumulator::default()),
            ring: Mutex::new(RingSlot::default()),
        })
    }

    /// Engine address.
    pub const fn id(&self) -> EngineId {
        self.id
    }

    /// Memory mapped or streaming.
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Alignment requirements reported by the hardware.
    pub const fn alignments(&self) -> Alignments {
        self.alignments
    }

    /// Bit of this engine in the channel interrupt registers.
    pub const fn irq_bit(&self) -> u32 {
        self.irq_bit
    }

    /// Whether completions are found by polling.
    pub fn poll_mode(&self) -> bool {
        self.poll_mode.load(Ordering::Acquire)
    }

    /// Whether the card-side address stays fixed for a transfer.
    pub fn address_mode(&self) -> bool {
        self.non_incr.load(Ordering::Acquire)
    }

    /// Whether a transfer is currently active.
    pub fn is_busy(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Whether this engine serves reads through a ring.
    pub fn is_stream_c2h(&self) -> bool {
        self.kind == EngineKind::Streaming && self.id.dir == Direction::C2H
    }

    fn max_descriptors(&self) -> usize {
        // one per page when nothing coalesces, plus an unaligned tail
        self.config.max_transfer_size.div_ceil(PAGE_SIZE) + 1
    }

    /// Switch between poll and interrupt completion.
    ///
    /// Poll mode masks the engine's channel interrupt; interrupt mode unmasks it.
    pub fn set_mode(&self, poll: bool) {
        self.poll_mode.store(poll, Ordering::Release);
        self.regs.set_channel_irq(self.irq_bit, !poll);
        tracing::debug!(
            "Engine {}: {} mode",
            self.id,
            if poll { "poll" } else { "interrupt" }
        );
    }

    /// Keep the card-side address fixed (`true`) or incrementing (`false`).
    pub fn set_address_mode(&self, non_incr: bool) {
        self.non_incr.store(non_incr, Ordering::Release);
        let reg = if non_incr {
            ereg::CONTROL_W1S
        } else {
            ereg::CONTROL_W1C
        };
        self.regs.write(reg, control::NON_INCR_ADDR);
        tracing::debug!("Engine {}: non-incrementing address = {non_incr}", self.id);
    }

    /// Clear and start the performance counters.
    pub fn start_perf(&self) {
        self.regs.write(ereg::PERF_CTRL, perf::CLEAR);
        self.regs.write(ereg::PERF_CTRL, perf::AUTO);
        *lock(&self.perf) = PerfAccumulator::default();
        tracing::debug!("Engine {}: performance counters started", self.id);
    }

    /// Current performance counters.
    pub fn perf(&self) -> PerfData {
        let acc = *lock(&self.perf);
        PerfData {
            bytes: acc.bytes,
            elapsed_ns: u64::try_from(acc.elapsed.as_nanos()).unwrap_or(u64::MAX),
            clock_cycles: self.regs.read64(ereg::PERF_CYC_LO, ereg::PERF_CYC_HI),
            data_cycles: self.regs.read64(ereg::PERF_DAT_LO, ereg::PERF_DAT_HI),
        }
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    /// Program and start a transfer of `request` at card address `card_addr`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for zero or oversized length, direction mismatch, a
    /// streaming C2H engine, or a transfer already in flight. `TransferFailed`
    /// if the descriptor list cannot be built. `DeviceGone` after release.
    pub fn issue(self: &Arc<Self>, card_addr: u64, request: DmaRequest) -> Result<TransferHandle> {
        let len = request.len();
        if len == 0 {
            return Err(XdmaError::invalid_request("zero-length transfer"));
        }
        if len > self.config.max_transfer_size {
            return Err(XdmaError::invalid_request(format!(
                "{len} bytes exceeds the {} byte transfer limit",
                self.config.max_transfer_size
            )));
        }
        if request.direction() != self.id.dir {
            return Err(XdmaError::invalid_request(format!(
                "{} request on engine {}",
                request.direction(),
                self.id
            )));
        }
        if self.is_stream_c2h() {
            return Err(XdmaError::invalid_request(format!(
                "engine {} is read through its ring",
                self.id
            )));
        }

        let mut active = lock(&self.active);
        if self.retired.load(Ordering::Acquire) {
            return Err(XdmaError::DeviceGone);
        }
        if active.is_some() {
            return Err(XdmaError::invalid_request(format!(
                "engine {} already has a transfer in flight",
                self.id
            )));
        }

        let mut transfer = Transfer::prepare(
            self.platform.as_ref(),
            &request,
            card_addr,
            self.address_mode(),
            self.max_descriptors(),
        )?;
        let poll = self.poll_mode();
        self.start(&transfer, poll);
        transfer.state = TransferState::Running;

        let completion = Arc::new(Completion::default());
        *active = Some(Active {
            transfer,
            completion: Arc::clone(&completion),
        });

        Ok(TransferHandle {
            engine: Arc::clone(self),
            completion,
            poll,
        })
    }

    fn start(&self, transfer: &Transfer, poll: bool) {
        let _ = self.regs.read(ereg::STATUS_RC);
        self.regs.set_first_desc(transfer.first_desc());

        let mut ctl = control::RUN;
        if self.address_mode() {
            ctl |= control::NON_INCR_ADDR;
        }
        if !poll {
            ctl |= control::IE_ALL;
            self.regs.write(ereg::INT_ENABLE_MASK, control::IE_ALL);
        }
        self.regs.write(ereg::CONTROL, ctl);
        tracing::debug!("Engine {}: started, control={ctl:#x}", self.id);
    }

    /// Inspect the hardware for the active transfer. `None` while running.
    fn check(&self, active: &Active) -> Option<Result<()>> {
        let st = self.regs.read(ereg::STATUS);
        let flags = EngineStatus::from_bits_retain(st);
        if flags.is_error() {
            self.regs.write(ereg::CONTROL_W1C, control::RUN);
            let _ = self.regs.read(ereg::STATUS_RC);
            tracing::warn!("Engine {}: transfer failed, status {flags:?}", self.id);
            return Some(Err(XdmaError::transfer_failed(format!(
                "engine {} reported status {st:#x}",
                self.id
            ))));
        }
        if st & status::BUSY != 0 || st & status::DESC_STOPPED == 0 {
            return None;
        }

        let done = self.regs.read(ereg::COMPLETED_DESC_COUNT) as usize;
        let _ = self.regs.read(ereg::STATUS_RC);
        self.regs.write(ereg::CONTROL_W1C, control::RUN);

        let expected = active.transfer.desc_count;
        if done == expected {
            Some(Ok(()))
        } else {
            Some(Err(XdmaError::transfer_failed(format!(
                "engine {} stopped after {done} of {expected} descriptors",
                self.id
            ))))
        }
    }

    /// Finalize a transfer whose completion token the caller holds.
    fn finish(&self, active: Active, outcome: Result<()>) {
        let Active {
            mut transfer,
            completion,
        } = active;
        let outcome = match outcome {
            Ok(()) => {
                transfer.state = TransferState::Completed;
                lock(&self.perf).record(transfer.len, transfer.started.elapsed());
                Ok(Completed {
                    bytes: transfer.len,
                    data: transfer.read_back(),
                })
            }
            Err(e) => {
                transfer.state = if e.is_cancelled() {
                    TransferState::Cancelled
                } else {
                    TransferState::Failed
                };
                Err(e)
            }
        };
        tracing::debug!(
            "Engine {}: {} bytes at card {:#x} {:?} after {:?}",
            self.id,
            transfer.len,
            transfer.card_addr,
            transfer.state,
            transfer.started.elapsed()
        );
        drop(transfer);
        completion.finish(outcome);
    }

    /// Completion check shared by the interrupt and poll paths.
    ///
    /// With no transfer active the engine status is read-cleared so a stale
    /// interrupt does not fire again.
    pub fn service(&self) {
        let mut active = lock(&self.active);
        let Some(current) = active.as_ref() else {
            let _ = self.regs.read(ereg::STATUS_RC);
            return;
        };
        let Some(outcome) = self.check(current) else {
            return;
        };
        if current.completion.claim() {
            if let Some(done) = active.take() {
                self.finish(done, outcome);
            }
        }
    }

    /// Interrupt entry: ring producer for streaming C2H, completion check otherwise.
    pub(crate) fn on_interrupt(&self) {
        if self.is_stream_c2h() {
            if let Some(ring) = self.ring() {
                ring.produce();
                return;
            }
            let _ = self.regs.read(ereg::STATUS_RC);
            return;
        }
        self.service();
    }

    fn cancel(&self, completion: &Arc<Completion>) -> bool {
        let mut active = lock(&self.active);
        let owns = active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.completion, completion));
        if !owns || !completion.claim() {
            return false;
        }

        let idle = self.regs.stop(self.config.poll_budget);
        let Some(current) = active.take() else {
            return false;
        };
        if idle {
            self.finish(current, Err(XdmaError::Cancelled));
        } else {
            // the engine may still touch the buffers, so they must outlive it
            tracing::warn!(
                "Engine {}: did not go idle on cancel, leaking transfer buffers",
                self.id
            );
            let Active {
                transfer,
                completion,
            } = current;
            std::mem::forget(transfer);
            completion.finish(Err(XdmaError::Cancelled));
        }
        true
    }

    fn poll_until_done(&self, completion: &Arc<Completion>) {
        for i in 0..self.config.poll_budget {
            if completion.is_claimed() {
                return;
            }
            self.service();
            if i % 64 == 0 {
                std::thread::yield_now();
            }
        }

        let mut active = lock(&self.active);
        let owns = active
            .as_ref()
            .is_some_and(|a| Arc::ptr_eq(&a.completion, completion));
        if owns && completion.claim() {
            let idle = self.regs.stop(self.config.poll_budget);
            if let Some(current) = active.take() {
                let err = XdmaError::transfer_failed(format!(
                    "engine {} did not complete within {} polls",
                    self.id, self.config.poll_budget
                ));
                if idle {
                    self.finish(current, Err(err));
                } else {
                    let Active {
                        transfer,
                        completion,
                    } = current;
                    std::mem::forget(transfer);
                    completion.finish(Err(err));
                }
            }
        }
    }

    // ── Streaming ring ───────────────────────────────────────────────────────

    /// Set the ring up on first open; later opens share it.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` on engines without a ring, or the ring allocation error.
    pub fn open_ring(self: &Arc<Self>) -> Result<Arc<StreamRing>> {
        if !self.is_stream_c2h() {
            return Err(XdmaError::invalid_request(format!(
                "engine {} has no streaming ring",
                self.id
            )));
        }
        if self.retired.load(Ordering::Acquire) {
            return Err(XdmaError::DeviceGone);
        }
        let mut slot = lock(&self.ring);
        let ring = match &slot.ring {
            Some(ring) => Arc::clone(ring),
            None => {
                let ring = Arc::new(StreamRing::setup(
                    self.regs.clone(),
                    self.platform.as_ref(),
                    &self.config,
                    self.poll_mode(),
                )?);
                slot.ring = Some(Arc::clone(&ring));
                ring
            }
        };
        slot.opens += 1;
        Ok(ring)
    }

    /// Drop one ring reference; the last one tears the ring down.
    pub fn close_ring(&self) {
        let mut slot = lock(&self.ring);
        slot.opens = slot.opens.saturating_sub(1);
        if slot.opens == 0 {
            if let Some(ring) = slot.ring.take() {
                ring.teardown(self.config.poll_budget);
            }
        }
    }

    /// The ring, while any node has it open.
    pub fn ring(&self) -> Option<Arc<StreamRing>> {
        lock(&self.ring).ring.clone()
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Refuse new work, cancel the active transfer and stop the ring.
    pub(crate) fn retire(&self) {
        let pending = {
            let active = lock(&self.active);
            self.retired.store(true, Ordering::Release);
            active.as_ref().map(|a| Arc::clone(&a.completion))
        };
        if let Some(completion) = pending {
            self.cancel(&completion);
        }
        {
            let mut slot = lock(&self.ring);
            slot.opens = 0;
            if let Some(ring) = slot.ring.take() {
                ring.teardown(self.config.poll_budget);
            }
        }
        self.regs.set_channel_irq(self.irq_bit, false);
        self.regs.write(ereg::CONTROL_W1C, control::RUN | control::IE_ALL);
    }
}

/// Probe every engine the IP may implement, H2C first.
pub fn probe_all(
    bar: &Arc<dyn Mmio>,
    platform: &Arc<dyn Platform>,
    config: &DriverConfig,
) -> Vec<Arc<Engine>> {
    let mut found = Vec::new();
    let mut h2c_count = 0;
    for dir in Direction::ALL {
        for channel in 0..MAX_CHANNELS {
            let id = EngineId::new(dir, channel);
            if let Some(engine) = Engine::probe(bar, id, h2c_count, platform, config) {
                if dir == Direction::H2C {
                    h2c_count += 1;
                }
                found.push(Arc::new(engine));
            }
        }
    }
    tracing::info!("Found {} DMA engine(s)", found.len());
    found
}

// ── Handles ──────────────────────────────────────────────────────────────────

/// Caller's view of an issued transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    engine: Arc<Engine>,
    completion: Arc<Completion>,
    poll: bool,
}

impl TransferHandle {
    /// Engine running the transfer.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Block until the transfer ends.
    ///
    /// In poll mode the calling thread polls engine status; in interrupt mode
    /// it sleeps until the interrupt path publishes the outcome.
    ///
    /// # Errors
    ///
    /// `TransferFailed` for hardware faults and an exhausted poll budget,
    /// `Cancelled` if [`cancel`](Self::cancel) won.
    pub fn wait(&self) -> Result<Completed> {
        if self.poll {
            self.engine.poll_until_done(&self.completion);
        }
        self.completion.wait()
    }

    /// Whether some path has already ended the transfer.
    pub fn is_finished(&self) -> bool {
        self.completion.is_claimed()
    }

    /// Stop the engine and end the transfer as cancelled.
    ///
    /// Returns `false` when the transfer already ended some other way.
    pub fn cancel(&self) -> bool {
        self.engine.cancel(&self.completion)
    }
}
