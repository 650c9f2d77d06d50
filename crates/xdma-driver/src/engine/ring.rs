//! Streaming C2H descriptor ring
//!
//! `ring_blocks` descriptors form a closed chain; descriptor `i` points the
//! engine at data block `i` and write-back slot `i`. The engine runs in SGDMA
//! credit mode: it may only fill blocks it holds a credit for, and a credit
//! is returned only after the consumer has copied the block out, so the
//! write cursor can never lap the read cursor.
//!
//! ```text
//! data  [blk 0][blk 1] ... [blk n-1]            contiguous, blocks * block_size
//! meta  [desc 0 .. desc n-1][wb 0 .. wb n-1]    contiguous, 32 + 16 bytes per block
//! ```

use super::{EngineRegs, EngineStatus};
use crate::config::DriverConfig;
use crate::error::{Result, XdmaError};
use crate::platform::{DmaMemory, Platform};
use crate::sync::lock;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use xdma_chip::desc::{flags, Descriptor, StreamWriteback, DESC_MAX_LEN, DESC_SIZE, WB_SIZE};
use xdma_chip::regs::{control, engine as ereg, sgdma};

/// How often a poll-mode consumer re-reads the engine.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result of a consume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// This many bytes were copied (at least one).
    Data(usize),
    /// Nothing arrived within the wait bound; retry.
    TimedOut {
        /// Bytes copied before the bound expired.
        copied: usize,
    },
}

impl ConsumeStatus {
    /// Bytes copied either way.
    pub const fn copied(self) -> usize {
        match self {
            Self::Data(n) | Self::TimedOut { copied: n } => n,
        }
    }
}

#[derive(Debug)]
struct RingState {
    /// Completed-descriptor count at the last producer pass.
    seen: u32,
    /// Next block the engine fills.
    head: usize,
    /// Next block the consumer reads.
    tail: usize,
    /// Bytes already consumed from the tail block.
    offset: usize,
    /// Filled blocks not yet fully consumed.
    available: usize,
    lengths: Vec<usize>,
    fault: Option<u32>,
    closed: bool,
}

/// Circular capture buffer of one streaming C2H engine.
#[derive(Debug)]
pub struct StreamRing {
    regs: EngineRegs,
    blocks: usize,
    block_size: usize,
    data: Arc<dyn DmaMemory>,
    meta: Arc<dyn DmaMemory>,
    poll: bool,
    wait_timeout: Duration,
    state: Mutex<RingState>,
    ready: Condvar,
}

impl StreamRing {
    /// Allocate the ring, write the descriptor chain and start the engine.
    pub(crate) fn setup(
        regs: EngineRegs,
        platform: &dyn Platform,
        config: &DriverConfig,
        poll: bool,
    ) -> Result<Self> {
        let blocks = config.ring_blocks;
        let block_size = config.ring_block_size;
        if blocks < 2 || block_size == 0 || block_size > DESC_MAX_LEN as usize {
            return Err(XdmaError::configuration(format!(
                "ring geometry {blocks} x {block_size} is unusable"
            )));
        }

        let data = platform.alloc_dma(blocks * block_size, true)?;
        let meta = platform.alloc_dma(blocks * (DESC_SIZE + WB_SIZE), true)?;
        let (Some(data_base), Some(meta_base)) = (data.bus_addr(0), meta.bus_addr(0)) else {
            return Err(XdmaError::configuration("ring memory has no bus address"));
        };
        let wb_base = meta_base + (blocks * DESC_SIZE) as u64;

        for i in 0..blocks {
            let desc = Descriptor {
                flags: flags::COMPLETED,
                next_adjacent: 0,
                len: block_size as u32,
                src: wb_base + (i * WB_SIZE) as u64,
                dst: data_base + (i * block_size) as u64,
                next: meta_base + (((i + 1) % blocks) * DESC_SIZE) as u64,
            };
            meta.write(i * DESC_SIZE, &desc.to_bytes());
        }
        meta.write(blocks * DESC_SIZE, &vec![0u8; blocks * WB_SIZE]);

        let _ = regs.read(ereg::STATUS_RC);
        regs.set_credit_mode(true);
        regs.set_first_desc(meta_base);
        regs.sgdma_write(sgdma::CREDITS, blocks as u32);

        let mut ctl = control::RUN;
        if !poll {
            ctl |= control::IE_ALL;
            regs.write(ereg::INT_ENABLE_MASK, control::IE_ALL);
        }
        regs.write(ereg::CONTROL, ctl);

        tracing::info!(
            "Ring {}: {blocks} x {block_size} bytes, {} mode",
            regs.id,
            if poll { "poll" } else { "interrupt" }
        );

        Ok(Self {
            regs,
            blocks,
            block_size,
            data,
            meta,
            poll,
            wait_timeout: config.wait_timeout,
            state: Mutex::new(RingState {
                seen: 0,
                head: 0,
                tail: 0,
                offset: 0,
                available: 0,
                lengths: vec![0; blocks],
                fault: None,
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Capacity in bytes.
    pub const fn capacity(&self) -> usize {
        self.blocks * self.block_size
    }

    /// Bytes filled and not yet consumed.
    pub fn buffered(&self) -> usize {
        let st = lock(&self.state);
        (0..st.available)
            .map(|i| st.lengths[(st.tail + i) % self.blocks])
            .sum::<usize>()
            - st.offset
    }

    /// Advance the write cursor over blocks the engine completed.
    pub(crate) fn produce(&self) {
        let mut st = lock(&self.state);
        if st.closed {
            return;
        }

        let stat = self.regs.read(ereg::STATUS_RC);
        if EngineStatus::from_bits_retain(stat).is_error() {
            tracing::warn!(
                "Ring {}: engine status {:?}",
                self.regs.id,
                EngineStatus::from_bits_retain(stat)
            );
            st.fault = Some(stat);
        }

        let count = self.regs.read(ereg::COMPLETED_DESC_COUNT);
        let new = count.wrapping_sub(st.seen) as usize;
        st.seen = count;
        for _ in 0..new {
            let i = st.head;
            let at = self.blocks * DESC_SIZE + i * WB_SIZE;
            let mut slot = [0u8; WB_SIZE];
            self.meta.read(at, &mut slot);
            let len = match StreamWriteback::from_bytes(&slot) {
                Some(wb) => (wb.len as usize).min(self.block_size),
                None => {
                    tracing::warn!("Ring {}: block {i} completed without write-back", self.regs.id);
                    self.block_size
                }
            };
            self.meta.write(at, &[0u8; WB_SIZE]);
            st.lengths[i] = len;
            st.head = (i + 1) % self.blocks;
            st.available += 1;
        }

        if new > 0 || st.fault.is_some() {
            tracing::trace!("Ring {}: +{new} block(s), {} ready", self.regs.id, st.available);
            self.ready.notify_all();
        }
    }

    /// Copy already-captured bytes into `buf`.
    ///
    /// Blocks until at least one byte is available or the configured wait
    /// bound passes. Completed blocks are handed back to the engine.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an empty buffer, `TransferFailed` if the engine
    /// reported a fault, `DeviceGone` if the ring was torn down.
    pub fn consume(&self, buf: &mut [u8]) -> Result<ConsumeStatus> {
        if buf.is_empty() {
            return Err(XdmaError::invalid_request("zero-length read"));
        }
        let deadline = Instant::now() + self.wait_timeout;

        let mut st = lock(&self.state);
        loop {
            if st.closed {
                return Err(XdmaError::DeviceGone);
            }
            if let Some(stat) = st.fault.take() {
                return Err(XdmaError::transfer_failed(format!(
                    "ring {} engine status {stat:#x}",
                    self.regs.id
                )));
            }
            if st.available > 0 {
                let copied = self.copy_out(&mut st, buf);
                if copied > 0 {
                    return Ok(ConsumeStatus::Data(copied));
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ConsumeStatus::TimedOut { copied: 0 });
            }
            if self.poll {
                drop(st);
                self.produce();
                st = lock(&self.state);
                if st.available == 0 && !st.closed {
                    drop(st);
                    std::thread::sleep(POLL_INTERVAL.min(deadline - now));
                    st = lock(&self.state);
                }
            } else {
                st = self
                    .ready
                    .wait_timeout(st, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }

    fn copy_out(&self, st: &mut RingState, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut freed = 0u32;
        while copied < buf.len() && st.available > 0 {
            let i = st.tail;
            let len = st.lengths[i];
            let n = (len - st.offset).min(buf.len() - copied);
            self.data
                .read(i * self.block_size + st.offset, &mut buf[copied..copied + n]);
            st.offset += n;
            copied += n;
            if st.offset == len {
                st.offset = 0;
                st.tail = (i + 1) % self.blocks;
                st.available -= 1;
                freed += 1;
            }
        }
        if freed > 0 {
            self.regs.sgdma_write(sgdma::CREDITS, freed);
        }
        copied
    }

    /// Stop the engine and wake any consumer.
    pub(crate) fn teardown(&self, max_polls: u32) {
        let mut st = lock(&self.state);
        st.closed = true;
        let idle = self.regs.stop(max_polls);
        self.regs.set_credit_mode(false);
        self.regs.write(ereg::CONTROL_W1C, control::IE_ALL);
        self.ready.notify_all();
        drop(st);

        if idle {
            tracing::info!("Ring {} torn down", self.regs.id);
        } else {
            // the engine may still write into the blocks
            tracing::warn!("Ring {}: engine did not stop, leaking ring memory", self.regs.id);
            std::mem::forget(Arc::clone(&self.data));
            std::mem::forget(Arc::clone(&self.meta));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_status_counts() {
        assert_eq!(ConsumeStatus::Data(7).copied(), 7);
        assert_eq!(ConsumeStatus::TimedOut { copied: 0 }.copied(), 0);
    }
}
