//! Transfer objects, descriptor lists and the completion token.

use crate::error::{Result, XdmaError};
use crate::platform::{DmaMemory, DmaSegment};
use crate::sync::lock;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;
use xdma_chip::desc::{flags, Descriptor, DESC_SIZE, MAX_DESC_BYTES};
use xdma_chip::Direction;

/// What a DMA request moves.
#[derive(Debug, Clone)]
pub enum DmaRequest {
    /// Host-to-card: these bytes.
    Write(Bytes),
    /// Card-to-host: this many bytes.
    Read(usize),
}

impl DmaRequest {
    /// Byte count of the request.
    pub fn len(&self) -> usize {
        match self {
            Self::Write(b) => b.len(),
            Self::Read(n) => *n,
        }
    }

    /// Whether the request moves nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direction the request needs.
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Write(_) => Direction::H2C,
            Self::Read(_) => Direction::C2H,
        }
    }
}

/// Successful end of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Bytes moved.
    pub bytes: usize,
    /// Data read from the card (empty for writes).
    pub data: Bytes,
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Buffers allocated, descriptors not yet written.
    Initializing,
    /// Descriptor list written to descriptor memory.
    Programmed,
    /// Engine started on the list.
    Running,
    /// Hardware finished the list.
    Completed,
    /// Hardware reported a fault or the poll budget ran out.
    Failed,
    /// Stopped by request.
    Cancelled,
}

/// A scatter/gather job owned by one engine.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub dir: Direction,
    pub len: usize,
    pub card_addr: u64,
    pub data: Arc<dyn DmaMemory>,
    pub descs: Arc<dyn DmaMemory>,
    pub desc_count: usize,
    pub state: TransferState,
    pub started: Instant,
}

impl Transfer {
    /// Bounce buffer plus descriptor list for `request`.
    pub fn prepare(
        platform: &dyn crate::platform::Platform,
        request: &DmaRequest,
        card_addr: u64,
        non_incr: bool,
        max_descs: usize,
    ) -> Result<Self> {
        let len = request.len();
        let data = platform.alloc_dma(len, false)?;
        if let DmaRequest::Write(bytes) = request {
            data.write(0, bytes);
        }

        let dir = request.direction();
        // next pointers are filled in once the list has a bus address
        let mut list = build_descriptors(data.segments(), dir, card_addr, non_incr, max_descs)?;
        let descs = platform.alloc_dma(list.len() * DESC_SIZE, true)?;
        let base = descs
            .bus_addr(0)
            .ok_or_else(|| XdmaError::transfer_failed("descriptor memory has no bus address"))?;
        link(&mut list, base);
        for (i, d) in list.iter().enumerate() {
            descs.write(i * DESC_SIZE, &d.to_bytes());
        }

        tracing::debug!(
            "{dir} transfer: {len} bytes, card {card_addr:#x}, {} descriptor(s) at {base:#x}",
            list.len()
        );

        Ok(Self {
            dir,
            len,
            card_addr,
            data,
            desc_count: list.len(),
            descs,
            state: TransferState::Programmed,
            started: Instant::now(),
        })
    }

    /// Bus address of the first descriptor.
    pub fn first_desc(&self) -> u64 {
        self.descs.bus_addr(0).unwrap_or(0)
    }

    /// Bytes the hardware deposited, for C2H transfers.
    pub fn read_back(&self) -> Bytes {
        if self.dir == Direction::H2C {
            return Bytes::new();
        }
        let mut out = vec![0u8; self.len];
        self.data.read(0, &mut out);
        Bytes::from(out)
    }
}

/// One descriptor per contiguous run, split at [`MAX_DESC_BYTES`].
///
/// The last descriptor carries STOP and COMPLETED. `next` pointers are left
/// zero for [`link`].
///
/// # Errors
///
/// Returns `TransferFailed` if the list would exceed `max_descs`.
pub fn build_descriptors(
    segments: &[DmaSegment],
    dir: Direction,
    card_addr: u64,
    non_incr: bool,
    max_descs: usize,
) -> Result<Vec<Descriptor>> {
    let needed: usize = segments.iter().map(|s| s.len.div_ceil(MAX_DESC_BYTES)).sum();
    if needed == 0 {
        return Err(XdmaError::transfer_failed("empty scatter list"));
    }
    if needed > max_descs {
        return Err(XdmaError::transfer_failed(format!(
            "{needed} descriptors needed, limit is {max_descs}"
        )));
    }

    let mut out = Vec::with_capacity(needed);
    let mut card = card_addr;
    for seg in segments {
        let mut done = 0;
        while done < seg.len {
            let n = (seg.len - done).min(MAX_DESC_BYTES);
            let host = seg.bus_addr + done as u64;
            let (src, dst) = match dir {
                Direction::H2C => (host, card),
                Direction::C2H => (card, host),
            };
            out.push(Descriptor {
                flags: 0,
                next_adjacent: 0,
                len: n as u32,
                src,
                dst,
                next: 0,
            });
            if !non_incr {
                card += n as u64;
            }
            done += n;
        }
    }
    if let Some(last) = out.last_mut() {
        last.flags |= flags::STOP | flags::COMPLETED;
    }
    Ok(out)
}

/// Chain a list stored contiguously at bus address `base`.
pub fn link(list: &mut [Descriptor], base: u64) {
    let n = list.len();
    for (i, d) in list.iter_mut().enumerate() {
        d.next = if i + 1 < n {
            base + ((i + 1) * DESC_SIZE) as u64
        } else {
            0
        };
    }
}

/// Single-owner completion token plus the outcome slot a waiter blocks on.
///
/// The interrupt path, the poll path and the cancel path each try to
/// [`claim`](Self::claim) the token; only the winner may finalize the transfer.
#[derive(Debug, Default)]
pub struct Completion {
    claimed: AtomicBool,
    outcome: Mutex<Option<Result<Completed>>>,
    done: Condvar,
}

impl Completion {
    /// Take the token. Returns `true` for exactly one caller.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether some path already took the token.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Publish the outcome (token holder only).
    pub(crate) fn finish(&self, outcome: Result<Completed>) {
        debug_assert!(self.is_claimed());
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    /// Block until the outcome is published.
    pub(crate) fn wait(&self) -> Result<Completed> {
        let mut slot = lock(&self.outcome);
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::coalesce_pages;

    #[test]
    fn one_descriptor_per_run() {
        let segs = coalesce_pages(&[0x1000, 0x2000, 0x5000], 0x1000, 0x2800);
        let list = build_descriptors(&segs, Direction::H2C, 0x100, false, 16).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!((list[0].src, list[0].dst, list[0].len), (0x1000, 0x100, 0x2000));
        assert_eq!((list[1].src, list[1].dst, list[1].len), (0x5000, 0x2100, 0x800));
        assert!(!list[0].is_stop());
        assert!(list[1].is_stop() && list[1].is_completed());
    }

    #[test]
    fn long_runs_split_at_descriptor_limit() {
        let len = 2 * MAX_DESC_BYTES + 10;
        let segs = [DmaSegment {
            bus_addr: 0x10_0000,
            offset: 0,
            len,
        }];
        let list = build_descriptors(&segs, Direction::C2H, 0, false, 8).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[2].len, 10);
        assert_eq!(list[1].src, MAX_DESC_BYTES as u64);
        assert_eq!(list[2].dst, 0x10_0000 + 2 * MAX_DESC_BYTES as u64);
    }

    #[test]
    fn fixed_card_address_does_not_advance() {
        let segs = coalesce_pages(&[0x1000, 0x3000], 0x1000, 0x2000);
        let list = build_descriptors(&segs, Direction::H2C, 0x40, true, 8).unwrap();
        assert!(list.iter().all(|d| d.dst == 0x40));
    }

    #[test]
    fn too_many_descriptors_fail_before_hardware() {
        let pages: Vec<u64> = (0..10).map(|i| 0x1000 + i * 0x2000).collect();
        let segs = coalesce_pages(&pages, 0x1000, 10 * 0x1000);
        assert!(matches!(
            build_descriptors(&segs, Direction::H2C, 0, false, 4),
            Err(XdmaError::TransferFailed { .. })
        ));
    }

    #[test]
    fn link_chains_and_terminates() {
        let mut list = vec![Descriptor::default(); 3];
        link(&mut list, 0x8000);
        assert_eq!(list[0].next, 0x8020);
        assert_eq!(list[1].next, 0x8040);
        assert_eq!(list[2].next, 0);
    }

    #[test]
    fn token_has_exactly_one_winner() {
        for _ in 0..200 {
            let c = Arc::new(Completion::default());
            let wins: usize = (0..4)
                .map(|_| {
                    let c = Arc::clone(&c);
                    std::thread::spawn(move || usize::from(c.claim()))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum();
            assert_eq!(wins, 1);
        }
    }

    #[test]
    fn waiter_sees_published_outcome() {
        let c = Arc::new(Completion::default());
        let waiter = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || c.wait())
        };
        assert!(c.claim());
        c.finish(Err(XdmaError::Cancelled));
        assert!(waiter.join().unwrap().unwrap_err().is_cancelled());
    }
}
