//! Descriptor execution and interrupt delivery for the hardware model.
//!
//! Two threads: one walks descriptor chains, one calls the interrupt handler.
//! Neither holds the register-file lock across a handler call or a data copy,
//! so a handler may block on driver state while the engine still finishes its
//! current descriptor.

use super::Shared;
use crate::sync::lock;
use std::sync::{MutexGuard, PoisonError};
use xdma_chip::desc::{Descriptor, StreamWriteback, DESC_SIZE};
use xdma_chip::regs::{control, perf, status};
use xdma_chip::{Direction, MAX_CHANNELS};

use super::regs::SimState;

/// Status bit set for a data-path fault (first bit of the READ_ERROR field).
const DATA_ERROR: u32 = 1 << 9;
/// Status bit set for a descriptor fetch fault (first bit of the DESC_ERROR field).
const FETCH_ERROR: u32 = 1 << 19;

/// Cycle overhead charged per descriptor by the performance counters.
const DESC_OVERHEAD_CYCLES: u64 = 16;
/// Datapath width in bytes (one data cycle moves this much).
const BEAT_BYTES: u64 = 8;

pub(super) fn run_engines(shared: &Shared) {
    let mut st = lock(&shared.state);
    loop {
        if st.shutdown {
            return;
        }
        if let Some((dir, ch)) = next_ready(&mut st) {
            st = step(shared, st, dir, ch);
            drop(st);
            shared.wake.notify_all();
            st = lock(&shared.state);
            continue;
        }
        st = shared.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
    }
}

pub(super) fn run_interrupts(shared: &Shared) {
    let mut st = lock(&shared.state);
    loop {
        if st.shutdown {
            return;
        }
        if st.irq_pending {
            st.irq_pending = false;
            if let Some(handler) = st.handler.clone() {
                st.delivering = true;
                st.delivered_count += 1;
                drop(st);
                handler();
                st = lock(&shared.state);
                st.delivering = false;
                shared.idle.notify_all();
            }
            continue;
        }
        st = shared.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
    }
}

fn next_ready(st: &mut SimState) -> Option<(Direction, usize)> {
    let total = 2 * MAX_CHANNELS;
    for i in 0..total {
        let idx = (st.next_engine + i) % total;
        let (dir, ch) = (Direction::ALL[idx / MAX_CHANNELS], idx % MAX_CHANNELS);
        let credit = st.credit_mode(dir, ch);
        let fifo_empty = st.fifos[ch].is_empty();
        let e = &st.engines[dir.index()][ch];

        let runnable = e.present
            && e.cursor.is_some()
            && !e.in_flight
            && e.control & control::RUN != 0;
        let fed = !(e.stream && dir == Direction::C2H)
            || (!fifo_empty && (!credit || e.credits > 0));

        if runnable && fed {
            st.next_engine = idx + 1;
            return Some((dir, ch));
        }
    }
    None
}

/// What executing a descriptor produced.
enum Moved {
    Bytes(usize),
    /// Stream H2C payload bound for the FIFO.
    Stream(Vec<u8>),
}

fn step<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, SimState>,
    dir: Direction,
    ch: usize,
) -> MutexGuard<'a, SimState> {
    let credit = st.credit_mode(dir, ch);
    let e = st.engine_mut(dir, ch);
    let Some(addr) = e.cursor else {
        return st;
    };
    let stream = e.stream;
    let fixed = e.control & control::NON_INCR_ADDR != 0;

    let mut raw = [0u8; DESC_SIZE];
    if shared.host.read(addr, &mut raw).is_err() {
        tracing::debug!("sim {dir}{ch}: descriptor fetch from unmapped {addr:#x}");
        e.stop(FETCH_ERROR);
        st.update_irq();
        return st;
    }
    let Some(desc) = Descriptor::from_bytes(&raw) else {
        e.stop(status::MAGIC_STOPPED);
        st.update_irq();
        return st;
    };

    e.in_flight = true;
    if stream && dir == Direction::C2H && credit {
        e.credits -= 1;
    }

    // stream C2H takes whatever the FIFO holds, up to the block size
    let payload = (stream && dir == Direction::C2H).then(|| {
        let fifo = &mut st.fifos[ch];
        let n = fifo.len().min(desc.len as usize);
        fifo.drain(..n).collect::<Vec<u8>>()
    });
    let eop = st.fifos[ch].is_empty();
    drop(st);

    let result = execute(shared, dir, (stream, fixed), &desc, payload, eop);
    if !shared.cfg.desc_latency.is_zero() {
        std::thread::sleep(shared.cfg.desc_latency);
    }

    let mut st = lock(&shared.state);
    let e = st.engine_mut(dir, ch);
    e.in_flight = false;

    let mut pushed = None;
    match result {
        Err(bits) => {
            tracing::debug!("sim {dir}{ch}: descriptor at {addr:#x} faulted ({bits:#x})");
            e.stop(bits);
        }
        Ok(moved) => {
            let bytes = match moved {
                Moved::Bytes(n) => n,
                Moved::Stream(data) => {
                    let n = data.len();
                    pushed = Some(data);
                    n
                }
            };
            e.completed = e.completed.wrapping_add(1);
            if e.perf_ctrl & perf::RUN != 0 {
                let beats = (bytes as u64).div_ceil(BEAT_BYTES);
                e.perf_data += beats;
                e.perf_cycles += beats + DESC_OVERHEAD_CYCLES;
            }
            if desc.is_completed() {
                e.status |= status::DESC_COMPLETED;
            }

            if e.control & control::RUN == 0 {
                // stopped while this descriptor was in flight
                e.status &= !status::BUSY;
                e.cursor = None;
            } else if desc.is_stop() || desc.next == 0 {
                e.stop(status::DESC_STOPPED);
            } else {
                e.cursor = Some(desc.next);
            }
        }
    }

    if let Some(data) = pushed {
        st.fifos[ch].extend(data);
    }
    st.update_irq();
    st
}

fn execute(
    shared: &Shared,
    dir: Direction,
    (stream, fixed): (bool, bool),
    desc: &Descriptor,
    payload: Option<Vec<u8>>,
    eop: bool,
) -> Result<Moved, u32> {
    let len = desc.len as usize;

    match (dir, stream) {
        (Direction::H2C, false) => {
            let mut buf = vec![0u8; len];
            shared.host.read(desc.src, &mut buf).map_err(|_| DATA_ERROR)?;
            let mut card = lock(&shared.card);
            if fixed {
                // every beat lands on the same word; the last one stays
                let dst = card_range(desc.dst, BEAT_BYTES as usize, card.len())?;
                if let Some(last) = buf.chunks(BEAT_BYTES as usize).last() {
                    card[dst][..last.len()].copy_from_slice(last);
                }
            } else {
                let dst = card_range(desc.dst, len, card.len())?;
                card[dst].copy_from_slice(&buf);
            }
            Ok(Moved::Bytes(len))
        }
        (Direction::C2H, false) => {
            let buf = {
                let card = lock(&shared.card);
                if fixed {
                    let src = card_range(desc.src, BEAT_BYTES as usize, card.len())?;
                    card[src].iter().copied().cycle().take(len).collect()
                } else {
                    let src = card_range(desc.src, len, card.len())?;
                    card[src].to_vec()
                }
            };
            shared.host.write(desc.dst, &buf).map_err(|_| DATA_ERROR)?;
            Ok(Moved::Bytes(len))
        }
        (Direction::H2C, true) => {
            let mut buf = vec![0u8; len];
            shared.host.read(desc.src, &mut buf).map_err(|_| DATA_ERROR)?;
            Ok(Moved::Stream(buf))
        }
        (Direction::C2H, true) => {
            let data = payload.unwrap_or_default();
            shared.host.write(desc.dst, &data).map_err(|_| DATA_ERROR)?;
            let wb = StreamWriteback {
                eop,
                len: data.len() as u32,
            };
            // for C2H streaming the source field carries the write-back slot
            shared.host.write(desc.src, &wb.to_bytes()).map_err(|_| DATA_ERROR)?;
            Ok(Moved::Bytes(data.len()))
        }
    }
}

fn card_range(addr: u64, len: usize, card_len: usize) -> Result<std::ops::Range<usize>, u32> {
    let start = usize::try_from(addr).map_err(|_| DATA_ERROR)?;
    match start.checked_add(len) {
        Some(end) if end <= card_len => Ok(start..end),
        _ => Err(DATA_ERROR),
    }
}
