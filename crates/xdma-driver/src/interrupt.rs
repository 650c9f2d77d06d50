//! Interrupt demultiplexing and user event lines
//!
//! The device raises one interrupt. [`IrqController::handle`] reads the
//! pending user and channel lines, masks them, dispatches each to its
//! [`IrqTarget`], and unmasks them again:
//!
//! ```text
//! USER_INT_PENDING    bit n  ──► EventLine n      (pulse)
//! CHANNEL_INT_PENDING bit k  ──► Engine           (completion check)
//!                            └─► Engine's ring    (producer pass)
//! ```

use crate::engine::Engine;
use crate::error::{Result, XdmaError};
use crate::mmio::Mmio;
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use xdma_chip::regs::{irq, IRQ_BLOCK_OFFSET};
use xdma_chip::MAX_USER_IRQ;

/// All user lines.
const USER_LINES: u32 = (1 << MAX_USER_IRQ) - 1;

// ── Event lines ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct EventState {
    next_ticket: u64,
    /// Blocked readers, oldest first.
    waiting: VecDeque<u64>,
    /// Readers a pulse has released that have not woken yet.
    released: Vec<u64>,
    closed: bool,
}

/// Pulse-style notification for one user interrupt line.
///
/// A pulse releases the oldest reader blocked when it fires and leaves
/// nothing behind: with no reader the pulse is lost, and a reader that
/// arrives later never sees it.
#[derive(Debug)]
pub struct EventLine {
    line: usize,
    state: Mutex<EventState>,
    cv: Condvar,
}

impl EventLine {
    /// Line `line`, nobody waiting.
    pub fn new(line: usize) -> Self {
        Self {
            line,
            state: Mutex::new(EventState::default()),
            cv: Condvar::new(),
        }
    }

    /// Line number.
    pub const fn line(&self) -> usize {
        self.line
    }

    /// Release one waiter, if any.
    pub fn pulse(&self) {
        let mut st = lock(&self.state);
        let Some(ticket) = st.waiting.pop_front() else {
            tracing::trace!("Event {}: no waiter, pulse dropped", self.line);
            return;
        };
        st.released.push(ticket);
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for the next pulse. Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// `DeviceGone` if the line is closed while waiting.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.state);
        if st.closed {
            return Err(XdmaError::DeviceGone);
        }
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.waiting.push_back(ticket);

        loop {
            if let Some(at) = st.released.iter().position(|&t| t == ticket) {
                st.released.swap_remove(at);
                return Ok(true);
            }
            let now = Instant::now();
            if st.closed || now >= deadline {
                st.waiting.retain(|&t| t != ticket);
                return if st.closed {
                    Err(XdmaError::DeviceGone)
                } else {
                    Ok(false)
                };
            }
            st = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Fail current and future waits.
    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.cv.notify_all();
    }
}

// ── Demultiplexer ────────────────────────────────────────────────────────────

/// Handler bound to one interrupt source.
#[derive(Debug, Clone)]
pub enum IrqTarget {
    /// Block-transfer engine: run the completion check.
    Engine(Arc<Engine>),
    /// Streaming C2H engine: advance its ring.
    Ring(Arc<Engine>),
    /// User line: pulse the event.
    Event(Arc<EventLine>),
}

impl IrqTarget {
    fn dispatch(&self) {
        match self {
            Self::Engine(engine) => engine.service(),
            Self::Ring(engine) => engine.on_interrupt(),
            Self::Event(event) => event.pulse(),
        }
    }

    /// Whether the source stays unmasked after service.
    fn rearm(&self) -> bool {
        match self {
            Self::Engine(engine) | Self::Ring(engine) => !engine.poll_mode(),
            Self::Event(_) => true,
        }
    }
}

/// IRQ block owner and interrupt handler.
#[derive(Debug)]
pub struct IrqController {
    bar: Arc<dyn Mmio>,
    channels: Vec<(u32, IrqTarget)>,
    users: Vec<IrqTarget>,
}

impl IrqController {
    /// Dispatch table for `engines` and `events` (indexed by line).
    pub fn new(bar: Arc<dyn Mmio>, engines: &[Arc<Engine>], events: &[Arc<EventLine>]) -> Self {
        let channels = engines
            .iter()
            .map(|e| {
                let target = if e.is_stream_c2h() {
                    IrqTarget::Ring(Arc::clone(e))
                } else {
                    IrqTarget::Engine(Arc::clone(e))
                };
                (e.irq_bit(), target)
            })
            .collect();
        let users = events
            .iter()
            .map(|e| IrqTarget::Event(Arc::clone(e)))
            .collect();
        Self {
            bar,
            channels,
            users,
        }
    }

    fn read(&self, reg: usize) -> u32 {
        self.bar.read32(IRQ_BLOCK_OFFSET + reg)
    }

    fn write(&self, reg: usize, value: u32) {
        self.bar.write32(IRQ_BLOCK_OFFSET + reg, value);
    }

    /// Route every user and channel line to vector 0.
    pub fn program_vectors(&self) {
        for i in 0..irq::USER_VECTOR_COUNT {
            self.write(irq::USER_VECTOR_BASE + 4 * i, 0);
        }
        for i in 0..irq::CHANNEL_VECTOR_COUNT {
            self.write(irq::CHANNEL_VECTOR_BASE + 4 * i, 0);
        }
    }

    /// Unmask all user lines.
    pub fn enable_user(&self) {
        self.write(irq::USER_INT_ENABLE_W1S, USER_LINES);
    }

    /// Mask every user and channel line.
    pub fn mask_all(&self) {
        self.write(irq::USER_INT_ENABLE_W1C, u32::MAX);
        self.write(irq::CHANNEL_INT_ENABLE_W1C, u32::MAX);
    }

    /// Service one device interrupt.
    pub fn handle(&self) {
        let user = self.read(irq::USER_INT_PENDING) & USER_LINES;
        let chan = self.read(irq::CHANNEL_INT_PENDING);
        tracing::trace!("IRQ: user={user:#x} channel={chan:#x}");

        if chan != 0 {
            self.write(irq::CHANNEL_INT_ENABLE_W1C, chan);
            let mut rearm = 0;
            for (bit, target) in &self.channels {
                if chan & bit != 0 {
                    target.dispatch();
                    if target.rearm() {
                        rearm |= bit;
                    }
                }
            }
            if rearm != 0 {
                self.write(irq::CHANNEL_INT_ENABLE_W1S, rearm);
            }
        }

        if user != 0 {
            self.write(irq::USER_INT_ENABLE_W1C, user);
            for (line, target) in self.users.iter().enumerate() {
                if user & (1 << line) != 0 {
                    target.dispatch();
                }
            }
            self.write(irq::USER_INT_ENABLE_W1S, user);
        }
    }
}
