//! Register file of the hardware model.

use crate::platform::InterruptHandler;
use std::collections::VecDeque;
use xdma_chip::regs::{
    self as r, control, engine, irq, perf, sgdma, sgdma_common, status, target, Alignments,
    Identifier, BLOCK_SIZE, CHANNEL_STRIDE,
};
use xdma_chip::{Direction, MAX_CHANNELS};

use super::{SimChannel, SimConfig};

/// Control bits that gate a status bit into the channel interrupt request.
const IE_BITS: u32 = control::IE_ALL | control::IE_IDLE_STOPPED;

/// Alignment register contents: byte alignment, byte granularity, 64 address bits.
const ALIGNMENTS: Alignments = Alignments {
    address: 1,
    length: 1,
    address_bits: 64,
};

#[derive(Debug, Default, Clone)]
pub(crate) struct EngineModel {
    pub present: bool,
    pub stream: bool,
    pub control: u32,
    pub status: u32,
    pub completed: u32,
    pub first_desc: u64,
    pub adjacent: u32,
    pub credits: u32,
    /// Next descriptor to fetch while running.
    pub cursor: Option<u64>,
    /// A descriptor is being executed outside the state lock.
    pub in_flight: bool,
    pub int_mask: u32,
    pub perf_ctrl: u32,
    pub perf_cycles: u64,
    pub perf_data: u64,
}

impl EngineModel {
    fn set_control(&mut self, value: u32) {
        let old = self.control;
        self.control = value;

        let run = value & control::RUN != 0;
        let was = old & control::RUN != 0;
        if run && !was {
            self.status = status::BUSY;
            self.completed = 0;
            self.cursor = Some(self.first_desc);
            if self.perf_ctrl & perf::AUTO != 0 {
                self.perf_ctrl |= perf::RUN;
            }
        } else if !run && was {
            self.cursor = None;
            if !self.in_flight {
                self.status &= !status::BUSY;
            }
            if self.perf_ctrl & perf::AUTO != 0 {
                self.perf_ctrl &= !perf::RUN;
            }
        }
    }

    pub fn stop(&mut self, bits: u32) {
        self.status = (self.status | bits) & !status::BUSY;
        self.cursor = None;
    }

    fn interrupt_request(&self) -> bool {
        self.present && self.status & self.control & IE_BITS != 0
    }
}

pub(crate) struct SimState {
    pub engines: [[EngineModel; MAX_CHANNELS]; 2],
    pub h2c_count: usize,
    pub user_enable: u32,
    pub channel_enable: u32,
    pub user_request: u32,
    pub user_vectors: [u32; irq::USER_VECTOR_COUNT],
    pub channel_vectors: [u32; irq::CHANNEL_VECTOR_COUNT],
    pub credit_enable: u32,
    pub fifos: [VecDeque<u8>; MAX_CHANNELS],
    pub handler: Option<InterruptHandler>,
    /// Pending lines at the last evaluation (user in 31:0, channel in 63:32).
    pub last_pending: u64,
    /// A rising edge is waiting to be delivered.
    pub irq_pending: bool,
    pub delivering: bool,
    pub delivered_count: u64,
    pub shutdown: bool,
    /// Round-robin start for the worker.
    pub next_engine: usize,
}

impl std::fmt::Debug for SimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimState")
            .field("user_enable", &format_args!("{:#x}", self.user_enable))
            .field("channel_enable", &format_args!("{:#x}", self.channel_enable))
            .field("handler", &self.handler.is_some())
            .field("delivered_count", &self.delivered_count)
            .finish_non_exhaustive()
    }
}

impl SimState {
    pub fn new(cfg: &SimConfig) -> Self {
        let mut engines: [[EngineModel; MAX_CHANNELS]; 2] = Default::default();
        for dir in Direction::ALL {
            for ch in 0..MAX_CHANNELS {
                let kind = cfg.engine(dir, ch);
                let e = &mut engines[dir.index()][ch];
                e.present = kind != SimChannel::Absent;
                e.stream = kind == SimChannel::Streaming;
            }
        }
        let h2c_count = engines[0].iter().filter(|e| e.present).count();
        Self {
            engines,
            h2c_count,
            user_enable: 0,
            channel_enable: 0,
            user_request: 0,
            user_vectors: [0; irq::USER_VECTOR_COUNT],
            channel_vectors: [0; irq::CHANNEL_VECTOR_COUNT],
            credit_enable: 0,
            fifos: Default::default(),
            handler: None,
            last_pending: 0,
            irq_pending: false,
            delivering: false,
            delivered_count: 0,
            shutdown: false,
            next_engine: 0,
        }
    }

    pub fn engine_mut(&mut self, dir: Direction, ch: usize) -> &mut EngineModel {
        &mut self.engines[dir.index()][ch]
    }

    pub fn credit_mode(&self, dir: Direction, ch: usize) -> bool {
        self.credit_enable & sgdma_common::credit_bit(dir, ch) != 0
    }

    fn channel_request(&self) -> u32 {
        let mut req = 0;
        for dir in Direction::ALL {
            for (ch, e) in self.engines[dir.index()].iter().enumerate() {
                if e.interrupt_request() {
                    req |= irq::channel_bit(dir, ch, self.h2c_count);
                }
            }
        }
        req
    }

    /// Re-evaluate interrupt lines; a newly pending line is an edge to deliver.
    pub fn update_irq(&mut self) {
        let pending = u64::from(self.user_request & self.user_enable)
            | (u64::from(self.channel_request() & self.channel_enable) << 32);
        if pending & !self.last_pending != 0 {
            self.irq_pending = true;
        }
        self.last_pending = pending;
    }

    pub fn read(&mut self, cfg: &SimConfig, offset: usize) -> u32 {
        let block = offset / BLOCK_SIZE;
        let ch = (offset % BLOCK_SIZE) / CHANNEL_STRIDE;
        let reg = offset % CHANNEL_STRIDE;
        let ver = cfg.ip_version;

        match block {
            0 | 1 => {
                let dir = if block == 0 { Direction::H2C } else { Direction::C2H };
                if ch >= MAX_CHANNELS || !self.engines[block][ch].present {
                    return 0;
                }
                let e = &mut self.engines[block][ch];
                match reg {
                    engine::IDENTIFIER => {
                        Identifier::new(dir as u32, e.stream, ch as u32, ver).0
                    }
                    engine::CONTROL | engine::CONTROL_W1S | engine::CONTROL_W1C => e.control,
                    engine::STATUS => e.status,
                    engine::STATUS_RC => {
                        let s = e.status;
                        e.status &= status::BUSY;
                        self.update_irq();
                        s
                    }
                    engine::COMPLETED_DESC_COUNT => e.completed,
                    engine::ALIGNMENTS => ALIGNMENTS.raw(),
                    engine::INT_ENABLE_MASK
                    | engine::INT_ENABLE_MASK_W1S
                    | engine::INT_ENABLE_MASK_W1C => e.int_mask,
                    engine::PERF_CTRL => e.perf_ctrl,
                    engine::PERF_CYC_LO => e.perf_cycles as u32,
                    engine::PERF_CYC_HI => (e.perf_cycles >> 32) as u32,
                    engine::PERF_DAT_LO => e.perf_data as u32,
                    engine::PERF_DAT_HI => (e.perf_data >> 32) as u32,
                    _ => 0,
                }
            }
            2 => match reg + ch * CHANNEL_STRIDE {
                irq::IDENTIFIER => Identifier::new(target::IRQ, false, 0, ver).0,
                irq::USER_INT_ENABLE | irq::USER_INT_ENABLE_W1S | irq::USER_INT_ENABLE_W1C => {
                    self.user_enable
                }
                irq::CHANNEL_INT_ENABLE
                | irq::CHANNEL_INT_ENABLE_W1S
                | irq::CHANNEL_INT_ENABLE_W1C => self.channel_enable,
                irq::USER_INT_REQUEST => self.user_request,
                irq::CHANNEL_INT_REQUEST => self.channel_request(),
                irq::USER_INT_PENDING => self.user_request & self.user_enable,
                irq::CHANNEL_INT_PENDING => self.channel_request() & self.channel_enable,
                o if (irq::USER_VECTOR_BASE..irq::USER_VECTOR_BASE + 4 * irq::USER_VECTOR_COUNT)
                    .contains(&o) =>
                {
                    self.user_vectors[(o - irq::USER_VECTOR_BASE) / 4]
                }
                o if (irq::CHANNEL_VECTOR_BASE
                    ..irq::CHANNEL_VECTOR_BASE + 4 * irq::CHANNEL_VECTOR_COUNT)
                    .contains(&o) =>
                {
                    self.channel_vectors[(o - irq::CHANNEL_VECTOR_BASE) / 4]
                }
                _ => 0,
            },
            3 => match reg + ch * CHANNEL_STRIDE {
                r::config::IDENTIFIER => Identifier::new(target::CONFIG, false, 0, ver).0,
                r::config::MAX_PAYLOAD => 1,
                r::config::MAX_READ_REQUEST => 2,
                r::config::MSI_ENABLE => 1,
                _ => 0,
            },
            4 | 5 => {
                let idx = block - 4;
                if ch >= MAX_CHANNELS || !self.engines[idx][ch].present {
                    return 0;
                }
                let e = &self.engines[idx][ch];
                match reg {
                    sgdma::IDENTIFIER => {
                        Identifier::new(target::H2C_SGDMA + idx as u32, e.stream, ch as u32, ver).0
                    }
                    sgdma::FIRST_DESC_LO => e.first_desc as u32,
                    sgdma::FIRST_DESC_HI => (e.first_desc >> 32) as u32,
                    sgdma::FIRST_DESC_ADJACENT => e.adjacent,
                    sgdma::CREDITS => e.credits,
                    _ => 0,
                }
            }
            6 => match reg + ch * CHANNEL_STRIDE {
                sgdma_common::IDENTIFIER => Identifier::new(target::SGDMA_COMMON, false, 0, ver).0,
                sgdma_common::CREDIT_MODE_ENABLE
                | sgdma_common::CREDIT_MODE_ENABLE_W1S
                | sgdma_common::CREDIT_MODE_ENABLE_W1C => self.credit_enable,
                _ => 0,
            },
            _ => 0,
        }
    }

    pub fn write(&mut self, _cfg: &SimConfig, offset: usize, value: u32) {
        let block = offset / BLOCK_SIZE;
        let ch = (offset % BLOCK_SIZE) / CHANNEL_STRIDE;
        let reg = offset % CHANNEL_STRIDE;

        match block {
            0 | 1 => {
                if ch >= MAX_CHANNELS || !self.engines[block][ch].present {
                    return;
                }
                let e = &mut self.engines[block][ch];
                match reg {
                    engine::CONTROL => e.set_control(value),
                    engine::CONTROL_W1S => e.set_control(e.control | value),
                    engine::CONTROL_W1C => e.set_control(e.control & !value),
                    engine::INT_ENABLE_MASK => e.int_mask = value,
                    engine::INT_ENABLE_MASK_W1S => e.int_mask |= value,
                    engine::INT_ENABLE_MASK_W1C => e.int_mask &= !value,
                    engine::PERF_CTRL => {
                        if value & perf::CLEAR != 0 {
                            e.perf_cycles = 0;
                            e.perf_data = 0;
                        }
                        e.perf_ctrl = value & !perf::CLEAR;
                    }
                    _ => {}
                }
            }
            2 => match reg + ch * CHANNEL_STRIDE {
                irq::USER_INT_ENABLE => self.user_enable = value,
                irq::USER_INT_ENABLE_W1S => self.user_enable |= value,
                irq::USER_INT_ENABLE_W1C => {
                    self.user_enable &= !value;
                    // masking a serviced line acknowledges it to the user logic
                    self.user_request &= !value;
                }
                irq::CHANNEL_INT_ENABLE => self.channel_enable = value,
                irq::CHANNEL_INT_ENABLE_W1S => self.channel_enable |= value,
                irq::CHANNEL_INT_ENABLE_W1C => self.channel_enable &= !value,
                o if (irq::USER_VECTOR_BASE..irq::USER_VECTOR_BASE + 4 * irq::USER_VECTOR_COUNT)
                    .contains(&o) =>
                {
                    self.user_vectors[(o - irq::USER_VECTOR_BASE) / 4] = value;
                }
                o if (irq::CHANNEL_VECTOR_BASE
                    ..irq::CHANNEL_VECTOR_BASE + 4 * irq::CHANNEL_VECTOR_COUNT)
                    .contains(&o) =>
                {
                    self.channel_vectors[(o - irq::CHANNEL_VECTOR_BASE) / 4] = value;
                }
                _ => {}
            },
            4 | 5 => {
                let idx = block - 4;
                if ch >= MAX_CHANNELS || !self.engines[idx][ch].present {
                    return;
                }
                let e = &mut self.engines[idx][ch];
                match reg {
                    sgdma::FIRST_DESC_LO => {
                        e.first_desc = (e.first_desc & !0xFFFF_FFFF) | u64::from(value);
                    }
                    sgdma::FIRST_DESC_HI => {
                        e.first_desc = (e.first_desc & 0xFFFF_FFFF) | (u64::from(value) << 32);
                    }
                    sgdma::FIRST_DESC_ADJACENT => e.adjacent = value,
                    sgdma::CREDITS => e.credits = e.credits.saturating_add(value),
                    _ => {}
                }
            }
            6 => match reg + ch * CHANNEL_STRIDE {
                sgdma_common::CREDIT_MODE_ENABLE => self.credit_enable = value,
                sgdma_common::CREDIT_MODE_ENABLE_W1S => self.credit_enable |= value,
                sgdma_common::CREDIT_MODE_ENABLE_W1C => {
                    self.credit_enable &= !value;
                    for dir in Direction::ALL {
                        for c in 0..MAX_CHANNELS {
                            if value & sgdma_common::credit_bit(dir, c) != 0 {
                                self.engines[dir.index()][c].credits = 0;
                            }
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (SimConfig, SimState) {
        let cfg = SimConfig::default();
        let st = SimState::new(&cfg);
        (cfg, st)
    }

    #[test]
    fn run_edge_resets_engine() {
        let (cfg, mut st) = state();
        let base = r::engine_offset(Direction::C2H, 0);
        st.engine_mut(Direction::C2H, 0).completed = 7;
        st.write(&cfg, base + engine::CONTROL_W1S, control::RUN);
        let e = &st.engines[1][0];
        assert_eq!(e.status, status::BUSY);
        assert_eq!(e.completed, 0);
        assert!(e.cursor.is_some());

        st.write(&cfg, base + engine::CONTROL_W1C, control::RUN);
        assert_eq!(st.engines[1][0].status, 0);
    }

    #[test]
    fn masked_user_line_is_acknowledged() {
        let (cfg, mut st) = state();
        let base = r::IRQ_BLOCK_OFFSET;
        st.write(&cfg, base + irq::USER_INT_ENABLE_W1S, 0b100);
        st.user_request = 0b100;
        st.update_irq();
        assert!(st.irq_pending);
        assert_eq!(st.read(&cfg, base + irq::USER_INT_PENDING), 0b100);

        st.write(&cfg, base + irq::USER_INT_ENABLE_W1C, 0b100);
        assert_eq!(st.read(&cfg, base + irq::USER_INT_REQUEST), 0);
    }

    #[test]
    fn channel_bits_follow_h2c_count() {
        let (cfg, mut st) = state();
        // default model: two H2C engines, so C2H channel 0 is bit 2
        let e = st.engine_mut(Direction::C2H, 0);
        e.control = control::IE_DESC_STOPPED;
        e.status = status::DESC_STOPPED;
        assert_eq!(st.read(&cfg, r::IRQ_BLOCK_OFFSET + irq::CHANNEL_INT_REQUEST), 0b100);
    }

    #[test]
    fn credits_accumulate() {
        let (cfg, mut st) = state();
        let base = r::sgdma_offset(Direction::C2H, 1);
        st.write(&cfg, base + sgdma::CREDITS, 4);
        st.write(&cfg, base + sgdma::CREDITS, 2);
        assert_eq!(st.read(&cfg, base + sgdma::CREDITS), 6);
    }
}
