//! Device nodes and the I/O request router
//!
//! | Node | read | write | control |
//! |------|------|-------|---------|
//! | `control` | config BAR | config BAR | - |
//! | `user` | user BAR | user BAR | - |
//! | `bypass` | bypass BAR | bypass BAR | - |
//! | `h2c_N` | - | DMA | perf, address mode |
//! | `c2h_N` | DMA or ring | - | perf, address mode |
//! | `events_N` | 1-byte wait | - | - |
//!
//! The file offset of a BAR node is the register offset; on a DMA node it is
//! the card-side address.

use crate::device::{Attached, XdmaDevice};
use crate::engine::{ConsumeStatus, DmaRequest, Engine, EngineId};
use crate::error::{Result, XdmaError};
use crate::queue::{DispatchQueue, PendingIo};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use xdma_chip::ioctl::{ControlCode, ADDRMODE_SIZE, PERF_DATA_SIZE};
use xdma_chip::{Direction, MAX_CHANNELS, MAX_USER_IRQ};

/// Classification of an opened node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Config BAR.
    Control,
    /// User logic BAR.
    User,
    /// DMA bypass BAR.
    Bypass,
    /// Host-to-card engine of a channel.
    H2c(usize),
    /// Card-to-host engine of a channel.
    C2h(usize),
    /// User interrupt line.
    Event(usize),
}

impl NodeKind {
    /// Engine behind a DMA node.
    pub const fn engine_id(self) -> Option<EngineId> {
        match self {
            Self::H2c(ch) => Some(EngineId::new(Direction::H2C, ch)),
            Self::C2h(ch) => Some(EngineId::new(Direction::C2H, ch)),
            _ => None,
        }
    }

    /// Every node name the device can expose.
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::Control, Self::User, Self::Bypass]
            .into_iter()
            .chain((0..MAX_CHANNELS).map(Self::H2c))
            .chain((0..MAX_CHANNELS).map(Self::C2h))
            .chain((0..MAX_USER_IRQ).map(Self::Event))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::User => f.write_str("user"),
            Self::Bypass => f.write_str("bypass"),
            Self::H2c(ch) => write!(f, "h2c_{ch}"),
            Self::C2h(ch) => write!(f, "c2h_{ch}"),
            Self::Event(line) => write!(f, "events_{line}"),
        }
    }
}

impl FromStr for NodeKind {
    type Err = XdmaError;

    fn from_str(name: &str) -> Result<Self> {
        let bare = name.trim_start_matches(['\\', '/']);
        let unknown = || XdmaError::invalid_parameter(format!("unknown device node {name:?}"));

        let indexed = |prefix: &str, limit: usize| -> Option<usize> {
            bare.strip_prefix(prefix)
                .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                .filter(|n| n.len() == 1 || !n.starts_with('0'))
                .and_then(|n| n.parse().ok())
                .filter(|&n| n < limit)
        };

        match bare {
            "control" => Ok(Self::Control),
            "user" => Ok(Self::User),
            "bypass" => Ok(Self::Bypass),
            _ => {
                if let Some(ch) = indexed("h2c_", MAX_CHANNELS) {
                    Ok(Self::H2c(ch))
                } else if let Some(ch) = indexed("c2h_", MAX_CHANNELS) {
                    Ok(Self::C2h(ch))
                } else if let Some(line) =
                    indexed("events_", MAX_USER_IRQ).or_else(|| indexed("event_", MAX_USER_IRQ))
                {
                    Ok(Self::Event(line))
                } else {
                    Err(unknown())
                }
            }
        }
    }
}

/// An open device node.
///
/// Holds no reference that keeps the device alive; every call re-checks that
/// the device is still the one the node was opened on.
#[derive(Debug)]
pub struct FileHandle {
    device: Weak<XdmaDevice>,
    generation: u64,
    kind: NodeKind,
    stream: bool,
    wait_timeout: Duration,
}

impl XdmaDevice {
    /// Open node `name`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown name, an absent user/bypass BAR or a
    /// disabled engine; `DeviceGone` after release; ring setup errors for a
    /// streaming C2H node.
    pub fn open(self: &Arc<Self>, name: &str) -> Result<FileHandle> {
        let kind: NodeKind = name.parse()?;
        let generation = self.generation();

        let (stream, queue) = self.with_generation(generation, |att| {
            let layout = att.bars.layout();
            match kind {
                NodeKind::User if layout.user.is_none() => {
                    Err(XdmaError::invalid_parameter("device has no user BAR"))
                }
                NodeKind::Bypass if layout.bypass.is_none() => {
                    Err(XdmaError::invalid_parameter("device has no bypass BAR"))
                }
                NodeKind::H2c(_) | NodeKind::C2h(_) => {
                    let queue = dma_queue(att, kind)?;
                    let stream = queue.engine().is_stream_c2h();
                    if stream {
                        queue.engine().open_ring()?;
                    }
                    Ok((stream, Some(queue)))
                }
                _ => Ok((false, None)),
            }
        })?;

        let handle = FileHandle {
            device: Arc::downgrade(self),
            generation,
            kind,
            stream,
            wait_timeout: self.config().wait_timeout,
        };

        // re-apply the engine's completion mode behind any queued requests
        if let Some(queue) = queue {
            let poll = queue.engine().poll_mode();
            queue.set_mode(poll)?;
        }

        tracing::info!("Opened {kind}");
        Ok(handle)
    }
}

fn dma_engine(att: &Attached, kind: NodeKind) -> Result<&Arc<Engine>> {
    let id = kind
        .engine_id()
        .ok_or_else(|| XdmaError::invalid_parameter(format!("{kind} is not a DMA node")))?;
    att.queue(id)
        .map(|q| q.engine())
        .ok_or_else(|| XdmaError::invalid_parameter(format!("engine {id} is not enabled")))
}

fn dma_queue(att: &Attached, kind: NodeKind) -> Result<Arc<DispatchQueue>> {
    let id = kind
        .engine_id()
        .ok_or_else(|| XdmaError::invalid_parameter(format!("{kind} is not a DMA node")))?;
    att.queue(id)
        .cloned()
        .ok_or_else(|| XdmaError::invalid_parameter(format!("engine {id} is not enabled")))
}

fn bar_offset(offset: u64) -> Result<usize> {
    usize::try_from(offset)
        .map_err(|_| XdmaError::invalid_request(format!("offset {offset:#x} out of range")))
}

impl FileHandle {
    /// Node classification.
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    fn attached<R>(&self, f: impl FnOnce(&Attached) -> Result<R>) -> Result<R> {
        let device = self.device.upgrade().ok_or(XdmaError::DeviceGone)?;
        device.with_generation(self.generation, f)
    }

    fn bar_index(&self, att: &Attached) -> Option<usize> {
        let layout = att.bars.layout();
        match self.kind {
            NodeKind::Control => Some(layout.config),
            NodeKind::User => layout.user,
            NodeKind::Bypass => layout.bypass,
            _ => None,
        }
    }

    fn wrong_direction(&self, op: &str) -> XdmaError {
        XdmaError::invalid_request(format!("{op} is not supported on {}", self.kind))
    }

    /// Read from the node into `buf`. Returns the bytes produced.
    ///
    /// BAR nodes copy registers at `offset`; block C2H nodes run a transfer
    /// from card address `offset`; streaming C2H nodes consume from the ring
    /// (0 on timeout); event nodes wait for the line and store `1` (pulsed)
    /// or `0` (timed out) in a one-byte `buf`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a read on a write-only node or a bad range/size,
    /// transfer errors, `DeviceGone` after release.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self.kind {
            NodeKind::Control | NodeKind::User | NodeKind::Bypass => {
                let at = bar_offset(offset)?;
                self.attached(|att| {
                    let index = self.bar_index(att).ok_or(XdmaError::DeviceGone)?;
                    att.bars.read(index, at, buf)
                })
            }
            NodeKind::H2c(_) => Err(self.wrong_direction("read")),
            NodeKind::C2h(_) if self.stream => Ok(self.consume(buf)?.copied()),
            NodeKind::C2h(_) => {
                let done = self.submit_read(offset, buf.len())?.wait()?;
                buf[..done.data.len()].copy_from_slice(&done.data);
                Ok(done.bytes)
            }
            NodeKind::Event(line) => {
                if buf.len() != 1 {
                    return Err(XdmaError::invalid_request(format!(
                        "event read needs a 1-byte buffer, got {}",
                        buf.len()
                    )));
                }
                let event = self.attached(|att| Ok(Arc::clone(&att.events[line])))?;
                buf[0] = u8::from(event.wait(self.wait_timeout)?);
                Ok(1)
            }
        }
    }

    /// Write `data` to the node. Returns the bytes consumed.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a write on a read-only node or a bad range,
    /// transfer errors, `DeviceGone` after release.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        match self.kind {
            NodeKind::Control | NodeKind::User | NodeKind::Bypass => {
                let at = bar_offset(offset)?;
                self.attached(|att| {
                    let index = self.bar_index(att).ok_or(XdmaError::DeviceGone)?;
                    att.bars.write(index, at, data)
                })
            }
            NodeKind::H2c(_) => Ok(self
                .submit_write(offset, Bytes::copy_from_slice(data))?
                .wait()?
                .bytes),
            NodeKind::C2h(_) | NodeKind::Event(_) => Err(self.wrong_direction("write")),
        }
    }

    /// Queue a card-to-host transfer of `len` bytes from card address `offset`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` on anything but a block C2H node, `DeviceGone` after release.
    pub fn submit_read(&self, offset: u64, len: usize) -> Result<PendingIo> {
        if !matches!(self.kind, NodeKind::C2h(_)) || self.stream {
            return Err(self.wrong_direction("DMA read"));
        }
        let queue = self.attached(|att| dma_queue(att, self.kind))?;
        queue.submit(offset, DmaRequest::Read(len))
    }

    /// Queue a host-to-card transfer of `data` to card address `offset`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` on anything but an H2C node, `DeviceGone` after release.
    pub fn submit_write(&self, offset: u64, data: Bytes) -> Result<PendingIo> {
        if !matches!(self.kind, NodeKind::H2c(_)) {
            return Err(self.wrong_direction("DMA write"));
        }
        let queue = self.attached(|att| dma_queue(att, self.kind))?;
        queue.submit(offset, DmaRequest::Write(data))
    }

    /// Consume ring data on a streaming C2H node.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` on other nodes; ring errors.
    pub fn consume(&self, buf: &mut [u8]) -> Result<ConsumeStatus> {
        if !self.stream {
            return Err(self.wrong_direction("ring consume"));
        }
        let ring = self.attached(|att| {
            dma_engine(att, self.kind)?
                .ring()
                .ok_or(XdmaError::DeviceGone)
        })?;
        ring.consume(buf)
    }

    /// Issue control code `code`. Returns the bytes written to `output`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on non-DMA nodes, `NotSupported` for unknown codes,
    /// `InvalidRequest` for short buffers.
    pub fn control(&self, code: u32, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if self.kind.engine_id().is_none() {
            return Err(XdmaError::invalid_parameter(format!(
                "control codes are not accepted on {}",
                self.kind
            )));
        }
        let op = ControlCode::from_raw(code)
            .ok_or_else(|| XdmaError::not_supported(format!("control code {code:#x}")))?;
        let queue = self.attached(|att| dma_queue(att, self.kind))?;
        let engine = queue.engine();

        match op {
            ControlCode::PerfStart => {
                engine.start_perf();
                Ok(0)
            }
            ControlCode::PerfGet => {
                let out = output.get_mut(..PERF_DATA_SIZE).ok_or_else(|| {
                    XdmaError::invalid_request(format!("PERF_GET needs {PERF_DATA_SIZE} bytes"))
                })?;
                out.copy_from_slice(engine.perf().as_bytes());
                Ok(PERF_DATA_SIZE)
            }
            ControlCode::AddrModeGet => {
                let out = output.get_mut(..ADDRMODE_SIZE).ok_or_else(|| {
                    XdmaError::invalid_request(format!("ADDRMODE_GET needs {ADDRMODE_SIZE} bytes"))
                })?;
                out.copy_from_slice(&u32::from(engine.address_mode()).to_le_bytes());
                Ok(ADDRMODE_SIZE)
            }
            ControlCode::AddrModeSet => {
                let raw: [u8; ADDRMODE_SIZE] = input
                    .get(..ADDRMODE_SIZE)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| {
                        XdmaError::invalid_request(format!(
                            "ADDRMODE_SET needs {ADDRMODE_SIZE} bytes"
                        ))
                    })?;
                queue.set_address_mode(u32::from_le_bytes(raw) != 0)?;
                Ok(0)
            }
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.stream {
            let _ = self.attached(|att| {
                dma_engine(att, self.kind)?.close_ring();
                Ok(())
            });
        }
        tracing::debug!("Closed {}", self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse() {
        assert_eq!("control".parse::<NodeKind>().unwrap(), NodeKind::Control);
        assert_eq!("\\h2c_3".parse::<NodeKind>().unwrap(), NodeKind::H2c(3));
        assert_eq!("/c2h_0".parse::<NodeKind>().unwrap(), NodeKind::C2h(0));
        assert_eq!("events_15".parse::<NodeKind>().unwrap(), NodeKind::Event(15));
        assert_eq!("event_2".parse::<NodeKind>().unwrap(), NodeKind::Event(2));
        assert_eq!("events_10".parse::<NodeKind>().unwrap(), NodeKind::Event(10));
        assert_eq!("h2c_0".parse::<NodeKind>().unwrap(), NodeKind::H2c(0));
    }

    #[test]
    fn bad_names_are_invalid_parameters() {
        let names = [
            "", "h2c_4", "events_16", "c2h_", "c2h_+1", "usr", "h2c_01x", "h2c_01", "events_007",
            "c2h_00",
        ];
        for name in names {
            assert!(
                matches!(name.parse::<NodeKind>(), Err(XdmaError::InvalidParameter { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn display_round_trips_every_node() {
        for kind in NodeKind::all() {
            assert_eq!(kind.to_string().parse::<NodeKind>().unwrap(), kind);
        }
        assert_eq!(NodeKind::all().count(), 3 + 8 + 16);
    }
}
