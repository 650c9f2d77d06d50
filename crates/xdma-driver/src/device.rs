//! Device attach and release
//!
//! [`XdmaDevice::attach`] brings a function up in the order the hardware
//! needs it: map and identify the BARs, probe the engines, start one
//! dispatch queue per engine, program the interrupt vectors, connect the
//! interrupt and finally unmask. [`XdmaDevice::release`] undoes it. Handles
//! opened before a release fail with [`XdmaError::DeviceGone`] afterwards.

use crate::bar::Bars;
use crate::config::DriverConfig;
use crate::discovery::{self, BarLayout};
use crate::engine::{self, Engine, EngineId};
use crate::error::{Result, XdmaError};
use crate::interrupt::{EventLine, IrqController};
use crate::platform::{InterruptHandler, Platform};
use crate::queue::DispatchQueue;
use crate::sync::{read, write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use xdma_chip::regs::IpVersion;
use xdma_chip::{Direction, MAX_CHANNELS, MAX_USER_IRQ};

/// Everything that exists only while attached.
#[derive(Debug)]
pub(crate) struct Attached {
    pub bars: Arc<Bars>,
    pub queues: [[Option<Arc<DispatchQueue>>; MAX_CHANNELS]; 2],
    pub events: Vec<Arc<EventLine>>,
    irq: Arc<IrqController>,
    irq_connected: bool,
}

impl Attached {
    pub fn queue(&self, id: EngineId) -> Option<&Arc<DispatchQueue>> {
        self.queues[id.dir.index()]
            .get(id.channel)
            .and_then(Option::as_ref)
    }

    fn all_queues(&self) -> impl Iterator<Item = &Arc<DispatchQueue>> {
        self.queues.iter().flatten().flatten()
    }
}

/// One XDMA function.
#[derive(Debug)]
pub struct XdmaDevice {
    platform: Arc<dyn Platform>,
    config: DriverConfig,
    state: RwLock<Option<Attached>>,
    generation: AtomicU64,
}

impl XdmaDevice {
    /// Bring the device up on `platform`.
    ///
    /// A platform without interrupt delivery is accepted; every engine is
    /// then forced into poll mode.
    ///
    /// # Errors
    ///
    /// `Configuration` if no config BAR is found or a BAR cannot be mapped;
    /// platform errors from connecting the interrupt.
    pub fn attach(platform: Arc<dyn Platform>, config: DriverConfig) -> Result<Arc<Self>> {
        tracing::info!("Attaching XDMA device on {}", platform.name());

        let bars = Arc::new(discovery::map_bars(platform.as_ref()).inspect_err(|e| {
            tracing::error!("Attach failed: {e}");
        })?);
        let config_bar = Arc::clone(bars.config());

        let engines = engine::probe_all(&config_bar, &platform, &config);
        let mut queues: [[Option<Arc<DispatchQueue>>; MAX_CHANNELS]; 2] = Default::default();
        for e in &engines {
            let id = e.id();
            let queue = DispatchQueue::spawn(Arc::clone(e))?;
            queues[id.dir.index()][id.channel] = Some(Arc::new(queue));
        }

        let events: Vec<Arc<EventLine>> = (0..MAX_USER_IRQ)
            .map(|l| Arc::new(EventLine::new(l)))
            .collect();
        let irq = Arc::new(IrqController::new(config_bar, &engines, &events));
        irq.mask_all();
        irq.program_vectors();

        let weak = Arc::downgrade(&irq);
        let handler: InterruptHandler = Arc::new(move || {
            if let Some(irq) = weak.upgrade() {
                irq.handle();
            }
        });
        let irq_connected = match platform.connect_interrupt(handler) {
            Ok(()) => true,
            Err(XdmaError::NotSupported { what }) => {
                tracing::warn!("No interrupt delivery ({what}); using poll mode");
                false
            }
            Err(e) => {
                tracing::error!("Attach failed: {e}");
                return Err(e);
            }
        };

        let poll = config.poll_mode || !irq_connected;
        for e in &engines {
            e.set_mode(poll);
        }
        if irq_connected {
            irq.enable_user();
        }

        let device = Arc::new(Self {
            platform,
            config,
            state: RwLock::new(Some(Attached {
                bars,
                queues,
                events,
                irq,
                irq_connected,
            })),
            generation: AtomicU64::new(1),
        });
        tracing::info!(
            "XDMA device attached: {} engine(s), {} mode",
            engines.len(),
            if poll { "poll" } else { "interrupt" }
        );
        Ok(device)
    }

    /// Stop all engines, mask interrupts and unmap the BARs.
    ///
    /// In-flight transfers end as cancelled. Idempotent.
    pub fn release(&self) {
        let mut state = write(&self.state);
        let Some(att) = state.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::AcqRel);

        att.irq.mask_all();
        for q in att.all_queues() {
            q.engine().retire();
        }
        for ev in &att.events {
            ev.close();
        }
        if att.irq_connected {
            self.platform.disconnect_interrupt();
        }
        for q in att.all_queues() {
            q.shutdown();
        }
        att.irq.program_vectors();
        drop(att);
        tracing::info!("XDMA device released");
    }

    /// Whether the device is attached.
    pub fn is_attached(&self) -> bool {
        read(&self.state).is_some()
    }

    /// Settings applied at attach.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Host platform.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// BAR layout found at attach.
    ///
    /// # Errors
    ///
    /// `DeviceGone` after release.
    pub fn layout(&self) -> Result<BarLayout> {
        self.with_attached(|a| Ok(a.bars.layout()))
    }

    /// IP release of the config block.
    ///
    /// # Errors
    ///
    /// `DeviceGone` after release.
    pub fn ip_version(&self) -> Result<IpVersion> {
        self.with_attached(|a| Ok(a.bars.ip_version()))
    }

    /// Enabled engines, H2C first.
    ///
    /// # Errors
    ///
    /// `DeviceGone` after release.
    pub fn engines(&self) -> Result<Vec<Arc<Engine>>> {
        self.with_attached(|a| Ok(a.all_queues().map(|q| Arc::clone(q.engine())).collect()))
    }

    /// Engine `dir` of `channel`.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` if the engine is not enabled, `DeviceGone` after release.
    pub fn engine(&self, dir: Direction, channel: usize) -> Result<Arc<Engine>> {
        let id = EngineId::new(dir, channel);
        self.with_attached(|a| {
            a.queue(id)
                .map(|q| Arc::clone(q.engine()))
                .ok_or_else(|| XdmaError::invalid_parameter(format!("engine {id} is not enabled")))
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Run `f` against the attached state.
    pub(crate) fn with_attached<R>(&self, f: impl FnOnce(&Attached) -> Result<R>) -> Result<R> {
        let state = read(&self.state);
        state.as_ref().map_or(Err(XdmaError::DeviceGone), f)
    }

    /// Run `f` against the attached state if it is still generation `generation`.
    pub(crate) fn with_generation<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&Attached) -> Result<R>,
    ) -> Result<R> {
        let state = read(&self.state);
        match state.as_ref() {
            Some(att) if self.generation() == generation => f(att),
            _ => Err(XdmaError::DeviceGone),
        }
    }
}

impl Drop for XdmaDevice {
    fn drop(&mut self) {
        self.release();
    }
}
