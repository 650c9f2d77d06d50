//! Per-engine serialized dispatch
//!
//! Every DMA request and mode change for one engine goes through that
//! engine's [`DispatchQueue`]: a single worker thread that takes jobs in
//! arrival order and runs each to completion before the next. That worker
//! is the only issuer on its engine, which is what keeps one transfer in
//! flight per engine.

use crate::engine::{Completed, DmaRequest, Engine, EngineId, TransferHandle};
use crate::error::{Result, XdmaError};
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

enum Job {
    Transfer {
        card_addr: u64,
        request: DmaRequest,
        shared: Arc<PendingShared>,
        reply: SyncSender<Result<Completed>>,
    },
    AddressMode {
        non_incr: bool,
        reply: SyncSender<()>,
    },
    PollMode {
        poll: bool,
        reply: SyncSender<()>,
    },
}

#[derive(Debug, Default)]
struct PendingShared {
    cancelled: AtomicBool,
    handle: Mutex<Option<TransferHandle>>,
}

/// A queued or running DMA request.
#[derive(Debug)]
pub struct PendingIo {
    shared: Arc<PendingShared>,
    reply: Receiver<Result<Completed>>,
}

impl PendingIo {
    /// Block until the request ends.
    ///
    /// # Errors
    ///
    /// The transfer's failure, `Cancelled`, or `DeviceGone` if the queue shut
    /// down before answering.
    pub fn wait(self) -> Result<Completed> {
        self.reply.recv().unwrap_or(Err(XdmaError::DeviceGone))
    }

    /// Cancel the request, whether still queued or already running.
    ///
    /// A request that has already completed keeps its result.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.shared.handle).as_ref() {
            handle.cancel();
        }
    }
}

/// Worker thread owning all issue traffic of one engine.
#[derive(Debug)]
pub struct DispatchQueue {
    engine: Arc<Engine>,
    jobs: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Start the worker for `engine`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(engine: Arc<Engine>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker_engine = Arc::clone(&engine);
        let worker = std::thread::Builder::new()
            .name(format!("xdma-{}", engine.id()))
            .spawn(move || run(&worker_engine, &rx))?;
        Ok(Self {
            engine,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Engine served by this queue.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Engine address.
    pub fn id(&self) -> EngineId {
        self.engine.id()
    }

    fn send(&self, job: Job) -> Result<()> {
        lock(&self.jobs)
            .as_ref()
            .ok_or(XdmaError::DeviceGone)?
            .send(job)
            .map_err(|_| XdmaError::DeviceGone)
    }

    /// Queue a transfer.
    ///
    /// # Errors
    ///
    /// `DeviceGone` once the queue has shut down.
    pub fn submit(&self, card_addr: u64, request: DmaRequest) -> Result<PendingIo> {
        let shared = Arc::new(PendingShared::default());
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Job::Transfer {
            card_addr,
            request,
            shared: Arc::clone(&shared),
            reply,
        })?;
        Ok(PendingIo { shared, reply: rx })
    }

    /// Change the address mode after all earlier requests.
    ///
    /// # Errors
    ///
    /// `DeviceGone` once the queue has shut down.
    pub fn set_address_mode(&self, non_incr: bool) -> Result<()> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Job::AddressMode { non_incr, reply })?;
        rx.recv().map_err(|_| XdmaError::DeviceGone)
    }

    /// Change poll/interrupt completion after all earlier requests.
    ///
    /// # Errors
    ///
    /// `DeviceGone` once the queue has shut down.
    pub fn set_mode(&self, poll: bool) -> Result<()> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.send(Job::PollMode { poll, reply })?;
        rx.recv().map_err(|_| XdmaError::DeviceGone)
    }

    /// Stop accepting jobs and join the worker once the backlog drains.
    pub(crate) fn shutdown(&self) {
        lock(&self.jobs).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!("Dispatch worker for {} panicked", self.engine.id());
            }
        }
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(engine: &Arc<Engine>, jobs: &Receiver<Job>) {
    tracing::debug!("Dispatch worker for {} started", engine.id());
    for job in jobs {
        match job {
            Job::Transfer {
                card_addr,
                request,
                shared,
                reply,
            } => {
                let outcome = transfer(engine, card_addr, request, &shared);
                let _ = reply.send(outcome);
            }
            Job::AddressMode { non_incr, reply } => {
                engine.set_address_mode(non_incr);
                let _ = reply.send(());
            }
            Job::PollMode { poll, reply } => {
                engine.set_mode(poll);
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!("Dispatch worker for {} stopped", engine.id());
}

fn transfer(
    engine: &Arc<Engine>,
    card_addr: u64,
    request: DmaRequest,
    shared: &PendingShared,
) -> Result<Completed> {
    if shared.cancelled.load(Ordering::Acquire) {
        return Err(XdmaError::Cancelled);
    }
    let handle = engine.issue(card_addr, request)?;
    {
        let mut slot = lock(&shared.handle);
        if shared.cancelled.load(Ordering::Acquire) {
            handle.cancel();
        } else {
            *slot = Some(handle.clone());
        }
    }
    let outcome = handle.wait();
    lock(&shared.handle).take();
    outcome
}
