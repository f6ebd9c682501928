//! Deferred delivery from the real-time producer to a non-real-time worker.
//!
//! The producer posts [`Payload`]s into an rtrb SPSC work ring and unparks a
//! dedicated worker thread, which hands each payload to the [`ExportSink`].
//! Snapshot buffers come from a fixed pool: a buffer travels producer ->
//! worker -> producer through the work ring and a free ring, so the producer
//! never writes into a buffer the worker is exporting. When no buffer is
//! free the snapshot is dropped; posting never waits.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use crate::{
    export::ExportSink,
    snapshot::{ScopeMessage, Snapshot},
    BridgeConfig, Result, ScopeError,
};

/// Work handed to the worker thread.
#[derive(Debug)]
pub enum Payload {
    Message(ScopeMessage),
    Snapshot(Box<Snapshot>),
}

/// Delivery counters, readable from any thread.
#[derive(Debug, Default)]
pub struct BridgeStats {
    posted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl BridgeStats {
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Payloads discarded because no buffer or queue slot was free.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Exports the sink reported as failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct WorkerFlags {
    shutdown: AtomicBool,
}

/// Producer half. Every method is non-blocking and allocation-free.
pub struct BridgePoster {
    work_tx: Producer<Payload>,
    free_rx: Consumer<Box<Snapshot>>,
    spare: Option<Box<Snapshot>>,
    worker: Thread,
    stats: Arc<BridgeStats>,
}

impl BridgePoster {
    /// Takes a free snapshot buffer, if the worker has returned one.
    pub fn acquire(&mut self) -> Option<Box<Snapshot>> {
        self.spare.take().or_else(|| self.free_rx.pop().ok())
    }

    /// Gives back a buffer that was acquired but not posted.
    pub fn release(&mut self, snapshot: Box<Snapshot>) {
        self.spare = Some(snapshot);
    }

    /// Queues a payload and wakes the worker. Returns false, dropping the
    /// payload, if the work ring is full; a snapshot buffer is kept for
    /// reuse in that case.
    pub fn post(&mut self, payload: Payload) -> bool {
        match self.work_tx.push(payload) {
            Ok(()) => {
                self.stats.posted.fetch_add(1, Ordering::Relaxed);
                self.worker.unpark();
                true
            }
            Err(PushError::Full(payload)) => {
                self.stats.record_drop();
                if let Payload::Snapshot(snapshot) = payload {
                    self.spare = Some(snapshot);
                }
                false
            }
        }
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }
}

/// Owner half of the worker thread.
pub struct BridgeWorker<S> {
    handle: JoinHandle<S>,
    flags: Arc<WorkerFlags>,
    stats: Arc<BridgeStats>,
}

impl<S> BridgeWorker<S> {
    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// Stops the worker after it drains everything already posted, and
    /// returns the sink.
    pub fn shutdown(self) -> Result<S> {
        self.flags.shutdown.store(true, Ordering::Release);
        self.handle.thread().unpark();
        self.handle
            .join()
            .map_err(|_| ScopeError::msg("delivery worker panicked"))
    }
}

/// Creates the rings and snapshot pool and spawns the worker thread.
///
/// `generations` snapshot buffers of `snapshot_capacity` values each are
/// allocated up front.
pub fn spawn<S>(
    name: &str,
    config: &BridgeConfig,
    snapshot_capacity: usize,
    extra_message_slots: usize,
    sink: S,
) -> Result<(BridgePoster, BridgeWorker<S>)>
where
    S: ExportSink + Send + 'static,
{
    let generations = config.generations.max(1);
    let (work_tx, work_rx) =
        RingBuffer::new(generations + config.message_slots + extra_message_slots);
    let (mut free_tx, free_rx) = RingBuffer::new(generations);
    for _ in 0..generations {
        free_tx
            .push(Box::new(Snapshot::with_capacity(snapshot_capacity)))
            .map_err(|_| ScopeError::msg("snapshot pool overflow"))?;
    }

    let flags = Arc::new(WorkerFlags::default());
    let stats = Arc::new(BridgeStats::default());
    let idle = Duration::from_millis(config.idle_park_ms.max(1));

    let handle = thread::Builder::new().name(name.to_owned()).spawn({
        let flags = Arc::clone(&flags);
        let stats = Arc::clone(&stats);
        move || run_worker(work_rx, free_tx, sink, &flags, &stats, idle)
    })?;

    tracing::debug!(worker = name, generations, snapshot_capacity, "delivery worker started");

    let poster = BridgePoster {
        work_tx,
        free_rx,
        spare: None,
        worker: handle.thread().clone(),
        stats: Arc::clone(&stats),
    };
    Ok((poster, BridgeWorker { handle, flags, stats }))
}

fn run_worker<S: ExportSink>(
    mut work_rx: Consumer<Payload>,
    mut free_tx: Producer<Box<Snapshot>>,
    mut sink: S,
    flags: &WorkerFlags,
    stats: &BridgeStats,
    idle: Duration,
) -> S {
    loop {
        let stopping = flags.shutdown.load(Ordering::Acquire);
        while let Ok(payload) = work_rx.pop() {
            deliver(payload, &mut sink, &mut free_tx, stats);
        }
        if stopping {
            break;
        }
        thread::park_timeout(idle);
    }
    if let Err(error) = sink.flush() {
        tracing::warn!(%error, "export sink flush failed");
    }
    tracing::debug!(delivered = stats.delivered(), "delivery worker stopped");
    sink
}

fn deliver<S: ExportSink>(
    payload: Payload,
    sink: &mut S,
    free_tx: &mut Producer<Box<Snapshot>>,
    stats: &BridgeStats,
) {
    let outcome = match &payload {
        Payload::Message(message) => sink.export_message(message),
        Payload::Snapshot(snapshot) => sink.export_snapshot(snapshot),
    };
    match outcome {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(error) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%error, "export failed");
        }
    }
    if let Payload::Snapshot(snapshot) = payload {
        // The pool size equals the free ring capacity, so this cannot fail.
        let _ = free_tx.push(snapshot);
    }
}
