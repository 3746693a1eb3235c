//! The client-side telemetry pipeline.
//!
//! A [`Pipeline`] wires the [`Collector`] to the encryption worker and the
//! [`Dispatcher`]:
//!
//! ```text
//! submit_event ─▶ validate ─▶ scrub ─▶ Collector ─▶ Encryptor ─▶ Dispatcher ─▶ Transport
//!                                         ▲                                      │
//!                                    flush timer                           DiscardSink
//! ```
//!
//! Ingress never blocks and never returns an error to the host page: bad
//! payloads are counted and dropped, and every later failure is handled
//! inside the pipeline.
//!
//! Records are submitted to the encryption worker while the collector lock
//! is held, and one forwarder task per priority awaits their tickets in
//! submission order. Encryption of several records runs in parallel, but
//! records of one priority reach the dispatcher in the order they were
//! flushed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::crypto::{
    EncryptTicket, EncryptionWorker, Encryptor, HandoffConfig, HandoffError, KeyMaterial,
    KeySession, Provisioned,
};
use crate::error::Result;
use crate::event::Event;
use crate::privacy::{ScrubConfig, Scrubber};
use crate::record::{Priority, ProcessingRecord};
use crate::transport::{DiscardSink, Dispatcher, DispatcherConfig, DispatcherStats, Transport};

/// Tuning for a whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Interval between timer-driven flushes of every buffer.
    pub flush_interval: Duration,
    /// Events per buffer that trigger an immediate flush.
    pub max_batch_size: usize,
    /// Encryption worker settings.
    pub handoff: HandoffConfig,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Scrubber settings.
    pub scrub: ScrubConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            max_batch_size: 20,
            handoff: HandoffConfig::default(),
            dispatcher: DispatcherConfig::default(),
            scrub: ScrubConfig::default(),
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            max_batch_size: config.collector.max_batch_size,
            handoff: config.handoff_config(),
            dispatcher: config.dispatcher_config(),
            scrub: config.scrub_config(),
        }
    }
}

/// Counters for the whole pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    /// Events accepted at ingress.
    pub accepted: u64,
    /// Events rejected at ingress.
    pub rejected: u64,
    /// Records built by the collector.
    pub records_flushed: u64,
    /// Records handed back for lack of key material and resubmitted.
    pub key_retries: u64,
    /// Records dropped before encryption (queue overflow, encode failure,
    /// or still unkeyed at shutdown).
    pub dropped_unsent: u64,
    /// Events still buffered in the collector.
    pub buffered: usize,
    /// Dispatcher counters.
    pub dispatcher: DispatcherStats,
}

impl PipelineStats {
    /// Records lost for any reason, before or after encryption.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.dropped_unsent + self.dispatcher.discarded
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    records_flushed: AtomicU64,
    key_retries: AtomicU64,
    dropped_unsent: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    collector: Mutex<Collector>,
    scrubber: Scrubber,
    session: KeySession,
    encryptor: Encryptor,
    dispatcher: Dispatcher,
    /// Tickets in submission order, one channel per priority.
    lanes: [mpsc::UnboundedSender<EncryptTicket>; 3],
    counters: Counters,
    /// Records between the collector and the dispatcher.
    handoffs: AtomicUsize,
    handoffs_idle: Notify,
    closing: AtomicBool,
}

impl Inner {
    fn collector(&self) -> MutexGuard<'_, Collector> {
        self.collector.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject(&self, reason: &str) -> bool {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(reason, "Rejected event at ingress");
        false
    }

    fn record(&self, mut event: Event, priority: Priority) -> bool {
        if let Err(e) = event.validate() {
            return self.reject(&e.to_string());
        }
        event.scrub(&self.scrubber);
        let serialized = match event.to_json() {
            Ok(s) => s,
            Err(e) => return self.reject(&e.to_string()),
        };

        // Hand off under the lock so flush order is submission order
        let mut collector = self.collector();
        let flushed = collector.record(serialized, priority);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        if let Some(record) = flushed {
            self.hand_off(record);
        }
        true
    }

    fn flush_all(&self) -> usize {
        let mut collector = self.collector();
        let records = collector.flush_all();
        let count = records.len();
        for record in records {
            self.hand_off(record);
        }
        count
    }

    /// Submit a record for encryption and queue its ticket on the record's
    /// lane. Callers hold the collector lock.
    fn hand_off(&self, record: ProcessingRecord) {
        self.counters.records_flushed.fetch_add(1, Ordering::Relaxed);
        let priority = record.priority();
        debug!(
            record_id = record.id(),
            %priority,
            events = record.len(),
            "Handing record to encryption"
        );
        let ticket = match self.encryptor.submit(record) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.drop_unsent(&e);
                return;
            }
        };
        self.handoffs.fetch_add(1, Ordering::AcqRel);
        if self.lanes[priority.index()].send(ticket).is_err() {
            warn!(%priority, "Forwarder stopped, record dropped");
            self.counters.dropped_unsent.fetch_add(1, Ordering::Relaxed);
            self.handoff_done();
        }
    }

    /// Wait for one ticket and move the sealed record to the dispatcher.
    async fn forward(&self, mut ticket: EncryptTicket) {
        loop {
            match ticket.wait().await {
                Ok(sealed) => {
                    self.dispatcher.enqueue(sealed);
                    return;
                }
                Err(HandoffError::KeyNotProvisioned(returned))
                    if !self.closing.load(Ordering::Acquire)
                        || self.session.is_provisioned() =>
                {
                    self.counters.key_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        record_id = returned.id(),
                        "Key material still absent, resubmitting record"
                    );
                    ticket = match self.encryptor.submit(returned) {
                        Ok(ticket) => ticket,
                        Err(e) => {
                            self.drop_unsent(&e);
                            return;
                        }
                    };
                }
                Err(e) => {
                    self.drop_unsent(&e);
                    return;
                }
            }
        }
    }

    fn drop_unsent(&self, error: &HandoffError) {
        self.counters.dropped_unsent.fetch_add(1, Ordering::Relaxed);
        warn!(%error, "Record dropped before encryption");
    }

    fn handoff_done(&self) {
        if self.handoffs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handoffs_idle.notify_waiters();
        }
    }

    async fn wait_handoffs(&self) {
        loop {
            let idle = self.handoffs_idle.notified();
            if self.handoffs.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            records_flushed: c.records_flushed.load(Ordering::Relaxed),
            key_retries: c.key_retries.load(Ordering::Relaxed),
            dropped_unsent: c.dropped_unsent.load(Ordering::Relaxed),
            buffered: self.collector().total_pending(),
            dispatcher: self.dispatcher.stats(),
        }
    }
}

/// Cloneable ingress handle given to the host application.
///
/// Every method returns immediately and is safe to call from any thread.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl PipelineHandle {
    /// Accept a serialized event with a numeric priority (1 = ERROR,
    /// 2 = PERFORMANCE, 3 = USERBEHAVIOR).
    ///
    /// Returns whether the event was accepted. A rejected event is counted
    /// and dropped.
    pub fn submit_event(&self, payload: &str, priority: u8) -> bool {
        let priority = match Priority::from_code(priority) {
            Ok(p) => p,
            Err(e) => return self.inner.reject(&e.to_string()),
        };
        match Event::parse(payload) {
            Ok(event) => self.inner.record(event, priority),
            Err(e) => self.inner.reject(&e.to_string()),
        }
    }

    /// Accept an already-typed event.
    pub fn record(&self, event: Event, priority: Priority) -> bool {
        self.inner.record(event, priority)
    }

    /// Flush every buffer now. Returns the number of records built.
    pub fn flush(&self) -> usize {
        self.inner.flush_all()
    }

    /// Deliver the session key material.
    ///
    /// # Errors
    ///
    /// Returns an error if different material was provisioned earlier.
    pub fn provision_key(&self, material: KeyMaterial) -> Result<Provisioned> {
        let outcome = self.inner.session.provision(material)?;
        if outcome == Provisioned::Fresh {
            info!("Key material provisioned");
        }
        Ok(outcome)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }
}

/// A running pipeline and its background tasks.
#[derive(Debug)]
pub struct Pipeline {
    handle: PipelineHandle,
    timer: JoinHandle<()>,
    forwarders: Vec<JoinHandle<()>>,
    dispatcher_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
}

impl Pipeline {
    /// Start a pipeline on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn start(
        config: PipelineConfig,
        session: KeySession,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DiscardSink>,
    ) -> Self {
        let (encryptor, worker_task) = EncryptionWorker::spawn(session.clone(), config.handoff);
        let dispatcher = Dispatcher::new(config.dispatcher, transport, sink);
        let dispatcher_task = dispatcher.start();

        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (perf_tx, perf_rx) = mpsc::unbounded_channel();
        let (ub_tx, ub_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            collector: Mutex::new(Collector::new(config.max_batch_size)),
            scrubber: Scrubber::with_config(config.scrub),
            session,
            encryptor,
            dispatcher,
            lanes: [error_tx, perf_tx, ub_tx],
            counters: Counters::default(),
            handoffs: AtomicUsize::new(0),
            handoffs_idle: Notify::new(),
            closing: AtomicBool::new(false),
        });

        let forwarders = [error_rx, perf_rx, ub_rx]
            .into_iter()
            .map(|rx| tokio::spawn(Self::forward_lane(Arc::clone(&inner), rx)))
            .collect();
        let timer = tokio::spawn(Self::flush_timer(
            Arc::clone(&inner),
            config.flush_interval,
        ));
        debug!(
            flush_interval_ms = config.flush_interval.as_millis(),
            max_batch_size = config.max_batch_size,
            "Pipeline started"
        );

        Self {
            handle: PipelineHandle { inner },
            timer,
            forwarders,
            dispatcher_task,
            worker_task,
        }
    }

    /// Ingress handle.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.handle.stats()
    }

    /// Flush every buffer, wait for every record to be delivered or
    /// discarded, then stop the background tasks.
    ///
    /// Records still waiting for key material when their deadline passes are
    /// dropped rather than resubmitted, unless the key has arrived since.
    pub async fn shutdown(self) -> PipelineStats {
        let inner = &self.handle.inner;
        self.timer.abort();

        inner.closing.store(true, Ordering::Release);
        inner.flush_all();
        inner.wait_handoffs().await;
        inner.dispatcher.drain().await;
        inner.dispatcher.shutdown();

        let stats = inner.stats();
        self.abort_tasks();
        info!(
            accepted = stats.accepted,
            delivered = stats.dispatcher.delivered,
            discarded = stats.discarded(),
            "Pipeline stopped"
        );
        stats
    }

    fn abort_tasks(&self) {
        self.timer.abort();
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
        self.dispatcher_task.abort();
        self.worker_task.abort();
    }

    async fn forward_lane(
        inner: Arc<Inner>,
        mut tickets: mpsc::UnboundedReceiver<EncryptTicket>,
    ) {
        while let Some(ticket) = tickets.recv().await {
            inner.forward(ticket).await;
            inner.handoff_done();
        }
    }

    async fn flush_timer(inner: Arc<Inner>, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let count = inner.flush_all();
            if count > 0 {
                trace!(records = count, "Timer flush");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
