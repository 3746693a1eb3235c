//! Priority-ordered sending with bounded retries.
//!
//! The dispatcher keeps one FIFO queue per [`Priority`] and always takes the
//! next record from the highest non-empty queue. A record is out of the
//! queues while its send is in flight, so it is never sent twice at once.
//!
//! A failed record goes straight back into its own queue, tagged with the
//! instant its linear backoff ends. While a queue holds only records that are
//! still backing off, lower queues wait too: every pending ERROR record is
//! attempted before any PERFORMANCE or USERBEHAVIOR record. A record that
//! runs out of retries is discarded, counted and handed to the
//! [`DiscardSink`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Transport, TransportFailure};
use crate::crypto::SealedRecord;
use crate::record::Priority;

/// Tuning for the [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Failed attempts a record may accumulate before it is discarded.
    pub max_retries: u32,
    /// Sends allowed in flight at once.
    pub max_in_flight: usize,
    /// Per-attempt deadline; expiry counts as a failed attempt.
    pub send_timeout: Duration,
    /// Base delay before a failed record may be attempted again. Multiplied
    /// by the record's retry count.
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_in_flight: 4,
            send_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// A record that will not be sent again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscardedRecord {
    /// Identifier of the original record.
    pub record_id: u64,
    /// Its priority.
    pub priority: Priority,
    /// Failed attempts at the time of discard.
    pub retries: u32,
    /// Events in the batch.
    pub event_count: usize,
    /// The ciphertext that could not be delivered.
    pub ciphertext: String,
    /// The last failure.
    pub reason: String,
    /// When the record was given up on.
    pub discarded_at: DateTime<Utc>,
}

impl DiscardedRecord {
    fn new(sealed: SealedRecord, reason: &TransportFailure) -> Self {
        Self {
            record_id: sealed.record.id(),
            priority: sealed.record.priority(),
            retries: sealed.record.retries(),
            event_count: sealed.record.len(),
            ciphertext: sealed.ciphertext,
            reason: reason.to_string(),
            discarded_at: Utc::now(),
        }
    }
}

/// Receives records the dispatcher has given up on.
pub trait DiscardSink: Send + Sync {
    /// Take ownership of a discarded record. Must not fail loudly; sinks log
    /// their own errors.
    fn discard(&self, record: DiscardedRecord);
}

/// A sink that drops discarded records on the floor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiscardSink for NullSink {
    fn discard(&self, _record: DiscardedRecord) {}
}

/// What happened to one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the endpoint.
    Delivered,
    /// Failed; queued again with this many retries used.
    Requeued(u32),
    /// Failed for the last time.
    Discarded,
}

/// Counters exposed for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Records accepted by the endpoint.
    pub delivered: u64,
    /// Send attempts that failed.
    pub failed_attempts: u64,
    /// Records put back in a queue after a failure.
    pub requeued: u64,
    /// Records given up on.
    pub discarded: u64,
    /// Records waiting in the queues, highest priority first.
    pub queued: [usize; 3],
    /// Sends currently in flight.
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
}

/// A queued record and the earliest instant it may be attempted again.
struct Queued {
    sealed: SealedRecord,
    not_before: Option<Instant>,
}

impl Queued {
    fn is_ready(&self, now: Instant) -> bool {
        !matches!(self.not_before, Some(at) if at > now)
    }
}

/// Result of looking for the next record to send.
enum Next {
    Ready(SealedRecord),
    /// The highest non-empty queue is backing off until this instant.
    BackingOff(Instant),
    Empty,
}

type Lanes = [VecDeque<Queued>; 3];

struct Shared {
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn DiscardSink>,
    queues: Mutex<Lanes>,
    permits: Arc<Semaphore>,
    wake: Notify,
    idle: Notify,
    /// Records owned by the dispatcher: queued, in flight, or backing off.
    outstanding: AtomicUsize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn queues(&self) -> MutexGuard<'_, Lanes> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, sealed: SealedRecord, not_before: Option<Instant>) {
        let index = sealed.record.priority().index();
        self.queues()[index].push_back(Queued { sealed, not_before });
        self.wake.notify_one();
    }

    /// Take the first ready record of the highest non-empty queue. A queue
    /// whose records are all backing off blocks every queue below it.
    fn next(&self, now: Instant) -> Next {
        let mut queues = self.queues();
        let Some(lane) = queues.iter_mut().find(|lane| !lane.is_empty()) else {
            return Next::Empty;
        };
        let ready = lane.iter().position(|q| q.is_ready(now));
        if let Some(queued) = ready.and_then(|pos| lane.remove(pos)) {
            return Next::Ready(queued.sealed);
        }
        lane.iter()
            .filter_map(|q| q.not_before)
            .min()
            .map_or(Next::Empty, Next::BackingOff)
    }

    fn finish(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Sends sealed records in priority order with retry and discard.
///
/// Cheap to clone; all clones feed the same queues.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher. Nothing is sent until [`Dispatcher::start`].
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DiscardSink>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                sink,
                queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
                permits,
                wake: Notify::new(),
                idle: Notify::new(),
                outstanding: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Queue a sealed record behind others of its priority.
    pub fn enqueue(&self, sealed: SealedRecord) {
        trace!(
            record_id = sealed.record.id(),
            priority = %sealed.record.priority(),
            "Queued record for sending"
        );
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.push(sealed, None);
    }

    /// Spawn the send loop on the current runtime.
    #[must_use]
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(Self::run(Arc::clone(&self.shared)))
    }

    /// Stop taking new records off the queues. In-flight sends finish.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /// Wait until every enqueued record has been delivered or discarded.
    pub async fn drain(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let queued = {
            let queues = self.shared.queues();
            [queues[0].len(), queues[1].len(), queues[2].len()]
        };
        let c = &self.shared.counters;
        DispatcherStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            queued,
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Records given up on so far.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.shared.counters.discarded.load(Ordering::Relaxed)
    }

    async fn run(shared: Arc<Shared>) {
        debug!(
            max_in_flight = shared.config.max_in_flight,
            max_retries = shared.config.max_retries,
            "Dispatcher started"
        );
        loop {
            if shared.closed.load(Ordering::Acquire) {
                break;
            }
            // Take the permit first so the record chosen is the highest
            // priority one at the moment a slot opens.
            let Ok(permit) = Arc::clone(&shared.permits).acquire_owned().await else {
                break;
            };
            match shared.next(Instant::now()) {
                Next::Ready(sealed) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        Self::attempt(&shared, sealed, permit).await;
                    });
                }
                Next::BackingOff(until) => {
                    drop(permit);
                    tokio::select! {
                        () = shared.wake.notified() => {}
                        () = tokio::time::sleep_until(until) => {}
                    }
                }
                Next::Empty => {
                    drop(permit);
                    shared.wake.notified().await;
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn attempt(
        shared: &Arc<Shared>,
        mut sealed: SealedRecord,
        permit: OwnedSemaphorePermit,
    ) -> SendOutcome {
        let priority = sealed.record.priority();
        let record_id = sealed.record.id();
        let timeout = shared.config.send_timeout;

        // Send with a per-attempt deadline
        shared.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = match tokio::time::timeout(
            timeout,
            shared.transport.send(&sealed.ciphertext, priority),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportFailure::Timeout(timeout)),
        };
        shared.in_flight.fetch_sub(1, Ordering::Relaxed);

        let failure = match result {
            Ok(()) => {
                drop(permit);
                trace!(record_id, %priority, "Record delivered");
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                shared.finish();
                return SendOutcome::Delivered;
            }
            Err(failure) => failure,
        };

        // Count the failure, then discard or requeue
        shared.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let retries = sealed.record.record_failure();

        if !failure.is_retryable() || sealed.record.exceeds(shared.config.max_retries) {
            drop(permit);
            warn!(
                record_id,
                %priority,
                retries,
                error = %failure,
                "Discarding record"
            );
            shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
            let discarded = DiscardedRecord::new(sealed, &failure);
            let sink = Arc::clone(&shared.sink);
            let _ = tokio::task::spawn_blocking(move || sink.discard(discarded)).await;
            shared.finish();
            return SendOutcome::Discarded;
        }

        debug!(record_id, %priority, retries, error = %failure, "Send failed, retrying");
        // Requeue before the slot is released.
        let backoff = shared.config.retry_backoff.saturating_mul(retries);
        let not_before = (!backoff.is_zero()).then(|| Instant::now() + backoff);
        shared.counters.requeued.fetch_add(1, Ordering::Relaxed);
        shared.push(sealed, not_before);
        drop(permit);
        SendOutcome::Requeued(retries)
    }
}
