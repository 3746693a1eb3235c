//! Off-thread encryption of outbound records.
//!
//! Records are submitted to an [`EncryptionWorker`] task through an
//! [`Encryptor`] handle and come back through an [`EncryptTicket`]. The
//! cipher itself runs on tokio's blocking pool so a large batch never stalls
//! collection. Until the [`KeySession`] is provisioned, jobs wait in a
//! bounded queue; the oldest job is dropped when the queue is full, and a job
//! that waits longer than the key deadline is handed back with
//! [`HandoffError::KeyNotProvisioned`] so the caller can try again later.
//! No record ever leaves this module unencrypted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::cipher;
use super::session::{KeyMaterial, KeySession};
use crate::record::ProcessingRecord;

/// A record together with its ciphertext.
#[derive(Debug, Clone)]
pub struct SealedRecord {
    /// The batch that was encrypted; owns the retry counter.
    pub record: ProcessingRecord,
    /// Base64 AES-CBC ciphertext of the record body.
    pub ciphertext: String,
}

/// Ways a handoff can fail. Variants carrying a record give it back.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// No key material arrived before the deadline. Retry later.
    #[error("key material not provisioned before deadline for record {}", .0.id())]
    KeyNotProvisioned(ProcessingRecord),

    /// The pending queue was full and this, the oldest job, was dropped.
    #[error("pending queue full, dropped record {}", .0.id())]
    Overflow(ProcessingRecord),

    /// The record body could not be serialized.
    #[error("failed to encode record {}: {message}", .record.id())]
    Encode {
        /// The record that failed.
        record: ProcessingRecord,
        /// Serializer message.
        message: String,
    },

    /// The worker task has shut down.
    #[error("encryption worker is not running")]
    WorkerGone,
}

impl HandoffError {
    /// Take back the record, if this error carries one.
    #[must_use]
    pub fn into_record(self) -> Option<ProcessingRecord> {
        match self {
            Self::KeyNotProvisioned(record) | Self::Overflow(record) => Some(record),
            Self::Encode { record, .. } => Some(record),
            Self::WorkerGone => None,
        }
    }

    /// Whether the caller should resubmit the record later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyNotProvisioned(_))
    }
}

/// Tuning for the encryption worker.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Jobs held while waiting for key material.
    pub pending_capacity: usize,
    /// How long a job may wait for key material.
    pub key_wait_timeout: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 256,
            key_wait_timeout: Duration::from_secs(10),
        }
    }
}

type Reply = oneshot::Sender<Result<SealedRecord, HandoffError>>;

#[derive(Debug)]
struct Job {
    record: ProcessingRecord,
    reply: Reply,
    enqueued_at: Instant,
}

/// Pending result of a submitted record.
#[derive(Debug)]
pub struct EncryptTicket {
    rx: oneshot::Receiver<Result<SealedRecord, HandoffError>>,
}

impl EncryptTicket {
    /// Wait for the worker's answer.
    ///
    /// # Errors
    ///
    /// Returns the worker's [`HandoffError`], or [`HandoffError::WorkerGone`]
    /// if the worker shut down without answering.
    pub async fn wait(self) -> Result<SealedRecord, HandoffError> {
        self.rx.await.unwrap_or(Err(HandoffError::WorkerGone))
    }
}

/// Cloneable handle for submitting records to the encryption worker.
#[derive(Debug, Clone)]
pub struct Encryptor {
    tx: mpsc::UnboundedSender<Job>,
}

impl Encryptor {
    /// Hand a record to the worker. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::WorkerGone`] if the worker has stopped.
    pub fn submit(&self, record: ProcessingRecord) -> Result<EncryptTicket, HandoffError> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            record,
            reply,
            enqueued_at: Instant::now(),
        };
        self.tx
            .send(job)
            .map_err(|_| HandoffError::WorkerGone)?;
        Ok(EncryptTicket { rx })
    }

    /// Submit a record and wait for its ciphertext.
    ///
    /// # Errors
    ///
    /// See [`Encryptor::submit`] and [`EncryptTicket::wait`].
    pub async fn encrypt(&self, record: ProcessingRecord) -> Result<SealedRecord, HandoffError> {
        self.submit(record)?.wait().await
    }
}

/// The task that owns the pending queue and dispatches cipher work.
#[derive(Debug)]
pub struct EncryptionWorker {
    session: KeySession,
    config: HandoffConfig,
    rx: mpsc::UnboundedReceiver<Job>,
    pending: VecDeque<Job>,
}

impl EncryptionWorker {
    /// Spawn the worker on the current runtime.
    ///
    /// The worker runs until every [`Encryptor`] handle is dropped; jobs still
    /// waiting for key material at that point are answered with
    /// [`HandoffError::KeyNotProvisioned`].
    #[must_use]
    pub fn spawn(session: KeySession, config: HandoffConfig) -> (Encryptor, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            session,
            config,
            rx,
            pending: VecDeque::new(),
        };
        let handle = tokio::spawn(worker.run());
        (Encryptor { tx }, handle)
    }

    async fn run(mut self) {
        let mut key_rx = self.session.subscribe();
        let mut key_open = true;
        let sweep_every = (self.config.key_wait_timeout / 4).max(Duration::from_millis(10));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some(job) => self.accept(job),
                    None => break,
                },
                changed = key_rx.changed(), if key_open => {
                    if changed.is_err() {
                        key_open = false;
                    } else {
                        let material = key_rx.borrow_and_update().clone();
                        if let Some(material) = material {
                            self.release_pending(&material);
                        }
                    }
                }
                _ = sweep.tick() => self.expire_pending(),
            }
        }

        for job in self.pending.drain(..) {
            let _ = job.reply.send(Err(HandoffError::KeyNotProvisioned(job.record)));
        }
        debug!("Encryption worker stopped");
    }

    fn accept(&mut self, job: Job) {
        if let Some(material) = self.session.material() {
            // Older queued jobs go first if the key landed before we saw it.
            self.release_pending(&material);
            Self::seal(material, job);
            return;
        }

        if self.pending.len() >= self.config.pending_capacity.max(1) {
            if let Some(oldest) = self.pending.pop_front() {
                warn!(
                    record_id = oldest.record.id(),
                    priority = %oldest.record.priority(),
                    "Handoff queue full, dropping oldest record"
                );
                let _ = oldest.reply.send(Err(HandoffError::Overflow(oldest.record)));
            }
        }
        trace!(record_id = job.record.id(), "Queued record until key arrives");
        self.pending.push_back(job);
    }

    fn release_pending(&mut self, material: &Arc<KeyMaterial>) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "Key provisioned, releasing queued records");
        }
        for job in self.pending.drain(..) {
            Self::seal(Arc::clone(material), job);
        }
    }

    fn expire_pending(&mut self) {
        let deadline = self.config.key_wait_timeout;
        while self
            .pending
            .front()
            .is_some_and(|job| job.enqueued_at.elapsed() >= deadline)
        {
            if let Some(job) = self.pending.pop_front() {
                debug!(
                    record_id = job.record.id(),
                    "Key not provisioned before deadline, returning record"
                );
                let _ = job
                    .reply
                    .send(Err(HandoffError::KeyNotProvisioned(job.record)));
            }
        }
    }

    fn seal(material: Arc<KeyMaterial>, job: Job) {
        tokio::task::spawn_blocking(move || {
            let Job { record, reply, .. } = job;
            let result = match record.body() {
                Ok(body) => Ok(SealedRecord {
                    ciphertext: cipher::seal(&material, &body),
                    record,
                }),
                Err(e) => Err(HandoffError::Encode {
                    message: e.to_string(),
                    record,
                }),
            };
            let _ = reply.send(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Priority;

    fn material() -> KeyMaterial {
        KeyMaterial::new(&[1u8; 16], &[2u8; 16]).unwrap()
    }

    fn record(n: usize) -> ProcessingRecord {
        ProcessingRecord::new(Priority::Performance, vec![format!("event-{n}")])
    }

    fn quick_config(capacity: usize, wait_ms: u64) -> HandoffConfig {
        HandoffConfig {
            pending_capacity: capacity,
            key_wait_timeout: Duration::from_millis(wait_ms),
        }
    }

    #[tokio::test]
    async fn test_encrypts_when_provisioned() {
        let session = KeySession::with_material(material());
        let (encryptor, _handle) = EncryptionWorker::spawn(session, HandoffConfig::default());

        let original = record(1);
        let sealed = encryptor.encrypt(original.clone()).await.unwrap();
        assert_eq!(sealed.record, original);
        let plain = cipher::open(&material(), &sealed.ciphertext).unwrap();
        assert_eq!(plain, original.body().unwrap());
    }

    #[tokio::test]
    async fn test_queues_until_key_arrives() {
        let session = KeySession::new();
        let (encryptor, _handle) =
            EncryptionWorker::spawn(session.clone(), quick_config(8, 60_000));

        let ticket = encryptor.submit(record(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.provision(material()).unwrap();

        let sealed = ticket.wait().await.unwrap();
        assert!(!sealed.ciphertext.is_empty());
        assert!(!sealed.ciphertext.contains("event-1"));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let session = KeySession::new();
        let (encryptor, _handle) =
            EncryptionWorker::spawn(session.clone(), quick_config(2, 60_000));

        let first = record(1);
        let first_id = first.id();
        let t1 = encryptor.submit(first).unwrap();
        let t2 = encryptor.submit(record(2)).unwrap();
        let t3 = encryptor.submit(record(3)).unwrap();

        match t1.wait().await {
            Err(HandoffError::Overflow(r)) => assert_eq!(r.id(), first_id),
            other => panic!("expected overflow, got {other:?}"),
        }

        session.provision(material()).unwrap();
        assert!(t2.wait().await.is_ok());
        assert!(t3.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_returns_record_for_retry() {
        let session = KeySession::new();
        let (encryptor, _handle) = EncryptionWorker::spawn(session, quick_config(8, 30));

        let original = record(1);
        let err = encryptor.encrypt(original.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.into_record(), Some(original));
    }

    #[tokio::test]
    async fn test_duplicate_provision_does_not_reencrypt() {
        let session = KeySession::new();
        let (encryptor, _handle) =
            EncryptionWorker::spawn(session.clone(), quick_config(8, 60_000));

        let ticket = encryptor.submit(record(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.provision(material()).unwrap();
        session.provision(material()).unwrap();

        let sealed = ticket.wait().await.unwrap();
        assert_eq!(sealed.record.retries(), 0);

        let again = encryptor.encrypt(record(2)).await.unwrap();
        assert_ne!(again.record.id(), sealed.record.id());
    }

    #[tokio::test]
    async fn test_worker_gone_after_shutdown() {
        let session = KeySession::new();
        let (encryptor, handle) = EncryptionWorker::spawn(session, quick_config(8, 60_000));
        let ticket = encryptor.submit(record(1)).unwrap();
        drop(encryptor);
        handle.await.unwrap();

        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, HandoffError::KeyNotProvisioned(_)));
    }

    #[test]
    fn test_handoff_config_default() {
        let config = HandoffConfig::default();
        assert_eq!(config.pending_capacity, 256);
        assert_eq!(config.key_wait_timeout, Duration::from_secs(10));
    }
}
