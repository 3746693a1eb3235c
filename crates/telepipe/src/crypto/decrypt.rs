//! Server-side decryption of ingested ciphertext.
//!
//! Fails closed: a ciphertext either yields every event it carries, fully
//! validated, or a [`DecodeFailure`]. Partial results are never returned.

use thiserror::Error;
use tracing::warn;

use super::cipher::{self, OpenError};
use super::session::KeySession;
use crate::event::Event;

/// Why a ciphertext was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    /// The server has no key material for this session.
    #[error("decryption key not provisioned")]
    KeyNotProvisioned,

    /// The payload is not valid base64.
    #[error("ciphertext is not valid base64")]
    Base64,

    /// Wrong key, truncated ciphertext, or corrupted padding.
    #[error("ciphertext did not decrypt under the session key")]
    Cipher,

    /// Decrypted bytes are not UTF-8.
    #[error("plaintext is not valid UTF-8")]
    Utf8,

    /// Decrypted text is not a JSON array of strings.
    #[error("plaintext is not a JSON event batch: {0}")]
    Json(String),

    /// One element of the batch is not a valid event.
    #[error("event {index} in batch is invalid: {reason}")]
    Event {
        /// Position of the offending event.
        index: usize,
        /// Validation message.
        reason: String,
    },
}

impl From<OpenError> for DecodeFailure {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::Base64 => Self::Base64,
            OpenError::Cipher => Self::Cipher,
        }
    }
}

/// Stateless decryption service bound to a key session.
///
/// Cheap to clone; safe to call from many requests in parallel.
#[derive(Debug, Clone)]
pub struct Decryptor {
    session: KeySession,
}

impl Decryptor {
    /// Create a decryptor that reads key material from `session`.
    #[must_use]
    pub fn new(session: KeySession) -> Self {
        Self { session }
    }

    /// The session this decryptor reads from.
    #[must_use]
    pub fn session(&self) -> &KeySession {
        &self.session
    }

    /// Recover the serialized event strings in a ciphertext.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeFailure`] for any stage that does not check out.
    pub fn open_batch(&self, ciphertext: &str) -> Result<Vec<String>, DecodeFailure> {
        let material = self
            .session
            .material()
            .ok_or(DecodeFailure::KeyNotProvisioned)?;
        let plaintext = cipher::open(&material, ciphertext)?;
        let text = String::from_utf8(plaintext).map_err(|_| DecodeFailure::Utf8)?;
        serde_json::from_str(&text).map_err(|e| DecodeFailure::Json(e.to_string()))
    }

    /// Decrypt a ciphertext into validated events.
    ///
    /// Failures are logged here; callers only need to count them.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeFailure`] if the ciphertext or any event in it is
    /// malformed.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<Event>, DecodeFailure> {
        let result = self.open_batch(ciphertext).and_then(|batch| {
            batch
                .iter()
                .enumerate()
                .map(|(index, raw)| {
                    Event::parse(raw).map_err(|e| DecodeFailure::Event {
                        index,
                        reason: e.to_string(),
                    })
                })
                .collect()
        });

        if let Err(failure) = &result {
            warn!(
                error = %failure,
                ciphertext_len = ciphertext.len(),
                "Rejected telemetry ciphertext"
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::session::KeyMaterial;
    use crate::event::{ErrorEvent, InteractionEvent, PerformanceSample};
    use crate::record::{Priority, ProcessingRecord};
    use base64::Engine;

    fn material() -> KeyMaterial {
        KeyMaterial::new(b"k3y-k3y-k3y-k3y!", b"iv-iv-iv-iv-iv-!").unwrap()
    }

    fn events() -> Vec<Event> {
        vec![
            Event::Error(ErrorEvent {
                indicator_id: 7,
                url: "/api/x".to_string(),
                timestamp: 1_700_000_000_000,
                message: "boom".to_string(),
                stack: Some("at main.js:1".to_string()),
            }),
            Event::Performance(PerformanceSample {
                indicator_id: 3,
                url: "/home".to_string(),
                timestamp: 1_700_000_000_500,
                name: "lcp".to_string(),
                value: 1234.25,
            }),
            Event::Interaction(InteractionEvent {
                indicator_id: 9,
                url: "/cart".to_string(),
                timestamp: 1_700_000_001_000,
                target: "button#buy".to_string(),
                value: None,
            }),
        ]
    }

    fn sealed(material: &KeyMaterial, events: &[Event]) -> String {
        let strings = events.iter().map(|e| e.to_json().unwrap()).collect();
        let record = ProcessingRecord::new(Priority::Error, strings);
        cipher::seal(material, &record.body().unwrap())
    }

    #[test]
    fn test_round_trip() {
        let decryptor = Decryptor::new(KeySession::with_material(material()));
        let original = events();
        let decoded = decryptor.decrypt(&sealed(&material(), &original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_round_trip_preserves_record_strings() {
        let strings: Vec<String> = events().iter().map(|e| e.to_json().unwrap()).collect();
        let record = ProcessingRecord::new(Priority::Performance, strings);
        let wire = cipher::seal(&material(), &record.body().unwrap());

        let decryptor = Decryptor::new(KeySession::with_material(material()));
        assert_eq!(decryptor.open_batch(&wire).unwrap(), record.events());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let other = KeyMaterial::new(b"another-key-1234", b"iv-iv-iv-iv-iv-!").unwrap();
        let decryptor = Decryptor::new(KeySession::with_material(material()));
        let result = decryptor.decrypt(&sealed(&other, &events()));
        assert!(matches!(
            result,
            Err(DecodeFailure::Cipher | DecodeFailure::Utf8 | DecodeFailure::Json(_))
        ));
    }

    #[test]
    fn test_random_bytes_fail_closed() {
        let decryptor = Decryptor::new(KeySession::with_material(material()));
        let engine = base64::engine::general_purpose::STANDARD;
        for seed in 0u8..16 {
            let junk: Vec<u8> = (0..64u8)
                .map(|i| i.wrapping_mul(31).wrapping_add(seed))
                .collect();
            assert!(decryptor.decrypt(&engine.encode(junk)).is_err());
        }
        assert_eq!(decryptor.decrypt("not base64!"), Err(DecodeFailure::Base64));
    }

    #[test]
    fn test_non_json_plaintext_rejected() {
        let decryptor = Decryptor::new(KeySession::with_material(material()));
        let wire = cipher::seal(&material(), b"hello, world");
        assert!(matches!(
            decryptor.decrypt(&wire),
            Err(DecodeFailure::Json(_))
        ));
    }

    #[test]
    fn test_one_bad_event_rejects_whole_batch() {
        let decryptor = Decryptor::new(KeySession::with_material(material()));
        let body = serde_json::to_vec(&vec![
            events()[0].to_json().unwrap(),
            r#"{"kind":"error","indicatorId":0,"url":"/","timestamp":1,"message":"x"}"#
                .to_string(),
        ])
        .unwrap();
        let wire = cipher::seal(&material(), &body);
        match decryptor.decrypt(&wire) {
            Err(DecodeFailure::Event { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected event failure, got {other:?}"),
        }
    }

    #[test]
    fn test_unprovisioned_session() {
        let decryptor = Decryptor::new(KeySession::new());
        let wire = sealed(&material(), &events());
        assert_eq!(
            decryptor.decrypt(&wire),
            Err(DecodeFailure::KeyNotProvisioned)
        );
    }
}
