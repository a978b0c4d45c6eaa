//! DHT record validation.
//!
//! Kademlia stores opaque values. Before a record is accepted from a peer
//! (inbound `PutRecord`) or returned from a lookup (`get_record`), it is
//! checked by the [`RecordValidator`] registered for its key namespace.
//! Keys look like `/<namespace>/<rest>`.
//!
//! The built-in `weft` namespace holds [`SignedRecord`]s: values signed by an
//! ed25519 key with an absolute expiry. Keys of the form `/weft/addr/<peer>`
//! may only be written by `<peer>` itself.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use weft_types::NodeId;

use crate::error::NetError;
use crate::identity::peer_id_of;

/// Namespace of records written by weft nodes.
pub const WEFT_NAMESPACE: &str = "weft";

/// A record failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid record: {0}")]
pub struct InvalidRecord(pub String);

/// Validates and ranks records within one key namespace.
pub trait RecordValidator: Send + Sync {
    /// Accept or reject `value` stored under `key`.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), InvalidRecord>;

    /// Pick the best of several valid values. Returns an index into `values`.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> usize;
}

/// Registry of validators keyed by namespace.
#[derive(Default)]
pub struct Validators {
    by_namespace: HashMap<String, Box<dyn RecordValidator>>,
}

impl Validators {
    /// An empty registry. Every record is rejected until a validator is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by nodes: [`SignedRecordValidator`] for `weft`.
    pub fn with_defaults() -> Self {
        let mut v = Self::new();
        v.register(WEFT_NAMESPACE, SignedRecordValidator);
        v
    }

    /// Add or replace the validator for `namespace`.
    pub fn register(&mut self, namespace: &str, validator: impl RecordValidator + 'static) {
        self.by_namespace
            .insert(namespace.to_string(), Box::new(validator));
    }

    fn lookup(&self, key: &[u8]) -> Result<&dyn RecordValidator, InvalidRecord> {
        let ns = namespace(key).ok_or_else(|| InvalidRecord("key has no namespace".into()))?;
        self.by_namespace
            .get(ns)
            .map(|v| v.as_ref())
            .ok_or_else(|| InvalidRecord(format!("no validator for namespace {ns:?}")))
    }

    /// Validate a record with the validator for its namespace.
    pub fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), InvalidRecord> {
        self.lookup(key)?.validate(key, value)
    }

    /// Validate all candidates and select the best. `None` if none are valid.
    pub fn select_valid(&self, key: &[u8], values: Vec<Vec<u8>>) -> Option<Vec<u8>> {
        let validator = self.lookup(key).ok()?;
        let mut valid: Vec<Vec<u8>> = values
            .into_iter()
            .filter(|v| validator.validate(key, v).is_ok())
            .collect();
        if valid.is_empty() {
            return None;
        }
        let idx = validator.select(key, &valid).min(valid.len() - 1);
        Some(valid.swap_remove(idx))
    }
}

/// `/ns/rest` → `ns`
fn namespace(key: &[u8]) -> Option<&str> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix('/')?;
    let ns = rest.split('/').next()?;
    (!ns.is_empty()).then_some(ns)
}

/// Key under which a node publishes its dialable address.
pub fn address_key(peer: &libp2p::PeerId) -> Vec<u8> {
    format!("/{WEFT_NAMESPACE}/addr/{peer}").into_bytes()
}

/// A value signed by its publisher with an absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    /// The payload.
    pub value: Vec<u8>,
    /// Unix seconds after which the record is invalid.
    pub expires_at: u64,
    /// Publisher's ed25519 public key.
    pub public_key: NodeId,
    /// Signature over `(key, value, expires_at)`.
    pub signature: Vec<u8>,
}

impl SignedRecord {
    /// Sign `value` for `key`, valid for `ttl` from now.
    pub fn sign(signing_key: &SigningKey, key: &[u8], value: Vec<u8>, ttl: Duration) -> Self {
        let expires_at = unix_now().saturating_add(ttl.as_secs());
        let signature = signing_key.sign(&signing_payload(key, &value, expires_at));
        Self {
            value,
            expires_at,
            public_key: NodeId::from(signing_key.verifying_key().to_bytes()),
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Postcard encoding, as stored in the DHT.
    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode without validating.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    fn verify(&self, key: &[u8], now: u64) -> Result<(), InvalidRecord> {
        if self.expires_at <= now {
            return Err(InvalidRecord("expired".into()));
        }
        let vk = VerifyingKey::from_bytes(self.public_key.as_bytes())
            .map_err(|e| InvalidRecord(format!("bad public key: {e}")))?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| InvalidRecord("signature must be 64 bytes".into()))?;
        vk.verify(
            &signing_payload(key, &self.value, self.expires_at),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|_| InvalidRecord("bad signature".into()))
    }
}

fn signing_payload(key: &[u8], value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(key.len() as u64).to_le_bytes());
    hasher.update(key);
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value);
    hasher.update(&expires_at.to_le_bytes());
    hasher.finalize().as_bytes().to_vec()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validator for the `weft` namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedRecordValidator;

impl RecordValidator for SignedRecordValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), InvalidRecord> {
        let record = SignedRecord::decode(value).map_err(|e| InvalidRecord(e.to_string()))?;
        record.verify(key, unix_now())?;

        let key_str = std::str::from_utf8(key).map_err(|_| InvalidRecord("key is not utf-8".into()))?;
        if let Some(owner) = key_str.strip_prefix(&format!("/{WEFT_NAMESPACE}/addr/")) {
            let publisher = peer_id_of(&record.public_key)
                .ok_or_else(|| InvalidRecord("publisher key is not ed25519".into()))?;
            if publisher.to_string() != owner {
                return Err(InvalidRecord(format!(
                    "{publisher} may not publish the address of {owner}"
                )));
            }
        }
        Ok(())
    }

    fn select(&self, _key: &[u8], values: &[Vec<u8>]) -> usize {
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| SignedRecord::decode(v).ok().map(|r| (r.expires_at, i)))
            .max()
            .map(|(_, i)| i)
            .unwrap_or(0)
    }
}
