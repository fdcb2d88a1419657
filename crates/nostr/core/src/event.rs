//! Signed Nostr events.
//!
//! Covers the event record itself, its canonical serialization, id
//! derivation, Schnorr signing over secp256k1 and verification:
//! - Canonical form `[0, pubkey, created_at, kind, tags, content]`
//! - `id` is the lowercase hex sha256 of the canonical form
//! - `sig` is a BIP-340 signature of the id bytes by `pubkey`

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building, signing or checking events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("id mismatch: expected {expected}, computed {computed}")]
    IdMismatch { expected: String, computed: String },

    #[error("invalid signature for event {0}")]
    InvalidSignature(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// The `d` tag identifier used by addressable kinds. Missing means empty.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Unsigned view of this event, used to recompute the id.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// An event before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey comes from the signer.
///
/// ```
/// use vine_nostr::{EventTemplate, KIND_VIDEO};
///
/// let template = EventTemplate {
///     created_at: 1_700_000_000,
///     kind: KIND_VIDEO,
///     tags: vec![vec!["d".to_string(), "vine_1".to_string()]],
///     content: "first loop".to_string(),
/// };
/// assert_eq!(template.kind, 32222);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key from a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], EventError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event into its canonical form.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]`
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, EventError> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(EventError::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id (hex sha256 of the canonical form).
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural validation of a signed event (no signature check).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Sign an unsigned event whose pubkey belongs to `secret_key`.
pub fn sign_event(unsigned: UnsignedEvent, secret_key: &[u8; 32]) -> Result<Event, EventError> {
    let id = get_event_hash(&unsigned)?;
    let sig = sign_id(&id, secret_key)?;

    Ok(Event {
        id,
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig,
    })
}

/// Produce a hex Schnorr signature over a hex event id.
pub fn sign_id(id: &str, secret_key: &[u8; 32]) -> Result<String, EventError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;

    let id_bytes =
        hex::decode(id).map_err(|e| EventError::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Signing(format!("invalid message: {}", e)))?;

    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
    Ok(hex::encode(sig.serialize()))
}

/// Sign a template with a secret key, producing a complete event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, EventError> {
    let pubkey = get_public_key_hex(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;

    let unsigned = UnsignedEvent {
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    sign_event(unsigned, secret_key)
}

/// Check structure, id binding and signature, classifying the first failure.
pub fn check_event(event: &Event) -> Result<(), EventError> {
    if !validate_event(event) {
        return Err(EventError::InvalidEvent(
            "id, pubkey and sig must be lowercase hex of 64/64/128 characters".to_string(),
        ));
    }

    let computed = get_event_hash(&event.unsigned())?;
    if computed != event.id {
        return Err(EventError::IdMismatch {
            expected: event.id.clone(),
            computed,
        });
    }

    let invalid_sig = || EventError::InvalidSignature(event.id.clone());

    let secp = Secp256k1::verification_only();
    let id_bytes = hex::decode(&event.id).map_err(|_| invalid_sig())?;
    let message = Message::from_digest_slice(&id_bytes).map_err(|_| invalid_sig())?;
    let sig_bytes = hex::decode(&event.sig).map_err(|_| invalid_sig())?;
    let sig = schnorr::Signature::from_slice(&sig_bytes).map_err(|_| invalid_sig())?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;

    secp.verify_schnorr(&sig, &message, &pubkey)
        .map_err(|_| invalid_sig())
}

/// Verify an event's id and signature.
///
/// Returns `Ok(false)` for events that are well formed but do not verify,
/// and an error only when the canonical form cannot be produced.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    match check_event(event) {
        Ok(()) => Ok(true),
        Err(EventError::Serialization(e)) => Err(EventError::Serialization(e)),
        Err(_) => Ok(false),
    }
}

/// Sort events newest first, ties broken by ascending id.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| compare_recency(a, b));
}

/// Ordering used everywhere events are listed: created_at desc, then id asc.
pub fn compare_recency(a: &Event, b: &Event) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

pub(crate) fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
