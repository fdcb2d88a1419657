//! Signing capability.
//!
//! Services never hold raw keys; they receive an [`EventSigner`]. [`Keys`]
//! is the in-process implementation backed by a secp256k1 secret key.

use crate::event::{
    Event, EventError, EventTemplate, UnsignedEvent, generate_secret_key, get_event_hash,
    get_public_key_hex, sign_id,
};
use std::fmt;

/// Something that can sign event ids on behalf of one public key.
pub trait EventSigner: Send + Sync {
    /// Hex x-only public key the signatures verify against.
    fn public_key(&self) -> &str;

    /// Schnorr signature (hex) over the 32 bytes of a hex event id.
    fn sign_id(&self, id: &str) -> Result<String, EventError>;

    /// Fill in pubkey, id and signature for a template.
    fn sign_template(&self, template: &EventTemplate) -> Result<Event, EventError> {
        let unsigned = UnsignedEvent {
            pubkey: self.public_key().to_string(),
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags.clone(),
            content: template.content.clone(),
        };
        let id = get_event_hash(&unsigned)?;
        let sig = self.sign_id(&id)?;

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
}

/// A secret key and its derived public key.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    pub fn new(secret_key: [u8; 32]) -> Result<Self, EventError> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Fresh random keys.
    pub fn generate() -> Result<Self, EventError> {
        Self::new(generate_secret_key())
    }

    /// Parse a 64-character hex secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| EventError::InvalidPublicKey(format!("invalid secret hex: {}", e)))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EventError::InvalidPublicKey("secret key must be 32 bytes".to_string()))?;
        Self::new(secret_key)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl EventSigner for Keys {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign_id(&self, id: &str) -> Result<String, EventError> {
        sign_id(id, &self.secret_key)
    }
}
