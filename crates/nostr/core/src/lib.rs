//! Nostr protocol core for the Vine relay/sync engine.
//!
//! This crate provides:
//! - Signed events, canonical serialization, Schnorr signing and verification
//! - Kind classification and per-kind replacement rules
//! - Subscription filters and the matcher shared by backfill and live delivery
//! - NIP-01 wire messages in both directions
//! - The `EventSigner` and `Clock` capabilities injected into services

mod clock;
mod event;
mod filter;
mod kinds;
mod message;
mod signer;


pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{
    Event, EventError, EventTemplate, UnsignedEvent, check_event, compare_recency,
    finalize_event, generate_secret_key, get_event_hash, get_public_key, get_public_key_hex,
    serialize_event, sign_event, sign_id, sort_events, validate_event, verify_event,
};
pub use filter::{Filter, FilterError, FilterMismatch, MAX_LIMIT};
pub use kinds::{
    KIND_CONTACTS, KIND_DELETION, KIND_GENERIC_REPOST, KIND_METADATA, KIND_REACTION,
    KIND_RELAY_LIST, KIND_REPOST, KIND_SHORT_TEXT_NOTE, KIND_VIDEO, KindClassification,
    ReplaceKey, ReplaceablePolicy, Retention, classify_kind, is_addressable_kind,
    is_ephemeral_kind, is_regular_kind, is_replaceable_kind,
};
pub use message::{ClientMessage, MessageError, RelayMessage, reason_prefix};
pub use signer::{EventSigner, Keys};
