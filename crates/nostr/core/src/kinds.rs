//! Event kinds and how the store treats each of them.
//!
//! NIP-01 splits the kind space into regular, replaceable, ephemeral and
//! addressable ranges. [`ReplaceablePolicy`] starts from that split and lets
//! callers override individual kinds.

use crate::event::Event;
use std::collections::HashMap;

pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_DELETION: u16 = 5;
pub const KIND_REPOST: u16 = 6;
pub const KIND_REACTION: u16 = 7;
pub const KIND_GENERIC_REPOST: u16 = 16;
pub const KIND_RELAY_LIST: u16 = 10002;
/// Short-form video post, addressable by its `d` tag.
pub const KIND_VIDEO: u16 = 32222;

/// Event kind classification according to NIP-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Stored as-is
    Regular,
    /// Latest per pubkey+kind
    Replaceable,
    /// Delivered live, never stored
    Ephemeral,
    /// Latest per pubkey+kind+d-tag
    Addressable,
    /// Outside every NIP-01 range
    Unknown,
}

/// Classify an event kind according to NIP-01 rules.
pub fn classify_kind(kind: u16) -> KindClassification {
    let k = kind as u32;

    if (1000..10000).contains(&k) || (4..45).contains(&k) || k == 1 || k == 2 {
        return KindClassification::Regular;
    }
    if (10000..20000).contains(&k) || k == 0 || k == 3 {
        return KindClassification::Replaceable;
    }
    if (20000..30000).contains(&k) {
        return KindClassification::Ephemeral;
    }
    if (30000..40000).contains(&k) {
        return KindClassification::Addressable;
    }

    KindClassification::Unknown
}

pub fn is_regular_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Regular)
}

pub fn is_replaceable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

pub fn is_ephemeral_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

pub fn is_addressable_kind(kind: u16) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// How the store keeps events of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Every event is kept.
    Regular,
    /// Only the newest event per (pubkey, kind) is kept.
    ByAuthorKind,
    /// Only the newest event per (pubkey, kind, d tag) is kept.
    ByAuthorKindTag,
    /// Announced to live subscribers, never stored.
    Ephemeral,
}

/// Identity of the slot a replaceable event occupies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplaceKey {
    pub pubkey: String,
    pub kind: u16,
    /// `d` tag value for addressable slots, `None` for plain replaceable ones.
    pub identifier: Option<String>,
}

impl ReplaceKey {
    /// NIP-01 `a` tag coordinate (`kind:pubkey:d`).
    pub fn coordinate(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.pubkey,
            self.identifier.as_deref().unwrap_or("")
        )
    }
}

/// Per-kind retention rules, defaulting to the NIP-01 ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceablePolicy {
    overrides: HashMap<u16, Retention>,
}

impl ReplaceablePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the retention of a single kind.
    pub fn with_override(mut self, kind: u16, retention: Retention) -> Self {
        self.overrides.insert(kind, retention);
        self
    }

    pub fn retention(&self, kind: u16) -> Retention {
        if let Some(retention) = self.overrides.get(&kind) {
            return *retention;
        }
        match classify_kind(kind) {
            KindClassification::Replaceable => Retention::ByAuthorKind,
            KindClassification::Addressable => Retention::ByAuthorKindTag,
            KindClassification::Ephemeral => Retention::Ephemeral,
            KindClassification::Regular | KindClassification::Unknown => Retention::Regular,
        }
    }

    /// The replacement slot of `event`, if its kind is replaceable.
    pub fn key_for(&self, event: &Event) -> Option<ReplaceKey> {
        match self.retention(event.kind) {
            Retention::ByAuthorKind => Some(ReplaceKey {
                pubkey: event.pubkey.clone(),
                kind: event.kind,
                identifier: None,
            }),
            Retention::ByAuthorKindTag => Some(ReplaceKey {
                pubkey: event.pubkey.clone(),
                kind: event.kind,
                identifier: Some(event.identifier().to_string()),
            }),
            Retention::Regular | Retention::Ephemeral => None,
        }
    }

    pub fn is_ephemeral(&self, kind: u16) -> bool {
        self.retention(kind) == Retention::Ephemeral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, finalize_event, generate_secret_key};

    #[test]
    fn test_classify_kind_ranges() {
        assert_eq!(classify_kind(1), KindClassification::Regular);
        assert_eq!(classify_kind(7), KindClassification::Regular);
        assert_eq!(classify_kind(0), KindClassification::Replaceable);
        assert_eq!(classify_kind(3), KindClassification::Replaceable);
        assert_eq!(classify_kind(10002), KindClassification::Replaceable);
        assert_eq!(classify_kind(20001), KindClassification::Ephemeral);
        assert_eq!(classify_kind(KIND_VIDEO), KindClassification::Addressable);
        assert_eq!(classify_kind(45), KindClassification::Unknown);
        assert_eq!(classify_kind(40000), KindClassification::Unknown);
    }

    #[test]
    fn test_video_kind_keyed_by_d_tag() {
        let sk = generate_secret_key();
        let template = EventTemplate {
            created_at: 100,
            kind: KIND_VIDEO,
            tags: vec![vec!["d".to_string(), "vine_1".to_string()]],
            content: String::new(),
        };
        let event = finalize_event(&template, &sk).unwrap();

        let key = ReplaceablePolicy::default().key_for(&event).unwrap();
        assert_eq!(key.identifier.as_deref(), Some("vine_1"));
        assert_eq!(key.coordinate(), format!("32222:{}:vine_1", event.pubkey));
    }

    #[test]
    fn test_override_makes_kind_regular() {
        let policy = ReplaceablePolicy::new().with_override(KIND_VIDEO, Retention::Regular);
        assert_eq!(policy.retention(KIND_VIDEO), Retention::Regular);
        assert_eq!(policy.retention(KIND_METADATA), Retention::ByAuthorKind);
        assert!(policy.is_ephemeral(20000));
    }
}
