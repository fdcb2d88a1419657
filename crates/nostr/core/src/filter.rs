//! Subscription filters and the event matcher.
//!
//! A filter is a conjunction of optional constraints. Within one list
//! constraint any value may match; across tag names every tag must match.
//! `since` and `until` are inclusive. `limit` only caps historical results.

use crate::event::{Event, is_lower_hex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Largest `limit` accepted by [`Filter::validate`].
pub const MAX_LIMIT: usize = 5000;

/// Reasons a filter is rejected before it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("empty {0} list matches nothing")]
    EmptySet(&'static str),

    #[error("since ({since}) is after until ({until})")]
    SinceAfterUntil { since: u64, until: u64 },

    #[error("limit too large: {limit} (max {max})")]
    LimitTooLarge { limit: usize, max: usize },

    #[error("invalid tag key {0:?}: expected '#' followed by a single letter")]
    InvalidTagKey(String),

    #[error("empty value list for tag {0}")]
    EmptyTagValues(String),

    #[error("invalid {field}: {value:?} is not 64 lowercase hex characters")]
    InvalidHex { field: &'static str, value: String },
}

/// Which constraint rejected an event. Debug diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMismatch {
    Id,
    Author,
    Kind { kind: u16 },
    TooOld { created_at: u64, since: u64 },
    TooNew { created_at: u64, until: u64 },
    Tag { name: String },
}

impl fmt::Display for FilterMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterMismatch::Id => write!(f, "id not in filter ids"),
            FilterMismatch::Author => write!(f, "pubkey not in filter authors"),
            FilterMismatch::Kind { kind } => write!(f, "kind {} not in filter kinds", kind),
            FilterMismatch::TooOld { created_at, since } => {
                write!(f, "created_at {} is before since {}", created_at, since)
            }
            FilterMismatch::TooNew { created_at, until } => {
                write!(f, "created_at {} is after until {}", created_at, until)
            }
            FilterMismatch::Tag { name } => write!(f, "no tag matches #{}", name),
        }
    }
}

/// Nostr subscription filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Tag constraints keyed as on the wire (`"#d"`, `"#t"`, ...)
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag constraint. `name` is the tag letter without `#`.
    pub fn tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.insert(
            format!("#{}", name.into()),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Constrain `#d` identifiers (addressable events).
    pub fn identifiers<I, S>(self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag("d", identifiers)
    }

    /// Constrain `#t` hashtags.
    pub fn hashtags<I, S>(self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag("t", hashtags)
    }

    /// Check a filter for malformed or conflicting constraints.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let Some(ids) = &self.ids {
            if ids.is_empty() {
                return Err(FilterError::EmptySet("ids"));
            }
            if let Some(bad) = ids.iter().find(|id| !is_lower_hex(id, 64)) {
                return Err(FilterError::InvalidHex {
                    field: "id",
                    value: bad.clone(),
                });
            }
        }

        if let Some(authors) = &self.authors {
            if authors.is_empty() {
                return Err(FilterError::EmptySet("authors"));
            }
            if let Some(bad) = authors.iter().find(|a| !is_lower_hex(a, 64)) {
                return Err(FilterError::InvalidHex {
                    field: "author",
                    value: bad.clone(),
                });
            }
        }

        if let Some(kinds) = &self.kinds
            && kinds.is_empty()
        {
            return Err(FilterError::EmptySet("kinds"));
        }

        for (key, values) in &self.tags {
            if tag_name(key).is_none() {
                return Err(FilterError::InvalidTagKey(key.clone()));
            }
            if values.is_empty() {
                return Err(FilterError::EmptyTagValues(key.clone()));
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(FilterError::SinceAfterUntil { since, until });
        }

        if let Some(limit) = self.limit
            && limit > MAX_LIMIT
        {
            return Err(FilterError::LimitTooLarge {
                limit,
                max: MAX_LIMIT,
            });
        }

        Ok(())
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.mismatch(event).is_none()
    }

    /// The first constraint `event` fails, or `None` if it matches.
    pub fn mismatch(&self, event: &Event) -> Option<FilterMismatch> {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| *id == event.id)
        {
            return Some(FilterMismatch::Id);
        }

        if let Some(authors) = &self.authors
            && !authors.iter().any(|author| *author == event.pubkey)
        {
            return Some(FilterMismatch::Author);
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return Some(FilterMismatch::Kind { kind: event.kind });
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return Some(FilterMismatch::TooOld {
                created_at: event.created_at,
                since,
            });
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return Some(FilterMismatch::TooNew {
                created_at: event.created_at,
                until,
            });
        }

        for (key, values) in &self.tags {
            let name = key.trim_start_matches('#');
            let found = event
                .tag_values(name)
                .any(|value| values.iter().any(|wanted| wanted == value));
            if !found {
                return Some(FilterMismatch::Tag {
                    name: name.to_string(),
                });
            }
        }

        None
    }

    /// Tag constraints as (letter, values) pairs.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.tags
            .iter()
            .filter_map(|(key, values)| tag_name(key).map(|name| (name, values.as_slice())))
    }

    /// Canonical identity of this filter ignoring `limit`.
    ///
    /// Two filters with the same key select the same set of events, so their
    /// live streams can be shared.
    pub fn coalesce_key(&self) -> String {
        let mut normalized = self.clone();
        normalized.limit = None;
        for list in [&mut normalized.ids, &mut normalized.authors]
            .into_iter()
            .flatten()
        {
            list.sort();
            list.dedup();
        }
        if let Some(kinds) = normalized.kinds.as_mut() {
            kinds.sort_unstable();
            kinds.dedup();
        }
        for values in normalized.tags.values_mut() {
            values.sort();
            values.dedup();
        }
        serde_json::to_string(&normalized).unwrap_or_default()
    }
}

/// The single tag letter of a `#x` key.
fn tag_name(key: &str) -> Option<&str> {
    let name = key.strip_prefix('#')?;
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTemplate, finalize_event, generate_secret_key};
    use crate::kinds::{KIND_SHORT_TEXT_NOTE, KIND_VIDEO};
    use pretty_assertions::assert_eq;

    fn event_with(kind: u16, tags: Vec<Vec<String>>, created_at: u64) -> Event {
        let template = EventTemplate {
            kind,
            tags,
            content: "test".to_string(),
            created_at,
        };
        finalize_event(&template, &generate_secret_key()).unwrap()
    }

    fn tag(name: &str, value: &str) -> Vec<String> {
        vec![name.to_string(), value.to_string()]
    }

    #[test]
    fn test_filter_kinds() {
        let filter = Filter::new().kinds([1, 2, 3]);
        assert!(filter.matches(&event_with(1, vec![], 10)));
        assert_eq!(
            filter.mismatch(&event_with(4, vec![], 10)),
            Some(FilterMismatch::Kind { kind: 4 })
        );
    }

    #[test]
    fn test_filter_ids_and_authors_are_exact() {
        let event = event_with(1, vec![], 10);

        assert!(Filter::new().ids([event.id.clone()]).matches(&event));
        assert!(!Filter::new().ids([event.id[..8].to_string()]).matches(&event));
        assert!(Filter::new().authors([event.pubkey.clone()]).matches(&event));
        assert_eq!(
            Filter::new().authors(["ab".repeat(32)]).mismatch(&event),
            Some(FilterMismatch::Author)
        );
    }

    #[test]
    fn test_since_until_are_inclusive() {
        let event = event_with(1, vec![], 100);

        assert!(Filter::new().since(100).until(100).matches(&event));
        assert_eq!(
            Filter::new().since(101).mismatch(&event),
            Some(FilterMismatch::TooOld {
                created_at: 100,
                since: 101
            })
        );
        assert!(!Filter::new().until(99).matches(&event));
    }

    #[test]
    fn test_tags_and_across_names_or_within_values() {
        let event = event_with(
            KIND_VIDEO,
            vec![tag("d", "vine_1"), tag("t", "cats")],
            10,
        );

        assert!(Filter::new().identifiers(["vine_1", "vine_2"]).matches(&event));
        assert!(
            Filter::new()
                .identifiers(["vine_1"])
                .hashtags(["cats"])
                .matches(&event)
        );
        assert_eq!(
            Filter::new()
                .identifiers(["vine_1"])
                .hashtags(["dogs"])
                .mismatch(&event),
            Some(FilterMismatch::Tag {
                name: "t".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_conflicts_and_malformed_values() {
        assert!(Filter::new().validate().is_ok());
        assert!(Filter::new().limit(0).validate().is_ok());
        assert!(Filter::new().limit(MAX_LIMIT).validate().is_ok());

        assert_eq!(
            Filter::new().since(10).until(5).validate(),
            Err(FilterError::SinceAfterUntil { since: 10, until: 5 })
        );
        assert_eq!(
            Filter::new().limit(MAX_LIMIT + 1).validate(),
            Err(FilterError::LimitTooLarge {
                limit: MAX_LIMIT + 1,
                max: MAX_LIMIT
            })
        );
        assert_eq!(
            Filter::new().kinds(Vec::<u16>::new()).validate(),
            Err(FilterError::EmptySet("kinds"))
        );
        assert!(matches!(
            Filter::new().ids(["xyz"]).validate(),
            Err(FilterError::InvalidHex { field: "id", .. })
        ));

        let mut bad_key = Filter::new();
        bad_key.tags.insert("#dd".to_string(), vec!["x".to_string()]);
        assert_eq!(
            bad_key.validate(),
            Err(FilterError::InvalidTagKey("#dd".to_string()))
        );
    }

    #[test]
    fn test_wire_format_flattens_tags() {
        let filter = Filter::new()
            .kinds([KIND_VIDEO])
            .identifiers(["vine_1"])
            .limit(50);
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r##"{"kinds":[32222],"#d":["vine_1"],"limit":50}"##);

        let parsed: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_coalesce_key_ignores_limit_and_order() {
        let a = Filter::new().kinds([KIND_VIDEO, KIND_SHORT_TEXT_NOTE]).limit(50);
        let b = Filter::new().kinds([KIND_SHORT_TEXT_NOTE, KIND_VIDEO]).limit(10);
        let c = Filter::new().kinds([KIND_VIDEO]);

        assert_eq!(a.coalesce_key(), b.coalesce_key());
        assert_ne!(a.coalesce_key(), c.coalesce_key());
    }
}
