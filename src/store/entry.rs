//! Store Entry Types
//!
//! An [`Entry`] is one logical record of a queue or map. Its identity
//! (unique id, size, durability) is fixed at construction; the payload is
//! either carried inline or is a reference to a [`SharedBody`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::body::{BodyLookup, BodyRef, SharedBody};
use crate::error::{Error, Result};

// =============================================================================
// Storage Id
// =============================================================================

/// Scoping identifier of one store instance, e.g. `callback:client7`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageId {
    prefix: String,
    postfix: String,
}

impl StorageId {
    /// Create from a relating prefix (`callback`, `history`, ...) and an owner id
    pub fn new(prefix: impl Into<String>, postfix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            postfix: postfix.into(),
        }
    }

    /// Relating prefix, e.g. `history`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Owner part, e.g. the topic or session name
    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    /// Physical name for the persistent tier: every non-alphanumeric becomes `_`
    pub fn stripped(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.postfix)
    }
}

impl FromStr for StorageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((prefix, postfix)) if !prefix.is_empty() && !postfix.is_empty() => {
                Ok(Self::new(prefix, postfix))
            }
            _ => Err(Error::Configuration(format!(
                "storage id '{}' is not of the form <prefix>:<postfix>",
                s
            ))),
        }
    }
}

impl TryFrom<String> for StorageId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<StorageId> for String {
    fn from(id: StorageId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Message priority, 0 (lowest) to 9 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(3);
    pub const NORM: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const MAX: Priority = Priority(9);

    /// Create a priority, clamping values above [`Priority::MAX`]
    pub fn new(value: u8) -> Self {
        Priority(value.min(Self::MAX.0))
    }

    /// Raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORM
    }
}

// =============================================================================
// Entry Kind
// =============================================================================

/// What an entry embeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    /// Published message held by a topic's message store
    MsgUnit,
    /// Callback queue entry waiting for delivery to a client
    Update,
    /// Topic history entry
    History,
    /// Topic administrative state
    Topic,
    /// Client session state
    Session,
    /// Subscription state
    Subscribe,
}

impl EntryKind {
    /// Stable name used in logs and persistent tables
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::MsgUnit => "msgUnit",
            EntryKind::Update => "update",
            EntryKind::History => "history",
            EntryKind::Topic => "topic",
            EntryKind::Session => "session",
            EntryKind::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unique Ids
// =============================================================================

/// Strictly increasing, time derived id source
#[derive(Debug, Default)]
pub struct UniqueIdGenerator {
    last: AtomicI64,
}

impl UniqueIdGenerator {
    /// Create a generator
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id: nanoseconds since the epoch, bumped past the previous id on collision
    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX - 1);
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Next id for LIFO ordered stores (history): newer entries sort first
    pub fn next_lifo(&self) -> i64 {
        -self.next()
    }
}

static UNIQUE_IDS: Lazy<UniqueIdGenerator> = Lazy::new(UniqueIdGenerator::new);

/// Next process-wide unique id
pub fn next_unique_id() -> i64 {
    UNIQUE_IDS.next()
}

// =============================================================================
// Entry
// =============================================================================

/// Embedded payload of an entry
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Self-contained bytes
    Inline(Bytes),
    /// Pointer to a shared message body
    Reference(BodyRef),
}

/// One logical record in a store
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    unique_id: i64,
    priority: Priority,
    size_bytes: u64,
    durable: bool,
    kind: EntryKind,
    storage_id: StorageId,
    expires_at: Option<DateTime<Utc>>,
    payload: Payload,
}

impl Entry {
    /// Create a self-contained entry; its size is the payload length
    pub fn inline(storage_id: StorageId, kind: EntryKind, unique_id: i64, data: Bytes) -> Self {
        Self {
            unique_id,
            priority: Priority::NORM,
            size_bytes: data.len() as u64,
            durable: false,
            kind,
            storage_id,
            expires_at: None,
            payload: Payload::Inline(data),
        }
    }

    /// Create a reference entry; size, priority and durability follow the body
    pub fn reference(
        storage_id: StorageId,
        kind: EntryKind,
        unique_id: i64,
        body: &Arc<SharedBody>,
    ) -> Self {
        Self {
            unique_id,
            priority: body.qos().priority,
            size_bytes: body.size_bytes(),
            durable: body.qos().durable,
            kind,
            storage_id,
            expires_at: None,
            payload: Payload::Reference(BodyRef::new(body)),
        }
    }

    /// Rebuild a reference entry from its persisted identity (no live handle)
    pub fn detached_reference(
        storage_id: StorageId,
        kind: EntryKind,
        unique_id: i64,
        body_ref: BodyRef,
        size_bytes: u64,
        durable: bool,
        priority: Priority,
    ) -> Self {
        Self {
            unique_id,
            priority,
            size_bytes,
            durable,
            kind,
            storage_id,
            expires_at: None,
            payload: Payload::Reference(body_ref),
        }
    }

    /// Set the priority (before the first put)
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the entry durable (before the first put)
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Expire the entry `lifetime` from now
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.expires_at = Some(Utc::now() + lifetime);
        self
    }

    #[inline]
    pub fn unique_id(&self) -> i64 {
        self.unique_id
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[inline]
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    #[inline]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    #[inline]
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Embedded payload
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Inline bytes, if self-contained
    pub fn data(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Inline(data) => Some(data),
            Payload::Reference(_) => None,
        }
    }

    /// Body reference, if this is a reference entry
    pub fn body_ref(&self) -> Option<&BodyRef> {
        match &self.payload {
            Payload::Inline(_) => None,
            Payload::Reference(body_ref) => Some(body_ref),
        }
    }

    /// True for reference entries
    pub fn is_reference(&self) -> bool {
        matches!(self.payload, Payload::Reference(_))
    }

    /// Resolve the referenced body (None for inline entries and orphans)
    pub fn resolve(&self, lookup: Option<&dyn BodyLookup>) -> Option<Arc<SharedBody>> {
        self.body_ref().and_then(|body_ref| body_ref.resolve(lookup))
    }

    /// Expired by lifetime, by the referenced body's lifetime, or orphaned
    pub fn is_expired(&self, lookup: Option<&dyn BodyLookup>) -> bool {
        if let Some(expires_at) = self.expires_at {
            if Utc::now() > expires_at {
                return true;
            }
        }
        match &self.payload {
            Payload::Inline(_) => false,
            Payload::Reference(body_ref) => match body_ref.resolve(lookup) {
                Some(body) => body.is_expired(),
                None => true,
            },
        }
    }

    /// Notification that a store accepted this entry
    ///
    /// Reference entries take one reference on their body. Returns the new count.
    pub fn added(&self, lookup: Option<&dyn BodyLookup>) -> Option<u32> {
        let body_ref = self.body_ref()?;
        match body_ref.resolve(lookup) {
            Some(body) => Some(body.incr_reference()),
            None => {
                warn!(
                    storage = %self.storage_id,
                    entry = self.unique_id,
                    topic = body_ref.topic_id(),
                    body = body_ref.body_unique_id(),
                    "added orphaned reference entry"
                );
                None
            }
        }
    }

    /// Notification that a store released this entry
    ///
    /// Reference entries drop their reference on the body. Returns the new count.
    pub fn removed(&self, lookup: Option<&dyn BodyLookup>) -> Option<u32> {
        let body_ref = self.body_ref()?;
        match body_ref.resolve(lookup) {
            Some(body) => Some(body.decr_reference()),
            None => {
                warn!(
                    storage = %self.storage_id,
                    entry = self.unique_id,
                    topic = body_ref.topic_id(),
                    body = body_ref.body_unique_id(),
                    "removed orphaned reference entry"
                );
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::body::{BodyQos, BodyRegistry};

    fn storage() -> StorageId {
        StorageId::new("callback", "client7")
    }

    fn make_body(id: i64) -> Arc<SharedBody> {
        let qos = BodyQos {
            priority: Priority::HIGH,
            durable: true,
            lifetime: None,
        };
        SharedBody::new("news", id, "key", Bytes::from_static(b"content"), qos)
    }

    #[test]
    fn test_storage_id_parse_and_display() {
        let id: StorageId = "history:topicX".parse().unwrap();
        assert_eq!(id.prefix(), "history");
        assert_eq!(id.postfix(), "topicX");
        assert_eq!(id.to_string(), "history:topicX");

        // Only the first colon separates
        let id: StorageId = "callback:client:7".parse().unwrap();
        assert_eq!(id.postfix(), "client:7");

        assert!("nocolon".parse::<StorageId>().is_err());
        assert!(":x".parse::<StorageId>().is_err());
    }

    #[test]
    fn test_storage_id_stripped() {
        let id = StorageId::new("msgUnitStore", "heron/news.eu");
        assert_eq!(id.stripped(), "msgUnitStore_heron_news_eu");
    }

    #[test]
    fn test_storage_id_serde() {
        let id = storage();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"callback:client7\"");
        let back: StorageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_priority_clamped() {
        assert_eq!(Priority::new(42), Priority::MAX);
        assert_eq!(Priority::new(3), Priority::LOW);
        assert_eq!(Priority::default(), Priority::NORM);
        assert!(Priority::HIGH > Priority::NORM);
    }

    #[test]
    fn test_unique_ids_strictly_increase() {
        let generator = UniqueIdGenerator::new();
        let mut last = generator.next();
        for _ in 0..1000 {
            let next = generator.next();
            assert!(next > last);
            last = next;
        }
        assert!(generator.next_lifo() < 0);
    }

    #[test]
    fn test_unique_ids_across_threads() {
        use std::collections::HashSet;
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..500).map(|_| next_unique_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_inline_entry() {
        let entry = Entry::inline(storage(), EntryKind::Update, 1, Bytes::from_static(b"hello"))
            .with_priority(Priority::HIGH)
            .durable(true);

        assert_eq!(entry.unique_id(), 1);
        assert_eq!(entry.size_bytes(), 5);
        assert_eq!(entry.priority(), Priority::HIGH);
        assert!(entry.is_durable());
        assert!(!entry.is_reference());
        assert_eq!(entry.data().unwrap().as_ref(), b"hello");
        assert!(!entry.is_expired(None));
        assert_eq!(entry.added(None), None);
    }

    #[test]
    fn test_inline_entry_lifetime() {
        let entry = Entry::inline(storage(), EntryKind::Update, 1, Bytes::new())
            .with_lifetime(Duration::milliseconds(-1));
        assert!(entry.is_expired(None));
    }

    #[test]
    fn test_reference_entry_follows_body() {
        let body = make_body(9);
        let entry = Entry::reference(storage(), EntryKind::Update, 2, &body);

        assert!(entry.is_reference());
        assert!(entry.is_durable());
        assert_eq!(entry.priority(), Priority::HIGH);
        assert_eq!(entry.size_bytes(), body.size_bytes());
        assert_eq!(entry.body_ref().unwrap().body_unique_id(), 9);
        assert!(entry.data().is_none());
    }

    #[test]
    fn test_reference_added_removed() {
        let body = make_body(9);
        let entry = Entry::reference(storage(), EntryKind::Update, 2, &body);

        assert_eq!(entry.added(None), Some(1));
        assert_eq!(entry.clone().added(None), Some(2));
        assert_eq!(entry.removed(None), Some(1));
        assert_eq!(entry.removed(None), Some(0));
        assert_eq!(entry.removed(None), Some(0));
    }

    #[test]
    fn test_orphaned_reference_is_expired() {
        let entry = {
            let body = make_body(9);
            Entry::reference(storage(), EntryKind::History, 3, &body)
        };
        assert!(entry.is_expired(None));
        assert_eq!(entry.added(None), None);

        let registry = BodyRegistry::new();
        registry.publish(make_body(9));
        assert!(!entry.is_expired(Some(&registry)));
        assert_eq!(entry.added(Some(&registry)), Some(1));
    }

    #[test]
    fn test_detached_reference() {
        let entry = Entry::detached_reference(
            storage(),
            EntryKind::Update,
            4,
            BodyRef::detached("news", 9),
            11,
            true,
            Priority::LOW,
        );
        assert_eq!(entry.size_bytes(), 11);
        assert!(entry.resolve(None).is_none());
    }
}
