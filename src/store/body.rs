//! Shared Message Bodies
//!
//! A published message body is owned by its topic and shared by every queue
//! entry that references it. Reference entries keep a `Weak` handle plus the
//! `(topic_id, body_unique_id)` identity so a body that was dropped from memory
//! can be re-fetched through a [`BodyLookup`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::warn;

use super::entry::Priority;

/// QoS metadata carried by a published body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyQos {
    /// Delivery priority
    pub priority: Priority,
    /// Body must survive a broker restart
    pub durable: bool,
    /// Time to live after publish (None = forever)
    pub lifetime: Option<Duration>,
}

impl Default for BodyQos {
    fn default() -> Self {
        Self {
            priority: Priority::NORM,
            durable: false,
            lifetime: None,
        }
    }
}

/// Key/content/QoS triple of a published message, reference counted across stores
pub struct SharedBody {
    topic_id: String,
    unique_id: i64,
    key: String,
    content: Bytes,
    qos: BodyQos,
    published_at: DateTime<Utc>,
    reference_count: AtomicU32,
}

impl SharedBody {
    /// Create a new body with a zero reference count
    pub fn new(
        topic_id: impl Into<String>,
        unique_id: i64,
        key: impl Into<String>,
        content: Bytes,
        qos: BodyQos,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic_id: topic_id.into(),
            unique_id,
            key: key.into(),
            content,
            qos,
            published_at: Utc::now(),
            reference_count: AtomicU32::new(0),
        })
    }

    /// Topic owning this body
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Unique id of the body within its topic
    pub fn unique_id(&self) -> i64 {
        self.unique_id
    }

    /// Key metadata
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Message content (zero-copy)
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// QoS metadata
    pub fn qos(&self) -> &BodyQos {
        &self.qos
    }

    /// Bytes accounted for every entry referencing this body
    pub fn size_bytes(&self) -> u64 {
        (self.key.len() + self.content.len()) as u64
    }

    /// True once the QoS lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        match self.qos.lifetime {
            Some(lifetime) => Utc::now() > self.published_at + lifetime,
            None => false,
        }
    }

    /// Number of store entries currently referencing this body
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Register one more referencing entry, returning the new count
    pub fn incr_reference(&self) -> u32 {
        self.reference_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one referencing entry, returning the new count.
    ///
    /// The count saturates at zero; an unbalanced release is logged and ignored.
    pub fn decr_reference(&self) -> u32 {
        let previous = self
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(count) => count - 1,
            Err(_) => {
                warn!(
                    topic = %self.topic_id,
                    body = self.unique_id,
                    "reference count released below zero, ignoring"
                );
                0
            }
        }
    }

    /// True when no store references this body any more
    pub fn is_unreferenced(&self) -> bool {
        self.reference_count() == 0
    }
}

impl std::fmt::Debug for SharedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBody")
            .field("topic_id", &self.topic_id)
            .field("unique_id", &self.unique_id)
            .field("size", &self.size_bytes())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// Topic registry lookup used to re-resolve a body whose weak handle is gone
pub trait BodyLookup: Send + Sync {
    /// Find a published body by its topic and unique id
    fn lookup_body(&self, topic_id: &str, body_unique_id: i64) -> Option<Arc<SharedBody>>;
}

/// Weak pointer to a shared body plus the identity needed to re-fetch it
#[derive(Clone)]
pub struct BodyRef {
    topic_id: String,
    body_unique_id: i64,
    handle: Weak<SharedBody>,
}

impl BodyRef {
    /// Reference a live body
    pub fn new(body: &Arc<SharedBody>) -> Self {
        Self {
            topic_id: body.topic_id.clone(),
            body_unique_id: body.unique_id,
            handle: Arc::downgrade(body),
        }
    }

    /// Reference by identity only (e.g. reloaded from a persistent tier)
    pub fn detached(topic_id: impl Into<String>, body_unique_id: i64) -> Self {
        Self {
            topic_id: topic_id.into(),
            body_unique_id,
            handle: Weak::new(),
        }
    }

    /// Topic owning the referenced body
    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Unique id of the referenced body
    pub fn body_unique_id(&self) -> i64 {
        self.body_unique_id
    }

    /// Resolve the body: live handle first, then the lookup collaborator.
    ///
    /// `None` means the reference is orphaned.
    pub fn resolve(&self, lookup: Option<&dyn BodyLookup>) -> Option<Arc<SharedBody>> {
        self.handle.upgrade().or_else(|| {
            lookup.and_then(|lookup| lookup.lookup_body(&self.topic_id, self.body_unique_id))
        })
    }
}

impl PartialEq for BodyRef {
    fn eq(&self, other: &Self) -> bool {
        self.topic_id == other.topic_id && self.body_unique_id == other.body_unique_id
    }
}

impl std::fmt::Debug for BodyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyRef")
            .field("topic_id", &self.topic_id)
            .field("body_unique_id", &self.body_unique_id)
            .field("live", &(self.handle.strong_count() > 0))
            .finish()
    }
}

/// In-memory topic registry implementing [`BodyLookup`]
#[derive(Default)]
pub struct BodyRegistry {
    bodies: DashMap<(String, i64), Arc<SharedBody>>,
}

impl BodyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a body so references can find it
    pub fn publish(&self, body: Arc<SharedBody>) {
        self.bodies
            .insert((body.topic_id.clone(), body.unique_id), body);
    }

    /// Withdraw a body regardless of its reference count
    pub fn unpublish(&self, topic_id: &str, unique_id: i64) -> Option<Arc<SharedBody>> {
        self.bodies
            .remove(&(topic_id.to_string(), unique_id))
            .map(|(_, body)| body)
    }

    /// Drop every body of `topic_id` no store references any more
    pub fn release_unreferenced(&self, topic_id: &str) -> usize {
        let before = self.bodies.len();
        self.bodies
            .retain(|(topic, _), body| topic != topic_id || !body.is_unreferenced());
        before - self.bodies.len()
    }

    /// Number of published bodies
    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    /// True when nothing is published
    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl BodyLookup for BodyRegistry {
    fn lookup_body(&self, topic_id: &str, body_unique_id: i64) -> Option<Arc<SharedBody>> {
        self.bodies
            .get(&(topic_id.to_string(), body_unique_id))
            .map(|body| Arc::clone(body.value()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_body(topic: &str, id: i64) -> Arc<SharedBody> {
        SharedBody::new(
            topic,
            id,
            "<key oid='news'/>",
            Bytes::from_static(b"hello subscribers"),
            BodyQos::default(),
        )
    }

    #[test]
    fn test_body_size() {
        let body = make_body("news", 1);
        assert_eq!(body.size_bytes(), 17 + 17);
    }

    #[test]
    fn test_reference_counting() {
        let body = make_body("news", 1);
        assert!(body.is_unreferenced());

        assert_eq!(body.incr_reference(), 1);
        assert_eq!(body.incr_reference(), 2);
        assert_eq!(body.decr_reference(), 1);
        assert_eq!(body.decr_reference(), 0);
        assert!(body.is_unreferenced());
    }

    #[test]
    fn test_reference_count_never_negative() {
        let body = make_body("news", 1);
        assert_eq!(body.decr_reference(), 0);
        assert_eq!(body.reference_count(), 0);
        assert_eq!(body.incr_reference(), 1);
    }

    #[test]
    fn test_body_lifetime() {
        let forever = make_body("news", 1);
        assert!(!forever.is_expired());

        let qos = BodyQos {
            lifetime: Some(Duration::milliseconds(-1)),
            ..Default::default()
        };
        let gone = SharedBody::new("news", 2, "k", Bytes::new(), qos);
        assert!(gone.is_expired());
    }

    #[test]
    fn test_body_ref_resolves_live_handle() {
        let body = make_body("news", 7);
        let reference = BodyRef::new(&body);

        let resolved = reference.resolve(None).unwrap();
        assert!(Arc::ptr_eq(&resolved, &body));
    }

    #[test]
    fn test_body_ref_falls_back_to_lookup() {
        let registry = BodyRegistry::new();
        let reference = {
            let body = make_body("news", 7);
            BodyRef::new(&body)
        };
        // Handle is dead and nothing is published: orphaned
        assert!(reference.resolve(Some(&registry)).is_none());

        registry.publish(make_body("news", 7));
        let resolved = reference.resolve(Some(&registry)).unwrap();
        assert_eq!(resolved.unique_id(), 7);
    }

    #[test]
    fn test_detached_ref_equality() {
        let body = make_body("news", 3);
        assert_eq!(BodyRef::new(&body), BodyRef::detached("news", 3));
        assert_ne!(BodyRef::new(&body), BodyRef::detached("news", 4));
    }

    #[test]
    fn test_registry_release_unreferenced() {
        let registry = BodyRegistry::new();
        let kept = make_body("news", 1);
        kept.incr_reference();
        registry.publish(kept);
        registry.publish(make_body("news", 2));
        registry.publish(make_body("sport", 3));

        assert_eq!(registry.release_unreferenced("news"), 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup_body("news", 1).is_some());
        assert!(registry.lookup_body("news", 2).is_none());
        assert!(registry.unpublish("sport", 3).is_some());
    }
}
