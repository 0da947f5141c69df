//! Dual-identity object id and the per-save reconciliation pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

static TEMP_COUNTER: AtomicI64 = AtomicI64::new(1);

/// Dual-form identity: a stable integer assigned at save time, and/or a
/// temporary string assigned at construction time (spec §3/§4.4).
///
/// Invariants, enforced by construction and by [`ObjectId::set_stable`]:
/// at least one of `stable`/`temporary` is present; `stable` is assigned
/// at most once.
#[derive(Debug, Clone)]
pub struct ObjectId {
    stable: Option<i64>,
    temporary: Option<String>,
}

impl ObjectId {
    /// Construct a freshly-created id with a process-unique synthetic
    /// temporary, e.g. `"tmp-A-1"`.
    #[must_use]
    pub fn fresh_temporary(entity_name: &str) -> Self {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            stable: None,
            temporary: Some(format!("tmp-{entity_name}-{n}")),
        }
    }

    #[must_use]
    pub const fn stable_only(stable: i64) -> Self {
        Self {
            stable: Some(stable),
            temporary: None,
        }
    }

    /// # Panics
    ///
    /// Panics if both `stable` and `temporary` are `None` (spec: "at
    /// least one is present").
    #[must_use]
    pub fn new(stable: Option<i64>, temporary: Option<String>) -> Self {
        assert!(
            stable.is_some() || temporary.is_some(),
            "ObjectId requires at least one of stable/temporary"
        );
        Self { stable, temporary }
    }

    #[must_use]
    pub const fn stable(&self) -> Option<i64> {
        self.stable
    }

    #[must_use]
    pub fn temporary(&self) -> Option<&str> {
        self.temporary.as_deref()
    }

    #[must_use]
    pub const fn has_stable(&self) -> bool {
        self.stable.is_some()
    }

    /// The only mutation allowed on an `ObjectId`. Rejects re-assignment
    /// once a stable value has already been set.
    ///
    /// # Panics
    ///
    /// Panics if `stable` has already been assigned.
    pub fn set_stable(&mut self, stable: i64) {
        assert!(
            self.stable.is_none(),
            "ObjectId::set_stable called twice (stable id is immutable once assigned)"
        );
        self.stable = Some(stable);
    }

    /// Deep-copies both halves.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }
}

impl PartialEq for ObjectId {
    /// Prefers comparing temporaries when both sides have one; else
    /// compares stables (spec §3/§9 "ObjectId double-identity").
    fn eq(&self, other: &Self) -> bool {
        match (&self.temporary, &other.temporary) {
            (Some(a), Some(b)) => a == b,
            _ => self.stable.is_some() && self.stable == other.stable,
        }
    }
}

impl Eq for ObjectId {}

impl std::hash::Hash for ObjectId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Must be consistent with `eq`: an id with a temporary hashes by
        // temporary regardless of whether a stable value is also set, so
        // two ids that compare equal via the temporary-preferred rule
        // always land in the same bucket.
        if let Some(t) = &self.temporary {
            0u8.hash(state);
            t.hash(state);
        } else if let Some(s) = self.stable {
            1u8.hash(state);
            s.hash(state);
        }
    }
}

/// Per-save scratch structure used to give a relation's target ids and
/// the related object's own id the same identity after save (spec
/// §4.4).
#[derive(Debug, Default)]
pub struct ObjectIdPool {
    entries: HashMap<(String, ObjectIdKey), ObjectId>,
}

/// Hashable dedup key for an `ObjectIdPool` lookup; mirrors `ObjectId`'s
/// own equality rule (temporary-preferred).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ObjectIdKey {
    Temporary(String),
    Stable(i64),
}

fn key_for(id: &ObjectId) -> ObjectIdKey {
    if let Some(t) = id.temporary() {
        ObjectIdKey::Temporary(t.to_string())
    } else {
        ObjectIdKey::Stable(id.stable().expect("ObjectId invariant: at least one present"))
    }
}

impl ObjectIdPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pooled id equal to `key` on first encounter, and the
    /// same id on every subsequent call with an equal `key` — `factory`
    /// runs only on the first encounter.
    pub fn get_or_create(
        &mut self,
        entity_name: &str,
        key: &ObjectId,
        factory: impl FnOnce() -> ObjectId,
    ) -> ObjectId {
        let cache_key = (entity_name.to_string(), key_for(key));
        self.entries
            .entry(cache_key)
            .or_insert_with(factory)
            .clone()
    }
}
