//! Live object handles, their status machine, and the event stream they
//! emit on the main lane.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::model::Entity;
use crate::object_id::{ObjectId, ObjectIdPool};
use crate::value::Value;

/// `invalid | created | saved | changed | updating` (spec §3 "Object
/// status").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    Invalid,
    Created,
    Saved,
    Changed,
    Updating,
}

/// Closed sum of object-lifecycle events (spec §4.5).
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    Fetched,
    Loaded,
    Cleared,
    AttributeUpdated { name: String },
    RelationInserted { name: String, index: usize },
    RelationRemoved { name: String, index: usize },
    RelationReplaced { name: String },
    /// Fired exactly once, on handle drop. Carries no handle — only the
    /// identity of the object that is gone.
    Erased { entity_name: String, object_id: ObjectId },
}

impl ObjectEvent {
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        !matches!(self, Self::Fetched | Self::Loaded | Self::Erased { .. })
    }
}

/// Immutable transfer representation of an object's state for crossing
/// the lane boundary (spec §3 "ObjectData").
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub object_id: ObjectId,
    pub attributes: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, Vec<ObjectId>>,
}

/// Read-only projection of an `Object`: entity, attributes, relations,
/// and id.
#[derive(Debug, Clone)]
pub struct ConstObject {
    pub entity_name: String,
    pub object_id: ObjectId,
    pub attributes: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, Vec<ObjectId>>,
}

struct ObjectInner {
    status: ObjectStatus,
    action: &'static str,
    attributes: BTreeMap<String, Value>,
    relations: BTreeMap<String, Vec<ObjectId>>,
    object_id: ObjectId,
}

/// A live, mutable handle to a logical row across the revision history.
///
/// All methods here run on the main lane only (spec §5 "Resource
/// policy"). Events are delivered synchronously, in program order, to
/// every subscriber registered via [`Object::subscribe`] — there is no
/// async broadcast channel, matching spec.md §5's requirement that
/// object events observed on the main lane stay in program order.
pub struct Object {
    entity_name: String,
    entity: Entity,
    inner: Mutex<ObjectInner>,
    subscribers: Mutex<Vec<Box<dyn FnMut(&ObjectEvent) + Send>>>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f.debug_struct("Object")
            .field("entity_name", &self.entity_name)
            .field("status", &inner.status)
            .field("object_id", &inner.object_id)
            .finish_non_exhaustive()
    }
}

impl Object {
    /// Construct a newly-created object (status `Created`) with a fresh
    /// temporary id and declared defaults filled in.
    #[must_use]
    pub fn new_created(entity: Entity) -> Self {
        let object_id = ObjectId::fresh_temporary(&entity.name);
        let mut attributes = BTreeMap::new();
        for attr in &entity.attributes {
            if let Some(default) = &attr.default {
                attributes.insert(attr.name.clone(), default.clone());
            }
        }
        let relations = entity
            .relations
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        Self {
            entity_name: entity.name.clone(),
            entity,
            inner: Mutex::new(ObjectInner {
                status: ObjectStatus::Created,
                action: "insert",
                attributes,
                relations,
                object_id,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Construct an object freshly loaded from the database (status
    /// `Saved`).
    #[must_use]
    pub fn new_loaded(entity: Entity, data: ObjectData) -> Self {
        Self {
            entity_name: entity.name.clone(),
            entity,
            inner: Mutex::new(ObjectInner {
                status: ObjectStatus::Saved,
                action: "insert",
                attributes: data.attributes,
                relations: data.relations,
                object_id: data.object_id,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    #[must_use]
    pub fn status(&self) -> ObjectStatus {
        self.lock().status
    }

    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.lock().object_id.clone()
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.lock().action == "remove"
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ObjectInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a synchronous event subscriber. Used by the manager to
    /// drive identity-map eviction and change tracking.
    pub fn subscribe(&self, handler: impl FnMut(&ObjectEvent) + Send + 'static) {
        self.subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(Box::new(handler));
    }

    fn emit(&self, event: ObjectEvent) {
        for handler in self.subscribers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).iter_mut() {
            handler(&event);
        }
    }

    /// Step 1 of every mutating, non-load operation (spec §4.5): a
    /// `Created` object stays tagged `"insert"` through local mutations;
    /// an already-`"remove"`d object stays `"remove"`; anything else
    /// (an existing, previously-saved object) is marked `"update"`.
    fn set_update_action(inner: &mut ObjectInner) {
        if inner.status == ObjectStatus::Created || inner.action == "remove" {
            return;
        }
        inner.action = "update";
    }

    #[must_use]
    pub fn attribute_value(&self, name: &str) -> Value {
        assert!(
            name != "obj_id",
            "obj_id is accessed via object_id(), not attribute_value"
        );
        assert!(
            !Entity::is_system_attribute(name) && self.entity.attribute_map.contains_key(name),
            "unknown attribute {name:?} on entity {}",
            self.entity_name
        );
        self.lock().attributes.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_attribute_value(&self, name: &str, value: Value) {
        assert!(name != "obj_id", "obj_id cannot be set via set_attribute_value");
        assert!(
            !Entity::is_system_attribute(name) && self.entity.attribute_map.contains_key(name),
            "unknown attribute {name:?} on entity {}",
            self.entity_name
        );

        let mut inner = self.lock();
        inner.attributes.insert(name.to_string(), value);
        Self::set_update_action(&mut inner);
        let event = ObjectEvent::AttributeUpdated { name: name.to_string() };
        drop(inner);
        self.apply_after(event);
    }

    fn apply_after(&self, event: ObjectEvent) {
        let mut inner = self.lock();
        if inner.status != ObjectStatus::Created {
            inner.status = ObjectStatus::Changed;
        }
        drop(inner);
        self.emit(event);
    }

    fn require_relation(&self, name: &str) {
        assert!(
            self.entity.relations.contains_key(name),
            "unknown relation {name:?} on entity {}",
            self.entity_name
        );
    }

    fn validate_relation_id(id: &ObjectId) {
        assert!(
            id.stable().is_some() || id.temporary().is_some(),
            "relation id must be non-null"
        );
        if let Some(stable) = id.stable() {
            assert!(stable > 0, "relation id's stable value must be positive, got {stable}");
        }
    }

    #[must_use]
    pub fn relation_ids(&self, name: &str) -> Vec<ObjectId> {
        self.require_relation(name);
        self.lock().relations.get(name).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn relation_id(&self, name: &str, idx: usize) -> Option<ObjectId> {
        self.require_relation(name);
        self.lock().relations.get(name).and_then(|v| v.get(idx).cloned())
    }

    #[must_use]
    pub fn relation_size(&self, name: &str) -> usize {
        self.require_relation(name);
        self.lock().relations.get(name).map_or(0, Vec::len)
    }

    pub fn set_relation_ids(&self, name: &str, ids: Vec<ObjectId>) {
        self.require_relation(name);
        for id in &ids {
            Self::validate_relation_id(id);
        }
        let mut inner = self.lock();
        inner.relations.insert(name.to_string(), ids);
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationReplaced { name: name.to_string() });
    }

    pub fn add_relation_id(&self, name: &str, id: ObjectId) {
        self.require_relation(name);
        Self::validate_relation_id(&id);
        let mut inner = self.lock();
        let list = inner.relations.entry(name.to_string()).or_default();
        list.push(id);
        let idx = list.len() - 1;
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationInserted { name: name.to_string(), index: idx });
    }

    pub fn insert_relation_id(&self, name: &str, idx: usize, id: ObjectId) {
        self.require_relation(name);
        Self::validate_relation_id(&id);
        let mut inner = self.lock();
        let list = inner.relations.entry(name.to_string()).or_default();
        let idx = idx.min(list.len());
        list.insert(idx, id);
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationInserted { name: name.to_string(), index: idx });
    }

    /// Removes the first occurrence of `value` from the named relation,
    /// if present. No-op (and emits nothing) if absent.
    pub fn remove_relation_id(&self, name: &str, value: &ObjectId) {
        self.require_relation(name);
        let mut inner = self.lock();
        let Some(list) = inner.relations.get_mut(name) else { return };
        let Some(idx) = list.iter().position(|v| v == value) else { return };
        list.remove(idx);
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationRemoved { name: name.to_string(), index: idx });
    }

    pub fn remove_relation_at(&self, name: &str, idx: usize) {
        self.require_relation(name);
        let mut inner = self.lock();
        let Some(list) = inner.relations.get_mut(name) else { return };
        if idx >= list.len() {
            return;
        }
        list.remove(idx);
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationRemoved { name: name.to_string(), index: idx });
    }

    pub fn remove_all_relations(&self, name: &str) {
        self.require_relation(name);
        let mut inner = self.lock();
        inner.relations.insert(name.to_string(), Vec::new());
        Self::set_update_action(&mut inner);
        drop(inner);
        self.apply_after(ObjectEvent::RelationReplaced { name: name.to_string() });
    }

    /// Clears all custom attributes and relations, keeping `pk_id`,
    /// `obj_id`, `action`; sets `action = "remove"`. Idempotent.
    pub fn remove(&self) {
        let mut inner = self.lock();
        if inner.action == "remove" {
            return;
        }
        inner.attributes.clear();
        for list in inner.relations.values_mut() {
            list.clear();
        }
        inner.action = "remove";
        if inner.status != ObjectStatus::Created {
            inner.status = ObjectStatus::Changed;
        }
        drop(inner);
        self.emit(ObjectEvent::Cleared);
    }

    /// Transition into `Updating` while a save is in flight for this
    /// object.
    pub fn begin_updating(&self) {
        self.lock().status = ObjectStatus::Updating;
    }

    /// Transition back to `Saved` after a save completes, and assign the
    /// stable id if this object had none (temporary->stable handoff is
    /// performed by the caller via `object_id_mut`, not here).
    pub fn mark_saved(&self) {
        let mut inner = self.lock();
        inner.status = ObjectStatus::Saved;
        inner.action = "insert";
    }

    /// Assign the stable half of this object's id (used by the manager
    /// during temporary→stable reconciliation).
    ///
    /// # Panics
    ///
    /// Panics if a stable id was already assigned.
    pub fn set_stable_id(&self, stable: i64) {
        self.lock().object_id.set_stable(stable);
    }

    /// Overwrite this object's loaded data. `force = false` refuses to
    /// overwrite a locally `Changed` object (used for background save
    /// completions racing a local mutation); `force = true` always
    /// overwrites (used for explicit reloads/reverts).
    pub fn load_data(&self, data: ObjectData, force: bool) {
        let mut inner = self.lock();
        if !force && inner.status == ObjectStatus::Changed {
            return;
        }
        inner.attributes = data.attributes;
        inner.relations = data.relations;
        inner.action = "insert";
        inner.status = ObjectStatus::Saved;
        drop(inner);
        self.emit(ObjectEvent::Loaded);
    }

    /// Clears loaded data back to nothing, as part of `Manager::clear`.
    pub fn clear_loaded_data(&self) {
        let mut inner = self.lock();
        inner.attributes.clear();
        inner.relations.values_mut().for_each(Vec::clear);
        drop(inner);
        self.emit(ObjectEvent::Cleared);
    }

    /// Rewrites this object's cached `save_id`-bearing state after a
    /// purge (spec §4.8 `purge` main-thread step). Purge does not change
    /// attribute/relation content, only the revision bookkeeping the
    /// manager tracks out-of-band — no event is required since no
    /// observable state changes.
    pub fn note_purged(&self) {}

    /// Mark this object as freshly fetched (no local state change,
    /// purely an observability event — spec's `fetched` variant).
    pub fn mark_fetched(&self) {
        self.emit(ObjectEvent::Fetched);
    }

    #[must_use]
    pub fn to_const(&self) -> ConstObject {
        let inner = self.lock();
        ConstObject {
            entity_name: self.entity_name.clone(),
            object_id: inner.object_id.clone(),
            attributes: inner.attributes.clone(),
            relations: inner.relations.clone(),
        }
    }

    /// Produce the `ObjectData` to write, per spec §4.5's exact rules:
    /// the self-id is interned through `pool`; if status is `Created`
    /// the `obj_id` attribute is omitted (it's assigned at save); every
    /// custom attribute appears (declared default if absent-and-not-null,
    /// else null); every present relation's target ids are interned
    /// through `pool`.
    #[must_use]
    pub fn save_data(&self, pool: &mut ObjectIdPool) -> ObjectData {
        let inner = self.lock();
        let pooled_id = pool.get_or_create(&self.entity_name, &inner.object_id, || inner.object_id.clone());

        let mut attributes = BTreeMap::new();
        for attr in &self.entity.attributes {
            let value = inner.attributes.get(&attr.name).cloned().unwrap_or_else(|| {
                if attr.not_null {
                    attr.default.clone().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            });
            attributes.insert(attr.name.clone(), value);
        }

        let mut relations = BTreeMap::new();
        for (name, ids) in &inner.relations {
            let interned = ids
                .iter()
                .map(|id| pool.get_or_create(&self.relation_target(name), id, || id.clone()))
                .collect();
            relations.insert(name.clone(), interned);
        }

        ObjectData {
            object_id: pooled_id,
            attributes,
            relations,
        }
    }

    fn relation_target(&self, relation_name: &str) -> String {
        self.entity
            .relations
            .get(relation_name)
            .map_or_else(|| self.entity_name.clone(), |r| r.target.clone())
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner);
        let event = ObjectEvent::Erased {
            entity_name: self.entity_name.clone(),
            object_id: inner.object_id.clone(),
        };
        for handler in self.subscribers.get_mut().unwrap_or_else(std::sync::PoisonError::into_inner).iter_mut() {
            handler(&event);
        }
    }
}

/// Shared handle type used by the manager's identity/created/changed
/// maps.
pub type SharedObject = Arc<Object>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeType, EntityDescription, AttributeDescription, ModelDescription, Model};

    fn entity_a() -> Entity {
        let desc = ModelDescription {
            version: "1.0".to_string(),
            entities: vec![EntityDescription {
                name: "A".to_string(),
                attributes: vec![
                    AttributeDescription {
                        name: "name".to_string(),
                        attr_type: AttributeType::Text,
                        default: None,
                        not_null: false,
                        primary: false,
                        unique: false,
                    },
                    AttributeDescription {
                        name: "age".to_string(),
                        attr_type: AttributeType::Integer,
                        default: Some(Value::Integer(0)),
                        not_null: true,
                        primary: false,
                        unique: false,
                    },
                ],
                relations: vec![],
            }],
            indices: vec![],
        };
        Model::new(desc).unwrap().entities.remove("A").unwrap()
    }

    #[test]
    fn set_attribute_transitions_created_stays_created() {
        let obj = Object::new_created(entity_a());
        assert_eq!(obj.status(), ObjectStatus::Created);
        obj.set_attribute_value("name", Value::Text("x".into()));
        assert_eq!(obj.status(), ObjectStatus::Created, "created stays created through local mutation");
    }

    #[test]
    fn set_attribute_on_saved_object_transitions_to_changed() {
        let data = ObjectData {
            object_id: ObjectId::stable_only(1),
            attributes: BTreeMap::new(),
            relations: BTreeMap::new(),
        };
        let obj = Object::new_loaded(entity_a(), data);
        assert_eq!(obj.status(), ObjectStatus::Saved);
        obj.set_attribute_value("name", Value::Text("y".into()));
        assert_eq!(obj.status(), ObjectStatus::Changed);
    }

    #[test]
    #[should_panic(expected = "unknown attribute")]
    fn rejects_unknown_attribute_name() {
        let obj = Object::new_created(entity_a());
        let _ = obj.attribute_value("nope");
    }

    #[test]
    #[should_panic(expected = "unknown attribute")]
    fn attribute_value_rejects_system_attribute_despite_being_in_the_map() {
        let entity = entity_a();
        assert!(entity.attribute("save_id").is_some(), "attribute_map must carry system attrs");
        let obj = Object::new_created(entity);
        let _ = obj.attribute_value("save_id");
    }

    #[test]
    #[should_panic(expected = "unknown attribute")]
    fn set_attribute_value_rejects_system_attribute() {
        let obj = Object::new_created(entity_a());
        obj.set_attribute_value("action", Value::Text("hacked".into()));
    }

    #[test]
    fn remove_is_idempotent_and_keeps_action_remove() {
        let obj = Object::new_created(entity_a());
        obj.set_attribute_value("name", Value::Text("x".into()));
        obj.remove();
        obj.remove();
        assert!(obj.is_removed());
    }

    #[test]
    fn save_data_omits_obj_id_attribute_fills_defaults() {
        let obj = Object::new_created(entity_a());
        let mut pool = ObjectIdPool::new();
        let data = obj.save_data(&mut pool);
        assert_eq!(data.attributes.get("age"), Some(&Value::Integer(0)));
        assert!(data.attributes.get("name").is_some());
    }

    #[test]
    fn erased_event_fires_once_on_drop() {
        let obj = Object::new_created(entity_a());
        let fired = Arc::new(Mutex::new(0));
        let fired2 = Arc::clone(&fired);
        obj.subscribe(move |event| {
            if matches!(event, ObjectEvent::Erased { .. }) {
                *fired2.lock().unwrap() += 1;
            }
        });
        drop(obj);
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
