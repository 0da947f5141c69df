//! The façade that owns a single `SQLite` file end to end (spec §4.8):
//! the weak identity map, the live `Created`/`Changed` object sets, the
//! observable `db_info`, and every top-level operation (`setup`, `fetch`,
//! `save`, `revert`, `purge`, `clear`, `reset`, `create_object`,
//! `suspend`/`resume`, and the two observer registrations).
//!
//! Every operation here takes a [`Cx`] and checks `cx.checkpoint()` at
//! entry and between phases, cooperatively honoring cancellation the same
//! way the rest of the stack does (see DESIGN.md) — without pretending to
//! a real two-thread lane split the rest of this crate only models, not
//! exercises: `db` is a plain `Mutex<Database>`, and `dispatch` serializes
//! access to it the way the DB lane's task queue would.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use asupersync::Cx;
use indexmap::IndexMap;
use revdb_core::{LockLevel, OrderedMutex, OrderedRwLock};

use crate::db::Database;
use crate::error::DbError;
use crate::model::{Model, ModelError};
use crate::object::{ConstObject, Object, ObjectData, ObjectEvent, ObjectStatus, SharedObject};
use crate::object_id::{ObjectId, ObjectIdPool};
use crate::revision::{self, FetchRequest, PendingSave};
use crate::schema::{self, DbInfo};
use crate::sql::SelectOption;
use crate::value::Value;

/// The full domain error taxonomy (spec §7, manager-level). Every variant
/// that wraps a database failure carries the driver's [`DbError`] as its
/// source; the rest report a manager-level invariant violation that the
/// database layer has no way to express.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid model: {0}")]
    InvalidModel(#[from] ModelError),

    #[error("begin transaction failed")]
    BeginTransactionFailed {
        #[source]
        source: DbError,
    },
    #[error("create db_info table failed")]
    CreateInfoTableFailed {
        #[source]
        source: DbError,
    },
    #[error("create entity table {entity} failed")]
    CreateEntityTableFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("alter entity table {entity} failed")]
    AlterEntityTableFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("create relation table {relation} failed")]
    CreateRelationTableFailed {
        relation: String,
        #[source]
        source: DbError,
    },
    #[error("create index {index} failed")]
    CreateIndexFailed {
        index: String,
        #[source]
        source: DbError,
    },
    #[error("insert db_info row failed")]
    InsertInfoFailed {
        #[source]
        source: DbError,
    },
    #[error("insert attributes into {entity} failed")]
    InsertAttributesFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("insert relation row into {relation} failed")]
    InsertRelationFailed {
        relation: String,
        #[source]
        source: DbError,
    },
    #[error("update db_info version failed")]
    UpdateInfoFailed {
        #[source]
        source: DbError,
    },
    #[error("update db_info save ids failed")]
    UpdateSaveIdFailed {
        #[source]
        source: DbError,
    },
    #[error("select from {entity} failed")]
    SelectFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("read db_info failed")]
    SelectInfoFailed {
        #[source]
        source: DbError,
    },
    #[error("select effective rows from {entity} failed")]
    SelectLastFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("select for revert failed")]
    SelectRevertFailed {
        #[source]
        source: DbError,
    },
    #[error("select relation-removed rows from {relation} failed")]
    SelectRelationRemovedFailed {
        relation: String,
        #[source]
        source: DbError,
    },
    #[error("reconstructing object data for {entity} failed")]
    MakeObjectDatasFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("delete from {entity} failed")]
    DeleteFailed {
        entity: String,
        #[source]
        source: DbError,
    },
    #[error("purge failed")]
    PurgeFailed {
        #[source]
        source: DbError,
    },
    #[error("purge of relation {relation} failed")]
    PurgeRelationFailed {
        relation: String,
        #[source]
        source: DbError,
    },
    #[error("VACUUM failed after purge; db_info was already reset to (1, 1)")]
    VacuumFailed {
        #[source]
        source: DbError,
    },
    #[error("last_insert_rowid() failed")]
    LastInsertRowidFailed {
        #[source]
        source: DbError,
    },
    #[error("model version text {0:?} is not dotted-numeric")]
    InvalidVersionText(String),
    #[error("db_info has no version recorded")]
    VersionNotFound,
    #[error("db_info row is missing")]
    SaveIdNotFound,
    #[error("revert target save-id {target} is out of range (last is {last})")]
    OutOfRangeSaveId { target: i64, last: i64 },
    #[error("operation cancelled")]
    Cancelled,
}

fn check(cx: &Cx) -> Result<(), ManagerError> {
    cx.checkpoint().map_err(|_| ManagerError::Cancelled)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdentityKey {
    Temporary(String),
    Stable(i64),
}

fn identity_key(id: &ObjectId) -> IdentityKey {
    id.temporary().map_or_else(
        || IdentityKey::Stable(id.stable().expect("ObjectId invariant: at least one present")),
        |t| IdentityKey::Temporary(t.to_string()),
    )
}

type ObjectChangeSubscriber = Box<dyn Fn(&str, &ConstObject, &ObjectEvent) + Send>;
type DbInfoSubscriber = Box<dyn Fn(&DbInfo) + Send>;

/// The engine façade (spec §4.8). One `Manager` owns exactly one
/// [`Database`] for its whole lifetime.
pub struct Manager {
    model: Model,
    db: Mutex<Database>,
    /// Serializes access to `db`, standing in for the DB lane's task
    /// queue (`LockLevel::TaskQueue`, the lowest rank — every other
    /// lane-bridging lock is acquired only while this one is held).
    dispatch: OrderedMutex<()>,
    db_info: OrderedRwLock<DbInfo>,
    object_notifier: OrderedMutex<Vec<ObjectChangeSubscriber>>,
    db_info_notifier: OrderedMutex<Vec<DbInfoSubscriber>>,
    suspend_count: OrderedMutex<u32>,
    identity_map: Mutex<IndexMap<(String, IdentityKey), Weak<Object>>>,
    created_objects: Mutex<Vec<SharedObject>>,
    changed_objects: Mutex<IndexMap<(String, IdentityKey), SharedObject>>,
}

impl Manager {
    /// Open `path` (or an in-memory database when `path` is `None`) and
    /// run [`schema::setup_or_migrate`] against `model` (spec §4.7/§4.8
    /// `setup`).
    pub fn open(model: Model, path: Option<&Path>) -> Result<Self, ManagerError> {
        let cx = Cx::for_request();
        let db = match path {
            Some(p) => Database::open_file(p).map_err(|source| ManagerError::BeginTransactionFailed { source })?,
            None => Database::open_memory().map_err(|source| ManagerError::BeginTransactionFailed { source })?,
        };
        let manager = Self {
            model,
            db: Mutex::new(db),
            dispatch: OrderedMutex::new(LockLevel::TaskQueue, ()),
            db_info: OrderedRwLock::new(LockLevel::DbInfoHolder, DbInfo { version: String::new(), cur_save_id: 0, last_save_id: 0 }),
            object_notifier: OrderedMutex::new(LockLevel::ObjectNotifier, Vec::new()),
            db_info_notifier: OrderedMutex::new(LockLevel::ObjectNotifier, Vec::new()),
            suspend_count: OrderedMutex::new(LockLevel::SuspendCount, 0),
            identity_map: Mutex::new(IndexMap::new()),
            created_objects: Mutex::new(Vec::new()),
            changed_objects: Mutex::new(IndexMap::new()),
        };
        manager.setup(&cx)?;
        Ok(manager)
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[must_use]
    pub fn current_db_info(&self) -> DbInfo {
        self.db_info.read().clone()
    }

    fn set_db_info(&self, info: DbInfo) {
        *self.db_info.write() = info.clone();
        for subscriber in self.db_info_notifier.lock().iter() {
            subscriber(&info);
        }
    }

    /// Register an observer that is called (on the caller's thread) every
    /// time `db_info` changes (spec §4.8 `observe_db_info`).
    pub fn observe_db_info(&self, handler: impl Fn(&DbInfo) + Send + 'static) {
        self.db_info_notifier.lock().push(Box::new(handler));
    }

    /// Register an observer called on every object lifecycle event across
    /// every live object (spec §4.8 `observe_db_object`).
    pub fn observe_db_object(&self, handler: impl Fn(&str, &ConstObject, &ObjectEvent) + Send + 'static) {
        self.object_notifier.lock().push(Box::new(handler));
    }

    fn notify_object_event(&self, entity_name: &str, object: &ConstObject, event: &ObjectEvent) {
        for subscriber in self.object_notifier.lock().iter() {
            subscriber(entity_name, object, event);
        }
    }

    fn is_suspended(&self) -> bool {
        *self.suspend_count.lock() > 0
    }

    /// Gate dispatch of DB-lane work (spec §4.8 `suspend`/`resume`); nests
    /// (a second `suspend` requires a second `resume`).
    pub fn suspend(&self) {
        *self.suspend_count.lock() += 1;
    }

    /// # Panics
    ///
    /// Panics on an unbalanced `resume` call (more resumes than
    /// suspends) — a programmer error in the caller.
    pub fn resume(&self) {
        let mut count = self.suspend_count.lock();
        assert!(*count > 0, "Manager::resume called without a matching suspend");
        *count -= 1;
    }

    /// spec §4.8 `setup`: create-or-migrate the schema and load `db_info`.
    pub fn setup(&self, cx: &Cx) -> Result<DbInfo, ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let info = schema::setup_or_migrate(&db, &self.model)?;
        drop(db);
        self.set_db_info(info.clone());
        Ok(info)
    }

    /// spec §4.8 `reset`: re-fetch the current effective data for every
    /// currently-changed object (by its stable id), force-reload those
    /// objects from the database, and clear the `created`/`changed` sets —
    /// discarding every unsaved local edit without touching `db_info` or
    /// issuing any schema work.
    ///
    /// A `created` object has no stable id and no row to re-fetch; it is
    /// simply dropped from `created_objects`, the same as a locally-removed
    /// `created` object already is (spec §4.8 `_object_did_change`).
    pub fn reset(&self, cx: &Cx) -> Result<(), ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();

        self.created_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();

        let changed: Vec<(String, SharedObject)> = self
            .changed_objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .map(|((entity_name, _), object)| (entity_name, object))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let mut by_entity: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (entity_name, object) in &changed {
            if let Some(stable) = object.object_id().stable() {
                by_entity.entry(entity_name.clone()).or_default().push(stable);
            }
        }
        if by_entity.is_empty() {
            return Ok(());
        }

        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cur_save_id = self.db_info.read().cur_save_id;
        let mut request = FetchRequest::new();
        for (entity_name, ids) in &by_entity {
            let opt = SelectOption::new(entity_name).where_expr(crate::sql::in_expr("obj_id", crate::sql::InSource::Integers(ids)));
            request.insert(entity_name.clone(), opt);
        }
        let datas = revision::fetch(&db, &self.model, &request, cur_save_id)?;
        drop(db);

        for (entity_name, object) in &changed {
            let Some(stable) = object.object_id().stable() else { continue };
            let Some(entity_datas) = datas.get(entity_name) else { continue };
            if let Some(data) = entity_datas.iter().find(|d| d.object_id.stable() == Some(stable)) {
                object.load_data(data.clone(), true);
                self.notify_object_event(entity_name, &object.to_const(), &ObjectEvent::Loaded);
            } else {
                object.clear_loaded_data();
            }
        }
        Ok(())
    }

    /// spec §4.8 `clear`: wipe every row (content tables only) and reset
    /// `db_info` to `(0, 0)`.
    pub fn clear(&self, cx: &Cx) -> Result<(), ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        {
            let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            db.begin_exclusive().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
            if let Err(err) = revision::clear(&db, &self.model) {
                let _ = db.rollback();
                return Err(err);
            }
            schema::write_db_info_save_ids(&db, 0, 0)?;
            db.commit().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        }
        for weak in self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).values() {
            if let Some(object) = weak.upgrade() {
                object.clear_loaded_data();
            }
        }
        self.created_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        self.changed_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
        let existing_version = self.db_info.read().version.clone();
        self.set_db_info(DbInfo { version: existing_version, cur_save_id: 0, last_save_id: 0 });
        Ok(())
    }

    /// spec §4.8 `purge`: collapse history to the current save generation.
    /// The `VACUUM` runs outside any transaction, as SQLite requires; a
    /// `VACUUM` failure is reported but does not roll back the collapse
    /// that already committed (see DESIGN.md for the Open Question this
    /// resolves).
    pub fn purge(&self, cx: &Cx) -> Result<(), ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let info = self.db_info.read().clone();

        db.begin_exclusive().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        if let Err(err) = revision::purge(&db, &self.model, info.cur_save_id, info.last_save_id) {
            let _ = db.rollback();
            return Err(err);
        }
        schema::write_db_info_save_ids(&db, 1, 1)?;
        db.commit().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        drop(db);

        self.set_db_info(DbInfo { version: info.version.clone(), cur_save_id: 1, last_save_id: 1 });

        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.execute_raw("VACUUM").map_err(|source| ManagerError::VacuumFailed { source })?;

        for weak in self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).values() {
            if let Some(object) = weak.upgrade() {
                object.note_purged();
            }
        }
        Ok(())
    }

    fn intern(&self, entity_name: &str, object: SharedObject) -> SharedObject {
        let key = identity_key(&object.object_id());
        let mut map = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = map.get(&(entity_name.to_string(), key.clone())).and_then(Weak::upgrade) {
            return existing;
        }
        map.insert((entity_name.to_string(), key), Arc::downgrade(&object));
        object
    }

    /// Move this object's identity-map entry from its pre-save temporary
    /// key to its newly-assigned stable key, so a later `fetch`/`revert`
    /// (which only ever knows the stable `obj_id`) finds the same live
    /// handle instead of constructing a second one.
    fn rekey_identity_map(&self, entity_name: &str, temporary_id: &str, stable: i64, object: &SharedObject) {
        let mut map = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        map.shift_remove(&(entity_name.to_string(), IdentityKey::Temporary(temporary_id.to_string())));
        map.insert((entity_name.to_string(), IdentityKey::Stable(stable)), Arc::downgrade(object));
    }

    /// spec §4.8 `create_object`: the only fully synchronous, main-lane-only
    /// operation — it never touches the database.
    #[must_use]
    pub fn create_object(&self, entity_name: &str) -> SharedObject {
        let entity = self.model.entity(entity_name).expect("create_object: unknown entity name").clone();
        let object = Arc::new(Object::new_created(entity));
        let object = self.intern(entity_name, object);
        self.created_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(Arc::clone(&object));
        object
    }

    fn entity_datas_to_objects(&self, entity_name: &str, datas: Vec<ObjectData>) -> Vec<SharedObject> {
        let entity = self.model.entity(entity_name).expect("entity must exist in model");
        datas
            .into_iter()
            .map(|data| {
                let key = identity_key(&data.object_id);
                let mut map = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(existing) = map.get(&(entity_name.to_string(), key.clone())).and_then(Weak::upgrade) {
                    existing.load_data(data, false);
                    return existing;
                }
                let object = Arc::new(Object::new_loaded(entity.clone(), data));
                map.insert((entity_name.to_string(), key), Arc::downgrade(&object));
                object
            })
            .collect()
    }

    /// spec §4.8 `fetch_objects`: run `request` and return live,
    /// identity-mapped handles, firing a `Fetched` event on each.
    pub fn fetch_objects(&self, cx: &Cx, request: &FetchRequest) -> Result<BTreeMap<String, Vec<SharedObject>>, ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cur_save_id = self.db_info.read().cur_save_id;
        let datas = revision::fetch(&db, &self.model, request, cur_save_id)?;
        drop(db);

        let mut result = BTreeMap::new();
        for (entity_name, entity_datas) in datas {
            let objects = self.entity_datas_to_objects(&entity_name, entity_datas);
            for object in &objects {
                object.mark_fetched();
            }
            result.insert(entity_name, objects);
        }
        Ok(result)
    }

    /// spec §4.8 `fetch_const_objects`: identical query, but returns
    /// snapshot data with no live handle and no identity-map entry.
    pub fn fetch_const_objects(&self, cx: &Cx, request: &FetchRequest) -> Result<BTreeMap<String, Vec<ConstObject>>, ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cur_save_id = self.db_info.read().cur_save_id;
        let datas = revision::fetch(&db, &self.model, request, cur_save_id)?;
        drop(db);

        Ok(datas
            .into_iter()
            .map(|(entity_name, entity_datas)| {
                let consts = entity_datas
                    .into_iter()
                    .map(|data| ConstObject { entity_name: entity_name.clone(), object_id: data.object_id, attributes: data.attributes, relations: data.relations })
                    .collect();
                (entity_name, consts)
            })
            .collect())
    }

    /// spec §4.8 `insert_objects`: the shared implementation behind
    /// `insert_objects_by_count` and `insert_objects_by_values` — both are
    /// thin callers that only differ in how `values` is produced.
    pub fn insert_objects(&self, cx: &Cx, entity_name: &str, values: Vec<BTreeMap<String, Value>>) -> Result<Vec<SharedObject>, ManagerError> {
        check(cx)?;
        let entity = self.model.entity(entity_name).ok_or_else(|| ManagerError::SelectFailed {
            entity: entity_name.to_string(),
            source: DbError::InvalidArgument(format!("unknown entity {entity_name:?}")),
        })?;

        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let info = self.db_info.read().clone();
        let next_save_id = info.cur_save_id + 1;

        db.begin_exclusive().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        let datas = match revision::insert_new_objects(&db, entity, &values, next_save_id) {
            Ok(d) => d,
            Err(err) => {
                let _ = db.rollback();
                return Err(err);
            }
        };
        schema::write_db_info_save_ids(&db, next_save_id, next_save_id)?;
        db.commit().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        drop(db);

        self.set_db_info(DbInfo { version: info.version, cur_save_id: next_save_id, last_save_id: next_save_id });
        Ok(self.entity_datas_to_objects(entity_name, datas))
    }

    /// spec §4.8 `insert_objects_by_count`: insert `count` fresh rows with
    /// only declared defaults applied.
    pub fn insert_objects_by_count(&self, cx: &Cx, entity_name: &str, count: usize) -> Result<Vec<SharedObject>, ManagerError> {
        self.insert_objects(cx, entity_name, vec![BTreeMap::new(); count])
    }

    /// spec §4.8 `insert_objects_by_values`: insert one row per element of
    /// `values`, each overriding the declared defaults it names.
    pub fn insert_objects_by_values(&self, cx: &Cx, entity_name: &str, values: Vec<BTreeMap<String, Value>>) -> Result<Vec<SharedObject>, ManagerError> {
        self.insert_objects(cx, entity_name, values)
    }

    /// spec §4.8 `save`: write every `Created`/`Changed` object, truncating
    /// any redo history beyond `cur_save_id` first, then fix up inverse
    /// relations for anything removed in this batch.
    pub fn save(&self, cx: &Cx) -> Result<(), ManagerError> {
        check(cx)?;
        let created: Vec<SharedObject> = std::mem::take(&mut *self.created_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        let changed: Vec<SharedObject> = self
            .changed_objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .map(|(_, object)| object)
            .collect();

        let mut all: Vec<SharedObject> = created;
        for object in changed {
            if !all.iter().any(|o| Arc::ptr_eq(o, &object)) {
                all.push(object);
            }
        }
        if all.is_empty() {
            return Ok(());
        }

        for object in &all {
            if object.status() != ObjectStatus::Created {
                object.begin_updating();
            }
        }

        let mut pool = ObjectIdPool::new();
        let mut pending = Vec::with_capacity(all.len());
        for object in &all {
            let entity_name = object.entity_name().to_string();
            let action: &'static str = if object.status() == ObjectStatus::Created {
                "insert"
            } else if object.is_removed() {
                "remove"
            } else {
                "update"
            };
            let data = object.save_data(&mut pool);
            pending.push(PendingSave { entity_name, action, data });
        }

        check(cx)?;
        let _gate = self.dispatch.lock();
        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let info = self.db_info.read().clone();
        let next_save_id = info.cur_save_id + 1;

        db.begin_exclusive().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        let finalized = match revision::save_changed_objects(&db, &self.model, info.cur_save_id, info.last_save_id, next_save_id, &pending) {
            Ok(f) => f,
            Err(err) => {
                let _ = db.rollback();
                return Err(err);
            }
        };
        schema::write_db_info_save_ids(&db, next_save_id, next_save_id)?;
        db.commit().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        drop(db);

        // `finalized`'s first `all.len()` entries are this batch's own
        // objects, in order; anything after that is an inverse-relation
        // holder `save_changed_objects` rewrote on this object's behalf
        // (spec §4.5) and never appeared in `all` at all.
        let mut finalized = finalized.into_iter();
        for object in &all {
            let (entity_name, data) = finalized.next().expect("save_changed_objects returns one entry per pending item");
            if let Some(temporary_id) = object.object_id().temporary().map(str::to_string)
                && object.object_id().stable().is_none()
            {
                let stable = data.object_id.stable().expect("save always assigns a stable id");
                object.set_stable_id(stable);
                self.rekey_identity_map(&entity_name, &temporary_id, stable, object);
            }
            // `data`'s relation target ids have been resolved against
            // every sibling saved in this same batch (see
            // `revision::save_changed_objects`'s two-pass assignment) —
            // push that back into the live handle so a relation that
            // pointed at a just-created sibling now carries its stable id
            // too, not only the wire-level row that was written.
            object.load_data(data, true);
            self.notify_object_event(&entity_name, &object.to_const(), &ObjectEvent::Loaded);
        }
        for (entity_name, data) in finalized {
            let key = (entity_name.clone(), identity_key(&data.object_id));
            if let Some(object) = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&key).and_then(Weak::upgrade) {
                object.load_data(data, true);
                self.notify_object_event(&entity_name, &object.to_const(), &ObjectEvent::Loaded);
            }
        }

        self.set_db_info(DbInfo { version: info.version, cur_save_id: next_save_id, last_save_id: next_save_id });
        Ok(())
    }

    /// Track an object that a caller has just created or mutated so the
    /// next [`Manager::save`] picks it up. Called by the embedding
    /// application after `create_object`/attribute or relation mutators.
    pub fn track_changed(&self, entity_name: &str, object: &SharedObject) {
        let key = (entity_name.to_string(), identity_key(&object.object_id()));
        self.changed_objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(key, Arc::clone(object));
    }

    /// spec §4.8 `revert`: move `cur_save_id` to `target`, restoring every
    /// entity table's rows via `select_for_revert`, and reload every live
    /// object whose `obj_id` was affected.
    pub fn revert(&self, cx: &Cx, target: i64) -> Result<(), ManagerError> {
        check(cx)?;
        let _gate = self.dispatch.lock();
        let info = self.db_info.read().clone();

        if target == info.cur_save_id {
            return Ok(());
        }
        if target > info.last_save_id {
            return Err(ManagerError::OutOfRangeSaveId { target, last: info.last_save_id });
        }

        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        db.begin_exclusive().map_err(|source| ManagerError::BeginTransactionFailed { source })?;

        let mut touched: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for entity in self.model.entities.values() {
            let rows = match revision::select_for_revert(&db, &entity.name, target, info.cur_save_id) {
                Ok(r) => r,
                Err(err) => {
                    let _ = db.rollback();
                    return Err(err);
                }
            };
            if rows.is_empty() {
                continue;
            }
            let mut ids = Vec::with_capacity(rows.len());
            for row in &rows {
                let obj_id = row.get_i64("obj_id").unwrap_or(0);
                ids.push(obj_id);
            }
            touched.insert(entity.name.clone(), ids);
        }

        schema::write_db_info_save_ids(&db, target, info.last_save_id)?;
        db.commit().map_err(|source| ManagerError::BeginTransactionFailed { source })?;
        drop(db);

        self.set_db_info(DbInfo { version: info.version, cur_save_id: target, last_save_id: info.last_save_id });

        let db = self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (entity_name, obj_ids) in touched {
            let entity = self.model.entity(&entity_name).expect("entity must exist");
            let opt = SelectOption::new(&entity_name).where_expr(crate::sql::in_expr("obj_id", crate::sql::InSource::Integers(&obj_ids)));
            let mut request = FetchRequest::new();
            request.insert(entity_name.clone(), opt);
            let datas = revision::fetch(&db, &self.model, &request, target)?;
            if let Some(entity_datas) = datas.get(&entity_name) {
                let present: std::collections::BTreeSet<i64> = entity_datas.iter().filter_map(|d| d.object_id.stable()).collect();
                for data in entity_datas {
                    if let Some(object) = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&(entity_name.clone(), identity_key(&data.object_id))).and_then(Weak::upgrade) {
                        object.load_data(data.clone(), true);
                    }
                }
                for obj_id in &obj_ids {
                    if present.contains(obj_id) {
                        continue;
                    }
                    if let Some(object) = self.identity_map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).get(&(entity_name.clone(), IdentityKey::Stable(*obj_id))).and_then(Weak::upgrade) {
                        object.clear_loaded_data();
                    }
                }
            }
            let _ = entity;
        }
        Ok(())
    }
}
