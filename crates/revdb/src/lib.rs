//! An embedded, versioned, object-graph persistence engine layered on
//! `SQLite`.
//!
//! Every entity row carries full revision history (`obj_id`, `save_id`,
//! `action`); the [`manager::Manager`] façade turns that history into
//! undo/redo/revert, inserts/saves that assign stable ids to
//! previously-temporary objects, and a weak in-memory identity map so two
//! fetches of the same row hand back the same live handle.

#![forbid(unsafe_code)]

pub mod db;
pub mod error;
pub mod manager;
pub mod model;
pub mod object;
pub mod object_id;
pub mod revision;
pub mod schema;
pub mod sql;
pub mod value;

pub use db::{DbRow, Database};
pub use error::{DbError, DbResult};
pub use manager::{Manager, ManagerError};
pub use model::{
    Attribute, AttributeDescription, AttributeType, Entity, EntityDescription, Index,
    IndexDescription, Model, ModelDescription, ModelError, Relation, RelationDescription,
};
pub use object::{ConstObject, Object, ObjectData, ObjectEvent, ObjectStatus, SharedObject};
pub use object_id::{ObjectId, ObjectIdPool};
pub use revision::FetchRequest;
pub use schema::DbInfo;
pub use sql::{InSource, Order, SelectOption};
pub use value::{Value, ValueKind};
