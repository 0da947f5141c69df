//! Schema creation and additive-only migration (spec §4.7).
//!
//! Every function in this module takes an already-open [`Database`] handle
//! and assumes the caller has opened whatever transaction it wants around
//! the call — this module never begins or commits one itself, the same
//! separation `revision.rs` keeps (see DESIGN.md).

use crate::db::Database;
use crate::manager::ManagerError;
use crate::model::{Attribute, Entity, Index, Model, Relation, compare_versions};
use crate::sql::{self, SelectOption};
use crate::value::Value;

pub const DB_INFO_TABLE: &str = "db_info";

/// The single `db_info` row (spec §3 "db_info").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub version: String,
    pub cur_save_id: i64,
    pub last_save_id: i64,
}

fn entity_table_columns(entity: &Entity) -> Vec<String> {
    let mut columns = vec![
        "pk_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "obj_id INTEGER NOT NULL DEFAULT 0".to_string(),
        "save_id INTEGER NOT NULL DEFAULT 0".to_string(),
        "action TEXT NOT NULL DEFAULT 'insert'".to_string(),
    ];
    columns.extend(entity.attributes.iter().map(Attribute::column_def));
    columns
}

fn relation_table_columns() -> Vec<String> {
    vec![
        "pk_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "src_pk_id INTEGER".to_string(),
        "src_obj_id INTEGER".to_string(),
        "tgt_obj_id INTEGER".to_string(),
        "save_id INTEGER".to_string(),
    ]
}

pub fn create_entity_table(db: &Database, entity: &Entity) -> Result<(), ManagerError> {
    let stmt = sql::create_table(&entity.name, &entity_table_columns(entity));
    db.execute_raw(&stmt).map_err(|source| ManagerError::CreateEntityTableFailed {
        entity: entity.name.clone(),
        source,
    })?;
    tracing::info!(entity = %entity.name, "created entity table");
    Ok(())
}

pub fn create_relation_table(db: &Database, relation: &Relation) -> Result<(), ManagerError> {
    let stmt = sql::create_table(&relation.table_name, &relation_table_columns());
    db.execute_raw(&stmt).map_err(|source| ManagerError::CreateRelationTableFailed {
        relation: relation.table_name.clone(),
        source,
    })?;
    tracing::info!(relation = %relation.table_name, "created relation table");
    Ok(())
}

pub fn create_model_index(db: &Database, index: &Index) -> Result<(), ManagerError> {
    let stmt = sql::create_index(&index.name, &index.entity, &index.attributes);
    db.execute_raw(&stmt).map_err(|source| ManagerError::CreateIndexFailed {
        index: index.name.clone(),
        source,
    })?;
    tracing::info!(index = %index.name, entity = %index.entity, "created index");
    Ok(())
}

fn create_db_info_table(db: &Database) -> Result<(), ManagerError> {
    let stmt = sql::create_table(
        DB_INFO_TABLE,
        &[
            "version TEXT NOT NULL".to_string(),
            "cur_save_id INTEGER NOT NULL".to_string(),
            "last_save_id INTEGER NOT NULL".to_string(),
        ],
    );
    db.execute_raw(&stmt).map_err(|source| ManagerError::CreateInfoTableFailed { source })
}

fn insert_db_info_row(db: &Database, version: &str, cur_save_id: i64, last_save_id: i64) -> Result<(), ManagerError> {
    let stmt = sql::insert(
        DB_INFO_TABLE,
        &["version".to_string(), "cur_save_id".to_string(), "last_save_id".to_string()],
    );
    db.execute_update(
        &stmt,
        &[Value::Text(version.to_string()), Value::Integer(cur_save_id), Value::Integer(last_save_id)],
    )
    .map_err(|source| ManagerError::InsertInfoFailed { source })?;
    Ok(())
}

/// Read the single `db_info` row.
///
/// # Panics
///
/// Panics if the table has no row — a missing row is a schema corruption
/// bug, not a recoverable runtime condition (`setup_or_migrate` always
/// leaves exactly one row behind).
pub fn read_db_info(db: &Database) -> Result<DbInfo, ManagerError> {
    let rows = db
        .execute_query(&sql::select(&SelectOption::new(DB_INFO_TABLE)), &[])
        .map_err(|source| ManagerError::SelectInfoFailed { source })?;
    let row = rows.first().expect("db_info table must always contain exactly one row");
    Ok(DbInfo {
        version: row.get_string("version").unwrap_or_default(),
        cur_save_id: row.get_i64("cur_save_id").unwrap_or(0),
        last_save_id: row.get_i64("last_save_id").unwrap_or(0),
    })
}

pub fn write_db_info_version(db: &Database, version: &str) -> Result<(), ManagerError> {
    let stmt = sql::update(DB_INFO_TABLE, &["version".to_string()], None);
    db.execute_update(&stmt, &[Value::Text(version.to_string())])
        .map_err(|source| ManagerError::UpdateInfoFailed { source })?;
    Ok(())
}

pub fn write_db_info_save_ids(db: &Database, cur_save_id: i64, last_save_id: i64) -> Result<(), ManagerError> {
    let stmt = sql::update(DB_INFO_TABLE, &["cur_save_id".to_string(), "last_save_id".to_string()], None);
    db.execute_update(&stmt, &[Value::Integer(cur_save_id), Value::Integer(last_save_id)])
        .map_err(|source| ManagerError::UpdateSaveIdFailed { source })?;
    Ok(())
}

fn alter_add_missing_columns(db: &Database, entity: &Entity) -> Result<(), ManagerError> {
    for attr in &entity.attributes {
        let exists = db
            .column_exists(&entity.name, &attr.name)
            .map_err(|source| ManagerError::AlterEntityTableFailed { entity: entity.name.clone(), source })?;
        if exists {
            continue;
        }
        let stmt = sql::alter_table_add_column(&entity.name, &attr.column_def());
        db.execute_raw(&stmt)
            .map_err(|source| ManagerError::AlterEntityTableFailed { entity: entity.name.clone(), source })?;
        tracing::info!(entity = %entity.name, column = %attr.name, "added column via migration");
    }
    Ok(())
}

/// Create-or-migrate the schema for `model` against `db` (spec §4.7).
///
/// Must run inside a transaction the caller has already opened — this
/// function only issues DDL/DML, it never begins or commits one itself.
pub fn setup_or_migrate(db: &Database, model: &Model) -> Result<DbInfo, ManagerError> {
    let db_info_exists = db
        .table_exists(DB_INFO_TABLE)
        .map_err(|source| ManagerError::SelectInfoFailed { source })?;

    if !db_info_exists {
        create_db_info_table(db)?;
        for entity in model.entities.values() {
            create_entity_table(db, entity)?;
            for relation in entity.relations.values() {
                create_relation_table(db, relation)?;
            }
        }
        for index in &model.indices {
            create_model_index(db, index)?;
        }
        insert_db_info_row(db, &model.version, 0, 0)?;
        tracing::info!(version = %model.version, "initialized new revdb schema");
        return read_db_info(db);
    }

    let existing = read_db_info(db)?;
    write_db_info_version(db, &model.version)?;

    if compare_versions(&model.version, &existing.version) == std::cmp::Ordering::Greater {
        for entity in model.entities.values() {
            if db
                .table_exists(&entity.name)
                .map_err(|source| ManagerError::AlterEntityTableFailed { entity: entity.name.clone(), source })?
            {
                alter_add_missing_columns(db, entity)?;
            } else {
                create_entity_table(db, entity)?;
            }
            for relation in entity.relations.values() {
                if !db
                    .table_exists(&relation.table_name)
                    .map_err(|source| ManagerError::CreateRelationTableFailed { relation: relation.table_name.clone(), source })?
                {
                    create_relation_table(db, relation)?;
                }
            }
        }
    }

    for index in &model.indices {
        if !db
            .index_exists(&index.name)
            .map_err(|source| ManagerError::CreateIndexFailed { index: index.name.clone(), source })?
        {
            create_model_index(db, index)?;
        }
    }

    read_db_info(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeDescription, AttributeType, EntityDescription, ModelDescription};

    fn model_v1() -> Model {
        Model::new(ModelDescription {
            version: "1.0".to_string(),
            entities: vec![EntityDescription {
                name: "A".to_string(),
                attributes: vec![AttributeDescription {
                    name: "name".to_string(),
                    attr_type: AttributeType::Text,
                    default: None,
                    not_null: false,
                    primary: false,
                    unique: false,
                }],
                relations: vec![],
            }],
            indices: vec![],
        })
        .unwrap()
    }

    fn model_v2_adds_column() -> Model {
        let desc = ModelDescription {
            version: "2.0".to_string(),
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
        Model::new(desc).unwrap()
    }

    #[test]
    fn fresh_setup_creates_tables_and_info_row() {
        let db = Database::open_memory().unwrap();
        let info = setup_or_migrate(&db, &model_v1()).unwrap();
        assert_eq!(info, DbInfo { version: "1.0".to_string(), cur_save_id: 0, last_save_id: 0 });
        assert!(db.table_exists("A").unwrap());
        assert!(db.table_exists(DB_INFO_TABLE).unwrap());
    }

    #[test]
    fn migration_adds_column_and_bumps_version() {
        let db = Database::open_memory().unwrap();
        setup_or_migrate(&db, &model_v1()).unwrap();
        assert!(!db.column_exists("A", "age").unwrap());

        let info = setup_or_migrate(&db, &model_v2_adds_column()).unwrap();
        assert_eq!(info.version, "2.0");
        assert!(db.column_exists("A", "age").unwrap());
    }

    #[test]
    fn lower_or_equal_version_is_a_no_op_besides_version_write() {
        let db = Database::open_memory().unwrap();
        setup_or_migrate(&db, &model_v2_adds_column()).unwrap();
        let info = setup_or_migrate(&db, &model_v1()).unwrap();
        // Version is always written back, even though 1.0 < 2.0 triggers no migration.
        assert_eq!(info.version, "1.0");
        assert!(db.column_exists("A", "age").unwrap(), "existing column must survive a downgraded version write");
    }
}
