//! Entities, attributes, relations, indices — the schema description and
//! the validated [`Model`] built from it.

use std::collections::BTreeMap;

use crate::value::{Value, ValueKind};

/// The four system attributes present on every entity table.
pub const SYSTEM_ATTRIBUTES: [&str; 4] = ["pk_id", "obj_id", "save_id", "action"];

/// Discriminated attribute type (spec §3 "Attribute type").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Integer,
    Real,
    Text,
    Blob,
}

impl AttributeType {
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
        }
    }

    #[must_use]
    pub const fn matches(self, kind: ValueKind) -> bool {
        matches!(
            (self, kind),
            (Self::Integer, ValueKind::Integer)
                | (Self::Real, ValueKind::Real)
                | (Self::Text, ValueKind::Text)
                | (Self::Blob, ValueKind::Blob)
        )
    }
}

/// A declared (non-system) attribute.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    pub default: Option<Value>,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub unique: bool,
}

/// Validated, constructed attribute as held inside a [`Model`].
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub attr_type: AttributeType,
    pub default: Option<Value>,
    pub not_null: bool,
    pub primary: bool,
    pub unique: bool,
}

impl Attribute {
    /// Render this attribute's column definition fragment for `CREATE
    /// TABLE`/`ALTER TABLE ADD COLUMN` (everything after the column name
    /// and SQL type is the default/not-null clause).
    #[must_use]
    pub fn column_def(&self) -> String {
        let mut def = format!("{} {}", self.name, self.attr_type.sql_type());
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(&default.sql_literal());
        }
        def
    }
}

/// A declared relation `source.name -> target` (spec §3 "relation").
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RelationDescription {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub many: bool,
}

/// Validated, constructed relation as held inside a [`Model`], with its
/// side-table name and insert SQL eagerly computed at construction time.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub source: String,
    pub target: String,
    pub many: bool,
    pub table_name: String,
    pub insert_sql: String,
}

impl Relation {
    fn new(source: &str, name: &str, target: &str, many: bool) -> Self {
        let table_name = format!("rel_{source}_{name}");
        let insert_sql = crate::sql::insert(
            &table_name,
            &[
                "src_pk_id".to_string(),
                "src_obj_id".to_string(),
                "tgt_obj_id".to_string(),
                "save_id".to_string(),
            ],
        );
        Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            many,
            table_name,
            insert_sql,
        }
    }
}

/// Entity description as supplied by the embedding application.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
    #[serde(default)]
    pub relations: Vec<RelationDescription>,
}

/// Index description.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IndexDescription {
    pub name: String,
    pub entity: String,
    pub attributes: Vec<String>,
}

/// The transfer form of a whole model, loadable from JSON/TOML.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelDescription {
    pub version: String,
    pub entities: Vec<EntityDescription>,
    #[serde(default)]
    pub indices: Vec<IndexDescription>,
}

/// A constructed entity: its full attribute map (declared ∪ system) and
/// relation map.
#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    /// Declared attributes only, in declaration order.
    pub attributes: Vec<Attribute>,
    /// Declared ∪ system attributes, keyed by name, for O(1) lookup.
    pub attribute_map: BTreeMap<String, Attribute>,
    pub relations: BTreeMap<String, Relation>,
}

impl Entity {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attribute_map.get(name)
    }

    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    #[must_use]
    pub fn is_system_attribute(name: &str) -> bool {
        SYSTEM_ATTRIBUTES.contains(&name)
    }
}

/// A validated index.
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub entity: String,
    pub attributes: Vec<String>,
}

/// Error raised while constructing a [`Model`] from a [`ModelDescription`]
/// (spec §6 "Invalid ... is rejected at model construction with an
/// invalid-argument error").
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("entity {entity}: duplicate attribute name {name:?}")]
    DuplicateAttribute { entity: String, name: String },
    #[error("entity {entity}: empty attribute name")]
    EmptyAttributeName { entity: String },
    #[error("entity {entity}: empty entity name")]
    EmptyEntityName { entity: String },
    #[error("entity {entity}, attribute {name:?}: not_null without a default")]
    NotNullWithoutDefault { entity: String, name: String },
    #[error("entity {entity}, attribute {name:?}: default value kind does not match declared type {declared:?}")]
    DefaultTypeMismatch {
        entity: String,
        name: String,
        declared: AttributeType,
    },
    #[error("duplicate entity name {0:?}")]
    DuplicateEntity(String),
    #[error("relation {entity}.{relation}: unknown target entity {target:?}")]
    UnknownRelationTarget {
        entity: String,
        relation: String,
        target: String,
    },
    #[error("index {0:?}: unknown entity {1:?}")]
    UnknownIndexEntity(String, String),
    #[error("model version string {0:?} is not dotted-numeric")]
    InvalidVersion(String),
}

/// The validated, immutable schema description. Constructed only through
/// [`Model::new`], which enforces every invariant in spec.md §4.3.
#[derive(Debug, Clone)]
pub struct Model {
    pub version: String,
    pub entities: BTreeMap<String, Entity>,
    pub indices: Vec<Index>,
    /// For every entity `tgt`, the set of `(src_entity, relation_name)`
    /// pairs of relations that point at it. Drives the inverse-relation
    /// fix-up on delete (spec §4.5/§4.6).
    pub inverse_relations: BTreeMap<String, Vec<(String, String)>>,
}

impl Model {
    /// Build and validate a [`Model`] from its transfer description.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] for any of the construction-time invariant
    /// violations named in spec.md §4.3/§6.
    pub fn new(description: ModelDescription) -> Result<Self, ModelError> {
        if !is_dotted_numeric(&description.version) {
            return Err(ModelError::InvalidVersion(description.version));
        }

        let mut entities = BTreeMap::new();

        for entity_desc in &description.entities {
            if entity_desc.name.is_empty() {
                return Err(ModelError::EmptyEntityName {
                    entity: entity_desc.name.clone(),
                });
            }
            if entities.contains_key(&entity_desc.name) {
                return Err(ModelError::DuplicateEntity(entity_desc.name.clone()));
            }

            let mut attributes = Vec::new();
            let mut attribute_map = BTreeMap::new();

            for attr_desc in &entity_desc.attributes {
                if attr_desc.name.is_empty() {
                    return Err(ModelError::EmptyAttributeName {
                        entity: entity_desc.name.clone(),
                    });
                }
                if Entity::is_system_attribute(&attr_desc.name)
                    || attribute_map.contains_key(&attr_desc.name)
                {
                    return Err(ModelError::DuplicateAttribute {
                        entity: entity_desc.name.clone(),
                        name: attr_desc.name.clone(),
                    });
                }
                if attr_desc.not_null && attr_desc.default.is_none() {
                    return Err(ModelError::NotNullWithoutDefault {
                        entity: entity_desc.name.clone(),
                        name: attr_desc.name.clone(),
                    });
                }
                if let Some(default) = &attr_desc.default
                    && !attr_desc.attr_type.matches(default.kind())
                {
                    return Err(ModelError::DefaultTypeMismatch {
                        entity: entity_desc.name.clone(),
                        name: attr_desc.name.clone(),
                        declared: attr_desc.attr_type,
                    });
                }

                let attribute = Attribute {
                    name: attr_desc.name.clone(),
                    attr_type: attr_desc.attr_type,
                    default: attr_desc.default.clone(),
                    not_null: attr_desc.not_null,
                    primary: attr_desc.primary,
                    unique: attr_desc.unique,
                };
                attribute_map.insert(attribute.name.clone(), attribute.clone());
                attributes.push(attribute);
            }

            for (name, attr_type, default) in [
                ("pk_id", AttributeType::Integer, None),
                ("obj_id", AttributeType::Integer, Some(Value::Integer(0))),
                ("save_id", AttributeType::Integer, Some(Value::Integer(0))),
                ("action", AttributeType::Text, Some(Value::Text("insert".to_string()))),
            ] {
                attribute_map.insert(
                    name.to_string(),
                    Attribute {
                        name: name.to_string(),
                        attr_type,
                        default,
                        not_null: name != "pk_id",
                        primary: name == "pk_id",
                        unique: false,
                    },
                );
            }

            let mut relations = BTreeMap::new();
            for rel_desc in &entity_desc.relations {
                let relation =
                    Relation::new(&entity_desc.name, &rel_desc.name, &rel_desc.target, rel_desc.many);
                relations.insert(relation.name.clone(), relation);
            }

            entities.insert(
                entity_desc.name.clone(),
                Entity {
                    name: entity_desc.name.clone(),
                    attributes,
                    attribute_map,
                    relations,
                },
            );
        }

        // Relation targets must name a known entity.
        for entity in entities.values() {
            for relation in entity.relations.values() {
                if !entities.contains_key(&relation.target) {
                    return Err(ModelError::UnknownRelationTarget {
                        entity: entity.name.clone(),
                        relation: relation.name.clone(),
                        target: relation.target.clone(),
                    });
                }
            }
        }

        let mut inverse_relations: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for entity in entities.values() {
            for relation in entity.relations.values() {
                inverse_relations
                    .entry(relation.target.clone())
                    .or_default()
                    .push((entity.name.clone(), relation.name.clone()));
            }
        }

        let mut indices = Vec::new();
        for index_desc in &description.indices {
            if !entities.contains_key(&index_desc.entity) {
                return Err(ModelError::UnknownIndexEntity(
                    index_desc.name.clone(),
                    index_desc.entity.clone(),
                ));
            }
            indices.push(Index {
                name: index_desc.name.clone(),
                entity: index_desc.entity.clone(),
                attributes: index_desc.attributes.clone(),
            });
        }

        Ok(Self {
            version: description.version,
            entities,
            indices,
            inverse_relations,
        })
    }

    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    #[must_use]
    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    #[must_use]
    pub fn inverse_relation_names(&self, entity: &str) -> &[(String, String)] {
        self.inverse_relations
            .get(entity)
            .map_or(&[], Vec::as_slice)
    }
}

fn is_dotted_numeric(version: &str) -> bool {
    !version.is_empty() && version.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Lexicographic comparison over dotted-numeric tuples (spec §4.3/§6).
/// Shorter tuples are zero-padded for comparison (`"1.2"` < `"1.2.1"`).
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let pa: Vec<u64> = a.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let pb: Vec<u64> = b.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let va = pa.get(i).copied().unwrap_or(0);
        let vb = pb.get(i).copied().unwrap_or(0);
        match va.cmp(&vb) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_description() -> ModelDescription {
        ModelDescription {
            version: "1.0".to_string(),
            entities: vec![
                EntityDescription {
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
                },
                EntityDescription {
                    name: "B".to_string(),
                    attributes: vec![],
                    relations: vec![RelationDescription {
                        name: "ref".to_string(),
                        target: "A".to_string(),
                        many: false,
                    }],
                },
            ],
            indices: vec![],
        }
    }

    #[test]
    fn builds_inverse_relation_map() {
        let model = Model::new(sample_description()).unwrap();
        let inv = model.inverse_relation_names("A");
        assert_eq!(inv, &[("B".to_string(), "ref".to_string())]);
        assert!(model.inverse_relation_names("B").is_empty());
    }

    #[test]
    fn rejects_not_null_without_default() {
        let mut desc = sample_description();
        desc.entities[0].attributes.push(AttributeDescription {
            name: "bad".to_string(),
            attr_type: AttributeType::Text,
            default: None,
            not_null: true,
            primary: false,
            unique: false,
        });
        assert!(matches!(
            Model::new(desc),
            Err(ModelError::NotNullWithoutDefault { .. })
        ));
    }

    #[test]
    fn rejects_default_type_mismatch() {
        let mut desc = sample_description();
        desc.entities[0].attributes[1].default = Some(Value::Text("nope".into()));
        assert!(matches!(
            Model::new(desc),
            Err(ModelError::DefaultTypeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_attribute_against_system_names() {
        let mut desc = sample_description();
        desc.entities[0].attributes.push(AttributeDescription {
            name: "obj_id".to_string(),
            attr_type: AttributeType::Integer,
            default: Some(Value::Integer(0)),
            not_null: false,
            primary: false,
            unique: false,
        });
        assert!(matches!(
            Model::new(desc),
            Err(ModelError::DuplicateAttribute { .. })
        ));
    }

    #[test]
    fn attribute_map_includes_system_attributes() {
        let model = Model::new(sample_description()).unwrap();
        let a = model.entity("A").unwrap();
        assert!(a.attribute("name").is_some());
        for system in SYSTEM_ATTRIBUTES {
            let attr = a.attribute(system).unwrap_or_else(|| panic!("{system} must be in attribute_map"));
            assert_eq!(attr.name, system);
        }
        assert_eq!(a.attribute("pk_id").unwrap().attr_type, AttributeType::Integer);
        assert!(a.attribute("pk_id").unwrap().primary);
        assert_eq!(a.attribute("action").unwrap().attr_type, AttributeType::Text);
        // declared-only `attributes` must not gain the system entries.
        assert_eq!(a.attributes.len(), 2);
    }

    #[test]
    fn version_compares_lexicographically() {
        use std::cmp::Ordering;
        assert_eq!(compare_versions("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.2.1", "1.2"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
    }
}
