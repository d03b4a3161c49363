//! Data models for Pantry
//!
//! Defines the entities the sync engine moves between the device and the
//! remote service: recipes and collections.
//!
//! Payloads are a tagged union discriminated by entity type. Every field is
//! optional, so the same types carry full versions and partial updates.
//! A payload is validated once, when a change enters the queue; everything
//! downstream works with typed values.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Kind of entity tracked by the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Recipe,
    Collection,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Recipe => "recipe",
            EntityType::Collection => "collection",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recipe" => Ok(EntityType::Recipe),
            "collection" => Ok(EntityType::Collection),
            other => Err(ValidationError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Identifies one entity: `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn recipe(id: impl Into<String>) -> Self {
        Self::new(EntityType::Recipe, id)
    }

    pub fn collection(id: impl Into<String>) -> Self {
        Self::new(EntityType::Collection, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Kind of local edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ValidationError::UnknownOperation(other.to_string())),
        }
    }
}

/// Errors raised while validating a payload at the queue boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unknown entity type '{0}' (expected recipe or collection)")]
    UnknownEntityType(String),

    #[error("Unknown operation '{0}' (expected create, update or delete)")]
    UnknownOperation(String),

    #[error("Entity id must not be empty")]
    EmptyId,

    #[error("{0} payload must be a JSON object")]
    NotAnObject(EntityType),

    #[error("Invalid {entity_type} payload: {details}")]
    InvalidFields {
        entity_type: EntityType,
        details: String,
    },

    #[error("Payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: EntityType,
        found: EntityType,
    },

    #[error("A {0} change requires a payload")]
    MissingPayload(Operation),
}

/// One ingredient line of a recipe
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ingredient {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// Recipe fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecipeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servings: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cook_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients: Option<Vec<Ingredient>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
}

/// Collection fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_ids: Option<Vec<String>>,
}

/// Entity payload, discriminated by entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "fields", rename_all = "snake_case")]
pub enum Payload {
    Recipe(RecipeFields),
    Collection(CollectionFields),
}

impl Payload {
    /// Validate raw JSON into a typed payload
    ///
    /// Unknown fields and wrong value types are rejected.
    pub fn from_json(entity_type: EntityType, value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::NotAnObject(entity_type));
        }

        let invalid = |e: serde_json::Error| ValidationError::InvalidFields {
            entity_type,
            details: e.to_string(),
        };

        match entity_type {
            EntityType::Recipe => serde_json::from_value(value)
                .map(Payload::Recipe)
                .map_err(invalid),
            EntityType::Collection => serde_json::from_value(value)
                .map(Payload::Collection)
                .map_err(invalid),
        }
    }

    /// Rebuild a payload from its field map
    pub fn from_fields(
        entity_type: EntityType,
        fields: Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        Self::from_json(entity_type, Value::Object(fields))
    }

    /// Payload with no fields set
    pub fn empty(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Recipe => Payload::Recipe(RecipeFields::default()),
            EntityType::Collection => Payload::Collection(CollectionFields::default()),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Payload::Recipe(_) => EntityType::Recipe,
            Payload::Collection(_) => EntityType::Collection,
        }
    }

    /// Field map view of the payload (only fields that are set)
    pub fn fields(&self) -> Map<String, Value> {
        let value = match self {
            Payload::Recipe(fields) => serde_json::to_value(fields),
            Payload::Collection(fields) => serde_json::to_value(fields),
        };

        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Apply `newer` on top of this payload, field by field
    ///
    /// Fields set in `newer` replace ours; fields it leaves unset are kept.
    pub fn overlay(&self, newer: &Payload) -> Result<Payload, ValidationError> {
        self.check_type(newer.entity_type())?;
        let mut fields = self.fields();
        fields.extend(newer.fields());
        Self::from_fields(self.entity_type(), fields)
    }

    /// Names of the fields whose value differs from `base`
    ///
    /// Without a base every set field counts as changed.
    pub fn changed_fields(&self, base: Option<&Payload>) -> BTreeSet<String> {
        let ours = self.fields();
        let Some(base) = base else {
            return ours.keys().cloned().collect();
        };
        let theirs = base.fields();

        ours.keys()
            .chain(theirs.keys())
            .filter(|k| ours.get(*k) != theirs.get(*k))
            .cloned()
            .collect()
    }

    /// Display name, when set
    pub fn name(&self) -> Option<&str> {
        match self {
            Payload::Recipe(fields) => fields.name.as_deref(),
            Payload::Collection(fields) => fields.name.as_deref(),
        }
    }

    pub(crate) fn check_type(&self, found: EntityType) -> Result<(), ValidationError> {
        if self.entity_type() == found {
            Ok(())
        } else {
            Err(ValidationError::TypeMismatch {
                expected: self.entity_type(),
                found,
            })
        }
    }
}

/// A versioned entity, as held locally or returned by the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub payload: Payload,
    pub modified_at: DateTime<Utc>,
    /// Tombstone marker for deletions
    #[serde(default)]
    pub deleted: bool,
}

impl Entity {
    pub fn new(id: impl Into<String>, payload: Payload, modified_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            modified_at,
            deleted: false,
        }
    }

    /// A deletion marker for `key`
    pub fn tombstone(key: &EntityKey, modified_at: DateTime<Utc>) -> Self {
        Self {
            id: key.id.clone(),
            payload: Payload::empty(key.entity_type),
            modified_at,
            deleted: true,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id.clone())
    }
}
