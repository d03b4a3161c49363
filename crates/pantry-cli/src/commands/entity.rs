//! Recipe and collection command handlers

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use pantry_core::{EntityKey, EntityType, Operation, SyncHandle};

use crate::output::Output;

/// Field values given on the command line
#[derive(Debug, Default)]
pub struct FieldArgs {
    /// Raw JSON object with any fields
    pub data: Option<String>,
    /// Shortcut for the `name` field
    pub name: Option<String>,
    /// Shortcut for the `description` field
    pub description: Option<String>,
}

impl FieldArgs {
    /// Combine the arguments into one JSON object; flags win over `--data`
    pub fn to_value(&self) -> Result<Option<Value>> {
        let mut fields = match &self.data {
            Some(raw) => match serde_json::from_str::<Value>(raw).context("--data is not valid JSON")? {
                Value::Object(map) => map,
                _ => bail!("--data must be a JSON object"),
            },
            None => Map::new(),
        };

        if let Some(name) = &self.name {
            fields.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(description) = &self.description {
            fields.insert("description".into(), Value::String(description.clone()));
        }

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Object(fields)))
        }
    }
}

/// Create an entity locally and queue it
pub async fn add(
    handle: &SyncHandle,
    entity_type: EntityType,
    id: String,
    fields: FieldArgs,
    output: &Output,
) -> Result<()> {
    let Some(data) = fields.to_value()? else {
        bail!("Nothing to save. Pass --name, --description or --data.");
    };
    let key = EntityKey::new(entity_type, id);

    handle
        .queue_change(key.clone(), Operation::Create, Some(data))
        .await
        .with_context(|| format!("Failed to create {}", key))?;

    output.success(&format!("Created {}", key));
    if let Some(entity) = handle.get(key).await? {
        output.print_entity(&entity);
    }
    Ok(())
}

/// Change some fields of an existing entity
pub async fn update(
    handle: &SyncHandle,
    entity_type: EntityType,
    id: String,
    fields: FieldArgs,
    output: &Output,
) -> Result<()> {
    let Some(data) = fields.to_value()? else {
        bail!("Nothing to change. Pass --name, --description or --data.");
    };
    let key = EntityKey::new(entity_type, id);

    handle
        .queue_change(key.clone(), Operation::Update, Some(data))
        .await
        .with_context(|| format!("Failed to update {}", key))?;

    output.success(&format!("Updated {}", key));
    if let Some(entity) = handle.get(key).await? {
        output.print_entity(&entity);
    }
    Ok(())
}

/// Delete an entity
pub async fn delete(
    handle: &SyncHandle,
    entity_type: EntityType,
    id: String,
    output: &Output,
) -> Result<()> {
    let key = EntityKey::new(entity_type, id);

    handle
        .queue_change(key.clone(), Operation::Delete, None)
        .await
        .with_context(|| format!("Failed to delete {}", key))?;

    output.success(&format!("Deleted {}", key));
    Ok(())
}

/// List all entities of a type
pub async fn list(handle: &SyncHandle, entity_type: EntityType, output: &Output) -> Result<()> {
    let entities = handle.list(entity_type).await?;
    output.print_entities(&entities);
    Ok(())
}

/// Show a single entity
pub async fn show(
    handle: &SyncHandle,
    entity_type: EntityType,
    id: String,
    output: &Output,
) -> Result<()> {
    let key = EntityKey::new(entity_type, id);
    let entity = handle
        .get(key.clone())
        .await?
        .ok_or_else(|| anyhow::anyhow!("Not found: {}", key))?;

    output.print_entity(&entity);
    Ok(())
}
