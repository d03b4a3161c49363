//! Conflict command handlers

use anyhow::{Context, Result};

use pantry_core::{Resolution, SyncHandle};

use crate::commands::entity::FieldArgs;
use crate::output::Output;

/// List conflicts waiting for a decision
pub async fn list(handle: &SyncHandle, output: &Output) -> Result<()> {
    let conflicts = handle.get_conflicts().await?;
    output.print_conflicts(&conflicts);
    Ok(())
}

/// Settle one conflict
///
/// Any field arguments are taken as the merged outcome.
pub async fn resolve(
    handle: &SyncHandle,
    id: String,
    resolution: Resolution,
    fields: FieldArgs,
    output: &Output,
) -> Result<()> {
    let merged = fields.to_value()?;
    handle
        .resolve_conflict(&id, resolution, merged)
        .await
        .with_context(|| format!("Failed to resolve conflict {}", id))?;

    output.success(&format!("Resolved conflict {} ({})", id, resolution));
    Ok(())
}

/// Settle every conflict the same way
pub async fn resolve_all(
    handle: &SyncHandle,
    resolution: Resolution,
    output: &Output,
) -> Result<()> {
    let count = handle.resolve_all_conflicts(resolution).await?;
    output.success(&format!("Resolved {} conflict(s) ({})", count, resolution));
    Ok(())
}
