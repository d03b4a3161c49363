//! Queue and error list maintenance

use anyhow::Result;

use pantry_core::SyncHandle;

use crate::output::Output;

/// Drop every pending change; local data is kept
pub async fn clear(handle: &SyncHandle, output: &Output) -> Result<()> {
    let dropped = handle.clear_queue().await?;
    output.success(&format!("Dropped {} pending change(s)", dropped));
    Ok(())
}

/// Forget failed changes and the last sync error
pub async fn clear_errors(handle: &SyncHandle, output: &Output) -> Result<()> {
    let dropped = handle.clear_errors().await?;
    output.success(&format!("Cleared {} failed change(s)", dropped));
    Ok(())
}
