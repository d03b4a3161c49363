//! Status command handler

use anyhow::Result;

use pantry_core::{Config, SyncHandle};

use crate::output::Output;

/// Show sync status
pub fn show(handle: &SyncHandle, config: &Config, output: &Output) -> Result<()> {
    let status = handle.status();
    output.print_status(&status, config.remote_url.as_deref());
    Ok(())
}
