//! Sync command handlers

use anyhow::{bail, Result};

use pantry_core::{Config, SyncError, SyncHandle};

use crate::output::Output;

/// Which phases to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Both,
    Pull,
    Push,
}

/// Run a sync cycle now
pub async fn sync(
    handle: &SyncHandle,
    config: &Config,
    direction: Direction,
    output: &Output,
) -> Result<()> {
    let Some(ref remote_url) = config.remote_url else {
        bail!(
            "Remote not configured. Set it with:\n  \
             pantry config set remote_url https://your-server"
        );
    };

    output.message(&format!("Syncing with {}...", remote_url));

    let result = match direction {
        Direction::Both => handle.force_sync().await,
        Direction::Pull => handle.force_pull().await,
        Direction::Push => handle.force_push().await,
    };

    match result {
        Ok(report) => {
            output.print_report(&report);
            let conflicts = handle.status().conflicts;
            if conflicts > 0 {
                output.message(&format!(
                    "{} conflict(s) need a decision. See `pantry conflicts list`.",
                    conflicts
                ));
            }
            Ok(())
        }
        Err(SyncError::Offline) => {
            output.message("Offline. Changes stay queued until the next sync.");
            Ok(())
        }
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            Err(e.into())
        }
    }
}

/// Sync quietly (for auto-sync) - no output on success
pub async fn sync_quiet(handle: &SyncHandle, config: &Config) -> Result<()> {
    if config.remote_url.is_none() || !config.sync.auto_sync_enabled {
        return Ok(());
    }

    match handle.force_sync().await {
        Ok(_) | Err(SyncError::Offline) | Err(SyncError::NoRemote) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
