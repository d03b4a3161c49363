//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use pantry_core::{ConflictItem, CycleReport, Entity, SyncStatus};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode output: {}", e),
        }
    }

    /// Print a single entity with all its fields
    pub fn print_entity(&self, entity: &Entity) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", entity.id);
                println!("Type:     {}", entity.entity_type());
                println!(
                    "Modified: {}",
                    entity.modified_at.format("%Y-%m-%d %H:%M:%S")
                );
                for (field, value) in entity.payload.fields() {
                    println!("{:<9} {}", format!("{}:", field), display_value(&value));
                }
            }
            OutputFormat::Json => self.json(entity),
            OutputFormat::Quiet => println!("{}", entity.id),
        }
    }

    /// Print a list of entities
    pub fn print_entities(&self, entities: &[Entity]) {
        match self.format {
            OutputFormat::Human => {
                if entities.is_empty() {
                    println!("Nothing found.");
                    return;
                }
                for entity in entities {
                    println!(
                        "{} | {} | {}",
                        truncate(&entity.id, 20),
                        truncate(entity.payload.name().unwrap_or("(unnamed)"), 40),
                        entity.modified_at.format("%Y-%m-%d %H:%M")
                    );
                }
                println!("\n{} item(s)", entities.len());
            }
            OutputFormat::Json => self.json(entities),
            OutputFormat::Quiet => {
                for entity in entities {
                    println!("{}", entity.id);
                }
            }
        }
    }

    /// Print a sync status snapshot
    pub fn print_status(&self, status: &SyncStatus, remote_url: Option<&str>) {
        match self.format {
            OutputFormat::Human => {
                println!("Pantry Sync Status");
                println!("==================");
                println!();
                println!("  {}", status.summary());
                println!();
                println!("  Remote:    {}", remote_url.unwrap_or("(not set)"));
                println!(
                    "  Network:   {}",
                    if status.is_online { "online" } else { "offline" }
                );
                println!("  State:     {}", status.state);
                println!("  Pending:   {}", status.pending_changes);
                println!("  Conflicts: {}", status.conflicts);
                println!(
                    "  Last sync: {}",
                    status
                        .last_sync_time
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string())
                );

                if !status.errors.is_empty() {
                    println!();
                    println!("── Errors ({}) ──", status.errors.len());
                    for error in &status.errors {
                        match &error.entity {
                            Some(entity) => println!("  {}: {}", entity, error.message),
                            None => println!("  {}", error.message),
                        }
                    }
                }
            }
            OutputFormat::Json => self.json(status),
            OutputFormat::Quiet => println!("{}", status.summary()),
        }
    }

    /// Print the outcome of a sync cycle
    pub fn print_report(&self, report: &CycleReport) {
        match self.format {
            OutputFormat::Human => {
                if report.is_clean() {
                    println!("✓ Sync complete");
                } else {
                    println!("! Sync finished with problems");
                }
                println!(
                    "  Pulled: {}, Pushed: {}, Conflicts: {} ({} parked)",
                    report.pulled, report.pushed, report.conflicts, report.parked
                );
                if report.failed > 0 || report.retried > 0 {
                    println!(
                        "  Failed: {}, Retrying: {}",
                        report.failed, report.retried
                    );
                }
            }
            OutputFormat::Json => self.json(report),
            OutputFormat::Quiet => {}
        }
    }

    /// Print parked conflicts
    pub fn print_conflicts(&self, conflicts: &[ConflictItem]) {
        match self.format {
            OutputFormat::Human => {
                if conflicts.is_empty() {
                    println!("No conflicts.");
                    return;
                }
                for conflict in conflicts {
                    println!("────────────────────────────────────────");
                    println!("ID:     {}", conflict.id);
                    println!("Entity: {}", conflict.key());
                    println!(
                        "Local:  {} ({})",
                        describe(&conflict.local_version),
                        conflict.local_modified_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    println!(
                        "Remote: {} ({})",
                        describe(&conflict.remote_version),
                        conflict.remote_modified_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                println!("\n{} conflict(s)", conflicts.len());
            }
            OutputFormat::Json => self.json(conflicts),
            OutputFormat::Quiet => {
                for conflict in conflicts {
                    println!("{}", conflict.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, msg: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", msg);
        }
    }
}

/// One-line description of an entity version
fn describe(entity: &Entity) -> String {
    if entity.deleted {
        "(deleted)".to_string()
    } else {
        let fields = serde_json::Value::Object(entity.payload.fields());
        truncate(&fields.to_string(), 60)
    }
}

/// Render a field value without JSON quoting for plain strings
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate a string to max chars, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
