//! Unlink command - tear a project down.

use anyhow::{Context, Result};
use cushm_core::{LeafOutcome, Registry};
use owo_colors::OwoColorize;

/// Run the unlink command.
pub fn run(registry: &Registry, project: &str) -> Result<()> {
    tracing::info!(project, "Unlinking project");

    let report = registry
        .teardown(project)
        .with_context(|| format!("Failed to unlink project '{}'", project))?;

    if report.is_noop() {
        println!("{} No project named {}", "!".yellow(), project.bold());
        return Ok(());
    }

    println!(
        "{} Cleaned project {} ({} segments removed)",
        "✓".green(),
        project.bold(),
        report.unlinked().len()
    );
    for (key, outcome) in &report.outcomes {
        match outcome {
            LeafOutcome::Unlinked => {}
            LeafOutcome::Missing => println!("  {} {}: shared memory was already gone", "!".yellow(), key),
            LeafOutcome::Failed(reason) => println!("  {} {}: {}", "✗".red(), key, reason),
        }
    }

    let failed = report.failed();
    if !failed.is_empty() {
        anyhow::bail!("{} segment(s) of '{}' could not be removed", failed.len(), project);
    }
    Ok(())
}
