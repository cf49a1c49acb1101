//! Transfer command - publish a directory of `.npy` files.

use std::path::Path;

use anyhow::{Context, Result};
use cushm_core::{format_bytes, ProgressObserver, Registry};
use owo_colors::OwoColorize;

use crate::npy;
use crate::progress::ProgressBar;

/// Run the transfer command.
pub fn run(registry: &Registry, project: &str, dir: &Path, overwrite: bool, show_progress: bool) -> Result<()> {
    tracing::info!(project, dir = %dir.display(), overwrite, "Transferring arrays");

    let arrays = npy::load_dir(dir)?;
    let count = arrays.leaf_count();
    if count == 0 {
        tracing::warn!(dir = %dir.display(), "no .npy files found");
    }
    let total = Registry::size_of(&arrays);

    let bar = show_progress.then(|| ProgressBar::new(format!("Transferring {}", project)));
    let path = registry
        .publish_with_progress(project, &arrays, overwrite, bar.as_ref().map(|b| b as &dyn ProgressObserver))
        .with_context(|| format!("Failed to publish project '{}'", project))?;

    println!("{} Published project {}", "✓".green(), project.bold());
    println!("  Record: {}", path.display());
    println!("  Arrays: {}", count);
    println!("  Size:   {}", format_bytes(total));
    Ok(())
}
