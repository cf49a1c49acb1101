//! List command - show published projects and check their segments.

use anyhow::Result;
use cushm_core::{format_bytes, ProjectInfo, Registry};
use owo_colors::OwoColorize;

/// Run the list command.
pub fn run(registry: &Registry, short: bool) -> Result<()> {
    tracing::info!(root = %registry.store().root().display(), short, "Listing projects");

    let listing = registry.list()?;
    if listing.is_empty() {
        println!("No projects in {}", registry.store().root().display());
        return Ok(());
    }

    if short {
        let mut table = Table::new(&["PROJECT", "RECORD", "ARRAYS", "SIZE", "OK"]);
        for entry in &listing {
            match &entry.info {
                Ok(info) => table.row(vec![
                    Cell::plain(&entry.project),
                    Cell::plain(entry.path.display()),
                    Cell::plain(info.array_count()),
                    Cell::plain(format_bytes(info.total_bytes())),
                    Cell::check(info.is_intact()),
                ]),
                Err(e) => table.row(vec![
                    Cell::plain(&entry.project),
                    Cell::plain(entry.path.display()),
                    Cell::bad(format!("error: {}", e)),
                    Cell::plain("-"),
                    Cell::check(false),
                ]),
            }
        }
        table.print();
        return Ok(());
    }

    let mut broken = Vec::new();
    for entry in &listing {
        println!("{} {}", "Project".bold(), entry.project.bold().cyan());
        println!("  Record: {}", entry.path.display());
        match &entry.info {
            Ok(info) => {
                print_project(info);
                if !info.is_intact() {
                    broken.push(entry.project.as_str());
                }
            }
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
                broken.push(entry.project.as_str());
            }
        }
        println!();
    }

    if !broken.is_empty() {
        println!(
            "{} Projects with missing shared memory or unreadable records: {}",
            "warning:".yellow().bold(),
            broken.join(", ")
        );
        println!("  Run `cushm unlink <project>` to clean them up.");
    }
    Ok(())
}

fn print_project(info: &ProjectInfo) {
    println!(
        "  Arrays: {}  Size: {}",
        info.array_count(),
        format_bytes(info.total_bytes())
    );
    let mut table = Table::new(&["KEY", "SHAPE", "DTYPE", "SIZE", "ATTRS", "SEGMENT", "OK"]);
    for entry in &info.entries {
        let shape = entry
            .shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x");
        table.row(vec![
            Cell::plain(&entry.key),
            Cell::plain(if shape.is_empty() { "scalar".to_string() } else { shape }),
            Cell::plain(&entry.dtype),
            Cell::plain(format_bytes(entry.nbytes)),
            Cell::plain(entry.attrs.join(",")),
            Cell::plain(&entry.public_name),
            Cell::check(entry.present),
        ]);
    }
    table.indent = 2;
    table.print();
}

#[derive(Clone, Copy, PartialEq)]
enum Tone {
    Plain,
    Good,
    Bad,
}

struct Cell {
    text: String,
    tone: Tone,
}

impl Cell {
    fn plain(text: impl ToString) -> Self {
        Self {
            text: text.to_string(),
            tone: Tone::Plain,
        }
    }

    fn bad(text: impl ToString) -> Self {
        Self {
            text: text.to_string(),
            tone: Tone::Bad,
        }
    }

    fn check(ok: bool) -> Self {
        if ok {
            Self {
                text: "✓".to_string(),
                tone: Tone::Good,
            }
        } else {
            Self::bad("✗")
        }
    }
}

/// Left-aligned text table; colors are applied after padding.
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
    indent: usize,
}

impl Table {
    fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
            indent: 0,
        }
    }

    fn row(&mut self, cells: Vec<Cell>) {
        self.rows.push(cells);
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.text.chars().count());
            }
        }
        widths
    }

    fn print(&self) {
        let widths = self.widths();
        let pad = " ".repeat(self.indent);

        let header: Vec<String> = self
            .headers
            .iter()
            .zip(&widths)
            .map(|(h, w)| format!("{:<w$}", h, w = w))
            .collect();
        println!("{}{}", pad, header.join("  ").trim_end().bold());

        for row in &self.rows {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(cell, w)| {
                    let padded = format!("{:<w$}", cell.text, w = w);
                    match cell.tone {
                        Tone::Plain => padded,
                        Tone::Good => padded.green().to_string(),
                        Tone::Bad => padded.red().to_string(),
                    }
                })
                .collect();
            println!("{}{}", pad, line.join("  ").trim_end());
        }
    }
}
