//! Progress bar drawn on stderr while a project is published

use std::cell::Cell;
use std::io::{IsTerminal, Write};
use std::time::Instant;

use cushm_core::{format_bytes, ProgressObserver};

const WIDTH: usize = 30;

pub struct ProgressBar {
    label: String,
    started: Cell<Option<Instant>>,
    interactive: bool,
}

impl ProgressBar {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            started: Cell::new(None),
            interactive: std::io::stderr().is_terminal(),
        }
    }

    fn draw(&self, transferred: u64, total: u64) {
        if !self.interactive {
            return;
        }
        let fraction = if total == 0 {
            1.0
        } else {
            transferred as f64 / total as f64
        };
        let filled = ((fraction * WIDTH as f64) as usize).min(WIDTH);
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\r{} [{}{}] {:>5.1}% {} / {}",
            self.label,
            "#".repeat(filled),
            " ".repeat(WIDTH - filled),
            fraction * 100.0,
            format_bytes(transferred),
            format_bytes(total)
        );
        let _ = stderr.flush();
    }
}

impl ProgressObserver for ProgressBar {
    fn start(&self, total: u64) {
        self.started.set(Some(Instant::now()));
        self.draw(0, total);
    }

    fn advance(&self, transferred: u64, total: u64) {
        self.draw(transferred, total);
    }

    fn finish(&self) {
        if self.interactive {
            eprintln!();
        }
        if let Some(started) = self.started.get() {
            tracing::info!(elapsed = ?started.elapsed(), "transfer finished");
        }
    }
}
