//! Publish progress reporting

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Observer of a publish, fed with byte counts as leaves are copied.
///
/// Observers cannot change the outcome of a publish: a panicking observer is
/// logged and ignored for the rest of the run.
pub trait ProgressObserver {
    /// Publishing begins; `total` bytes will be copied.
    fn start(&self, total: u64);

    /// `transferred` of `total` bytes are now in shared memory.
    fn advance(&self, transferred: u64, total: u64);

    /// Publishing is over, successfully or not.
    fn finish(&self) {}
}

/// Guards observer calls made by the registry.
pub(crate) struct Progress<'a> {
    observer: Option<&'a dyn ProgressObserver>,
    total: u64,
    transferred: u64,
}

impl<'a> Progress<'a> {
    pub(crate) fn start(observer: Option<&'a dyn ProgressObserver>, total: u64) -> Self {
        let mut progress = Self {
            observer,
            total,
            transferred: 0,
        };
        progress.notify(|o| o.start(total));
        progress
    }

    pub(crate) fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        let (transferred, total) = (self.transferred, self.total);
        self.notify(|o| o.advance(transferred, total));
    }

    fn notify(&mut self, call: impl FnOnce(&dyn ProgressObserver)) {
        let Some(observer) = self.observer else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| call(observer))).is_err() {
            tracing::warn!("progress observer panicked, progress reporting disabled");
            self.observer = None;
        }
    }
}

impl Drop for Progress<'_> {
    fn drop(&mut self) {
        self.notify(|o| o.finish());
    }
}
