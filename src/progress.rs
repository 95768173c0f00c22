use indicatif::{ProgressBar, ProgressStyle};
use std::borrow::Cow;
use std::sync::Mutex;

/// Progress of a pass, reported from worker threads.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any work starts.
    fn initialize(&self, total_items: u64);

    /// One item (chunk) completed.
    fn progress(&self);

    fn finish(&self) {}
}

/// Reporter that ignores everything (default)
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn initialize(&self, _total_items: u64) {}
    fn progress(&self) {}
}

/// Terminal progress bar, created lazily on `initialize`.
pub struct IndicatifProgressBar {
    name: Cow<'static, str>,
    progress_bar: Mutex<Option<ProgressBar>>,
}

impl IndicatifProgressBar {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            progress_bar: Mutex::new(None),
        }
    }
}

impl ProgressReporter for IndicatifProgressBar {
    fn initialize(&self, total_items: u64) {
        let Ok(mut guard) = self.progress_bar.lock() else {
            return;
        };
        if guard.is_none() {
            *guard = Some(
                ProgressBar::new(total_items)
                    .with_style(default_progress_style())
                    .with_message(self.name.clone()),
            );
        }
    }

    fn progress(&self) {
        if let Ok(guard) = self.progress_bar.lock()
            && let Some(pb) = guard.as_ref()
        {
            pb.inc(1);
        }
    }

    fn finish(&self) {
        if let Ok(mut guard) = self.progress_bar.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
    }
}

pub fn default_progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}
