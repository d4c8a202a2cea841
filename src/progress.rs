// src/progress.rs

//! Progress mirrors for the status directory
//!
//! The status directory is the durable progress record. A
//! `ProgressTracker` is an optional second view of the same counters:
//!
//! - `BarProgress`: terminal progress bar using indicatif (verbose runs)
//! - `LogProgress`: periodic tracing lines
//! - `SilentProgress`: no-op
//!
//! Units are whatever the status record currently counts (bytes while
//! writing images, synthetic operations while applying a delta).

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Core trait for progress tracking
pub trait ProgressTracker: Send + Sync {
    /// Set the current phase label
    fn set_message(&self, message: &str);

    /// Set progress to a specific position
    fn set_position(&self, position: u64);

    /// Set the total (length) of the progress
    fn set_length(&self, length: u64);

    fn position(&self) -> u64;

    fn length(&self) -> u64;

    /// Finish progress successfully with a message
    fn finish_with_message(&self, message: &str);

    /// Finish progress with an error message
    fn finish_with_error(&self, message: &str);

    fn is_finished(&self) -> bool;
}

/// Silent progress tracker (no-op)
#[derive(Debug, Default)]
pub struct SilentProgress {
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}

    fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Logging progress tracker
///
/// Logs at info level roughly every tenth of the total.
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl LogProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn set_position(&self, position: u64) {
        let old_pos = self.position.swap(position, Ordering::Relaxed);
        let length = self.length.load(Ordering::Relaxed);
        if length == 0 {
            return;
        }
        let interval = std::cmp::max(1, length / 10);
        if position / interval > old_pos / interval {
            let percent = position.saturating_mul(100) / length;
            info!("{}: {}% ({}/{})", self.name, percent, position, length);
        }
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: {}", self.name, message);
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: ERROR - {}", self.name, message);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker for BarProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn set_length(&self, length: u64) {
        self.bar.set_length(length);
    }

    fn position(&self) -> u64 {
        self.bar.position()
    }

    fn length(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    fn finish_with_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("ERROR: {}", message));
    }

    fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_progress() {
        let progress = SilentProgress::new();
        progress.set_length(100);
        progress.set_message("test");
        progress.set_position(50);
        assert_eq!(progress.position(), 50);
        assert_eq!(progress.length(), 100);

        assert!(!progress.is_finished());
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_log_progress() {
        let progress = LogProgress::new("test");
        progress.set_length(100);

        progress.set_position(25);
        assert_eq!(progress.position(), 25);

        progress.set_position(50);
        assert_eq!(progress.position(), 50);

        progress.finish_with_error("failed");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_log_progress_without_length() {
        let progress = LogProgress::new("test");
        progress.set_position(10);
        assert_eq!(progress.position(), 10);
        assert_eq!(progress.length(), 0);
    }

    #[test]
    fn test_bar_progress_hidden_terminal() {
        let progress = BarProgress::new();
        progress.set_length(4800);
        progress.set_position(800);
        assert_eq!(progress.position(), 800);
        assert_eq!(progress.length(), 4800);
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }
}
