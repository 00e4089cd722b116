//! Terminal progress display for the long-running entry points.

use indicatif::{ProgressBar, ProgressStyle};

/// A percent-based progress bar for watch/realtime sessions. All methods
/// are safe to call when stderr is not a terminal; indicatif degrades to
/// no-op drawing.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{prefix:.bold} [{bar:30}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(label.to_string());
        Self { bar }
    }

    pub fn update(&self, percent: u8, message: &str) {
        self.bar.set_position(u64::from(percent.min(100)));
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.set_position(100);
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_accepts_out_of_range_percent() {
        let reporter = ProgressReporter::new("watch");
        reporter.update(150, "clamped");
        reporter.finish("done");
    }
}
