use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Controls how update progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Progress bars, cleared of log output.
    Normal,
    /// Progress bars plus debug logging on stderr.
    Verbose,
    /// Final summary lines only.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
}

const BAR_LENGTH: u64 = 1000;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{prefix}] {bar:30.cyan/blue} {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// One progress bar per update, keyed by product id.
///
/// Methods take `&self` because updates are reported from engine delegate
/// callbacks.
pub struct UpdateProgress {
    multi: MultiProgress,
    mode: OutputMode,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl UpdateProgress {
    pub fn new(mode: OutputMode) -> Self {
        let multi = match mode {
            OutputMode::Normal | OutputMode::Verbose => MultiProgress::new(),
            OutputMode::Quiet | OutputMode::Plain => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
        };
        Self {
            multi,
            mode,
            bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    fn bar(&self, product_id: &str) -> Option<ProgressBar> {
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(product_id)
            .cloned()
    }

    pub fn start(&self, product_id: &str, label: &str) {
        if self.mode == OutputMode::Plain {
            println!("[{product_id}] {label}");
        }
        let bar = self.multi.add(ProgressBar::new(BAR_LENGTH));
        bar.set_style(bar_style());
        bar.set_prefix(product_id.to_string());
        bar.set_message(label.to_string());
        self.bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(product_id.to_string(), bar);
    }

    /// `fraction` is clamped to `0.0..=1.0`.
    pub fn set_progress(&self, product_id: &str, fraction: f32) {
        if let Some(bar) = self.bar(product_id) {
            let fraction = fraction.clamp(0.0, 1.0);
            bar.set_position((fraction * BAR_LENGTH as f32) as u64);
        }
    }

    pub fn position(&self, product_id: &str) -> Option<u64> {
        self.bar(product_id).map(|bar| bar.position())
    }

    pub fn finish(&self, product_id: &str, successful: bool, message: &str) {
        let bar = self
            .bars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(product_id);

        match self.mode {
            OutputMode::Plain | OutputMode::Quiet => {
                let mark = if successful { "\u{2713}" } else { "\u{2717}" };
                println!("[{product_id}] {mark} {message}");
            }
            OutputMode::Normal | OutputMode::Verbose => {}
        }

        if let Some(bar) = bar {
            bar.set_style(if successful { done_style() } else { failed_style() });
            bar.finish_with_message(message.to_string());
        }
    }

    /// Print an info line. Suppressed in quiet mode.
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => println!("      \u{2192} {text}"),
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }

    /// Print a plain line via multi.println (final messages).
    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Plain | OutputMode::Quiet => println!("{text}"),
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(text).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_track_progress_until_finished() {
        let progress = UpdateProgress::new(OutputMode::Quiet);
        progress.start("app", "updating");
        progress.set_progress("app", 0.5);
        assert_eq!(progress.position("app"), Some(BAR_LENGTH / 2));

        progress.set_progress("app", 3.0);
        assert_eq!(progress.position("app"), Some(BAR_LENGTH));

        progress.finish("app", true, "updated");
        assert_eq!(progress.position("app"), None);
    }

    #[test]
    fn unknown_products_are_ignored() {
        let progress = UpdateProgress::new(OutputMode::Quiet);
        progress.set_progress("ghost", 0.3);
        assert_eq!(progress.position("ghost"), None);
    }
}
