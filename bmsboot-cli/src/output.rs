//! Terminal rendering of session notifications.

use std::sync::{Mutex, PoisonError};

use bmsboot::Observer;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Prefix of the line the session logs for a failed workflow. `main`
/// reports the error itself.
const ERROR_PREFIX: &str = "Error: ";

/// Prints console lines to stderr and draws a progress bar for transfers.
pub struct ConsoleObserver {
    quiet: bool,
    fancy: bool,
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleObserver {
    pub fn new(quiet: bool, fancy: bool) -> Self {
        Self {
            quiet,
            fancy,
            bar: Mutex::new(None),
        }
    }

    #[allow(clippy::unwrap_used)]
    fn new_bar() -> ProgressBar {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb
    }
}

impl Observer for ConsoleObserver {
    fn log_line(&self, line: &str) {
        if self.quiet || line.starts_with(ERROR_PREFIX) {
            return;
        }
        let text = if line.starts_with("Success") || line.ends_with("passed!") {
            style(line).green().to_string()
        } else {
            line.to_string()
        };
        let bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        match bar.as_ref() {
            Some(pb) => pb.println(text),
            None => eprintln!("{text}"),
        }
    }

    fn progress_changed(&self, percent: u8) {
        if self.quiet || !self.fancy {
            return;
        }
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        bar.get_or_insert_with(Self::new_bar)
            .set_position(u64::from(percent));
    }

    fn busy_changed(&self, busy: bool) {
        if busy {
            return;
        }
        let bar = self
            .bar
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pb) = bar {
            pb.finish_and_clear();
        }
    }
}
