//! User-visible progress reporting.
//!
//! The pipeline never prints. Every step that a user should see is reported
//! through a [`Progress`] implementation: [`ConsoleProgress`] renders spinners
//! and status lines in the terminal, [`NullProgress`] discards everything.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Receives pipeline events. All methods default to doing nothing.
pub trait Progress: Send + Sync {
    /// A named phase (e.g. "Uploading files") started.
    fn phase_started(&self, _phase: &str) {}

    /// The most recently started phase completed successfully.
    fn phase_finished(&self, _phase: &str) {}

    /// A file reached the service, either linked by hash or sent as bytes.
    fn file_uploaded(&self, _relative_path: &str, _linked_by_hash: bool) {}

    /// The service reported new status lines for a run.
    fn status(&self, _lines: &[String]) {}

    /// The state checker is about to sleep before the next poll.
    fn waiting(&self, _seconds: u64) {}

    /// Polling stopped because the timeout budget would be exceeded.
    fn timed_out(&self, _timeout_secs: u64) {}
}

/// A progress sink that does nothing (for tests or `--quiet` style output).
pub struct NullProgress;

impl Progress for NullProgress {}

/// Terminal progress with a spinner per phase.
pub struct ConsoleProgress {
    spinner: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            spinner: Mutex::new(None),
            verbose,
        }
    }

    fn start_spinner(&self, message: String) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(120));

        if let Ok(mut guard) = self.spinner.lock()
            && let Some(previous) = guard.replace(pb)
        {
            previous.finish_and_clear();
        }
    }

    fn clear_spinner(&self) {
        if let Ok(mut guard) = self.spinner.lock()
            && let Some(pb) = guard.take()
        {
            pb.finish_and_clear();
        }
    }

    /// Prints above the spinner when one is active.
    fn println(&self, line: String) {
        match self.spinner.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(pb) => pb.println(line),
                None => println!("{line}"),
            },
            Err(_) => println!("{line}"),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Progress for ConsoleProgress {
    fn phase_started(&self, phase: &str) {
        self.start_spinner(format!("{phase}..."));
    }

    fn phase_finished(&self, phase: &str) {
        self.clear_spinner();
        println!("{} {}", console::style("✓").green(), phase);
    }

    fn file_uploaded(&self, relative_path: &str, linked_by_hash: bool) {
        if self.verbose {
            let how = if linked_by_hash {
                console::style("linked").dim()
            } else {
                console::style("uploaded").cyan()
            };
            self.println(format!("  {how} {relative_path}"));
        }
    }

    fn status(&self, lines: &[String]) {
        self.clear_spinner();
        println!("Current test status: {}", lines.join("\n"));
    }

    fn waiting(&self, seconds: u64) {
        self.start_spinner(format!("Waiting {seconds} seconds..."));
    }

    fn timed_out(&self, timeout_secs: u64) {
        self.clear_spinner();
        println!(
            "{}",
            console::style(format!(
                "After {timeout_secs} seconds, command timed out waiting for tests to finish."
            ))
            .yellow()
            .bold()
        );
    }
}
