/*!
 * CLI progress renderer
 *
 * Subscribes to the engine's progress events and drives a single
 * `indicatif` bar for the whole run. Per-file byte counts are absolute, so
 * the bar stays correct when events are dropped or a file restarts after a
 * failed attempt.
 */

use std::collections::HashMap;
use std::thread;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cli_style::{format_bytes, Icons, Theme};
use crate::core::progress::{FileId, ProgressEvent, ProgressSubscriber};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}";

pub struct CliProgressRenderer {
    subscriber: ProgressSubscriber,
    bar: ProgressBar,
    per_file: HashMap<FileId, u64>,
    position: u64,
    verbose: bool,
}

impl CliProgressRenderer {
    pub fn new(subscriber: ProgressSubscriber, verbose: bool) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self::with_bar(subscriber, bar, verbose)
    }

    fn with_bar(subscriber: ProgressSubscriber, bar: ProgressBar, verbose: bool) -> Self {
        Self {
            subscriber,
            bar,
            per_file: HashMap::new(),
            position: 0,
            verbose,
        }
    }

    /// Render until the run completes or every publisher is dropped
    pub fn run(mut self) {
        while let Some(event) = self.subscriber.recv() {
            if !self.handle_event(event) {
                break;
            }
        }
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Returns false once the run is over
    fn handle_event(&mut self, event: ProgressEvent) -> bool {
        match event {
            ProgressEvent::RunStart {
                files_total,
                bytes_total,
                chunk_size,
                ..
            } => {
                self.bar.set_length(bytes_total);
                self.bar.set_message(format!(
                    "{} files, chunk {}",
                    files_total,
                    format_bytes(chunk_size)
                ));
            }

            ProgressEvent::TransferStart {
                file_id,
                size_class,
                total_bytes,
                ..
            } => {
                if self.verbose {
                    self.bar.println(format!(
                        "  {} {} ({}, {})",
                        Icons::ARROW_RIGHT,
                        file_id,
                        size_class,
                        format_bytes(total_bytes)
                    ));
                }
                self.set_file_bytes(file_id, 0);
            }

            ProgressEvent::TransferProgress {
                file_id,
                bytes_done,
                ..
            } => self.set_file_bytes(file_id, bytes_done),

            ProgressEvent::Attempt {
                file_id,
                attempt,
                succeeded: false,
                error,
                next_delay_ms,
                ..
            } => {
                self.set_file_bytes(file_id.clone(), 0);
                if let Some(delay) = next_delay_ms {
                    self.bar.println(format!(
                        "  {} {} attempt {} failed, retrying in {}ms: {}",
                        Theme::warning(Icons::WARNING),
                        file_id,
                        attempt,
                        delay,
                        error.unwrap_or_default()
                    ));
                }
            }

            ProgressEvent::Attempt { .. } => {}

            ProgressEvent::TransferComplete {
                file_id,
                total_bytes,
                checksum,
                ..
            } => {
                self.set_file_bytes(file_id.clone(), total_bytes);
                if self.verbose {
                    let digest = checksum.map(|c| format!(" {}", c)).unwrap_or_default();
                    self.bar.println(format!(
                        "  {} {}{}",
                        Theme::success(Icons::SUCCESS),
                        file_id,
                        Theme::muted(digest)
                    ));
                }
            }

            ProgressEvent::TransferFailed { file_id, error, .. } => {
                self.set_file_bytes(file_id.clone(), 0);
                self.bar.println(format!(
                    "  {} {}: {}",
                    Theme::error(Icons::ERROR),
                    file_id,
                    error
                ));
            }

            ProgressEvent::TransferCancelled { file_id, .. } => {
                self.set_file_bytes(file_id, 0);
            }

            ProgressEvent::RunComplete { cancelled, .. } => {
                if cancelled {
                    self.bar.abandon_with_message("cancelled");
                } else {
                    self.bar.finish_with_message("done");
                }
                return false;
            }
        }
        true
    }

    fn set_file_bytes(&mut self, file_id: FileId, bytes: u64) {
        let previous = self.per_file.insert(file_id, bytes).unwrap_or(0);
        self.position = self.position.saturating_sub(previous).saturating_add(bytes);
        self.bar.set_position(self.position);
    }
}
