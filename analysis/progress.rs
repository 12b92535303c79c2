use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for reporting incremental progress while decoding a Jacobian.
///
/// Decoding only reports progress for files large enough to need it; see
/// [`crate::jco::PROGRESS_RECORD_INTERVAL`]. Nothing an observer does can change
/// the decoded matrix.
pub trait DecodeProgressObserver {
    fn on_start(&mut self, total_records: u64) {
        let _ = total_records;
    }
    fn on_advance(&mut self, processed_records: u64) {
        let _ = processed_records;
    }
    fn on_finish(&mut self, total_records: u64) {
        let _ = total_records;
    }
}

#[derive(Default)]
pub struct NoopDecodeProgress;

impl DecodeProgressObserver for NoopDecodeProgress {}

/// Adapts a `(processed, total)` closure into an observer.
pub struct CallbackProgress<F> {
    callback: F,
    total: u64,
}

impl<F: FnMut(u64, u64)> CallbackProgress<F> {
    pub fn new(callback: F) -> Self {
        Self { callback, total: 0 }
    }
}

impl<F: FnMut(u64, u64)> DecodeProgressObserver for CallbackProgress<F> {
    fn on_start(&mut self, total_records: u64) {
        self.total = total_records;
        (self.callback)(0, total_records);
    }
    fn on_advance(&mut self, processed_records: u64) {
        (self.callback)(processed_records, self.total);
    }
    fn on_finish(&mut self, total_records: u64) {
        (self.callback)(total_records, total_records);
    }
}

/// Draws a progress bar on stderr, or nothing when stderr is not a terminal.
pub struct ConsoleDecodeProgress {
    message: String,
    bar: Option<ProgressBar>,
}

impl ConsoleDecodeProgress {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            bar: None,
        }
    }
}

impl DecodeProgressObserver for ConsoleDecodeProgress {
    fn on_start(&mut self, total_records: u64) {
        self.bar = Some(create_progress_bar(total_records, &self.message));
    }
    fn on_advance(&mut self, processed_records: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_records);
        }
    }
    fn on_finish(&mut self, total_records: u64) {
        if let Some(bar) = self.bar.take() {
            bar.set_position(total_records);
            bar.finish_and_clear();
        }
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} records ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}
