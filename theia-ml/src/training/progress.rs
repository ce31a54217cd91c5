//! Terminal progress bar for the training loop.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const TEMPLATE: &str = "{prefix:.bold} [{elapsed_precise}] {bar:40.green/white} {pos}/{len} ({eta})\n{wide_msg}";

/// Progress over every train and validation batch of a run, with the
/// current metric line shown beneath the bar.
pub struct TrainingProgress {
    bar: ProgressBar,
}

impl TrainingProgress {
    /// A bar of `total` steps. Nothing is drawn unless `visible`.
    pub fn new(total: u64, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total)
        } else {
            ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden())
        };
        bar.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar }
    }

    /// Set the title, e.g. `Epoch 2/10`.
    pub fn set_title(&self, title: impl Into<String>) {
        self.bar.set_prefix(title.into());
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.bar.set_message(text.into());
    }

    /// Jump to `position`, used when training resumes part-way.
    pub fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    pub fn tick(&self) {
        self.bar.inc(1);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    /// Print a line above the bar without breaking its rendering.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.bar.is_hidden() {
            println!("{}", line.as_ref());
        } else {
            self.bar.println(line);
        }
    }
}
