//! Terminal progress bar for the writing worker.

use calogan_training::{ProgressEvent, ProgressSink, TracingProgressSink};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// One bar per epoch; epoch summaries still go through `tracing`.
pub struct ProgressBarSink {
    bar: Mutex<Option<ProgressBar>>,
    log: TracingProgressSink,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        Self { bar: Mutex::new(None), log: TracingProgressSink }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.cyan} [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }
}

impl ProgressSink for ProgressBarSink {
    fn on_event(&self, event: ProgressEvent) {
        let Ok(mut bar) = self.bar.lock() else {
            return;
        };
        match event {
            ProgressEvent::EpochStarted { epoch, nb_batches, .. } => {
                let next = ProgressBar::new(nb_batches as u64);
                next.set_style(Self::style());
                next.set_prefix(format!("Epoch {epoch}"));
                *bar = Some(next);
            }
            ProgressEvent::Step { step, .. } => {
                if let Some(bar) = bar.as_ref() {
                    bar.set_position(step as u64);
                }
            }
            event @ ProgressEvent::EpochFinished { .. } => {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                self.log.on_event(event);
            }
            other => self.log.on_event(other),
        }
    }
}
