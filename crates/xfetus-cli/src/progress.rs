//! indicatif progress bars driven by the trainer's callbacks

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use xfetus_convert::CheckpointPaths;
use xfetus_train::{EpochSummary, TrainObserver};

pub struct ProgressObserver {
    style: ProgressStyle,
    bar: Option<ProgressBar>,
    epochs: usize,
}

impl ProgressObserver {
    pub fn new(epochs: usize) -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-");
        Ok(Self {
            style,
            bar: None,
            epochs,
        })
    }

    fn start(&mut self, len: usize, prefix: String) {
        self.finish();
        let bar = ProgressBar::new(len as u64);
        bar.set_style(self.style.clone());
        bar.set_prefix(prefix);
        self.bar = Some(bar);
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn advance(&mut self, msg: String) {
        let done = match &self.bar {
            Some(bar) => {
                bar.inc(1);
                bar.set_message(msg);
                bar.length() == Some(bar.position())
            }
            None => false,
        };
        // Clear before the trainer logs its epoch summary
        if done {
            self.finish();
        }
    }
}

impl TrainObserver for ProgressObserver {
    fn on_train_start(&mut self, epoch: usize, num_batches: usize) {
        self.start(num_batches, format!("epoch {}/{} train", epoch + 1, self.epochs));
    }

    fn on_train_batch(&mut self, _step: usize, loss: f32) {
        self.advance(format!("loss {loss:.4}"));
    }

    fn on_validation_start(&mut self, epoch: usize, num_batches: usize) {
        self.start(num_batches, format!("epoch {}/{} valid", epoch + 1, self.epochs));
    }

    fn on_validation_batch(&mut self, _step: usize, loss: f32) {
        self.advance(format!("loss {loss:.4}"));
    }

    fn on_sampling_step(&mut self, step: usize, total: usize) {
        if step == 1 {
            self.start(total, "sampling".to_string());
        }
        self.advance(format!("step {step}"));
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        self.finish();
        if let Some(preview) = &summary.preview {
            println!("  preview: {}", preview.path.display());
        }
    }

    fn on_checkpoint(&mut self, paths: &CheckpointPaths) {
        self.finish();
        println!("  checkpoint: {}", paths.model.display());
    }
}
