use std::path::{Path, PathBuf};

use candle_core::Device;
use line_data::LineDataset;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    checkpoint::{self, CheckpointDescriptor, ProgressSnapshot, SaveRequest},
    data::{BatchLoader, TensorBatch},
    history::TrainingHistory,
    loss::SpacedCrossEntropy,
    metrics::TrainingMetrics,
    model::Recognizer,
    optimizer::AdamW,
    registry, TrainingConfig, TrainingError,
};

/// Owns the full training loop: dataset, loader, model, loss, optimizer,
/// metrics, history, and checkpoint cadence.
pub struct Trainer {
    config: TrainingConfig,
    loader: BatchLoader,
    model: Box<dyn Recognizer>,
    loss: SpacedCrossEntropy,
    optimizer: AdamW,
    metrics: TrainingMetrics,
    history: TrainingHistory,
    global_step: usize,
    run_dir: PathBuf,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = Device::Cpu;

        let dataset = LineDataset::new(
            &config.dataset.root,
            config.dataset.split,
            &config.dataset.options,
        )
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let classes = dataset.codec().class_count();
        info!(samples = dataset.len(), classes, "dataset ready");

        let loader = BatchLoader::new(
            dataset,
            config.trainer.batch_size,
            config.trainer.seed,
            device.clone(),
        )?;
        let model = registry::build_model(&config.model, classes, &device)?;
        let loss = registry::build_loss(&config.loss)?;
        let optimizer = AdamW::new(model.named_parameters()?, &config.optimizer)?;
        let run_dir = config.run_dir();

        Ok(Self {
            config,
            loader,
            model,
            loss,
            optimizer,
            metrics: TrainingMetrics::new(),
            history: TrainingHistory::new(),
            global_step: 0,
            run_dir,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// A fresh run must not reuse a run directory that already holds
    /// checkpoints; that almost always means a name collision.
    pub fn ensure_fresh_run(&self) -> Result<(), TrainingError> {
        if checkpoint::latest_checkpoint(&self.run_dir)?.is_some() {
            return Err(TrainingError::initialization(format!(
                "path already used: {} (resume it or pick a new run name)",
                self.run_dir.display()
            )));
        }
        Ok(())
    }

    /// Resumes from the newest checkpoint in the run directory; no
    /// checkpoint is a hard error.
    pub fn resume_from_latest(&mut self) -> Result<CheckpointDescriptor, TrainingError> {
        match checkpoint::latest_checkpoint(&self.run_dir)? {
            Some(descriptor) => {
                self.restore(&descriptor.directory)?;
                Ok(descriptor)
            }
            None => Err(TrainingError::initialization(format!(
                "no checkpoint to resume under {}",
                self.run_dir.display()
            ))),
        }
    }

    /// Resumes from an explicit checkpoint directory; a missing directory is
    /// a hard error.
    pub fn resume_from_path(
        &mut self,
        directory: &Path,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        if !directory.is_dir() {
            return Err(TrainingError::initialization(format!(
                "checkpoint directory {} does not exist",
                directory.display()
            )));
        }
        let manifest = self.restore(directory)?;
        Ok(CheckpointDescriptor {
            directory: directory.to_path_buf(),
            manifest,
        })
    }

    /// Like `resume_from_latest`, but a missing checkpoint only warns and
    /// the run starts fresh.
    pub fn soft_resume(&mut self) -> Result<Option<CheckpointDescriptor>, TrainingError> {
        match checkpoint::latest_checkpoint(&self.run_dir)? {
            Some(descriptor) => {
                self.restore(&descriptor.directory)?;
                Ok(Some(descriptor))
            }
            None => {
                warn!(
                    "no checkpoint under {}; starting from scratch",
                    self.run_dir.display()
                );
                Ok(None)
            }
        }
    }

    fn restore(
        &mut self,
        directory: &Path,
    ) -> Result<checkpoint::CheckpointManifest, TrainingError> {
        let outcome = checkpoint::load_checkpoint(directory)?;
        checkpoint::apply_model_weights(self.model.as_ref(), &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        self.history = outcome.history;
        self.global_step = outcome.manifest.progress.global_step;
        self.loader.seek_epoch(outcome.manifest.progress.epoch);
        info!(
            step = self.global_step,
            epoch = outcome.manifest.progress.epoch,
            "restored checkpoint {}",
            directory.display()
        );
        Ok(outcome.manifest)
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until the step/epoch budget is exhausted or `should_stop`
    /// returns true. A tripped stop flag finishes the step in flight, writes
    /// exactly one checkpoint, and returns; no new step starts once that
    /// write has begun.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        info!(run = %self.config.name, "starting training loop");

        loop {
            if self.budget_exhausted() {
                break;
            }
            match self.loader.next_batch()? {
                Some(batch) => {
                    self.train_step(&batch)?;
                    if self.global_step % self.config.trainer.save_every_n_steps == 0 {
                        self.save_checkpoint()?;
                    }
                    if should_stop() {
                        info!(step = self.global_step, "shutdown requested; checkpointing");
                        self.save_checkpoint()?;
                        return Ok(());
                    }
                }
                None => {
                    self.loader.advance_epoch();
                }
            }
        }

        let descriptor = self.save_checkpoint()?;
        info!(
            step = self.global_step,
            "training complete; final checkpoint at {}",
            descriptor.directory.display()
        );
        Ok(())
    }

    fn budget_exhausted(&self) -> bool {
        if let Some(limit) = self.config.trainer.max_steps {
            if self.global_step >= limit {
                return true;
            }
        }
        let epochs = self.config.trainer.epochs;
        epochs > 0 && self.loader.epoch() >= epochs
    }

    fn train_step(&mut self, batch: &TensorBatch) -> Result<(), TrainingError> {
        let logits = self.model.forward(&batch.images)?;
        let targets = batch.spaced_labels.as_ref().unwrap_or(&batch.labels);
        let output = self.loss.compute(&logits, targets)?;

        let mut grads = output
            .loss
            .backward()
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
        self.optimizer.step(&mut grads)?;
        self.global_step += 1;

        let snapshot = self.metrics.record_step(
            output.metrics.total_chars() as u64,
            output.metrics.average_loss() as f64,
            output.metrics.accuracy() as f64,
        );

        if self.global_step % self.config.trainer.log_every_n_steps == 0 {
            info!(
                step = self.global_step,
                epoch = self.loader.epoch(),
                loss = snapshot.loss,
                accuracy = snapshot.accuracy,
                chars_per_sec = snapshot.chars_per_sec,
                "train step"
            );
            self.history.add_entry(json!({
                "step": self.global_step,
                "epoch": self.loader.epoch(),
                "loss": snapshot.step_loss,
                "loss_ema": snapshot.loss,
                "accuracy": snapshot.step_accuracy,
                "chars_per_sec": snapshot.chars_per_sec,
                "total_chars": snapshot.total_chars,
            }));
        }

        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<CheckpointDescriptor, TrainingError> {
        checkpoint::save_checkpoint(SaveRequest {
            run_dir: &self.run_dir,
            config: &self.config,
            model: self.model.as_ref(),
            optimizer: &self.optimizer,
            history: &self.history,
            progress: ProgressSnapshot {
                global_step: self.global_step,
                epoch: self.loader.epoch(),
            },
            max_keep: self.config.trainer.max_keep,
        })
    }
}
