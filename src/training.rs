use crate::{
    config::TrainingConfig,
    data::{load_labels, LesionBatch, LesionBatcher, LesionDataset, LesionItem},
    loss::JointLoss,
    metrics::classification_accuracy,
    ynet::YNet,
};
use anyhow::{anyhow, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use std::{fs, path::Path, sync::Arc, time::Instant};

/// Per-epoch averages of the accumulated batch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub seg_loss: f64,
    pub class_loss: f64,
    pub total_loss: f64,
    pub accuracy: f64,
}

/// Running sums over one pass; divided by the batch count at epoch end.
#[derive(Debug, Default)]
struct RunningMetrics {
    seg_loss: f64,
    class_loss: f64,
    total_loss: f64,
    accuracy: f64,
    batches: usize,
}

impl RunningMetrics {
    fn record(&mut self, seg: f64, class: f64, total: f64, accuracy: f64) {
        self.seg_loss += seg;
        self.class_loss += class;
        self.total_loss += total;
        self.accuracy += accuracy;
        self.batches += 1;
    }

    fn average(&self) -> EpochMetrics {
        let n = self.batches.max(1) as f64;
        EpochMetrics {
            seg_loss: self.seg_loss / n,
            class_loss: self.class_loss / n,
            total_loss: self.total_loss / n,
            accuracy: self.accuracy / n,
        }
    }
}

/// Epoch-by-epoch metric history for both splits, owned by the caller and
/// appended to exactly once per epoch.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub train: Vec<EpochMetrics>,
    pub valid: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn push(&mut self, train: EpochMetrics, valid: EpochMetrics) {
        self.train.push(train);
        self.valid.push(valid);
    }

    pub fn best_valid_loss(&self) -> Option<f64> {
        self.valid
            .iter()
            .map(|m| m.total_loss)
            .filter(|l| l.is_finite())
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Greedy monotone checkpoint selection: save whenever the validation total
/// loss strictly improves on the best finite value seen so far. No patience
/// window, and a non-finite loss never saves.
#[derive(Debug)]
pub struct CheckpointPolicy {
    best: f64,
}

impl CheckpointPolicy {
    pub fn new() -> Self {
        Self { best: f64::INFINITY }
    }

    pub fn should_save(&mut self, valid_loss: f64) -> bool {
        if valid_loss.is_finite() && valid_loss < self.best {
            self.best = valid_loss;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplies the learning rate by `factor` once the validation loss has
/// stalled for more than `patience` epochs. The patience applies to the
/// learning rate only, never to checkpointing.
#[derive(Debug)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    best: f64,
    stalled: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr: f64, factor: f64, patience: usize) -> Self {
        Self {
            lr,
            factor,
            patience,
            best: f64::INFINITY,
            stalled: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn observe(&mut self, valid_loss: f64) {
        if valid_loss.is_finite() && valid_loss < self.best {
            self.best = valid_loss;
            self.stalled = 0;
            return;
        }
        self.stalled += 1;
        if self.stalled > self.patience {
            self.lr *= self.factor;
            self.stalled = 0;
        }
    }
}

fn epoch_time(elapsed_secs: u64) -> (u64, u64) {
    (elapsed_secs / 60, elapsed_secs % 60)
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn run(&self) -> Result<TrainingHistory> {
        self.config.validate()?;

        println!("Starting training");
        println!("  backend: {}", std::any::type_name::<B>());
        println!(
            "  image size: {}x{}",
            self.config.image_width, self.config.image_height
        );
        println!("  batch size: {}", self.config.batch_size);
        println!("  learning rate: {}", self.config.learning_rate);

        let (train_loader, valid_loader) = self.create_dataloaders()?;
        let mut model = self.config.model().init::<B>(&self.device);
        let mut optim = self.create_optimizer().init();
        let mut scheduler = ReduceLrOnPlateau::new(
            self.config.learning_rate,
            self.config.scheduler_factor,
            self.config.scheduler_patience,
        );
        let mut policy = CheckpointPolicy::new();
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.num_epochs {
            let start = Instant::now();

            let (updated, train_metrics) =
                self.train_epoch(model, &mut optim, &train_loader, scheduler.lr());
            model = updated;
            let valid_metrics = eval_pass(&model.valid(), &valid_loader);

            if policy.should_save(valid_metrics.total_loss) {
                println!(
                    "Valid loss improved to {:2.4}. Saving checkpoint: {}",
                    valid_metrics.total_loss, self.config.checkpoint_path
                );
                self.save_checkpoint(&model)?;
            } else if !valid_metrics.total_loss.is_finite() {
                eprintln!(
                    "warning: non-finite validation loss in epoch {epoch}; checkpoint not saved"
                );
            }
            scheduler.observe(valid_metrics.total_loss);

            let (mins, secs) = epoch_time(start.elapsed().as_secs());
            println!("Epoch: {epoch:02} | Epoch Time: {mins}m {secs}s");
            println!(
                "\t Train Loss for segmentation: {:.3}",
                train_metrics.seg_loss
            );
            println!(
                "\t Val. Loss for segmentation: {:.3}",
                valid_metrics.seg_loss
            );
            println!(
                "\t Train Loss for classification: {:.3}",
                train_metrics.class_loss
            );
            println!(
                "\t Val. Loss for classification: {:.3}",
                valid_metrics.class_loss
            );
            println!("\t Total Train Loss: {:.3}", train_metrics.total_loss);
            println!("\t Total Valid Loss: {:.3}", valid_metrics.total_loss);
            println!("\t Train Accuracy: {:.3}", train_metrics.accuracy);
            println!("\t Valid Accuracy: {:.3}", valid_metrics.accuracy);

            history.push(train_metrics, valid_metrics);
        }

        Ok(history)
    }

    fn create_optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(MomentumConfig::new().with_momentum(self.config.momentum)))
    }

    #[allow(clippy::type_complexity)]
    fn create_dataloaders(
        &self,
    ) -> Result<(
        Arc<dyn DataLoader<B, LesionBatch<B>>>,
        Arc<dyn DataLoader<B::InnerBackend, LesionBatch<B::InnerBackend>>>,
    )> {
        let (height, width) = (self.config.image_height, self.config.image_width);

        let train_labels = load_labels(&self.config.train.labels_csv, &self.config.label_column)?;
        let train_data = LesionDataset::from_split(
            &self.config.train.images_dir,
            &self.config.train.masks_dir,
            train_labels,
            height,
            width,
        )?;
        let valid_labels = load_labels(&self.config.valid.labels_csv, &self.config.label_column)?;
        let valid_data = LesionDataset::from_split(
            &self.config.valid.images_dir,
            &self.config.valid.masks_dir,
            valid_labels,
            height,
            width,
        )?;
        println!(
            "Dataset Size:\nTrain: {} - Valid: {}",
            train_data.len(),
            valid_data.len()
        );

        let batcher_train = LesionBatcher::<B>::new(height, width, self.device.clone());
        let device_valid = <B::InnerBackend as Backend>::Device::default();
        let batcher_valid = LesionBatcher::<B::InnerBackend>::new(height, width, device_valid);

        let train_loader = DataLoaderBuilder::<B, LesionItem, LesionBatch<B>>::new(batcher_train)
            .batch_size(self.config.batch_size)
            .shuffle(self.config.seed)
            .num_workers(self.config.num_workers)
            .build(train_data);
        let valid_loader =
            DataLoaderBuilder::<B::InnerBackend, LesionItem, LesionBatch<B::InnerBackend>>::new(
                batcher_valid,
            )
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .build(valid_data);

        Ok((train_loader, valid_loader))
    }

    fn train_epoch<O: Optimizer<YNet<B>, B>>(
        &self,
        mut model: YNet<B>,
        optim: &mut O,
        loader: &Arc<dyn DataLoader<B, LesionBatch<B>>>,
        lr: f64,
    ) -> (YNet<B>, EpochMetrics) {
        let mut running = RunningMetrics::default();

        for batch in loader.iter() {
            let (seg_logits, label_prob) = model.forward(batch.images);
            let loss = JointLoss::forward(
                seg_logits,
                batch.masks,
                label_prob.clone(),
                batch.labels.clone(),
            );

            let total = loss.total.clone().into_scalar().elem::<f64>();
            if !total.is_finite() {
                eprintln!("warning: non-finite training loss ({total})");
            }

            let grads = loss.total.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(lr, model, grads);

            let probs = label_prob.to_data().to_vec::<f32>().unwrap_or_default();
            let targets = batch.labels.to_data().to_vec::<f32>().unwrap_or_default();
            running.record(
                loss.seg.into_scalar().elem::<f64>(),
                loss.class.into_scalar().elem::<f64>(),
                total,
                classification_accuracy(&probs, &targets),
            );
        }

        (model, running.average())
    }

    fn save_checkpoint(&self, model: &YNet<B>) -> Result<()> {
        let path = Path::new(&self.config.checkpoint_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(model.clone().into_record(), path.to_path_buf())
            .map_err(|e| anyhow!("failed to save checkpoint: {e:?}"))?;
        Ok(())
    }
}

/// One pass over a split without gradient tracking: the model runs on the
/// inner (non-autodiff) backend, so parameters cannot be mutated.
fn eval_pass<B: Backend>(
    model: &YNet<B>,
    loader: &Arc<dyn DataLoader<B, LesionBatch<B>>>,
) -> EpochMetrics {
    let mut running = RunningMetrics::default();

    for batch in loader.iter() {
        let (seg_logits, label_prob) = model.forward(batch.images);
        let loss = JointLoss::forward(
            seg_logits,
            batch.masks,
            label_prob.clone(),
            batch.labels.clone(),
        );

        let probs = label_prob.to_data().to_vec::<f32>().unwrap_or_default();
        let targets = batch.labels.to_data().to_vec::<f32>().unwrap_or_default();
        running.record(
            loss.seg.into_scalar().elem::<f64>(),
            loss.class.into_scalar().elem::<f64>(),
            loss.total.into_scalar().elem::<f64>(),
            classification_accuracy(&probs, &targets),
        );
    }

    running.average()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoints_only_on_strict_improvement() {
        let mut policy = CheckpointPolicy::new();

        let decisions: Vec<bool> = [0.9, 0.5, 0.6, 0.4]
            .iter()
            .map(|&loss| policy.should_save(loss))
            .collect();

        assert_eq!(decisions, vec![true, true, false, true]);
        assert_eq!(policy.best(), 0.4);
    }

    #[test]
    fn never_checkpoints_on_non_finite_loss() {
        let mut policy = CheckpointPolicy::new();
        assert!(policy.should_save(1.0));

        assert!(!policy.should_save(f64::NAN));
        assert!(!policy.should_save(f64::NEG_INFINITY));
        assert!(policy.should_save(0.5));
    }

    #[test]
    fn plateau_scheduler_waits_out_its_patience() {
        let mut scheduler = ReduceLrOnPlateau::new(1e-3, 0.1, 2);
        scheduler.observe(1.0);

        scheduler.observe(1.1);
        scheduler.observe(1.2);
        assert_eq!(scheduler.lr(), 1e-3);

        scheduler.observe(1.3);
        assert!((scheduler.lr() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn plateau_scheduler_resets_on_improvement() {
        let mut scheduler = ReduceLrOnPlateau::new(1e-3, 0.1, 2);
        scheduler.observe(1.0);
        scheduler.observe(1.1);
        scheduler.observe(1.2);

        scheduler.observe(0.9);
        scheduler.observe(1.0);
        scheduler.observe(1.1);
        assert_eq!(scheduler.lr(), 1e-3);
    }

    #[test]
    fn epoch_averages_divide_by_batch_count() {
        let mut running = RunningMetrics::default();
        running.record(1.0, 0.5, 1.5, 1.0);
        running.record(3.0, 1.5, 4.5, 0.5);

        let metrics = running.average();

        assert_eq!(metrics.seg_loss, 2.0);
        assert_eq!(metrics.class_loss, 1.0);
        assert_eq!(metrics.total_loss, 3.0);
        assert_eq!(metrics.accuracy, 0.75);
    }

    #[test]
    fn history_tracks_best_finite_valid_loss() {
        let mut history = TrainingHistory::default();
        let epoch = |total_loss| EpochMetrics {
            total_loss,
            ..Default::default()
        };
        history.push(epoch(0.9), epoch(0.8));
        history.push(epoch(0.7), epoch(f64::NAN));
        history.push(epoch(0.6), epoch(0.5));

        assert_eq!(history.best_valid_loss(), Some(0.5));
    }

    #[test]
    fn epoch_time_splits_minutes_and_seconds() {
        assert_eq!(epoch_time(125), (2, 5));
        assert_eq!(epoch_time(59), (0, 59));
    }
}
