use crate::{
    config::TrainingConfig,
    data::{load_labels, LesionBatch, LesionBatcher, LesionDataset, LesionItem},
    metrics::{
        classification_report, segmentation_scores, ClassReport, ConfusionMatrix,
        SegmentationScores, THRESHOLD,
    },
    ynet::YNet,
};
use anyhow::{anyhow, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{activation::sigmoid, backend::Backend},
};

/// End-of-test aggregate: segmentation scores averaged over the test set,
/// plus classification statistics over the accumulated labels.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub segmentation: SegmentationScores,
    pub confusion: ConfusionMatrix,
    pub classification: ClassReport,
}

/// Scores a trained checkpoint against the test split.
pub struct Evaluator<B: Backend> {
    config: TrainingConfig,
    device: B::Device,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn run(&self) -> Result<TestReport> {
        self.config.validate()?;

        let (height, width) = (self.config.image_height, self.config.image_width);
        let labels = load_labels(&self.config.test.labels_csv, &self.config.label_column)?;
        let dataset = LesionDataset::from_split(
            &self.config.test.images_dir,
            &self.config.test.masks_dir,
            labels,
            height,
            width,
        )?;
        println!("Test: {} samples", dataset.len());

        let batcher = LesionBatcher::<B>::new(height, width, self.device.clone());
        let loader = DataLoaderBuilder::<B, LesionItem, LesionBatch<B>>::new(batcher)
            .batch_size(self.config.batch_size)
            .num_workers(self.config.num_workers)
            .build(dataset);

        let model = self.load_model()?;

        let mut sums = SegmentationScores::default();
        let mut batches = 0;
        let mut y_true = Vec::new();
        let mut y_pred = Vec::new();

        for batch in loader.iter() {
            let (seg_logits, label_prob) = model.forward(batch.images);
            let pred_mask = sigmoid(seg_logits)
                .to_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("failed to read predicted mask: {e:?}"))?;
            let target_mask = batch
                .masks
                .to_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("failed to read target mask: {e:?}"))?;

            sums.accumulate(&segmentation_scores(&pred_mask, &target_mask));
            batches += 1;

            let probs = label_prob
                .to_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("failed to read predicted labels: {e:?}"))?;
            let targets = batch
                .labels
                .to_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("failed to read target labels: {e:?}"))?;
            y_pred.extend(probs.iter().map(|&p| (p > THRESHOLD) as u8));
            y_true.extend(targets.iter().map(|&t| (t > THRESHOLD) as u8));
        }

        let report = TestReport {
            segmentation: sums.averaged(batches),
            confusion: ConfusionMatrix::from_labels(&y_true, &y_pred),
            classification: classification_report(&y_true, &y_pred),
        };

        println!("{}", report.segmentation);
        println!("Confusion matrix:\n{}", report.confusion);
        println!("Classification report:\n{}", report.classification);

        Ok(report)
    }

    fn load_model(&self) -> Result<YNet<B>> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.config
            .model()
            .init::<B>(&self.device)
            .load_file(&self.config.checkpoint_path, &recorder, &self.device)
            .map_err(|e| {
                anyhow!(
                    "failed to load checkpoint from {}: {e:?}",
                    self.config.checkpoint_path
                )
            })
    }
}
