use crate::ynet::YNetConfig;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Image, mask and label locations for one dataset split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitPaths {
    pub images_dir: String,
    pub masks_dir: String,
    pub labels_csv: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub image_height: usize,
    pub image_width: usize,
    pub base_channels: usize,
    pub bottleneck_channels: usize,
    pub fc1_units: usize,
    pub fc2_units: usize,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub scheduler_factor: f64,
    pub scheduler_patience: usize,
    pub label_column: String,
    pub train: SplitPaths,
    pub valid: SplitPaths,
    pub test: SplitPaths,
    pub checkpoint_path: String,
    pub num_workers: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            image_height: 256,
            image_width: 256,
            base_channels: 32,
            bottleneck_channels: 64,
            fc1_units: 64,
            fc2_units: 32,
            batch_size: 5,
            num_epochs: 150,
            learning_rate: 3e-5,
            momentum: 0.9,
            scheduler_factor: 0.1,
            scheduler_patience: 5,
            label_column: "NV".to_string(),
            train: SplitPaths {
                images_dir: "data/train/images".to_string(),
                masks_dir: "data/train/masks".to_string(),
                labels_csv: "data/train/labels.csv".to_string(),
            },
            valid: SplitPaths {
                images_dir: "data/valid/images".to_string(),
                masks_dir: "data/valid/masks".to_string(),
                labels_csv: "data/valid/labels.csv".to_string(),
            },
            test: SplitPaths {
                images_dir: "data/test/images".to_string(),
                masks_dir: "data/test/masks".to_string(),
                labels_csv: "data/test/labels.csv".to_string(),
            },
            checkpoint_path: "checkpoints/ynet".to_string(),
            num_workers: 1,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("Batch size must be > 0"));
        }
        if self.num_epochs == 0 {
            return Err(anyhow!("Number of epochs must be > 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(anyhow!("Learning rate must be > 0"));
        }
        if !(0.0..1.0).contains(&self.scheduler_factor) {
            return Err(anyhow!("Scheduler factor must be in (0, 1)"));
        }
        // Four encoder pools plus the classification-branch pool.
        if self.image_height % 32 != 0 || self.image_width % 32 != 0 {
            return Err(anyhow!(
                "Image size {}x{} must be divisible by 32",
                self.image_height,
                self.image_width
            ));
        }
        Ok(())
    }

    pub fn model(&self) -> YNetConfig {
        YNetConfig::new()
            .with_base_channels(self.base_channels)
            .with_bottleneck_channels(self.bottleneck_channels)
            .with_fc1_units(self.fc1_units)
            .with_fc2_units(self.fc2_units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_indivisible_image_size() {
        let config = TrainingConfig {
            image_height: 250,
            ..Default::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let config = TrainingConfig::default();

        let json = serde_json::to_string(&config).unwrap();
        let loaded: TrainingConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(loaded.batch_size, config.batch_size);
        assert_eq!(loaded.train.images_dir, config.train.images_dir);
    }
}
