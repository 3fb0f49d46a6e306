use anyhow::{anyhow, Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Tensor},
};
use image::{imageops::FilterType, ImageReader};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const MASK_MEAN: f32 = 0.5;
const MASK_STD: f32 = 0.5;

const VALID_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

/// One dermoscopic sample: an image, its segmentation mask and the binary
/// diagnosis label. Images and masks are paired by sorted filename order;
/// keeping the label CSV aligned with that order is the caller's contract.
#[derive(Debug, Clone)]
pub struct LesionItem {
    pub image_path: PathBuf,
    pub mask_path: PathBuf,
    pub label: u8,
}

#[derive(Debug, Clone)]
pub struct LesionDataset {
    items: Vec<LesionItem>,
    pub target_height: usize,
    pub target_width: usize,
}

impl LesionDataset {
    pub fn from_split(
        images_dir: impl AsRef<Path>,
        masks_dir: impl AsRef<Path>,
        labels: Vec<u8>,
        target_height: usize,
        target_width: usize,
    ) -> Result<Self> {
        let images = sorted_image_files(images_dir.as_ref())?;
        let masks = sorted_image_files(masks_dir.as_ref())?;

        if images.len() != masks.len() {
            return Err(anyhow!(
                "{} images but {} masks under {} / {}",
                images.len(),
                masks.len(),
                images_dir.as_ref().display(),
                masks_dir.as_ref().display(),
            ));
        }
        if images.len() != labels.len() {
            return Err(anyhow!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            ));
        }
        if images.is_empty() {
            return Err(anyhow!(
                "no images found under {}",
                images_dir.as_ref().display()
            ));
        }

        let items = images
            .into_iter()
            .zip(masks)
            .zip(labels)
            .map(|((image_path, mask_path), label)| LesionItem {
                image_path,
                mask_path,
                label,
            })
            .collect();

        Ok(Self {
            items,
            target_height,
            target_width,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Dataset<LesionItem> for LesionDataset {
    fn get(&self, index: usize) -> Option<LesionItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn sorted_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(ext) = path.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if VALID_EXTENSIONS.iter().any(|&e| e == ext) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Reads the given 0/1 column from a label CSV, one row per sample.
pub fn load_labels(path: impl AsRef<Path>, column: &str) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open label csv {}", path.display()))?;

    let headers = reader.headers()?.clone();
    let index = headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| anyhow!("column '{column}' not found in {}", path.display()))?;

    let mut labels = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let raw = record
            .get(index)
            .ok_or_else(|| anyhow!("row {row} is missing column '{column}'"))?;
        let value: f32 = raw
            .trim()
            .parse()
            .with_context(|| format!("row {row}: '{raw}' is not a numeric label"))?;
        labels.push((value > 0.5) as u8);
    }
    Ok(labels)
}

/// Decodes, resizes and normalizes an RGB image into CHW order.
pub fn load_image(path: &Path, height: usize, width: usize) -> Result<Vec<f32>> {
    let img = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?
        .resize_exact(width as u32, height as u32, FilterType::Triangle);

    Ok(image_to_chw(&img.to_rgb8().into_raw(), height, width))
}

/// Decodes a mask as grayscale with nearest-neighbor resize (masks must stay
/// binary through the resize) and normalizes it.
pub fn load_mask(path: &Path, height: usize, width: usize) -> Result<Vec<f32>> {
    let img = ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))?
        .resize_exact(width as u32, height as u32, FilterType::Nearest);

    Ok(mask_to_plane(&img.to_luma8().into_raw()))
}

fn image_to_chw(raw: &[u8], height: usize, width: usize) -> Vec<f32> {
    let frame_size = height * width;
    let mut chw = vec![0.0; frame_size * 3];

    for i in 0..frame_size {
        let base = i * 3;
        for c in 0..3 {
            chw[i + c * frame_size] =
                (raw[base + c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    chw
}

fn mask_to_plane(raw: &[u8]) -> Vec<f32> {
    raw.iter()
        .map(|&v| (v as f32 / 255.0 - MASK_MEAN) / MASK_STD)
        .collect()
}

#[derive(Debug, Clone)]
pub struct LesionBatch<B: Backend> {
    /// `(N, 3, H, W)`, ImageNet-normalized.
    pub images: Tensor<B, 4>,
    /// `(N, 1, H, W)`, normalized with mean/std 0.5.
    pub masks: Tensor<B, 4>,
    /// `(N, 1)` float 0/1 classification targets.
    pub labels: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct LesionBatcher<B: Backend> {
    pub image_height: usize,
    pub image_width: usize,
    pub device: B::Device,
}

impl<B: Backend> LesionBatcher<B> {
    pub fn new(image_height: usize, image_width: usize, device: B::Device) -> Self {
        Self {
            image_height,
            image_width,
            device,
        }
    }
}

impl<B: Backend> Batcher<B, LesionItem, LesionBatch<B>> for LesionBatcher<B> {
    fn batch(&self, items: Vec<LesionItem>, device: &B::Device) -> LesionBatch<B> {
        let batch_size = items.len();
        let frame_size = self.image_height * self.image_width;

        let loaded: Vec<(Vec<f32>, Vec<f32>)> = items
            .par_iter()
            .map(|item| {
                let image = load_image(&item.image_path, self.image_height, self.image_width);
                let mask = load_mask(&item.mask_path, self.image_height, self.image_width);
                match (image, mask) {
                    (Ok(image), Ok(mask)) => (image, mask),
                    (image, mask) => {
                        for err in [image.err(), mask.err()].into_iter().flatten() {
                            eprintln!("warning: {err:#}; substituting zeros");
                        }
                        (vec![0.0; frame_size * 3], vec![0.0; frame_size])
                    }
                }
            })
            .collect();

        let mut images_data = Vec::with_capacity(batch_size * 3 * frame_size);
        let mut masks_data = Vec::with_capacity(batch_size * frame_size);
        let mut labels_data = Vec::with_capacity(batch_size);
        for ((image, mask), item) in loaded.into_iter().zip(&items) {
            images_data.extend_from_slice(&image);
            masks_data.extend_from_slice(&mask);
            labels_data.push(item.label as f32);
        }

        let images = Tensor::<B, 1>::from_floats(&*images_data, device).reshape([
            batch_size as i32,
            3,
            self.image_height as i32,
            self.image_width as i32,
        ]);
        let masks = Tensor::<B, 1>::from_floats(&*masks_data, device).reshape([
            batch_size as i32,
            1,
            self.image_height as i32,
            self.image_width as i32,
        ]);
        let labels =
            Tensor::<B, 1>::from_floats(&*labels_data, device).reshape([batch_size as i32, 1]);

        LesionBatch {
            images,
            masks,
            labels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn image_normalization_uses_per_channel_stats() {
        // A single white pixel.
        let chw = image_to_chw(&[255, 255, 255], 1, 1);

        for c in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((chw[c] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn mask_normalization_maps_to_symmetric_range() {
        let plane = mask_to_plane(&[0, 255]);

        assert_eq!(plane, vec![-1.0, 1.0]);
    }

    #[test]
    fn loads_label_column_from_csv() {
        let path = std::env::temp_dir().join("derm_ynet_labels_test.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "image,NV").unwrap();
        writeln!(file, "a.png,1").unwrap();
        writeln!(file, "b.png,0").unwrap();
        writeln!(file, "c.png,1").unwrap();
        drop(file);

        let labels = load_labels(&path, "NV").unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(labels, vec![1, 0, 1]);
    }

    #[test]
    fn missing_label_column_is_an_error() {
        let path = std::env::temp_dir().join("derm_ynet_labels_missing_test.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "image,MEL").unwrap();
        writeln!(file, "a.png,1").unwrap();
        drop(file);

        let result = load_labels(&path, "NV");
        fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
