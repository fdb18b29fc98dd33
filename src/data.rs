//! Image datasets and the infinite batch loader feeding the training loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("index {idx} out of bounds (size: {size})")]
    OutOfBounds { idx: usize, size: usize },
    #[error("{available} samples available, fewer than one batch of {batch_size}")]
    TooSmall { available: usize, batch_size: usize },
    #[error("{0}")]
    Other(String),
}

/// Random access to normalized images.
///
/// `load` returns one image in CHW layout with values in `[-1, 1]`; every image
/// of a source has the same [`ImageSource::shape`].
pub trait ImageSource: Send + Sync {
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// `[channels, height, width]`
    fn shape(&self) -> [usize; 3];
    fn load(&self, idx: usize) -> DatasetResult<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub struct Augmentation {
    pub horizontal_flip: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self::new()
    }
}

impl Augmentation {
    pub fn new() -> Self {
        Self {
            horizontal_flip: 0.5,
        }
    }

    pub fn apply(&self, img: DynamicImage) -> DynamicImage {
        if rand::random::<f32>() < self.horizontal_flip {
            img.fliph()
        } else {
            img
        }
    }
}

/// A flat directory of jpg/png/bmp/gif files, resized to a square resolution.
pub struct ImageFolder {
    name: String,
    image_paths: Vec<PathBuf>,
    resolution: usize,
    augmentation: Option<Augmentation>,
}

impl ImageFolder {
    pub fn directory(dir_path: impl AsRef<Path>, resolution: usize) -> DatasetResult<Self> {
        let path = dir_path.as_ref();
        let entries = std::fs::read_dir(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut image_paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| DatasetError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file = entry.path();
            if let Some(ext) = file.extension() {
                let ext = ext.to_str().unwrap_or("").to_lowercase();
                if matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "bmp" | "gif") {
                    image_paths.push(file);
                }
            }
        }

        if image_paths.is_empty() {
            return Err(DatasetError::Empty(path.to_path_buf()));
        }
        image_paths.sort();

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("dataset")
            .to_string();
        tracing::info!(images = image_paths.len(), dataset = %name, "Loaded image folder");

        Ok(Self {
            name,
            image_paths,
            resolution,
            augmentation: None,
        })
    }

    pub fn with_augmentation(mut self, aug: Augmentation) -> Self {
        self.augmentation = Some(aug);
        self
    }
}

impl ImageSource for ImageFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.image_paths.len()
    }

    fn shape(&self) -> [usize; 3] {
        [3, self.resolution, self.resolution]
    }

    fn load(&self, idx: usize) -> DatasetResult<Vec<f32>> {
        let path = self.image_paths.get(idx).ok_or(DatasetError::OutOfBounds {
            idx,
            size: self.image_paths.len(),
        })?;
        let mut img = image::open(path).map_err(|source| DatasetError::Image {
            path: path.clone(),
            source,
        })?;

        if let Some(ref aug) = self.augmentation {
            img = aug.apply(img);
        }

        let side = self.resolution as u32;
        let img = img.resize_exact(side, side, FilterType::Lanczos3).to_rgb8();

        let plane = self.resolution * self.resolution;
        let mut chw = vec![0.0_f32; 3 * plane];
        for (i, p) in img.pixels().enumerate() {
            for c in 0..3 {
                chw[c * plane + i] = (p[c] as f32 / 255.0) * 2.0 - 1.0;
            }
        }
        Ok(chw)
    }
}

/// Order in which the loader visits samples each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum SamplerKind {
    Shuffled,
    Sequential,
    /// Shuffled with an epoch seed shared by all ranks, then strided by rank.
    Sharded,
}

/// This process's slice of a sharded dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

/// Sample indices for one epoch.
pub fn epoch_order(kind: SamplerKind, len: usize, shard: Shard, seed: u64, epoch: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    match kind {
        SamplerKind::Sequential => order,
        SamplerKind::Shuffled => {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
            order
        }
        SamplerKind::Sharded => {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
            let world_size = shard.world_size.max(1);
            order
                .into_iter()
                .enumerate()
                .filter(|(i, _)| i % world_size == shard.rank)
                .map(|(_, idx)| idx)
                .collect()
        }
    }
}

/// Cycles over an [`ImageSource`] forever, yielding full batches only.
///
/// Images of a batch are decoded concurrently on a dedicated rayon pool.
pub struct BatchLoader {
    source: Arc<dyn ImageSource>,
    batch_size: usize,
    sampler: SamplerKind,
    shard: Shard,
    seed: u64,
    epoch: u64,
    order: Vec<usize>,
    cursor: usize,
    pool: rayon::ThreadPool,
}

impl BatchLoader {
    pub fn new(
        source: Arc<dyn ImageSource>,
        batch_size: usize,
        sampler: SamplerKind,
        shard: Shard,
        seed: u64,
        workers: usize,
    ) -> DatasetResult<Self> {
        let order = epoch_order(sampler, source.len(), shard, seed, 0);
        if batch_size == 0 || order.len() < batch_size {
            return Err(DatasetError::TooSmall {
                available: order.len(),
                batch_size,
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()
            .map_err(|e| DatasetError::Other(format!("failed to build loader pool: {e}")))?;

        Ok(Self {
            source,
            batch_size,
            sampler,
            shard,
            seed,
            epoch: 0,
            order,
            cursor: 0,
            pool,
        })
    }

    fn next_indices(&mut self) -> Vec<usize> {
        if self.cursor + self.batch_size > self.order.len() {
            self.epoch += 1;
            self.order = epoch_order(self.sampler, self.source.len(), self.shard, self.seed, self.epoch);
            self.cursor = 0;
        }
        let indices = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;
        indices
    }

    /// Next batch as a `[batch_size, C, H, W]` tensor.
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> DatasetResult<Tensor<B, 4>> {
        let indices = self.next_indices();
        let source = &self.source;
        let images: Vec<Vec<f32>> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&idx| source.load(idx))
                .collect::<DatasetResult<Vec<_>>>()
        })?;

        let [c, h, w] = self.source.shape();
        let flat: Vec<f32> = images.into_iter().flatten().collect();
        Ok(Tensor::from_data(
            TensorData::new(flat, [self.batch_size, c, h, w]),
            device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    /// Each image is filled with its own index so batches can be traced back.
    struct IndexImages {
        len: usize,
    }

    impl ImageSource for IndexImages {
        fn name(&self) -> &str {
            "index"
        }
        fn len(&self) -> usize {
            self.len
        }
        fn shape(&self) -> [usize; 3] {
            [1, 2, 2]
        }
        fn load(&self, idx: usize) -> DatasetResult<Vec<f32>> {
            Ok(vec![idx as f32; 4])
        }
    }

    fn batch_ids(batch: Tensor<TestBackend, 4>) -> Vec<usize> {
        let values: Vec<f32> = batch.into_data().to_vec().unwrap();
        values.chunks(4).map(|c| c[0] as usize).collect()
    }

    #[test]
    fn test_sequential_order_and_drop_last() {
        let device = Default::default();
        let source: Arc<dyn ImageSource> = Arc::new(IndexImages { len: 5 });
        let mut loader =
            BatchLoader::new(source, 2, SamplerKind::Sequential, Shard::default(), 0, 2).unwrap();

        assert_eq!(batch_ids(loader.next_batch(&device).unwrap()), vec![0, 1]);
        assert_eq!(batch_ids(loader.next_batch(&device).unwrap()), vec![2, 3]);
        // Index 4 would form an incomplete batch; the loader wraps instead.
        assert_eq!(batch_ids(loader.next_batch(&device).unwrap()), vec![0, 1]);
    }

    #[test]
    fn test_shuffled_covers_epoch() {
        let order = epoch_order(SamplerKind::Shuffled, 32, Shard::default(), 7, 0);
        let unique: HashSet<_> = order.iter().copied().collect();
        assert_eq!(unique.len(), 32);
        assert_ne!(order, (0..32).collect::<Vec<_>>());
        assert_ne!(order, epoch_order(SamplerKind::Shuffled, 32, Shard::default(), 7, 1));
    }

    #[test]
    fn test_sharded_disjoint_and_complete() {
        let world_size = 3;
        let mut seen = HashSet::new();
        for rank in 0..world_size {
            let shard = Shard { rank, world_size };
            for idx in epoch_order(SamplerKind::Sharded, 10, shard, 42, 0) {
                assert!(seen.insert(idx), "index {idx} appears in two shards");
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_too_small_dataset() {
        let source: Arc<dyn ImageSource> = Arc::new(IndexImages { len: 3 });
        let err = BatchLoader::new(source, 4, SamplerKind::Shuffled, Shard::default(), 0, 1)
            .err()
            .expect("loader must reject a dataset smaller than one batch");
        assert!(matches!(err, DatasetError::TooSmall { available: 3, batch_size: 4 }));
    }

    #[test]
    fn test_image_folder_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let white = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]));
        white.save(dir.path().join("a.png")).unwrap();
        let black = image::RgbImage::from_pixel(4, 4, image::Rgb([0, 0, 0]));
        black.save(dir.path().join("b.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let folder = ImageFolder::directory(dir.path(), 2).unwrap();
        assert_eq!(folder.len(), 2);
        assert_eq!(folder.shape(), [3, 2, 2]);

        let a = folder.load(0).unwrap();
        assert_eq!(a.len(), 12);
        assert!(a.iter().all(|v| (v - 1.0).abs() < 1e-6));
        let b = folder.load(1).unwrap();
        assert!(b.iter().all(|v| (v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_empty_folder_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageFolder::directory(dir.path(), 8),
            Err(DatasetError::Empty(_))
        ));
    }
}
