//! Experiment-tracking sink: named scalars and image grids.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::prelude::*;
use image::{Rgb, RgbImage};
use serde::Serialize;

const GRID_PADDING: u32 = 2;

#[derive(Debug, Clone)]
pub enum Record {
    Scalar {
        key: String,
        value: f64,
    },
    Images {
        key: String,
        grid: RgbImage,
        caption: Option<String>,
    },
}

impl Record {
    pub fn key(&self) -> &str {
        match self {
            Record::Scalar { key, .. } | Record::Images { key, .. } => key,
        }
    }
}

/// Receives telemetry from a training run. Writes are small and frequent.
pub trait Tracker {
    fn log(&mut self, step: Option<usize>, record: Record) -> anyhow::Result<()>;

    fn log_scalar(&mut self, step: Option<usize>, key: &str, value: f64) -> anyhow::Result<()> {
        self.log(
            step,
            Record::Scalar {
                key: key.to_string(),
                value,
            },
        )
    }

    fn log_images(
        &mut self,
        step: Option<usize>,
        key: &str,
        grid: RgbImage,
        caption: Option<String>,
    ) -> anyhow::Result<()> {
        self.log(
            step,
            Record::Images {
                key: key.to_string(),
                grid,
                caption,
            },
        )
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Tile a `[N, C, H, W]` batch into one RGB image, `nrow` images per row.
///
/// Values are mapped linearly from `range` to `[0, 255]` and clamped.
/// Single-channel batches are replicated to grey.
pub fn make_grid<B: Backend>(images: Tensor<B, 4>, nrow: usize, range: (f32, f32)) -> anyhow::Result<RgbImage> {
    let [n, channels, height, width] = images.dims();
    anyhow::ensure!(n > 0, "cannot build a grid from an empty batch");
    anyhow::ensure!(
        channels == 1 || channels == 3,
        "grid expects 1 or 3 channels, got {channels}"
    );

    let values: Vec<f32> = images
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("failed to read image tensor: {e:?}"))?;

    let (lo, hi) = range;
    let span = (hi - lo).max(f32::EPSILON);
    let to_u8 = |v: f32| (((v - lo) / span) * 255.0).clamp(0.0, 255.0).round() as u8;

    let cols = nrow.clamp(1, n);
    let rows = n.div_ceil(cols);
    let (h, w) = (height as u32, width as u32);
    let grid_w = cols as u32 * (w + GRID_PADDING) + GRID_PADDING;
    let grid_h = rows as u32 * (h + GRID_PADDING) + GRID_PADDING;
    let mut grid = RgbImage::new(grid_w, grid_h);

    let plane = height * width;
    for k in 0..n {
        let x0 = (k % cols) as u32 * (w + GRID_PADDING) + GRID_PADDING;
        let y0 = (k / cols) as u32 * (h + GRID_PADDING) + GRID_PADDING;
        let base = k * channels * plane;
        for y in 0..height {
            for x in 0..width {
                let at = |c: usize| values[base + c * plane + y * width + x];
                let pixel = if channels == 1 {
                    let v = to_u8(at(0));
                    Rgb([v, v, v])
                } else {
                    Rgb([to_u8(at(0)), to_u8(at(1)), to_u8(at(2))])
                };
                grid.put_pixel(x0 + x as u32, y0 + y as u32, pixel);
            }
        }
    }
    Ok(grid)
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Line<'a> {
    Scalar {
        key: &'a str,
        value: f64,
        step: Option<usize>,
    },
    Image {
        key: &'a str,
        path: String,
        caption: Option<&'a str>,
        step: Option<usize>,
    },
}

/// Writes scalars to `scalars.jsonl` and grids as PNG files under `images/`.
pub struct RunTracker {
    dir: PathBuf,
    scalars: BufWriter<File>,
    image_count: usize,
}

impl RunTracker {
    pub fn create(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("images"))
            .with_context(|| format!("failed to create run directory {}", dir.display()))?;
        let file = File::create(dir.join("scalars.jsonl"))
            .with_context(|| format!("failed to create scalar log in {}", dir.display()))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
            image_count: 0,
        })
    }

    fn write_line(&mut self, line: &Line<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.scalars, line)?;
        self.scalars.write_all(b"\n")?;
        Ok(())
    }
}

fn slug(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

impl Tracker for RunTracker {
    fn log(&mut self, step: Option<usize>, record: Record) -> anyhow::Result<()> {
        match record {
            Record::Scalar { key, value } => self.write_line(&Line::Scalar {
                key: &key,
                value,
                step,
            }),
            Record::Images { key, grid, caption } => {
                let file_name = match step {
                    Some(step) => format!("{}_{step:06}.png", slug(&key)),
                    None => format!("{}_{:04}.png", slug(&key), self.image_count),
                };
                let rel = format!("images/{file_name}");
                grid.save(self.dir.join(&rel))
                    .with_context(|| format!("failed to save image grid {rel}"))?;
                self.image_count += 1;
                self.write_line(&Line::Image {
                    key: &key,
                    path: rel,
                    caption: caption.as_deref(),
                    step,
                })?;
                // Image records are rare; make them visible to readers right away.
                self.scalars.flush()?;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

impl Drop for RunTracker {
    fn drop(&mut self) {
        if let Err(e) = self.scalars.flush() {
            tracing::warn!(error = %e, "Failed to flush scalar log");
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    pub records: Vec<(Option<usize>, Record)>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values logged under `key`, in logging order.
    pub fn scalars(&self, key: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|(_, r)| match r {
                Record::Scalar { key: k, value } if k == key => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn last_scalar(&self, key: &str) -> Option<f64> {
        self.scalars(key).last().copied()
    }

    pub fn image_steps(&self, key: &str) -> Vec<Option<usize>> {
        self.records
            .iter()
            .filter(|(_, r)| matches!(r, Record::Images { .. }) && r.key() == key)
            .map(|(step, _)| *step)
            .collect()
    }
}

impl Tracker for MemoryTracker {
    fn log(&mut self, step: Option<usize>, record: Record) -> anyhow::Result<()> {
        self.records.push((step, record));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_grid_layout() {
        let device = Default::default();
        let batch = Tensor::<TestBackend, 4>::zeros([7, 3, 4, 5], &device);
        let grid = make_grid(batch, 3, (-1.0, 1.0)).unwrap();

        // 3 columns x 3 rows, 2px padding around every cell
        assert_eq!(grid.width(), 3 * (5 + 2) + 2);
        assert_eq!(grid.height(), 3 * (4 + 2) + 2);
    }

    #[test]
    fn test_grid_normalizes_range() {
        let device = Default::default();
        let batch = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![-1.0_f32, 1.0, -1.0, 1.0, -1.0, 1.0], [1, 3, 1, 2]),
            &device,
        );
        let grid = make_grid(batch, 6, (-1.0, 1.0)).unwrap();

        assert_eq!(grid.get_pixel(2, 2), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(3, 2), &Rgb([255, 255, 255]));
        // Padding stays black
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_run_tracker_writes_jsonl_and_png() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tracker = RunTracker::create(dir.path()).unwrap();
            tracker.log_scalar(Some(3), "VAE", 0.25).unwrap();
            tracker.log_scalar(None, "Score", 12.5).unwrap();
            tracker
                .log_images(Some(3), "Generated Images VAE", RgbImage::new(4, 4), Some("Step 3".into()))
                .unwrap();
        }

        let text = std::fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["kind"], "scalar");
        assert_eq!(lines[0]["key"], "VAE");
        assert_eq!(lines[0]["step"], 3);
        assert_eq!(lines[1]["value"], 12.5);
        assert!(lines[1]["step"].is_null());
        assert_eq!(lines[2]["kind"], "image");
        assert_eq!(lines[2]["caption"], "Step 3");

        let png = dir.path().join("images/generated_images_vae_000003.png");
        assert!(png.exists(), "missing {}", png.display());
    }

    #[test]
    fn test_memory_tracker_queries() {
        let mut tracker = MemoryTracker::new();
        tracker.log_scalar(Some(0), "Score", 3.0).unwrap();
        tracker.log_scalar(Some(1), "VAE", 1.0).unwrap();
        tracker.log_scalar(None, "Score", 2.0).unwrap();

        assert_eq!(tracker.scalars("Score"), vec![3.0, 2.0]);
        assert_eq!(tracker.last_scalar("Score"), Some(2.0));
        assert_eq!(tracker.last_scalar("FID"), None);
    }
}
