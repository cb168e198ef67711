use candle_core::{Device, Tensor};
use line_data::{collate, AuthorGroup, Batch, LineDataset, Planar, Sample};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::debug;

use crate::TrainingError;

/// One collated batch materialized as candle tensors.
pub struct TensorBatch {
    /// `[n, 1, h, w]` remapped pixels.
    pub images: Tensor,
    /// `[n, max_label_len]` zero-padded character indices.
    pub labels: Tensor,
    pub label_lengths: Vec<usize>,
    /// `[n, t]` per-timestep alignments, when configured.
    pub spaced_labels: Option<Tensor>,
    /// `[n, d]` style vectors, when configured.
    pub styles: Option<Tensor>,
    pub fg_masks: Option<Tensor>,
    pub changed_images: Option<Tensor>,
    pub gt: Vec<String>,
    pub names: Vec<String>,
    pub size: usize,
}

/// Draws author groups from the dataset in a seeded per-epoch shuffle,
/// filters skip sentinels, collates, and uploads to the device.
pub struct BatchLoader {
    dataset: LineDataset,
    device: Device,
    groups_per_batch: usize,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    seed: u64,
}

impl BatchLoader {
    pub fn new(
        dataset: LineDataset,
        groups_per_batch: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self, TrainingError> {
        if groups_per_batch == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than 0",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization(
                "dataset contains no samples",
            ));
        }
        let mut loader = Self {
            dataset,
            device,
            groups_per_batch,
            order: Vec::new(),
            cursor: 0,
            epoch: 0,
            seed,
        };
        loader.shuffle();
        Ok(loader)
    }

    pub fn dataset(&self) -> &LineDataset {
        &self.dataset
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Returns the next batch, or `None` when the epoch is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<TensorBatch>, TrainingError> {
        let span = self.groups_per_batch * self.dataset.a_batch_size();
        loop {
            if self.cursor >= self.order.len() {
                return Ok(None);
            }
            let end = (self.cursor + span).min(self.order.len());
            let indices = &self.order[self.cursor..end];
            self.cursor = end;

            let mut samples: Vec<Sample> = Vec::with_capacity(indices.len());
            for &index in indices {
                if let Some(sample) = self.dataset.fetch(index)? {
                    samples.push(sample);
                } else {
                    debug!("skipping sample {}", index);
                }
            }
            if samples.is_empty() {
                continue;
            }

            let groups: Vec<AuthorGroup> = samples
                .chunks(self.dataset.a_batch_size())
                .map(|chunk| AuthorGroup {
                    samples: chunk.to_vec(),
                })
                .collect();
            let batch = collate(&groups)?;
            return Ok(Some(materialize(batch, &self.device)?));
        }
    }

    /// Starts the next epoch with a fresh deterministic shuffle.
    pub fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.shuffle();
    }

    /// Jumps to `epoch` and reshuffles, used when resuming a run.
    pub fn seek_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.shuffle();
    }

    fn shuffle(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }
}

fn materialize(batch: Batch, device: &Device) -> Result<TensorBatch, TrainingError> {
    let n = batch.len();

    let images = planar_to_tensor(&batch.images, device)?;
    let fg_masks = match &batch.fg_masks {
        Some(planar) => Some(planar_to_tensor(planar, device)?),
        None => None,
    };
    let changed_images = match &batch.changed_images {
        Some(planar) => Some(planar_to_tensor(planar, device)?),
        None => None,
    };

    let labels = time_major_to_tensor(&batch.labels, batch.max_label_len, n, device)?;
    let spaced_labels = match &batch.spaced_labels {
        Some(data) => Some(time_major_to_tensor(data, batch.max_spaced_len, n, device)?),
        None => None,
    };

    let styles = match &batch.styles {
        Some((flat, dim)) => Some(
            Tensor::from_vec(flat.clone(), (n, *dim), device).map_err(to_runtime_error)?,
        ),
        None => None,
    };

    Ok(TensorBatch {
        images,
        labels,
        label_lengths: batch.label_lengths,
        spaced_labels,
        styles,
        fg_masks,
        changed_images,
        gt: batch.gt,
        names: batch.names,
        size: n,
    })
}

fn planar_to_tensor(planar: &Planar, device: &Device) -> Result<Tensor, TrainingError> {
    Tensor::from_vec(
        planar.data.clone(),
        (planar.n, planar.c, planar.h, planar.w),
        device,
    )
    .map_err(to_runtime_error)
}

/// `[t, n]` row-major on the data side becomes `[n, t]` on the tensor side.
fn time_major_to_tensor(
    data: &[i64],
    t: usize,
    n: usize,
    device: &Device,
) -> Result<Tensor, TrainingError> {
    Tensor::from_vec(data.to_vec(), (t, n), device)
        .map_err(to_runtime_error)?
        .transpose(0, 1)
        .map_err(to_runtime_error)?
        .contiguous()
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use line_data::LineImage;

    fn sample(width: usize, label: &[u32]) -> Sample {
        Sample {
            image: LineImage::filled(8, width, 0.25),
            gt: "x".repeat(label.len()),
            label: label.to_vec(),
            spaced_label: Some(label.to_vec()),
            style: None,
            fg_mask: None,
            changed_image: None,
            author: "0".into(),
            author_idx: 0,
            name: format!("0_{}", width),
        }
    }

    #[test]
    fn materialized_shapes_match_collated_batch() {
        let groups = vec![AuthorGroup {
            samples: vec![sample(10, &[1, 2]), sample(6, &[3])],
        }];
        let batch = collate(&groups).unwrap();
        let tensors = materialize(batch, &Device::Cpu).unwrap();
        assert_eq!(tensors.images.dims(), &[2, 1, 8, 10]);
        assert_eq!(tensors.labels.dims(), &[2, 2]);
        assert_eq!(tensors.label_lengths, vec![2, 1]);
        let spaced = tensors.spaced_labels.unwrap();
        assert_eq!(spaced.dims(), &[2, 2]);
        // zero padding lands at the end of the shorter row
        let rows = tensors.labels.to_vec2::<i64>().unwrap();
        assert_eq!(rows, vec![vec![1, 2], vec![3, 0]]);
    }
}
