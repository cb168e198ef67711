use crate::{dataset::Sample, DataError};

/// Fill value for padded image regions, chosen to sit just below the remapped
/// background level.
pub const PADDING_CONSTANT: f32 = -1.0 / 255.0;

/// Samples fetched for one author, batched together so style supervision sees
/// several lines of the same hand.
#[derive(Debug, Clone)]
pub struct AuthorGroup {
    pub samples: Vec<Sample>,
}

/// Dense NCHW buffer. `c` is always 1 for grayscale lines.
#[derive(Debug, Clone)]
pub struct Planar {
    pub data: Vec<f32>,
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Planar {
    fn filled(n: usize, h: usize, w: usize, fill: f32) -> Self {
        Self {
            data: vec![fill; n * h * w],
            n,
            c: 1,
            h,
            w,
        }
    }

    fn paste(&mut self, index: usize, img: &crate::normalize::LineImage) {
        for y in 0..img.height {
            let dst = (index * self.h + y) * self.w;
            let src = y * img.width;
            self.data[dst..dst + img.width].copy_from_slice(&img.data[src..src + img.width]);
        }
    }
}

/// A collated batch. Images are left-aligned in a width-padded buffer; labels
/// are time-major (`data[t * n + b]`) and zero-padded.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Planar,
    pub fg_masks: Option<Planar>,
    pub changed_images: Option<Planar>,
    pub labels: Vec<i64>,
    pub max_label_len: usize,
    pub label_lengths: Vec<usize>,
    pub spaced_labels: Option<Vec<i64>>,
    pub max_spaced_len: usize,
    pub styles: Option<(Vec<f32>, usize)>,
    pub gt: Vec<String>,
    pub authors: Vec<String>,
    pub author_idxs: Vec<usize>,
    pub names: Vec<String>,
    pub a_batch_size: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.n
    }

    pub fn is_empty(&self) -> bool {
        self.images.n == 0
    }
}

/// Flattens the author groups and pads every per-sample field to the batch
/// maximum. All samples must share a height, and the optional fields (masks,
/// changed views, styles, spaced labels) must be present on all samples or on
/// none.
pub fn collate(groups: &[AuthorGroup]) -> Result<Batch, DataError> {
    let samples: Vec<&Sample> = groups.iter().flat_map(|g| g.samples.iter()).collect();
    if samples.is_empty() {
        return Err(DataError::collate("cannot collate an empty batch"));
    }
    let a_batch_size = groups[0].samples.len();

    let height = samples[0].image.height;
    for sample in &samples {
        if sample.image.height != height {
            return Err(DataError::collate(format!(
                "mixed image heights in batch: {} and {}",
                height, sample.image.height
            )));
        }
    }
    for flag in [
        samples
            .iter()
            .map(|s| s.fg_mask.is_some())
            .collect::<Vec<_>>(),
        samples
            .iter()
            .map(|s| s.changed_image.is_some())
            .collect::<Vec<_>>(),
        samples.iter().map(|s| s.style.is_some()).collect::<Vec<_>>(),
        samples
            .iter()
            .map(|s| s.spaced_label.is_some())
            .collect::<Vec<_>>(),
    ] {
        if flag.iter().any(|&b| b) && !flag.iter().all(|&b| b) {
            return Err(DataError::collate(
                "optional fields must be present on every sample or on none",
            ));
        }
    }

    let n = samples.len();
    let max_width = samples.iter().map(|s| s.image.width).max().unwrap_or(0);

    let mut images = Planar::filled(n, height, max_width, PADDING_CONSTANT);
    for (i, sample) in samples.iter().enumerate() {
        images.paste(i, &sample.image);
    }

    let fg_masks = if samples[0].fg_mask.is_some() {
        let mut masks = Planar::filled(n, height, max_width, 0.0);
        for (i, sample) in samples.iter().enumerate() {
            if let Some(mask) = &sample.fg_mask {
                if mask.height != height || mask.width != sample.image.width {
                    return Err(DataError::collate(format!(
                        "mask shape {}x{} does not match image {}x{}",
                        mask.height, mask.width, height, sample.image.width
                    )));
                }
                masks.paste(i, mask);
            }
        }
        Some(masks)
    } else {
        None
    };

    let changed_images = if samples[0].changed_image.is_some() {
        let mut changed = Planar::filled(n, height, max_width, PADDING_CONSTANT);
        for (i, sample) in samples.iter().enumerate() {
            if let Some(view) = &sample.changed_image {
                changed.paste(i, view);
            }
        }
        Some(changed)
    } else {
        None
    };

    let max_label_len = samples.iter().map(|s| s.label.len()).max().unwrap_or(0);
    let mut labels = vec![0i64; max_label_len * n];
    let mut label_lengths = Vec::with_capacity(n);
    for (b, sample) in samples.iter().enumerate() {
        for (t, &idx) in sample.label.iter().enumerate() {
            labels[t * n + b] = idx as i64;
        }
        label_lengths.push(sample.label.len());
    }

    let (spaced_labels, max_spaced_len) = if samples[0].spaced_label.is_some() {
        let max_len = samples
            .iter()
            .filter_map(|s| s.spaced_label.as_ref().map(Vec::len))
            .max()
            .unwrap_or(0);
        let mut spaced = vec![0i64; max_len * n];
        for (b, sample) in samples.iter().enumerate() {
            if let Some(row) = &sample.spaced_label {
                for (t, &idx) in row.iter().enumerate() {
                    spaced[t * n + b] = idx as i64;
                }
            }
        }
        (Some(spaced), max_len)
    } else {
        (None, 0)
    };

    let styles = if let Some(first) = &samples[0].style {
        let dim = first.len();
        let mut flat = Vec::with_capacity(n * dim);
        for sample in &samples {
            let style = sample
                .style
                .as_ref()
                .ok_or_else(|| DataError::collate("missing style vector"))?;
            if style.len() != dim {
                return Err(DataError::collate(format!(
                    "style dim {} does not match established dim {}",
                    style.len(),
                    dim
                )));
            }
            flat.extend_from_slice(style);
        }
        Some((flat, dim))
    } else {
        None
    };

    Ok(Batch {
        images,
        fg_masks,
        changed_images,
        labels,
        max_label_len,
        label_lengths,
        spaced_labels,
        max_spaced_len,
        styles,
        gt: samples.iter().map(|s| s.gt.clone()).collect(),
        authors: samples.iter().map(|s| s.author.clone()).collect(),
        author_idxs: samples.iter().map(|s| s.author_idx).collect(),
        names: samples.iter().map(|s| s.name.clone()).collect(),
        a_batch_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::LineImage;

    fn sample(width: usize, label: &[u32]) -> Sample {
        Sample {
            image: LineImage::filled(8, width, 0.5),
            gt: "x".repeat(label.len()),
            label: label.to_vec(),
            spaced_label: None,
            style: None,
            fg_mask: None,
            changed_image: None,
            author: "0".into(),
            author_idx: 0,
            name: format!("0_{}", width),
        }
    }

    fn group(samples: Vec<Sample>) -> AuthorGroup {
        AuthorGroup { samples }
    }

    #[test]
    fn pads_to_widest_sample() {
        let batch = collate(&[group(vec![sample(10, &[1]), sample(6, &[2, 3])])]).unwrap();
        assert_eq!(batch.images.n, 2);
        assert_eq!(batch.images.w, 10);
        // sample 1 row 0: real pixels then padding
        let row = &batch.images.data[(1 * 8) * 10..(1 * 8) * 10 + 10];
        assert_eq!(row[5], 0.5);
        assert!((row[6] - PADDING_CONSTANT).abs() < 1e-6);
        assert!((row[9] - PADDING_CONSTANT).abs() < 1e-6);
    }

    #[test]
    fn labels_are_time_major_and_zero_padded() {
        let batch = collate(&[group(vec![sample(4, &[7]), sample(4, &[8, 9])])]).unwrap();
        assert_eq!(batch.max_label_len, 2);
        assert_eq!(batch.label_lengths, vec![1, 2]);
        // t=0: [7, 8]; t=1: [0, 9]
        assert_eq!(batch.labels, vec![7, 8, 0, 9]);
    }

    #[test]
    fn single_sample_batch() {
        let batch = collate(&[group(vec![sample(12, &[1, 2, 3])])]).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.images.w, 12);
        assert_eq!(batch.a_batch_size, 1);
    }

    #[test]
    fn mixed_heights_rejected() {
        let tall = Sample {
            image: LineImage::filled(16, 4, 0.0),
            ..sample(4, &[1])
        };
        assert!(collate(&[group(vec![sample(4, &[1]), tall])]).is_err());
    }

    #[test]
    fn partial_styles_rejected() {
        let mut styled = sample(4, &[1]);
        styled.style = Some(vec![0.1, 0.2]);
        assert!(collate(&[group(vec![styled, sample(4, &[2])])]).is_err());
    }

    #[test]
    fn empty_batch_rejected() {
        assert!(collate(&[]).is_err());
    }

    #[test]
    fn groups_flatten_and_record_group_size() {
        let batch = collate(&[
            group(vec![sample(4, &[1]), sample(4, &[2])]),
            group(vec![sample(4, &[3]), sample(4, &[4])]),
        ])
        .unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.a_batch_size, 2);
    }
}
