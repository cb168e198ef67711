use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    augment::{self, AffineParams, StrokeParams, MAX_SKEW_RAD, MAX_STRETCH},
    codec::CharCodec,
    manifest,
    normalize::{self, LineImage},
    spaced::SpacedStore,
    style::StyleStore,
    DataError,
};

/// Manifest folders of the BEST corpus releases.
const TRAIN_FOLDERS: &[&str] = &[
    "best2019-r31-with-label",
    "best2019-r32-with-label",
    "best2019-r33-with-label",
    "best2019-r34-with-label",
    "best2019-r35-with-label",
    "best2019-r36-with-label",
    "best2020-r31-with-label",
];
const TEST_FOLDERS: &[&str] = &["best2020-r33-1001to2640-with-label"];

/// The corpus has no author annotations; every line belongs to the single
/// placeholder author.
const SINGLE_AUTHOR: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
    Valid,
}

impl std::str::FromStr for Split {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            "valid" => Ok(Split::Valid),
            other => Err(DataError::config(format!("unknown split '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentationMode {
    None,
    Affine,
    Normalization,
    Warp,
}

impl Default for AugmentationMode {
    fn default() -> Self {
        AugmentationMode::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub img_height: usize,
    #[serde(default = "default_max_width")]
    pub max_width: usize,
    #[serde(default = "default_a_batch_size")]
    pub a_batch_size: usize,
    #[serde(default)]
    pub no_spaces: bool,
    #[serde(default)]
    pub augmentation: AugmentationMode,
    #[serde(default)]
    pub include_stroke_aug: bool,
    #[serde(default)]
    pub remove_bg: bool,
    #[serde(default)]
    pub fg_masks_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_normalized: Option<PathBuf>,
    pub char_file: PathBuf,
    #[serde(default)]
    pub style_loc: Option<String>,
    #[serde(default)]
    pub spaced_loc: Option<PathBuf>,
    #[serde(default)]
    pub identity_spaced: bool,
    #[serde(default)]
    pub only_author: Option<String>,
    #[serde(default)]
    pub skip_author: Option<String>,
}

fn default_max_width() -> usize {
    3000
}

fn default_a_batch_size() -> usize {
    1
}

/// One fully preprocessed training example.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Remapped pixels, fixed height, variable width.
    pub image: LineImage,
    /// Ground-truth transcription.
    pub gt: String,
    /// Character indices for `gt`.
    pub label: Vec<u32>,
    /// Per-timestep alignment, when configured.
    pub spaced_label: Option<Vec<u32>>,
    /// Writer style vector, when configured.
    pub style: Option<Vec<f32>>,
    /// Ink/background mask, same spatial size as `image`.
    pub fg_mask: Option<LineImage>,
    /// Stroke-augmented second view.
    pub changed_image: Option<LineImage>,
    pub author: String,
    pub author_idx: usize,
    pub name: String,
}

/// Indexed corpus of (image path, transcription) pairs with per-fetch
/// preprocessing.
pub struct LineDataset {
    images: Vec<(PathBuf, String)>,
    codec: CharCodec,
    img_height: usize,
    max_width: usize,
    a_batch_size: usize,
    no_spaces: bool,
    augmentation: AugmentationMode,
    include_stroke_aug: bool,
    remove_bg: bool,
    fg_masks_dir: Option<PathBuf>,
    cache_normalized: Option<PathBuf>,
    styles: Option<StyleStore>,
    spaced: Option<SpacedStore>,
    identity_spaced: bool,
    author_list: Vec<String>,
    max_char_len: usize,
    max_stretch: f32,
    max_skew_rad: f32,
    upsample_warned: AtomicBool,
}

impl LineDataset {
    pub fn new(root: &Path, split: Split, config: &DatasetConfig) -> Result<Self, DataError> {
        if config.only_author.is_some() {
            return Err(DataError::config(
                "only_author is not implemented for this corpus; there are no author annotations",
            ));
        }
        if config.skip_author.is_some() {
            return Err(DataError::config(
                "skip_author is not implemented for this corpus; there are no author annotations",
            ));
        }
        if config.augmentation == AugmentationMode::Warp && config.fg_masks_dir.is_some() {
            return Err(DataError::config(
                "warp augmentation is incompatible with foreground masks",
            ));
        }
        if config.remove_bg && config.fg_masks_dir.is_none() {
            return Err(DataError::config(
                "remove_bg requires fg_masks_dir for the foreground mask",
            ));
        }
        if config.identity_spaced && config.spaced_loc.is_some() {
            return Err(DataError::config(
                "identity_spaced and spaced_loc are mutually exclusive",
            ));
        }
        if config.a_batch_size == 0 {
            return Err(DataError::config("a_batch_size must be greater than 0"));
        }

        let folders: &[&str] = match split {
            Split::Train => TRAIN_FOLDERS,
            Split::Test => TEST_FOLDERS,
            Split::Valid => {
                warn!("no validation partition exists; using the test set for validation");
                TEST_FOLDERS
            }
        };

        let mut images = Vec::new();
        let mut max_char_len = 0usize;
        for folder in folders {
            let folder = root.join(folder);
            for record in manifest::scan_folder(&folder)? {
                max_char_len = max_char_len.max(record.transcription.chars().count());
                images.push((record.image_path, record.transcription));
            }
        }

        let codec = CharCodec::from_file(&config.char_file)?;

        let styles = match &config.style_loc {
            Some(pattern) => {
                let store = StyleStore::load(pattern)?;
                if !store.has_author(SINGLE_AUTHOR) {
                    return Err(DataError::style(format!(
                        "style store has no entries for author '{}'",
                        SINGLE_AUTHOR
                    )));
                }
                Some(store)
            }
            None => None,
        };

        let spaced = match &config.spaced_loc {
            Some(path) => Some(SpacedStore::load(path)?),
            None => None,
        };

        if let Some(dir) = &config.cache_normalized {
            fs::create_dir_all(dir)?;
        }
        if let Some(dir) = &config.fg_masks_dir {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            images,
            codec,
            img_height: config.img_height,
            max_width: config.max_width,
            a_batch_size: config.a_batch_size,
            no_spaces: config.no_spaces,
            augmentation: config.augmentation,
            include_stroke_aug: config.include_stroke_aug,
            remove_bg: config.remove_bg,
            fg_masks_dir: config.fg_masks_dir.clone(),
            cache_normalized: config.cache_normalized.clone(),
            styles,
            spaced,
            identity_spaced: config.identity_spaced,
            author_list: vec![SINGLE_AUTHOR.to_string()],
            max_char_len,
            max_stretch: MAX_STRETCH,
            max_skew_rad: MAX_SKEW_RAD,
            upsample_warned: AtomicBool::new(false),
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Longest transcription seen across the whole corpus.
    pub fn max_transcription_len(&self) -> usize {
        self.max_char_len
    }

    pub fn a_batch_size(&self) -> usize {
        self.a_batch_size
    }

    pub fn codec(&self) -> &CharCodec {
        &self.codec
    }

    pub fn authors(&self) -> &[String] {
        &self.author_list
    }

    /// Fetches and preprocesses one sample. Returns `Ok(None)` — the skip
    /// sentinel — when the image is unreadable or its ground truth is empty;
    /// callers must filter these out before collation.
    pub fn fetch(&self, index: usize) -> Result<Option<Sample>, DataError> {
        let mut rng = thread_rng();

        let (img_path, raw_gt) = &self.images[index];
        let author = SINGLE_AUTHOR;
        let name = format!("{}_{}", author, index);

        let gt = if self.no_spaces {
            raw_gt.replace(' ', "")
        } else {
            raw_gt.clone()
        };

        let img = match LineImage::open_grayscale(img_path) {
            Ok(img) => img,
            Err(err) => {
                warn!("could not read image {}: {}", img_path.display(), err);
                return Ok(None);
            }
        };

        let normalized = normalize::normalize_height(img, self.img_height, self.max_width);
        if normalized.upsampled && !self.upsample_warned.swap(true, Ordering::Relaxed) {
            warn!("upsampling image to fit target height");
        }
        let mut img = normalized.image;

        let mut affine = if self.augmentation == AugmentationMode::Affine {
            let mut params = AffineParams::draw(&mut rng, self.max_stretch, self.max_skew_rad);
            params.cap_stretch(img.width, self.max_width);
            Some(params)
        } else {
            None
        };

        let mut fg_mask = match &self.fg_masks_dir {
            Some(dir) => Some(self.resolve_fg_mask(dir, &name, &img)?),
            None => None,
        };

        match self.augmentation {
            AugmentationMode::None => {}
            AugmentationMode::Normalization => {
                img = normalize::deskew(&img);
                img = normalize::skeletonize(&img);
                if let Some(dir) = &self.cache_normalized {
                    write_if_absent(&dir.join(format!("{}.png", name)), &img)?;
                }
            }
            AugmentationMode::Affine => {
                let params = affine.take().unwrap_or(AffineParams {
                    skew: 0.0,
                    stretch: 1.0,
                });
                let (warped, warped_mask) = augment::affine_trans(&img, fg_mask.as_ref(), params);
                img = warped;
                fg_mask = warped_mask;
            }
            AugmentationMode::Warp => {
                augment::brightness_jitter(&mut img, &mut rng);
                img = augment::grid_warp(&img, &mut rng);
            }
        }

        let changed_image = if self.include_stroke_aug {
            let params = StrokeParams::draw(&mut rng);
            Some(augment::change_thickness(&img, params, &mut rng))
        } else {
            None
        };

        if self.remove_bg {
            let mask = fg_mask
                .as_ref()
                .ok_or_else(|| DataError::config("remove_bg without a foreground mask"))?;
            normalize::remap_remove_bg(&mut img, mask);
        } else {
            normalize::remap_plain(&mut img);
        }

        if gt.is_empty() {
            return Ok(None);
        }
        let label = self.codec.encode(&gt)?;

        let style = match &self.styles {
            Some(store) => {
                let vector = store.sample(author, &name, &mut rng).ok_or_else(|| {
                    DataError::style(format!(
                        "no eligible style vector for author '{}' excluding id '{}'",
                        author, name
                    ))
                })?;
                Some(vector.to_vec())
            }
            None => None,
        };

        let spaced_label = if self.identity_spaced {
            Some(label.clone())
        } else {
            match &self.spaced {
                Some(store) => Some(
                    store
                        .get(&name)
                        .ok_or_else(|| {
                            DataError::spaced(format!("no spaced label for sample '{}'", name))
                        })?
                        .to_vec(),
                ),
                None => None,
            }
        };

        Ok(Some(Sample {
            image: img,
            gt,
            label,
            spaced_label,
            style,
            fg_mask,
            changed_image,
            author: author.to_string(),
            author_idx: 0,
            name,
        }))
    }

    /// Loads the sample's foreground mask, computing and persisting a
    /// synthetic one when the cached file is absent. A cached mask whose
    /// shape disagrees with the image is replaced by a recomputed synthetic
    /// mask with a diagnostic; this never fails the fetch.
    fn resolve_fg_mask(
        &self,
        dir: &Path,
        name: &str,
        img: &LineImage,
    ) -> Result<LineImage, DataError> {
        let path = dir.join(format!("{}.png", name));
        if path.is_file() {
            let mask = LineImage::open_grayscale(&path)?;
            if mask.height == img.height && mask.width == img.width {
                let mut mask = mask;
                for v in &mut mask.data {
                    *v /= 255.0;
                }
                return Ok(mask);
            }
            warn!(
                "foreground mask {} is {}x{} but image is {}x{}; recomputing",
                path.display(),
                mask.height,
                mask.width,
                img.height,
                img.width
            );
            return Ok(synthetic_fg_mask(img));
        }

        let mask = synthetic_fg_mask(img);
        let mut stored = mask.clone();
        for v in &mut stored.data {
            *v *= 255.0;
        }
        write_if_absent(&path, &stored)?;
        Ok(mask)
    }
}

/// Otsu-thresholded, inverted, dilated ink mask with values in `[0, 1]`.
fn synthetic_fg_mask(img: &LineImage) -> LineImage {
    let gray = img.to_luma8();
    let level = otsu_level(&gray);
    let ink = threshold(&gray, level, ThresholdType::BinaryInverted);
    let dilated = dilate(&ink, Norm::LInf, 4);
    let mut mask = LineImage::from_luma8(&dilated);
    for v in &mut mask.data {
        *v /= 255.0;
    }
    mask
}

/// Idempotent side-store write: racing writers produce the same bytes, so a
/// pre-existing file is simply kept.
fn write_if_absent(path: &Path, img: &LineImage) -> Result<(), DataError> {
    if path.exists() {
        return Ok(());
    }
    img.to_luma8()
        .save(path)
        .map_err(|err| DataError::image(format!("failed to write {}: {}", path.display(), err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_line_image(path: &Path, height: u32, width: u32) {
        let mut img = image::GrayImage::from_pixel(width, height, image::Luma([255u8]));
        for x in 0..width {
            img.put_pixel(x, height / 2, image::Luma([0u8]));
        }
        img.save(path).unwrap();
    }

    fn corpus(root: &Path, lines: &[(&str, &str)]) {
        for folder in TRAIN_FOLDERS {
            fs::create_dir_all(root.join(folder)).unwrap();
            fs::File::create(root.join(folder).join("lines.label")).unwrap();
        }
        let folder = root.join(TRAIN_FOLDERS[0]);
        let mut manifest = fs::File::create(folder.join("lines.label")).unwrap();
        for (file, gt) in lines {
            writeln!(manifest, "{} {}", file, gt).unwrap();
            write_line_image(&folder.join(file), 64, 320);
        }
    }

    fn char_file(dir: &Path) -> PathBuf {
        let path = dir.join("chars.json");
        let mut map = serde_json::Map::new();
        for (i, ch) in "ABCDEFGHIJKLMNOPQRSTUVWXYZ".chars().enumerate() {
            map.insert(ch.to_string(), serde_json::json!(i + 1));
        }
        let doc = serde_json::json!({ "char_to_idx": map });
        fs::write(&path, doc.to_string()).unwrap();
        path
    }

    fn base_config(dir: &Path) -> DatasetConfig {
        DatasetConfig {
            img_height: 32,
            max_width: 3000,
            a_batch_size: 1,
            no_spaces: false,
            augmentation: AugmentationMode::None,
            include_stroke_aug: false,
            remove_bg: false,
            fg_masks_dir: None,
            cache_normalized: None,
            char_file: char_file(dir),
            style_loc: None,
            spaced_loc: None,
            identity_spaced: false,
            only_author: None,
            skip_author: None,
        }
    }

    #[test]
    fn fetch_joins_tokens_without_separator() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[("0001.png", "HELLO WORLD")]);
        let dataset =
            LineDataset::new(dir.path(), Split::Train, &base_config(dir.path())).unwrap();
        assert_eq!(dataset.len(), 1);
        let sample = dataset.fetch(0).unwrap().unwrap();
        assert_eq!(sample.gt, "HELLOWORLD");
        assert_eq!(sample.image.height, 32);
        assert_eq!(sample.label.len(), 10);
        assert_eq!(sample.name, "0_0");
    }

    #[test]
    fn unreadable_image_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[("0001.png", "ABC")]);
        let folder = dir.path().join(TRAIN_FOLDERS[0]);
        fs::write(folder.join("0001.png"), b"not a png").unwrap();
        let dataset =
            LineDataset::new(dir.path(), Split::Train, &base_config(dir.path())).unwrap();
        assert!(dataset.fetch(0).unwrap().is_none());
    }

    #[test]
    fn unsupported_author_filter_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[("0001.png", "ABC")]);
        let mut config = base_config(dir.path());
        config.only_author = Some("7".into());
        assert!(LineDataset::new(dir.path(), Split::Train, &config).is_err());
    }

    #[test]
    fn identity_spaced_mirrors_label() {
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[("0001.png", "ABC")]);
        let mut config = base_config(dir.path());
        config.identity_spaced = true;
        let dataset = LineDataset::new(dir.path(), Split::Train, &config).unwrap();
        let sample = dataset.fetch(0).unwrap().unwrap();
        assert_eq!(sample.spaced_label.as_deref(), Some(sample.label.as_slice()));
    }

    #[test]
    fn fg_mask_cache_is_written_once(){
        let dir = tempfile::tempdir().unwrap();
        corpus(dir.path(), &[("0001.png", "ABC")]);
        let mut config = base_config(dir.path());
        let mask_dir = dir.path().join("masks");
        config.fg_masks_dir = Some(mask_dir.clone());
        let dataset = LineDataset::new(dir.path(), Split::Train, &config).unwrap();
        let sample = dataset.fetch(0).unwrap().unwrap();
        let mask = sample.fg_mask.unwrap();
        assert_eq!(mask.height, sample.image.height);
        assert_eq!(mask.width, sample.image.width);
        assert!(mask_dir.join("0_0.png").is_file());
        // second fetch reads the cached file
        let again = dataset.fetch(0).unwrap().unwrap();
        assert!(again.fg_mask.is_some());
    }
}
