use std::{
    collections::{HashMap, HashSet},
    fs,
};

use rand::Rng;
use serde::Deserialize;

use crate::DataError;

/// On-disk style record: parallel arrays over precomputed style vectors.
#[derive(Debug, Deserialize)]
struct StyleFile {
    authors: Vec<String>,
    styles: Vec<Vec<f32>>,
    ids: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
struct StyleEntry {
    vector: Vec<f32>,
    ids: HashSet<String>,
}

/// Author-grouped store of precomputed style vectors.
///
/// Each entry is tagged with the sample ids it was computed from; resolving a
/// style for a sample excludes every entry tagged with that sample's own id,
/// so a sample never sees its own style fingerprint.
#[derive(Debug, Clone)]
pub struct StyleStore {
    by_author: HashMap<String, Vec<StyleEntry>>,
    dim: usize,
}

impl StyleStore {
    /// Loads and merges every file matching `pattern` (a trailing `*` is
    /// appended when missing). At least one file must match.
    pub fn load(pattern: &str) -> Result<Self, DataError> {
        let pattern = if pattern.ends_with('*') {
            pattern.to_string()
        } else {
            format!("{}*", pattern)
        };

        let paths: Vec<_> = glob::glob(&pattern)
            .map_err(|err| DataError::style(format!("bad style glob '{}': {}", pattern, err)))?
            .collect::<Result<_, _>>()
            .map_err(|err| DataError::style(format!("style glob failed: {}", err)))?;
        if paths.is_empty() {
            return Err(DataError::style(format!(
                "no style files match '{}'",
                pattern
            )));
        }

        let mut by_author: HashMap<String, Vec<StyleEntry>> = HashMap::new();
        let mut dim = 0usize;
        for path in paths {
            let contents = fs::read_to_string(&path).map_err(|err| {
                DataError::style(format!("failed to read {}: {}", path.display(), err))
            })?;
            let file: StyleFile = serde_json::from_str(&contents).map_err(|err| {
                DataError::style(format!("failed to parse {}: {}", path.display(), err))
            })?;
            if file.authors.len() != file.styles.len() || file.authors.len() != file.ids.len() {
                return Err(DataError::style(format!(
                    "{}: authors/styles/ids arrays differ in length",
                    path.display()
                )));
            }
            for ((author, vector), ids) in file
                .authors
                .into_iter()
                .zip(file.styles)
                .zip(file.ids)
            {
                if dim == 0 {
                    dim = vector.len();
                } else if vector.len() != dim {
                    return Err(DataError::style(format!(
                        "style vector length {} differs from established length {}",
                        vector.len(),
                        dim
                    )));
                }
                by_author.entry(author).or_default().push(StyleEntry {
                    vector,
                    ids: ids.into_iter().collect(),
                });
            }
        }

        Ok(Self { by_author, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn has_author(&self, author: &str) -> bool {
        self.by_author.contains_key(author)
    }

    /// Draws one style vector for `(author, sample_id)` from the entries not
    /// tagged with `sample_id`. Returns `None` when the author is unknown or
    /// every entry is excluded.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        author: &str,
        sample_id: &str,
        rng: &mut R,
    ) -> Option<&[f32]> {
        let entries = self.by_author.get(author)?;
        let eligible: Vec<&StyleEntry> = entries
            .iter()
            .filter(|entry| !entry.ids.contains(sample_id))
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let pick = rng.gen_range(0..eligible.len());
        Some(&eligible[pick].vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::Write;

    fn store_with(entries: serde_json::Value) -> (tempfile::TempDir, StyleStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("styles_0.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{}", entries).unwrap();
        let store = StyleStore::load(dir.path().join("styles").to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn sample_never_returns_own_entry() {
        let (_dir, store) = store_with(serde_json::json!({
            "authors": ["0", "0"],
            "styles": [[1.0, 1.0], [2.0, 2.0]],
            "ids": [["0_1"], ["0_2"]],
        }));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let style = store.sample("0", "0_1", &mut rng).unwrap();
            assert_eq!(style, &[2.0, 2.0]);
        }
    }

    #[test]
    fn fully_excluded_author_yields_none() {
        let (_dir, store) = store_with(serde_json::json!({
            "authors": ["0"],
            "styles": [[1.0]],
            "ids": [["0_1"]],
        }));
        let mut rng = StdRng::seed_from_u64(3);
        assert!(store.sample("0", "0_1", &mut rng).is_none());
        assert!(store.sample("9", "9_1", &mut rng).is_none());
    }

    #[test]
    fn empty_glob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("missing").to_str().unwrap().to_string();
        assert!(StyleStore::load(&pattern).is_err());
    }
}
