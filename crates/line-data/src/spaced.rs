use std::{collections::HashMap, fs, path::Path};

use crate::DataError;

/// Precomputed per-timestep label alignments, keyed by sample name
/// (`"{author}_{line}"`).
///
/// The on-disk record is a two-dimensional array with exactly one label index
/// per row (one decoded timestep each); this is validated at load time.
#[derive(Debug, Clone)]
pub struct SpacedStore {
    by_name: HashMap<String, Vec<u32>>,
}

impl SpacedStore {
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DataError::spaced(format!("failed to read {}: {}", path.display(), err))
        })?;
        let raw: HashMap<String, Vec<Vec<u32>>> =
            serde_json::from_str(&contents).map_err(|err| {
                DataError::spaced(format!("failed to parse {}: {}", path.display(), err))
            })?;

        let mut by_name = HashMap::with_capacity(raw.len());
        for (name, rows) in raw {
            let mut flat = Vec::with_capacity(rows.len());
            for row in &rows {
                if row.len() != 1 {
                    return Err(DataError::spaced(format!(
                        "entry '{}' has a row with {} indices; expected exactly one per timestep",
                        name,
                        row.len()
                    )));
                }
                flat.push(row[0]);
            }
            by_name.insert(name, flat);
        }
        Ok(Self { by_name })
    }

    pub fn get(&self, name: &str) -> Option<&[u32]> {
        self.by_name.get(name).map(Vec::as_slice)
    }
}
