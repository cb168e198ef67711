use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TrainingError;

/// Append-only training log.
///
/// Entries are stored under consecutive 1-based integer keys and can never be
/// mutated or removed; resuming a run appends after the highest existing key.
/// Serialized form is indented JSON with keys in ascending order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingHistory {
    entries: BTreeMap<u64, Value>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, TrainingError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainingError::runtime(format!("failed to read history {}: {}", path.display(), err))
        })?;
        serde_json::from_str(&contents).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to parse history {}: {}",
                path.display(),
                err
            ))
        })
    }

    /// Appends one entry and returns the key it was stored under.
    pub fn add_entry(&mut self, value: Value) -> u64 {
        let key = self.entries.keys().next_back().copied().unwrap_or(0) + 1;
        self.entries.insert(key, value);
        key
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<&Value> {
        self.entries.get(&key)
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        let json = serde_json::to_string_pretty(&self.entries).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize history: {}", err))
        })?;
        fs::write(path, json + "\n").map_err(|err| {
            TrainingError::runtime(format!(
                "failed to write history {}: {}",
                path.display(),
                err
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_consecutive_and_ordered() {
        let mut history = TrainingHistory::new();
        assert_eq!(history.add_entry(json!({"loss": 2.0})), 1);
        assert_eq!(history.add_entry(json!({"loss": 1.5})), 2);
        assert_eq!(history.add_entry(json!({"loss": 1.2})), 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history.get(2).unwrap()["loss"], 1.5);
    }

    #[test]
    fn round_trip_appends_after_highest_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut history = TrainingHistory::new();
        history.add_entry(json!({"step": 1}));
        history.add_entry(json!({"step": 2}));
        history.save(&path).unwrap();

        let mut reloaded = TrainingHistory::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.add_entry(json!({"step": 3})), 3);
    }

    #[test]
    fn serialized_keys_ascend() {
        let mut history = TrainingHistory::new();
        for step in 0..12 {
            history.add_entry(json!({ "step": step }));
        }
        let json = serde_json::to_string(&history).unwrap();
        let nine = json.find("\"9\"").unwrap();
        let ten = json.find("\"10\"").unwrap();
        assert!(nine < ten);
    }
}
