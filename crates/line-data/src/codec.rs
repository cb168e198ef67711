use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;

use crate::DataError;

/// Character table loaded from the corpus char file.
///
/// Index 0 is reserved for the blank/padding class and never appears in the
/// table itself.
#[derive(Debug, Clone)]
pub struct CharCodec {
    char_to_idx: HashMap<char, u32>,
    idx_to_char: HashMap<u32, char>,
}

#[derive(Debug, Deserialize)]
struct CharFile {
    char_to_idx: HashMap<String, u32>,
}

impl CharCodec {
    pub fn from_file(path: &Path) -> Result<Self, DataError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            DataError::codec(format!("failed to read char file {}: {}", path.display(), err))
        })?;
        let parsed: CharFile = serde_json::from_str(&contents).map_err(|err| {
            DataError::codec(format!(
                "failed to parse char file {}: {}",
                path.display(),
                err
            ))
        })?;

        let mut char_to_idx = HashMap::with_capacity(parsed.char_to_idx.len());
        let mut idx_to_char = HashMap::with_capacity(parsed.char_to_idx.len());
        for (key, idx) in parsed.char_to_idx {
            let mut chars = key.chars();
            let ch = match (chars.next(), chars.next()) {
                (Some(ch), None) => ch,
                _ => {
                    return Err(DataError::codec(format!(
                        "char table key '{}' is not a single character",
                        key
                    )))
                }
            };
            if idx == 0 {
                return Err(DataError::codec(format!(
                    "char table maps '{}' to reserved index 0",
                    ch
                )));
            }
            if let Some(previous) = idx_to_char.insert(idx, ch) {
                return Err(DataError::codec(format!(
                    "char table index {} assigned to both '{}' and '{}'",
                    idx, previous, ch
                )));
            }
            char_to_idx.insert(ch, idx);
        }

        Ok(Self {
            char_to_idx,
            idx_to_char,
        })
    }

    /// Number of known characters, excluding the reserved padding class.
    pub fn len(&self) -> usize {
        self.char_to_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.char_to_idx.is_empty()
    }

    /// Count of output classes a model must produce: every character plus the
    /// reserved index 0.
    pub fn class_count(&self) -> usize {
        self.char_to_idx.len() + 1
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, DataError> {
        text.chars()
            .map(|ch| {
                self.char_to_idx.get(&ch).copied().ok_or_else(|| {
                    DataError::codec(format!("character '{}' missing from char table", ch))
                })
            })
            .collect()
    }

    pub fn decode(&self, label: &[u32]) -> String {
        label
            .iter()
            .filter_map(|idx| self.idx_to_char.get(idx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_char_file(entries: &[(&str, u32)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let map: serde_json::Map<String, serde_json::Value> = entries
            .iter()
            .map(|(ch, idx)| (ch.to_string(), serde_json::json!(idx)))
            .collect();
        let doc = serde_json::json!({ "char_to_idx": map });
        write!(file, "{}", doc).unwrap();
        file
    }

    #[test]
    fn encode_decode_round_trip() {
        let file = write_char_file(&[("a", 1), ("b", 2), ("c", 3)]);
        let codec = CharCodec::from_file(file.path()).unwrap();
        let label = codec.encode("cab").unwrap();
        assert_eq!(label, vec![3, 1, 2]);
        assert_eq!(codec.decode(&label), "cab");
        assert_eq!(codec.class_count(), 4);
    }

    #[test]
    fn unknown_character_is_an_error() {
        let file = write_char_file(&[("a", 1)]);
        let codec = CharCodec::from_file(file.path()).unwrap();
        assert!(codec.encode("ab").is_err());
    }

    #[test]
    fn reserved_index_rejected() {
        let file = write_char_file(&[("a", 0)]);
        assert!(CharCodec::from_file(file.path()).is_err());
    }
}
