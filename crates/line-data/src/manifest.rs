use std::{
    fs,
    path::{Path, PathBuf},
};

use encoding_rs::{UTF_16BE, UTF_16LE, WINDOWS_874};

use crate::DataError;

const LABEL_EXTENSION: &str = "label";

/// One manifest record: an image path (relative paths are resolved against
/// the manifest's folder) and the joined transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub image_path: PathBuf,
    pub transcription: String,
}

/// Reads the single `.label` manifest inside `folder` and parses its records.
///
/// Records are whitespace-separated: the first field is an image path, every
/// remaining field is concatenated without a separator into the
/// transcription. Records with fewer than two fields are skipped.
pub fn scan_folder(folder: &Path) -> Result<Vec<ManifestRecord>, DataError> {
    let manifest = find_label_file(folder)?;
    let bytes = fs::read(&manifest).map_err(|err| {
        DataError::manifest(format!("failed to read {}: {}", manifest.display(), err))
    })?;
    let text = decode_manifest(&bytes, &manifest)?;
    Ok(parse_records(&text, folder))
}

fn find_label_file(folder: &Path) -> Result<PathBuf, DataError> {
    let entries = fs::read_dir(folder).map_err(|err| {
        DataError::manifest(format!(
            "failed to list manifest folder {}: {}",
            folder.display(),
            err
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            DataError::manifest(format!("failed to read folder entry: {}", err))
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(LABEL_EXTENSION) {
            return Ok(path);
        }
    }
    Err(DataError::manifest(format!(
        "no .{} manifest found in {}",
        LABEL_EXTENSION,
        folder.display()
    )))
}

/// The BEST corpus ships manifests in cp874; some releases use UTF-16.
/// Try cp874 first, fall back to UTF-16; a second failure is fatal.
fn decode_manifest(bytes: &[u8], path: &Path) -> Result<String, DataError> {
    let (decoded, _, had_errors) = WINDOWS_874.decode(bytes);
    if !had_errors {
        return Ok(decoded.into_owned());
    }

    let encoding = if bytes.starts_with(&[0xFE, 0xFF]) {
        UTF_16BE
    } else {
        UTF_16LE
    };
    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(DataError::manifest(format!(
            "{} is neither cp874 nor UTF-16",
            path.display()
        )));
    }
    Ok(decoded.into_owned())
}

fn parse_records(text: &str, folder: &Path) -> Vec<ManifestRecord> {
    let mut records = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let Some(image) = fields.next() else {
            continue;
        };
        let transcription: String = fields.collect();
        if transcription.is_empty() {
            // fewer than two fields
            continue;
        }
        records.push(ManifestRecord {
            image_path: folder.join(image),
            transcription,
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn folder_with_manifest(contents: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("lines.label")).unwrap();
        file.write_all(contents).unwrap();
        dir
    }

    #[test]
    fn tokens_join_without_separator() {
        let dir = folder_with_manifest(b"0001.png HELLO WORLD\n");
        let records = scan_folder(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transcription, "HELLOWORLD");
        assert_eq!(records[0].image_path, dir.path().join("0001.png"));
    }

    #[test]
    fn short_records_are_skipped() {
        let dir = folder_with_manifest(b"orphan.png\n0002.png ok\n\n");
        let records = scan_folder(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transcription, "ok");
    }

    #[test]
    fn utf16_fallback() {
        let text = "0003.png ABC\n";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let dir = folder_with_manifest(&bytes);
        let records = scan_folder(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].transcription, "ABC");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_folder(dir.path()).is_err());
    }
}
