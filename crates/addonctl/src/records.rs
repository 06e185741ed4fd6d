//! Record and manifest files.

use std::fs;
use std::path::{Path, PathBuf};

use addon_engine::resource::split_documents;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read a JSON record, `None` when the file does not exist yet.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&raw).with_context(|| format!("Invalid record in {}", path.display()))?;
    Ok(Some(value))
}

/// Write a JSON record, replacing the previous file atomically.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Remove a record file if present.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// Documents of every file, files in the given order.
pub fn read_manifests(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut documents = Vec::new();
    for path in paths {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        documents.extend(split_documents(&text));
    }
    Ok(documents)
}

/// Raw text of every file, for hashing.
pub fn read_texts(paths: &[PathBuf]) -> Result<Vec<String>> {
    paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("Failed to read {}", p.display())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_engine::feature::{FeatureId, FeatureRecord};

    #[test]
    fn missing_record_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<FeatureRecord> = load(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn records_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let record = FeatureRecord::new(FeatureId::Resources);

        save(&path, &record).unwrap();
        let loaded: Option<FeatureRecord> = load(&path).unwrap();
        assert_eq!(loaded, Some(record));
        assert!(!path.with_extension("json.tmp").exists());

        remove(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn invalid_record_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, "{not json").unwrap();
        assert!(load::<FeatureRecord>(&path).is_err());
    }

    #[test]
    fn manifests_are_split_across_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.yaml");
        let second = dir.path().join("b.yaml");
        fs::write(&first, "kind: A\n---\nkind: B\n").unwrap();
        fs::write(&second, "# only a comment\n---\nkind: C\n").unwrap();

        let documents = read_manifests(&[first, second]).unwrap();
        assert_eq!(documents, vec!["kind: A\n", "kind: B\n", "kind: C\n"]);
    }
}
