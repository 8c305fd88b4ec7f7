// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Artifact persistence helpers
//!
//! Every artifact is written to a sibling temp file and renamed into place, so
//! a reader sees either the previous state or the complete new file.

use crate::error::PersistenceError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.tmp", file_name))
}

/// Create the parent directory of `path` if it does not exist yet
pub fn ensure_parent_dir(path: &Path) -> Result<(), PersistenceError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))
        }
        _ => Ok(()),
    }
}

/// Write `contents` to `path` via temp file + rename
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    ensure_parent_dir(path)?;

    let tmp = temp_path(path);
    std::fs::write(&tmp, contents).map_err(|e| io_error(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_error(path, e));
    }
    Ok(())
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomically(path, &json)?;
    tracing::debug!("Saved {}", path.display());
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|source| PersistenceError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let yaml = serde_yaml::to_string(value).map_err(|source| PersistenceError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomically(path, yaml.as_bytes())?;
    tracing::debug!("Saved {}", path.display());
    Ok(())
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, PersistenceError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| PersistenceError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Copy a file into place atomically
pub fn copy_atomically(from: &Path, to: &Path) -> Result<(), PersistenceError> {
    let contents = std::fs::read(from).map_err(|e| io_error(from, e))?;
    write_atomically(to, &contents)
}

/// Hex-encoded SHA-256 digest of a file
pub fn sha256_file(path: &Path) -> Result<String, PersistenceError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| io_error(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_atomically_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/report.yaml");

        write_atomically(&path, b"is_model_accepted: true\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "is_model_accepted: true\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");
        let mut values = BTreeMap::new();
        values.insert("f1_score".to_string(), 0.85);

        save_json(&path, &values).unwrap();
        let loaded: BTreeMap<String, f64> = load_json(&path).unwrap();

        assert_eq!(loaded, values);
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_json::<BTreeMap<String, f64>>(&dir.path().join("absent.json")).unwrap_err();

        assert!(matches!(err, PersistenceError::Io { .. }));
    }

    #[test]
    fn test_sha256_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
