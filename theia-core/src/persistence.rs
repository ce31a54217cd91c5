//! Shared persistence utilities — atomic file writes, JSON load/save.
//!
//! Checkpoint manifests, tracked run metadata and saved configs all go
//! through the write-to-`.tmp`-then-rename pattern implemented here.

use std::io::{self, Write};
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then renames onto the target path. Creates parent directories if they
/// don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Append one JSON document as a single line to a JSONL file.
///
/// The file and its parent directories are created on first use.
pub fn append_json_line<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(data).map_err(io::Error::other)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Read every line of a JSONL file. Blank lines are skipped.
pub fn read_json_lines<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.json");

        let data = TestData {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<TestData> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("test.json");

        atomic_write_json(&path, &TestData { name: "nested".into(), count: 1 }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<TestData>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");

        atomic_write_json(&path, &"test").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_json_lines_append_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs").join("metrics.jsonl");

        for count in 0..3 {
            append_json_line(&path, &TestData { name: "step".into(), count }).unwrap();
        }

        let rows: Vec<TestData> = read_json_lines(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].count, 2);
    }

    #[test]
    fn test_read_json_lines_missing_file_is_empty() {
        let rows: Vec<TestData> = read_json_lines(Path::new("/nonexistent/metrics.jsonl")).unwrap();
        assert!(rows.is_empty());
    }
}
