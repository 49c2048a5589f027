//! Persisted per-task fingerprints used for up-to-date checks.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// What a task saw the last time it completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub inputs: Hash32,
    /// Hash of the output the task produced, if it produces a single file.
    pub output: Option<Hash32>,
}

/// Directory of `<task>.cbor` records.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    dir: Utf8PathBuf,
}

impl FingerprintStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, task: &str) -> Utf8PathBuf {
        self.dir.join(format!("{task}.cbor"))
    }

    /// Last record of `task`. Unreadable or corrupt records count as absent.
    pub fn load(&self, task: &str) -> Option<Record> {
        let file = File::open(self.path(task)).ok()?;
        let file = BufReader::new(file);

        ciborium::from_reader::<Record, _>(file).ok()
    }

    /// Whether `task` last ran with `inputs` and its output is still the one
    /// it produced back then.
    pub fn is_up_to_date(&self, task: &str, inputs: Hash32, output: Option<&Utf8Path>) -> bool {
        let Some(record) = self.load(task) else {
            return false;
        };
        if record.inputs != inputs {
            return false;
        }

        match (record.output, output) {
            (Some(expected), Some(path)) => {
                Hash32::hash_file(path).is_ok_and(|actual| actual == expected)
            }
            (None, None) => true,
            _ => false,
        }
    }

    pub fn save(&self, task: &str, record: Record) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path(task);
        let temp = self.dir.join(format!(".{task}.cbor.part"));

        let mut writer = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(&record, &mut writer).map_err(std::io::Error::other)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp, &path)
    }

    pub fn forget(&self, task: &str) {
        let _ = fs::remove_file(self.path(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDir;

    #[test]
    fn test_record_roundtrip() {
        let dir = TempDir::new("fingerprint");
        let store = FingerprintStore::new(dir.path().join(".fingerprints"));
        let output = dir.path().join("out.jar");
        fs::write(&output, b"jar").unwrap();

        let inputs = Hash32::hash(b"inputs");
        assert!(!store.is_up_to_date("shadowJar", inputs, Some(&output)));

        store
            .save(
                "shadowJar",
                Record {
                    inputs,
                    output: Some(Hash32::hash_file(&output).unwrap()),
                },
            )
            .unwrap();

        assert!(store.is_up_to_date("shadowJar", inputs, Some(&output)));
        assert!(!store.is_up_to_date("shadowJar", Hash32::hash(b"other"), Some(&output)));

        fs::write(&output, b"tampered").unwrap();
        assert!(!store.is_up_to_date("shadowJar", inputs, Some(&output)));

        store.forget("shadowJar");
        assert!(store.load("shadowJar").is_none());
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let dir = TempDir::new("fingerprint-corrupt");
        let store = FingerprintStore::new(dir.path());
        fs::write(store.path("compileJava"), b"\xff\x00garbage").unwrap();

        assert!(store.load("compileJava").is_none());
    }
}
