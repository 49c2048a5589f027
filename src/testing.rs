//! Helpers shared by unit tests.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};

use crate::archive::{self, Entry};
use crate::classfile::ClassFile;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Scratch directory removed on drop.
pub struct TempDir(Utf8PathBuf);

impl TempDir {
    pub fn new(label: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let name = format!(
            "shadepack-{label}-{}-{}-{nanos}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let root = std::env::temp_dir().join(name);
        let path = Utf8PathBuf::from_path_buf(root).expect("temp dir is not UTF-8");
        fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// Entry holding a stub class named `name` that refers to `references`.
pub fn class_entry(name: &str, references: &[&str]) -> Entry {
    let unit = ClassFile::stub(name, "java/lang/Object", references);
    Entry::new(format!("{name}.class"), unit.to_bytes())
}

/// Writes a jar containing `entries` and returns its path.
pub fn write_jar(dir: &Utf8Path, file: &str, entries: &[Entry]) -> Utf8PathBuf {
    let path = dir.join(file);
    archive::write_jar(
        &path,
        entries.iter().map(|e| (e.path.as_str(), e.data.as_slice())),
    )
    .unwrap();
    path
}
