//! Reading and writing of jar archives and class directories.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::core::Hash32;
use crate::error::ArchiveError;

/// A single file inside an archive, addressed by its `/`-separated path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn is_class(&self) -> bool {
        self.path.ends_with(".class")
    }
}

/// Every entry of one input, together with a label naming where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contents {
    pub origin: String,
    pub entries: Vec<Entry>,
}

impl Contents {
    pub fn new(origin: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            origin: origin.into(),
            entries,
        }
    }
}

fn io_err(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_owned(),
        source,
    }
}

fn zip_err(path: &Utf8Path) -> impl FnOnce(zip::result::ZipError) -> ArchiveError + '_ {
    move |source| ArchiveError::Zip {
        path: path.to_owned(),
        source,
    }
}

fn check_name(name: &str) -> Result<(), ArchiveError> {
    let unsafe_name = name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|segment| segment == "..");

    if unsafe_name {
        Err(ArchiveError::EntryName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Reads all file entries of a jar, skipping directory records.
pub fn read_jar(path: &Utf8Path, origin: impl Into<String>) -> Result<Contents, ArchiveError> {
    let file = File::open(path).map_err(io_err(path))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_err(path))?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(zip_err(path))?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        check_name(&name)?;

        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data).map_err(io_err(path))?;
        entries.push(Entry::new(name, data));
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Contents::new(origin, entries))
}

/// Reads a directory tree into entries relative to `root`. A missing
/// directory yields no entries.
pub fn read_dir(root: &Utf8Path, origin: impl Into<String>) -> Result<Contents, ArchiveError> {
    let mut entries = Vec::new();
    if root.is_dir() {
        read_dir_rec(root, root, &mut entries)?;
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(Contents::new(origin, entries))
}

fn read_dir_rec(root: &Utf8Path, dir: &Utf8Path, acc: &mut Vec<Entry>) -> Result<(), ArchiveError> {
    for entry in dir.read_dir_utf8().map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let path = entry.path();

        if entry.file_type().map_err(io_err(path))?.is_dir() {
            read_dir_rec(root, path, acc)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map_err(|_| ArchiveError::EntryName(path.to_string()))?;
        let name = relative.components().map(|c| c.as_str()).collect::<Vec<_>>().join("/");

        let data = fs::read(path).map_err(io_err(path))?;
        acc.push(Entry::new(name, data));
    }

    Ok(())
}

/// Path a jar is assembled at before it is moved into place.
pub fn staging_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("archive.jar");
    path.with_file_name(format!(".{name}.part"))
}

/// Writes `entries`, in the given order, into a jar at `path`.
///
/// Every entry gets the same timestamp and permissions so that identical
/// input produces a byte-identical archive. The archive is assembled next to
/// `path` and renamed over it only once complete; on failure the final path is
/// left as it was.
pub fn write_jar<'a>(
    path: &Utf8Path,
    entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Result<Hash32, ArchiveError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let temp = staging_path(path);
    let result = write_entries(&temp, entries).and_then(|()| {
        fs::rename(&temp, path).map_err(io_err(path))?;
        Hash32::hash_file(path).map_err(io_err(path))
    });

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }

    result
}

fn write_entries<'a>(
    temp: &Utf8Path,
    entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
) -> Result<(), ArchiveError> {
    let file = File::create(temp).map_err(io_err(temp))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    for (name, data) in entries {
        check_name(name)?;
        zip.start_file(name, options).map_err(zip_err(temp))?;
        zip.write_all(data).map_err(io_err(temp))?;
    }

    let mut writer = zip.finish().map_err(zip_err(temp))?;
    writer.flush().map_err(io_err(temp))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(io_err(temp))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new("archive-rw");
        let path = dir.path().join("out/demo.jar");

        write_jar(
            &path,
            [("a/B.class", &b"one"[..]), ("manifest.json", &b"{}"[..])],
        )
        .unwrap();

        let contents = read_jar(&path, "demo").unwrap();
        assert_eq!(
            contents.entries,
            vec![Entry::new("a/B.class", "one"), Entry::new("manifest.json", "{}")]
        );
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_output_is_deterministic() {
        let dir = TempDir::new("archive-det");
        let entries = [("x/Y.class", &b"payload"[..]), ("z.txt", &b"text"[..])];

        let first = write_jar(&dir.path().join("a.jar"), entries).unwrap();
        let second = write_jar(&dir.path().join("b.jar"), entries).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unsafe_name_leaves_no_output() {
        let dir = TempDir::new("archive-unsafe");
        let path = dir.path().join("bad.jar");

        let err = write_jar(&path, [("../escape", &b""[..])]).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryName(_)));
        assert!(!path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_read_dir_uses_forward_slashes() {
        let dir = TempDir::new("archive-dir");
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/C.class"), b"c").unwrap();
        fs::write(dir.path().join("top.txt"), b"t").unwrap();

        let contents = read_dir(dir.path(), "classes").unwrap();
        let paths: Vec<_> = contents.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["a/b/C.class", "top.txt"]);

        let missing = read_dir(&dir.path().join("nope"), "none").unwrap();
        assert!(missing.entries.is_empty());
    }
}
