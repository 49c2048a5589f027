//! Repository indexes the resolver looks coordinates up in.

use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::config::Coordinate;
use crate::error::ResolutionError;

/// An artifact location together with the coordinates it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub file: Utf8PathBuf,
    pub dependencies: Vec<Coordinate>,
}

/// Source of artifacts, consulted in the order repositories are configured.
pub trait RepositoryIndex: Send + Sync {
    /// Human readable identity, used in "not found" reports.
    fn describe(&self) -> String;

    /// `Ok(None)` means this repository does not know the coordinate; the
    /// resolver then asks the next one.
    fn lookup(&self, coordinate: &Coordinate) -> Result<Option<ResolvedModule>, ResolutionError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexFile {
    #[serde(default, rename = "artifact")]
    artifacts: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexEntry {
    coordinate: Coordinate,
    file: Utf8PathBuf,
    #[serde(default)]
    dependencies: Vec<Coordinate>,
}

/// A directory laid out as `group/path/name/version/name-version.jar`.
///
/// An optional `index.toml` at the root lists artifacts explicitly together
/// with their transitive dependencies:
///
/// ```toml
/// [[artifact]]
/// coordinate = "com.google.code.gson:gson:2.10.1"
/// file = "gson-2.10.1.jar"
/// dependencies = []
/// ```
///
/// Artifacts missing from the index are still found through the directory
/// layout, without any dependencies.
pub struct LocalRepository {
    root: Utf8PathBuf,
    index: HashMap<Coordinate, ResolvedModule>,
}

impl LocalRepository {
    pub const INDEX_FILE: &'static str = "index.toml";

    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, ResolutionError> {
        let root = root.into();
        let path = root.join(Self::INDEX_FILE);

        let index = match fs::read_to_string(&path) {
            Ok(text) => {
                let file: IndexFile =
                    toml::from_str(&text).map_err(|source| ResolutionError::IndexFormat {
                        path: path.clone(),
                        source,
                    })?;

                file.artifacts
                    .into_iter()
                    .map(|entry| {
                        let module = ResolvedModule {
                            file: root.join(entry.file),
                            dependencies: entry.dependencies,
                        };
                        (entry.coordinate, module)
                    })
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(ResolutionError::Index { path, source }),
        };

        Ok(Self { root, index })
    }

    fn layout_path(&self, coordinate: &Coordinate) -> Utf8PathBuf {
        let mut path = self.root.clone();
        for segment in coordinate.group.split('.') {
            path.push(segment);
        }
        path.push(&coordinate.name);
        path.push(coordinate.version.as_str());
        path.push(format!("{}-{}.jar", coordinate.name, coordinate.version));
        path
    }
}

impl RepositoryIndex for LocalRepository {
    fn describe(&self) -> String {
        self.root.to_string()
    }

    fn lookup(&self, coordinate: &Coordinate) -> Result<Option<ResolvedModule>, ResolutionError> {
        if let Some(module) = self.index.get(coordinate) {
            if !module.file.exists() {
                return Err(ResolutionError::MissingFile(module.file.clone()));
            }
            return Ok(Some(module.clone()));
        }

        let path = self.layout_path(coordinate);
        Ok(path.is_file().then(|| ResolvedModule {
            file: path,
            dependencies: Vec::new(),
        }))
    }
}

/// Repository kept entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    modules: HashMap<Coordinate, ResolvedModule>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        coordinate: Coordinate,
        file: impl AsRef<Utf8Path>,
        dependencies: impl IntoIterator<Item = Coordinate>,
    ) -> &mut Self {
        self.modules.insert(
            coordinate,
            ResolvedModule {
                file: file.as_ref().to_owned(),
                dependencies: dependencies.into_iter().collect(),
            },
        );
        self
    }
}

impl RepositoryIndex for MemoryRepository {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn lookup(&self, coordinate: &Coordinate) -> Result<Option<ResolvedModule>, ResolutionError> {
        Ok(self.modules.get(coordinate).cloned())
    }
}
