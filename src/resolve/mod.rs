//! Dependency set resolution.
//!
//! Declared dependencies are expanded through the configured repositories into
//! three flat, ordered and de-duplicated artifact lists:
//!
//! * the **compile classpath**: compile-only and bundled dependencies together
//!   with everything they pull in,
//! * the **bundle set**: bundled dependencies and their transitive closure,
//!   minus anything declared compile-only or provided by the host,
//! * the **test classpath**: the compile classpath plus test-only
//!   dependencies.
//!
//! Conflicting versions of one module are settled by picking the highest
//! version. Every such decision is logged as a warning and reported in
//! [`Resolution::conflicts`].

mod repository;
mod version;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{self, Display};
use std::sync::Mutex;

use camino::Utf8PathBuf;

use crate::config::{Coordinate, DependencySource, DependencySpec, ModuleKey, Scope};
use crate::error::ResolutionError;

pub use repository::{LocalRepository, MemoryRepository, RepositoryIndex, ResolvedModule};
pub use version::Version;

/// One artifact taking part in compilation or packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// `None` for plain file dependencies.
    pub coordinate: Option<Coordinate>,
    pub file: Utf8PathBuf,
}

impl Display for ResolvedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.coordinate {
            Some(coordinate) => write!(f, "{coordinate}"),
            None => write!(f, "{}", self.file),
        }
    }
}

/// A module requested in more than one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    pub module: ModuleKey,
    pub requested: Vec<Version>,
    pub selected: Version,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub compile_classpath: Vec<ResolvedArtifact>,
    pub bundle: Vec<ResolvedArtifact>,
    pub test_classpath: Vec<ResolvedArtifact>,
    pub conflicts: Vec<VersionConflict>,
}

impl Resolution {
    pub fn compile_files(&self) -> Vec<Utf8PathBuf> {
        self.compile_classpath.iter().map(|a| a.file.clone()).collect()
    }

    pub fn test_files(&self) -> Vec<Utf8PathBuf> {
        self.test_classpath.iter().map(|a| a.file.clone()).collect()
    }
}

/// Resolves declared dependencies against a list of repositories.
pub struct Resolver {
    repositories: Vec<Box<dyn RepositoryIndex>>,
    host_api: BTreeSet<ModuleKey>,
    cache: Mutex<HashMap<Coordinate, ResolvedModule>>,
}

#[derive(Default)]
struct Walk {
    selected: BTreeMap<ModuleKey, Version>,
    requested: BTreeMap<ModuleKey, BTreeSet<Version>>,
}

impl Resolver {
    pub fn new(repositories: Vec<Box<dyn RepositoryIndex>>) -> Self {
        Self {
            repositories,
            host_api: BTreeSet::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Modules provided by the host; they never enter the bundle set, even
    /// when a bundled dependency pulls them in.
    pub fn with_host_api(mut self, keys: impl IntoIterator<Item = ModuleKey>) -> Self {
        self.host_api.extend(keys);
        self
    }

    pub fn resolve(&self, specs: &[DependencySpec]) -> Result<Resolution, ResolutionError> {
        let roots = |scopes: &[Scope]| -> Vec<Coordinate> {
            specs
                .iter()
                .filter(|spec| scopes.contains(&spec.scope))
                .filter_map(|spec| match &spec.source {
                    DependencySource::Module(c) => Some(c.clone()),
                    DependencySource::File(_) => None,
                })
                .collect()
        };
        let files = |scopes: &[Scope]| -> Result<Vec<ResolvedArtifact>, ResolutionError> {
            specs
                .iter()
                .filter(|spec| scopes.contains(&spec.scope))
                .filter_map(|spec| match &spec.source {
                    DependencySource::File(path) => Some(path),
                    DependencySource::Module(_) => None,
                })
                .map(|path| {
                    if path.is_file() {
                        Ok(ResolvedArtifact {
                            coordinate: None,
                            file: path.clone(),
                        })
                    } else {
                        Err(ResolutionError::MissingFile(path.clone()))
                    }
                })
                .collect()
        };

        let compile_only: BTreeSet<ModuleKey> = roots(&[Scope::CompileOnly])
            .iter()
            .map(Coordinate::key)
            .chain(self.host_api.iter().cloned())
            .collect();

        let mut main = Walk::default();
        let mut compile_classpath =
            self.walk(&roots(&[Scope::CompileOnly, Scope::Bundled]), &BTreeSet::new(), &mut main)?;
        compile_classpath.extend(files(&[Scope::CompileOnly, Scope::Bundled])?);

        // Selections are shared with the compile walk, so the bundle always
        // carries the exact versions the project was compiled against.
        let mut bundle_walk = Walk {
            selected: main.selected.clone(),
            requested: BTreeMap::new(),
        };
        let mut bundle = self.walk(&roots(&[Scope::Bundled]), &compile_only, &mut bundle_walk)?;
        bundle.extend(files(&[Scope::Bundled])?);

        let mut test = Walk {
            selected: main.selected.clone(),
            requested: BTreeMap::new(),
        };
        let mut test_classpath = self.walk(
            &roots(&[Scope::CompileOnly, Scope::Bundled, Scope::TestOnly]),
            &BTreeSet::new(),
            &mut test,
        )?;
        test_classpath.extend(files(&[Scope::CompileOnly, Scope::Bundled, Scope::TestOnly])?);

        let conflicts = collect_conflicts(&main);
        for conflict in &conflicts {
            let requested: Vec<_> = conflict.requested.iter().map(Version::as_str).collect();
            tracing::warn!(
                "version conflict for {}: requested [{}], selected {}",
                conflict.module,
                requested.join(", "),
                conflict.selected
            );
        }

        Ok(Resolution {
            compile_classpath: dedup(compile_classpath),
            bundle: dedup(bundle),
            test_classpath: dedup(test_classpath),
            conflicts,
        })
    }

    /// Breadth-first expansion of `roots`, repeated until the highest-version
    /// selection stops changing.
    fn walk(
        &self,
        roots: &[Coordinate],
        excluded: &BTreeSet<ModuleKey>,
        walk: &mut Walk,
    ) -> Result<Vec<ResolvedArtifact>, ResolutionError> {
        loop {
            let mut order = Vec::new();
            let mut visited = BTreeSet::new();
            let mut queue: VecDeque<Coordinate> = roots.iter().cloned().collect();
            let mut changed = false;

            while let Some(coordinate) = queue.pop_front() {
                let key = coordinate.key();
                if excluded.contains(&key) {
                    tracing::debug!("{coordinate} is provided at runtime, not bundling it");
                    continue;
                }

                walk.requested
                    .entry(key.clone())
                    .or_default()
                    .insert(coordinate.version.clone());

                let selected = walk.selected.entry(key.clone()).or_insert_with(|| {
                    changed = true;
                    coordinate.version.clone()
                });
                if coordinate.version > *selected {
                    *selected = coordinate.version.clone();
                    changed = true;
                }

                if !visited.insert(key) {
                    continue;
                }

                let chosen = coordinate.with_version(selected.clone());
                let module = self.lookup(&chosen)?;
                queue.extend(module.dependencies.iter().cloned());
                order.push(ResolvedArtifact {
                    coordinate: Some(chosen),
                    file: module.file,
                });
            }

            // A selection raised after its module was already expanded means
            // the order above used an outdated version; walk again.
            if !changed || order.iter().all(|artifact| {
                artifact
                    .coordinate
                    .as_ref()
                    .is_some_and(|c| walk.selected.get(&c.key()) == Some(&c.version))
            }) {
                return Ok(order);
            }
        }
    }

    fn lookup(&self, coordinate: &Coordinate) -> Result<ResolvedModule, ResolutionError> {
        if let Some(module) = self.cache.lock().unwrap().get(coordinate) {
            return Ok(module.clone());
        }

        for repository in &self.repositories {
            if let Some(module) = repository.lookup(coordinate)? {
                tracing::debug!("resolved {coordinate} from {}", repository.describe());
                self.cache
                    .lock()
                    .unwrap()
                    .insert(coordinate.clone(), module.clone());
                return Ok(module);
            }
        }

        let searched = self
            .repositories
            .iter()
            .map(|repo| repo.describe())
            .collect::<Vec<_>>()
            .join(", ");

        Err(ResolutionError::NotFound {
            coordinate: coordinate.clone(),
            searched: if searched.is_empty() {
                "no repositories configured".into()
            } else {
                searched
            },
        })
    }
}

fn collect_conflicts(walk: &Walk) -> Vec<VersionConflict> {
    walk.requested
        .iter()
        .filter(|(_, versions)| versions.len() > 1)
        .filter_map(|(key, versions)| {
            Some(VersionConflict {
                module: key.clone(),
                requested: versions.iter().cloned().collect(),
                selected: walk.selected.get(key)?.clone(),
            })
        })
        .collect()
}

fn dedup(artifacts: Vec<ResolvedArtifact>) -> Vec<ResolvedArtifact> {
    let mut seen = BTreeSet::new();
    artifacts
        .into_iter()
        .filter(|artifact| seen.insert(artifact.file.clone()))
        .collect()
}
