//! Merging of project output, bundled libraries and resources into one jar.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::archive::{self, Contents};
use crate::config::ProjectConfig;
use crate::core::{Fingerprint, Hash32};
use crate::error::{PackageError, PackagingConflict};

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Everything that goes into one package.
#[derive(Debug, Clone, Copy)]
pub struct PackageInputs<'a> {
    pub project: &'a Contents,
    pub bundle: &'a [Contents],
    pub resources: &'a Contents,
}

/// The produced archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub path: Utf8PathBuf,
    /// Empty for the shaded artifact, so the file name carries no suffix.
    pub classifier: String,
    /// Fingerprint of the merged entries that determined the content.
    pub inputs: Hash32,
    /// Hash of the archive file itself.
    pub content: Hash32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Generated,
    Project,
    Bundled,
    Resource,
}

#[derive(Debug, Clone, Copy)]
struct Source<'a> {
    origin: &'a str,
    kind: Kind,
    data: &'a [u8],
}

/// Entries of the package, keyed and ordered by path.
pub struct Merged<'a> {
    entries: BTreeMap<&'a str, Source<'a>>,
}

impl<'a> Merged<'a> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&'a [u8]> {
        self.entries.get(path).map(|source| source.data)
    }

    /// Manifest first, everything else in path order.
    fn ordered(&self) -> impl Iterator<Item = (&'a str, &'a [u8])> + '_ {
        let manifest = self.entries.get_key_value(MANIFEST_PATH);
        let rest = self
            .entries
            .iter()
            .filter(|(path, _)| **path != MANIFEST_PATH);

        manifest
            .into_iter()
            .chain(rest)
            .map(|(path, source)| (*path, source.data))
    }

    pub fn fingerprint(&self, classifier: &str) -> Hash32 {
        let mut fp = Fingerprint::new("package");
        fp.field(classifier);
        for (path, data) in self.ordered() {
            fp.field(path).field(data);
        }
        fp.finish()
    }

    fn insert(&mut self, path: &'a str, source: Source<'a>) -> Result<(), PackagingConflict> {
        let Some(&existing) = self.entries.get(path) else {
            self.entries.insert(path, source);
            return Ok(());
        };

        if existing.data == source.data {
            return Ok(());
        }
        // Resources win over library files and the generated manifest only.
        match (existing.kind, source.kind) {
            (Kind::Resource, Kind::Bundled) => return Ok(()),
            (Kind::Generated | Kind::Bundled, Kind::Resource) => {
                self.entries.insert(path, source);
                return Ok(());
            }
            _ => {}
        }

        Err(PackagingConflict {
            path: path.to_string(),
            first: existing.origin.to_string(),
            second: source.origin.to_string(),
        })
    }
}

/// Builds packages with a fixed set of excludes and a generated manifest.
pub struct Packager {
    excludes: Vec<Pattern>,
    manifest: Vec<u8>,
}

impl Packager {
    pub fn new(excludes: &[String], manifest: Vec<u8>) -> Result<Self, PackageError> {
        let excludes = excludes
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<Result<_, _>>()?;

        Ok(Self { excludes, manifest })
    }

    pub fn from_config(config: &ProjectConfig) -> Result<Self, PackageError> {
        let manifest = format!(
            "Manifest-Version: 1.0\r\nCreated-By: shadepack\r\nImplementation-Title: {}\r\nImplementation-Version: {}\r\n\r\n",
            config.project.name, config.project.version
        );

        Self::new(&config.package.excludes, manifest.into_bytes())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excludes
            .iter()
            .any(|pattern| pattern.matches_with(path, GLOB_OPTS))
    }

    /// Merges the inputs in order: generated manifest, resources, project
    /// classes, bundled artifacts.
    ///
    /// Identical duplicates collapse into one entry. A resource takes
    /// precedence over bundled entries and the generated manifest, but not
    /// over project classes. Any other duplicate path with
    /// different content is a conflict; nothing is ever silently overwritten.
    pub fn merge<'a>(&'a self, inputs: &PackageInputs<'a>) -> Result<Merged<'a>, PackagingConflict> {
        let mut merged = Merged {
            entries: BTreeMap::new(),
        };

        merged.insert(
            MANIFEST_PATH,
            Source {
                origin: "shadepack",
                kind: Kind::Generated,
                data: &self.manifest,
            },
        )?;

        let layers = [(inputs.resources, Kind::Resource), (inputs.project, Kind::Project)]
            .into_iter()
            .chain(inputs.bundle.iter().map(|contents| (contents, Kind::Bundled)));

        for (contents, kind) in layers {
            for entry in &contents.entries {
                if kind == Kind::Bundled && self.is_excluded(&entry.path) {
                    continue;
                }

                let source = Source {
                    origin: &contents.origin,
                    kind,
                    data: &entry.data,
                };
                merged.insert(&entry.path, source)?;
            }
        }

        Ok(merged)
    }

    /// Writes the merged inputs to `output`. The archive appears at `output`
    /// only once it is complete.
    pub fn package(
        &self,
        inputs: &PackageInputs<'_>,
        output: &Utf8Path,
        classifier: &str,
    ) -> Result<PackageArtifact, PackageError> {
        let merged = self.merge(inputs)?;
        let fingerprint = merged.fingerprint(classifier);
        let content = archive::write_jar(output, merged.ordered())?;

        tracing::debug!(
            path = %output,
            entries = merged.len(),
            "Wrote package"
        );

        Ok(PackageArtifact {
            path: output.to_owned(),
            classifier: classifier.to_string(),
            inputs: fingerprint,
            content,
        })
    }
}
