//! Project description read from `Shadepack.toml`.
//!
//! The whole configuration is parsed and validated before any task runs, and
//! it is never mutated afterwards: every component receives the parts it needs
//! as plain structs when the graph is assembled.

use std::fmt::{self, Display};
use std::fs;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::resolve::Version;

pub const CONFIG_FILE: &str = "Shadepack.toml";

/// A library coordinate, `group:name:version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Coordinate {
    pub group: String,
    pub name: String,
    pub version: Version,
}

/// The version-less part of a coordinate, identifying a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    pub group: String,
    pub name: String,
}

impl Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.name)
    }
}

impl Coordinate {
    pub fn new(group: impl Into<String>, name: impl Into<String>, version: &str) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: Version::new(version),
        }
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey {
            group: self.group.clone(),
            name: self.name.clone(),
        }
    }

    pub fn with_version(&self, version: Version) -> Self {
        Self {
            group: self.group.clone(),
            name: self.name.clone(),
            version,
        }
    }
}

impl Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.name, self.version)
    }
}

impl FromStr for Coordinate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(name), Some(version), None)
                if !group.is_empty() && !name.is_empty() && !version.is_empty() =>
            {
                Ok(Coordinate::new(group, name, version))
            }
            _ => Err(ConfigError::Coordinate(s.to_string())),
        }
    }
}

impl TryFrom<String> for Coordinate {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Coordinate> for String {
    fn from(value: Coordinate) -> Self {
        value.to_string()
    }
}

/// Where a dependency ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Visible to the compiler, provided by the host at runtime.
    CompileOnly,
    /// Copied into the package.
    Bundled,
    /// Visible to test compilation only.
    TestOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    Module(Coordinate),
    File(Utf8PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub source: DependencySource,
    pub scope: Scope,
}

impl DependencySpec {
    pub fn module(coordinate: Coordinate, scope: Scope) -> Self {
        Self {
            source: DependencySource::Module(coordinate),
            scope,
        }
    }

    pub fn file(path: impl Into<Utf8PathBuf>, scope: Scope) -> Self {
        Self {
            source: DependencySource::File(path.into()),
            scope,
        }
    }
}

/// Rewrites `from.*` to `to.*` inside bundled code. Both prefixes use the
/// dotted package notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationRule {
    pub from: String,
    pub to: String,
}

impl RelocationRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutSection {
    pub sources: Utf8PathBuf,
    pub test_sources: Utf8PathBuf,
    pub resources: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            sources: "src/main/java".into(),
            test_sources: "src/test/java".into(),
            resources: "src/main/resources".into(),
            build_dir: "build".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerSection {
    pub program: String,
    pub args: Vec<String>,
    /// Glob, relative to the source directory, selecting the files to compile.
    pub include: String,
}

impl Default for CompilerSection {
    fn default() -> Self {
        Self {
            program: "javac".into(),
            args: Vec::new(),
            include: "**/*.java".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostSection {
    /// `group:name` of artifacts provided by the host.
    pub api: Vec<String>,
    /// Dotted package prefixes owned by the host API.
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DependenciesSection {
    pub compile_only: Vec<Coordinate>,
    pub bundled: Vec<Coordinate>,
    pub test_only: Vec<Coordinate>,
    pub compile_only_files: Vec<Utf8PathBuf>,
    pub bundled_files: Vec<Utf8PathBuf>,
    pub test_only_files: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RepositorySection {
    pub path: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplatesSection {
    /// Globs, relative to the resource directory, of files to expand.
    pub files: Vec<String>,
    pub reserved_prefix: String,
    /// Extra placeholder values on top of the project identity.
    pub values: std::collections::BTreeMap<String, String>,
}

impl Default for TemplatesSection {
    fn default() -> Self {
        Self {
            files: vec!["manifest.json".into()],
            reserved_prefix: "project.".into(),
            values: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageSection {
    pub classifier: String,
    /// Produce the plain, non-bundled archive as well.
    pub plain_archive: bool,
    pub plain_classifier: String,
    /// Globs of bundled entries that never make it into the package.
    pub excludes: Vec<String>,
}

impl Default for PackageSection {
    fn default() -> Self {
        Self {
            classifier: String::new(),
            plain_archive: false,
            plain_classifier: String::new(),
            excludes: vec![
                "META-INF/MANIFEST.MF".into(),
                "META-INF/*.SF".into(),
                "META-INF/*.DSA".into(),
                "META-INF/*.RSA".into(),
                "module-info.class".into(),
                "META-INF/versions/*/module-info.class".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploySection {
    pub dir: Utf8PathBuf,
    /// Copy on every invocation, even when the staged file is identical.
    pub always: bool,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            dir: "server/mods".into(),
            always: false,
        }
    }
}

/// Parsed `Shadepack.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Directory every relative path is resolved against.
    #[serde(skip)]
    pub root: Utf8PathBuf,
    pub project: ProjectSection,
    #[serde(default)]
    pub layout: LayoutSection,
    #[serde(default)]
    pub compiler: CompilerSection,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub dependencies: DependenciesSection,
    #[serde(default)]
    pub repositories: Vec<RepositorySection>,
    #[serde(default)]
    pub relocations: Vec<RelocationRule>,
    #[serde(default)]
    pub templates: TemplatesSection,
    #[serde(default)]
    pub package: PackageSection,
    #[serde(default)]
    pub deploy: DeploySection,
}

impl ProjectConfig {
    /// Minimal configuration, mostly useful for embedding and tests.
    pub fn new(root: impl Into<Utf8PathBuf>, name: &str, version: &str) -> Self {
        Self {
            root: root.into(),
            project: ProjectSection {
                name: name.into(),
                version: version.into(),
                group: String::new(),
                description: String::new(),
            },
            layout: Default::default(),
            compiler: Default::default(),
            host: Default::default(),
            dependencies: Default::default(),
            repositories: Vec::new(),
            relocations: Vec::new(),
            templates: Default::default(),
            package: Default::default(),
            deploy: Default::default(),
        }
    }

    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let mut config: ProjectConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        config.root = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
            _ => Utf8PathBuf::from("."),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.name.trim().is_empty() {
            return Err(ConfigError::Empty("project.name"));
        }
        if self.project.version.trim().is_empty() {
            return Err(ConfigError::Empty("project.version"));
        }

        let host = self.host_api_keys();
        if let Some(coordinate) = self
            .dependencies
            .bundled
            .iter()
            .find(|c| host.contains(&c.key()))
        {
            return Err(ConfigError::HostApiBundled(coordinate.clone()));
        }

        validate_relocations(&self.relocations, &self.host.namespaces)?;

        if self.package.plain_archive && self.plain_archive_path() == self.archive_path() {
            return Err(ConfigError::PlainArchiveClash(self.archive_path()));
        }

        Ok(())
    }

    /// Declared dependencies, in declaration order, scope by scope.
    pub fn dependency_specs(&self) -> Vec<DependencySpec> {
        let deps = &self.dependencies;
        let modules = [
            (&deps.compile_only, Scope::CompileOnly),
            (&deps.bundled, Scope::Bundled),
            (&deps.test_only, Scope::TestOnly),
        ];
        let files = [
            (&deps.compile_only_files, Scope::CompileOnly),
            (&deps.bundled_files, Scope::Bundled),
            (&deps.test_only_files, Scope::TestOnly),
        ];

        let mut specs = Vec::new();
        for (list, scope) in modules {
            specs.extend(list.iter().cloned().map(|c| DependencySpec::module(c, scope)));
        }
        for (list, scope) in files {
            specs.extend(
                list.iter()
                    .map(|path| DependencySpec::file(self.root.join(path), scope)),
            );
        }
        specs
    }

    pub fn host_api_keys(&self) -> Vec<ModuleKey> {
        self.host
            .api
            .iter()
            .filter_map(|entry| {
                let (group, name) = entry.split_once(':')?;
                Some(ModuleKey {
                    group: group.into(),
                    name: name.into(),
                })
            })
            .collect()
    }

    pub fn repository_paths(&self) -> Vec<Utf8PathBuf> {
        self.repositories
            .iter()
            .map(|repo| self.root.join(&repo.path))
            .collect()
    }

    pub fn build_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.layout.build_dir)
    }

    pub fn sources_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.layout.sources)
    }

    pub fn test_sources_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.layout.test_sources)
    }

    pub fn resources_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.layout.resources)
    }

    pub fn classes_dir(&self) -> Utf8PathBuf {
        self.build_dir().join("classes/main")
    }

    pub fn test_classes_dir(&self) -> Utf8PathBuf {
        self.build_dir().join("classes/test")
    }

    pub fn processed_resources_dir(&self) -> Utf8PathBuf {
        self.build_dir().join("resources/main")
    }

    pub fn libs_dir(&self) -> Utf8PathBuf {
        self.build_dir().join("libs")
    }

    pub fn fingerprints_dir(&self) -> Utf8PathBuf {
        self.build_dir().join(".fingerprints")
    }

    pub fn deploy_dir(&self) -> Utf8PathBuf {
        self.root.join(&self.deploy.dir)
    }

    /// `<name>-<version>[-<classifier>].jar`
    pub fn archive_name(&self, classifier: &str) -> String {
        let base = format!("{}-{}", self.project.name, self.project.version);
        match classifier {
            "" => format!("{base}.jar"),
            classifier => format!("{base}-{classifier}.jar"),
        }
    }

    pub fn archive_path(&self) -> Utf8PathBuf {
        self.libs_dir()
            .join(self.archive_name(&self.package.classifier))
    }

    pub fn plain_archive_path(&self) -> Utf8PathBuf {
        self.libs_dir()
            .join(self.archive_name(&self.package.plain_classifier))
    }
}

/// Checks a rule set on its own, independent of any bundle content.
pub(crate) fn validate_relocations(
    rules: &[RelocationRule],
    host_namespaces: &[String],
) -> Result<(), ConfigError> {
    for rule in rules {
        if rule.from.trim().is_empty() {
            return Err(ConfigError::EmptyRelocation(rule.from.clone()));
        }
        if rule.to.trim().is_empty() {
            return Err(ConfigError::EmptyRelocation(rule.to.clone()));
        }

        if let Some(host) = host_namespaces
            .iter()
            .find(|host| package_contains(host, &rule.to))
        {
            return Err(ConfigError::RelocationIntoHost {
                target: rule.to.clone(),
                host: host.clone(),
            });
        }
    }

    for (i, a) in rules.iter().enumerate() {
        for b in &rules[i + 1..] {
            if package_contains(&a.from, &b.from) || package_contains(&b.from, &a.from) {
                return Err(ConfigError::OverlappingRelocations {
                    first: a.from.clone(),
                    second: b.from.clone(),
                });
            }
        }
    }

    for a in rules {
        for b in rules {
            if a != b && package_contains(&b.from, &a.to) {
                return Err(ConfigError::RelocationChain {
                    target: a.to.clone(),
                    source_prefix: b.from.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Whether dotted package `inner` equals `outer` or lives beneath it.
pub(crate) fn package_contains(outer: &str, inner: &str) -> bool {
    match inner.strip_prefix(outer) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[project]
name = "OneBlock"
group = "com.example"
version = "1.0.0"

[host]
api = ["com.hypixel:server"]
namespaces = ["com.hypixel"]

[dependencies]
bundled = ["com.google.code.gson:gson:2.10.1"]
compile_only_files = ["libs/HostServer.jar"]
test_only = ["org.junit.jupiter:junit-jupiter:5.10.1"]

[[repositories]]
path = "repo"

[[relocations]]
from = "com.google.gson"
to = "com.example.oneblock.libs.gson"

[deploy]
dir = "hytale-server/mods"
"#;

    #[test]
    fn test_parse_sample() {
        let mut config: ProjectConfig = toml::from_str(SAMPLE).unwrap();
        config.root = "/work".into();
        config.validate().unwrap();

        assert_eq!(config.archive_path(), "/work/build/libs/OneBlock-1.0.0.jar");
        assert_eq!(config.deploy_dir(), "/work/hytale-server/mods");
        assert_eq!(config.templates.files, vec!["manifest.json"]);

        let specs = config.dependency_specs();
        assert_eq!(specs.len(), 3);
        assert!(specs.contains(&DependencySpec::file(
            "/work/libs/HostServer.jar",
            Scope::CompileOnly
        )));
    }

    #[test]
    fn test_coordinate_parse() {
        let c: Coordinate = "a.b:c:1.2".parse().unwrap();
        assert_eq!(c.group, "a.b");
        assert_eq!(c.to_string(), "a.b:c:1.2");
        assert!("a.b:c".parse::<Coordinate>().is_err());
        assert!("a:b:c:d".parse::<Coordinate>().is_err());
        assert!("a::1".parse::<Coordinate>().is_err());
    }

    #[test]
    fn test_host_api_must_not_be_bundled() {
        let mut config = ProjectConfig::new("/p", "demo", "1.0");
        config.host.api = vec!["com.hypixel:server".into()];
        config.dependencies.bundled = vec!["com.hypixel:server:1.0".parse().unwrap()];

        assert!(matches!(
            config.validate(),
            Err(ConfigError::HostApiBundled(_))
        ));
    }

    #[test]
    fn test_overlapping_relocations() {
        let rules = [
            RelocationRule::new("com.google", "a.google"),
            RelocationRule::new("com.google.gson", "b.gson"),
        ];
        assert!(matches!(
            validate_relocations(&rules, &[]),
            Err(ConfigError::OverlappingRelocations { .. })
        ));
    }

    #[test]
    fn test_sibling_prefixes_do_not_overlap() {
        let rules = [
            RelocationRule::new("com.google.gson", "x.gson"),
            RelocationRule::new("com.google.gsonfire", "x.gsonfire"),
        ];
        validate_relocations(&rules, &[]).unwrap();
    }

    #[test]
    fn test_relocation_into_host() {
        let rules = [RelocationRule::new("com.google.gson", "com.hypixel.gson")];
        assert!(matches!(
            validate_relocations(&rules, &["com.hypixel".into()]),
            Err(ConfigError::RelocationIntoHost { .. })
        ));
    }

    #[test]
    fn test_relocation_chain() {
        let rules = [
            RelocationRule::new("a", "b.moved"),
            RelocationRule::new("b", "c"),
        ];
        assert!(matches!(
            validate_relocations(&rules, &[]),
            Err(ConfigError::RelocationChain { .. })
        ));
    }

    #[test]
    fn test_plain_archive_clash() {
        let mut config = ProjectConfig::new("/p", "demo", "1.0");
        config.package.plain_archive = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PlainArchiveClash(_))
        ));

        config.package.plain_classifier = "plain".into();
        config.validate().unwrap();
        assert_eq!(config.plain_archive_path(), "/p/build/libs/demo-1.0-plain.jar");
    }
}
