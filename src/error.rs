use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::compile::Diagnostic;
use crate::config::Coordinate;

#[derive(Debug, Error)]
pub enum ShadepackError {
    #[error("Configuration error:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Invalid task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Relocation rules rejected:\n{0}")]
    Rules(#[from] RelocationError),

    #[error("Template setup rejected:\n{0}")]
    Template(#[from] TemplateError),

    #[error("Packaging setup rejected:\n{0}")]
    Package(#[from] PackageError),

    #[error("Couldn't open repository:\n{0}")]
    Repository(#[from] ResolutionError),

    #[error("Task '{task}' failed: {cause}")]
    TaskFailed {
        task: String,
        cause: Arc<TaskError>,
        /// Tasks that never ran because they hard-depend on `task`.
        skipped: Vec<String>,
    },

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid coordinate '{0}', expected 'group:name:version'")]
    Coordinate(String),

    #[error("Field '{0}' must not be empty")]
    Empty(&'static str),

    #[error("Host API artifact '{0}' must be compile-only, it is already provided by the host")]
    HostApiBundled(Coordinate),

    #[error("Relocation source '{0}' may not be empty")]
    EmptyRelocation(String),

    #[error("Relocation sources '{first}' and '{second}' overlap")]
    OverlappingRelocations { first: String, second: String },

    #[error("Relocation target '{target}' lies inside the host API namespace '{host}'")]
    RelocationIntoHost { target: String, host: String },

    #[error("Relocation target '{target}' is relocated again by rule '{source_prefix}'")]
    RelocationChain {
        target: String,
        source_prefix: String,
    },

    #[error("The plain archive would overwrite the shaded archive at '{0}'")]
    PlainArchiveClash(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task '{0}' is registered twice")]
    DuplicateTask(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' cannot depend on or be ordered after itself")]
    SelfEdge(String),

    #[error("Output '{path}' is written by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),

    #[error("Couldn't start the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Could not resolve '{coordinate}' (searched: {searched})")]
    NotFound {
        coordinate: Coordinate,
        searched: String,
    },

    #[error("Dependency file '{0}' does not exist")]
    MissingFile(Utf8PathBuf),

    #[error("Repository index '{path}' is unreadable.\n{source}")]
    Index {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Repository index '{path}' is malformed.\n{source}")]
    IndexFormat {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClassFileError {
    #[error("not a class unit (bad magic {0:#010x})")]
    BadMagic(u32),

    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("unknown constant pool tag {tag} at entry {index}")]
    UnknownTag { tag: u8, index: u16 },

    #[error("constant pool index {0} does not point at the expected entry")]
    BadIndex(u16),

    #[error("constant pool entry is larger than 65535 bytes after relocation")]
    Overflow,
}

#[derive(Debug, Error)]
pub enum RelocationError {
    #[error(transparent)]
    Rules(#[from] ConfigError),

    #[error("Couldn't decode unit '{unit}': {source}")]
    Decode {
        unit: String,
        source: ClassFileError,
    },

    #[error(
        "Dangling reference in '{original}' (relocated as '{target}'): '{missing}' does not exist after relocation"
    )]
    Dangling {
        original: String,
        target: String,
        missing: String,
    },

    #[error("Relocating '{original}' to '{target}' collides with the project's own class")]
    ProjectCollision { original: String, target: String },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Unresolved placeholder '${{{token}}}' in '{file}' on line {line}")]
    Unresolved {
        file: Utf8PathBuf,
        token: String,
        line: usize,
    },

    #[error("Value of placeholder '{0}' contains `$` or starts with `{{`")]
    RecursiveValue(String),

    #[error("Expanded '{file}' is not valid JSON.\n{source}")]
    InvalidJson {
        file: Utf8PathBuf,
        source: serde_json::Error,
    },

    #[error("Template '{0}' is not valid UTF-8")]
    NotUtf8(Utf8PathBuf),

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("I/O error at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// Two inputs claim the same path inside the package with different content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("'{path}' is provided by both '{first}' and '{second}' with different content")]
pub struct PackagingConflict {
    pub path: String,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed archive '{path}'.\n{source}")]
    Zip {
        path: Utf8PathBuf,
        source: zip::result::ZipError,
    },

    #[error("Archive entry '{0}' has a non UTF-8 or unsafe name")]
    EntryName(String),
}

#[derive(Debug, Error)]
pub enum PackageError {
    #[error(transparent)]
    Conflict(#[from] PackagingConflict),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Couldn't compile exclude pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Package '{0}' does not exist")]
    MissingArtifact(Utf8PathBuf),

    #[error("Deployment directory '{path}' is not writable.\n{source}")]
    NotWritable {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't fingerprint '{path}'.\n{source}")]
    Fingerprint {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Compilation failed with {} error(s):\n{}", .0.len(), render_diagnostics(.0))]
    Failed(Vec<Diagnostic>),

    #[error("Couldn't start compiler '{program}'.\n{source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Error raised by a single task action.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Relocation(#[from] RelocationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Fingerprint store '{path}':\n{source}")]
    Fingerprint {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Output of task '{0}' is not available")]
    MissingInput(&'static str),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<PackagingConflict> for TaskError {
    fn from(value: PackagingConflict) -> Self {
        TaskError::Package(value.into())
    }
}
