//! Boundary to the external compiler.

use std::fmt::{self, Display};
use std::fs;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::CompilerSection;
use crate::core::{Fingerprint, Hash32};
use crate::error::CompileError;

const CLASSPATH_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

/// A compile error located in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: Utf8PathBuf,
    pub line: Option<usize>,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file, line, self.message),
            None => write!(f, "{}: {}", self.file, self.message),
        }
    }
}

/// Extracts `file:line: error: message` records from compiler output.
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let (location, message) = line.split_once(": error: ")?;
            let (file, line) = match location.rsplit_once(':') {
                Some((file, line)) if line.parse::<usize>().is_ok() => (file, line.parse().ok()),
                _ => (location, None),
            };

            Some(Diagnostic {
                file: file.into(),
                line,
                message: message.trim().to_string(),
            })
        })
        .collect()
}

/// Source files selected from one directory.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    pub root: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
}

impl SourceSet {
    /// Every file beneath `root` matching `include`, in path order. A missing
    /// root yields an empty set.
    pub fn scan(root: &Utf8Path, include: &str) -> Result<Self, CompileError> {
        let mut files = Vec::new();

        if root.is_dir() {
            let pattern = format!("{}/{include}", glob::Pattern::escape(root.as_str()));
            for path in glob::glob(&pattern)? {
                let path = path.map_err(|err| CompileError::Io {
                    path: root.to_owned(),
                    source: err.into_error(),
                })?;
                let path = Utf8PathBuf::from_path_buf(path).map_err(|path| CompileError::Io {
                    path: root.to_owned(),
                    source: std::io::Error::other(format!("non UTF-8 path {}", path.display())),
                })?;

                if path.is_file() {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(Self {
            root: root.to_owned(),
            files,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Hash over the relative path and content of every file.
    pub fn fingerprint(&self) -> Result<Hash32, CompileError> {
        let mut fp = Fingerprint::new("sources");

        for file in &self.files {
            let relative = file.strip_prefix(&self.root).unwrap_or(file);
            let hash = Hash32::hash_file(file).map_err(|source| CompileError::Io {
                path: file.clone(),
                source,
            })?;
            fp.field(relative.as_str()).hash(hash);
        }

        Ok(fp.finish())
    }
}

/// Turns a source set into class units.
pub trait Compiler: Send + Sync {
    /// Compiles `sources` against `classpath` into `out`, which is emptied
    /// first.
    fn compile(
        &self,
        classpath: &[Utf8PathBuf],
        sources: &SourceSet,
        out: &Utf8Path,
    ) -> Result<(), CompileError>;

    /// Identity of the compiler and its options, part of every up-to-date
    /// fingerprint.
    fn describe(&self) -> String;
}

/// Runs an external compiler executable with `javac`-style arguments.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    args: Vec<String>,
}

impl CommandCompiler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &CompilerSection) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

pub(crate) fn clean_dir(dir: &Utf8Path) -> Result<(), CompileError> {
    let io = |source: std::io::Error| CompileError::Io {
        path: dir.to_owned(),
        source,
    };

    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io)?;
    }
    fs::create_dir_all(dir).map_err(io)
}

impl Compiler for CommandCompiler {
    fn compile(
        &self,
        classpath: &[Utf8PathBuf],
        sources: &SourceSet,
        out: &Utf8Path,
    ) -> Result<(), CompileError> {
        clean_dir(out)?;

        let mut command = Command::new(&self.program);
        command.arg("-d").arg(out);
        if !classpath.is_empty() {
            let joined = classpath
                .iter()
                .map(|path| path.as_str())
                .collect::<Vec<_>>()
                .join(CLASSPATH_SEPARATOR);
            command.arg("-cp").arg(joined);
        }
        command.args(&self.args).args(&sources.files);

        let output = command.output().map_err(|source| CompileError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            if !stderr.trim().is_empty() {
                tracing::warn!("{}", stderr.trim());
            }
            return Ok(());
        }

        let mut diagnostics = parse_diagnostics(&stderr);
        if diagnostics.is_empty() {
            diagnostics.push(Diagnostic {
                file: self.program.clone().into(),
                line: None,
                message: format!("exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Err(CompileError::Failed(diagnostics))
    }

    fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}
