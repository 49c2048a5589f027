#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use shadepack::archive::{self, Entry};
use shadepack::classfile::ClassFile;
use shadepack::compile::{Compiler, Diagnostic, SourceSet};
use shadepack::config::{Coordinate, RelocationRule};
use shadepack::resolve::{MemoryRepository, RepositoryIndex};
use shadepack::{CompileError, Pipeline, ProjectConfig};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub struct TempDir(Utf8PathBuf);

impl TempDir {
    pub fn new(label: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let name = format!(
            "shadepack-it-{label}-{}-{}-{nanos}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        let path = Utf8PathBuf::from_path_buf(std::env::temp_dir().join(name)).unwrap();
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

/// Compiles "sources" of the form
///
/// ```text
/// class com/example/Main
/// ref com/lib/Util
/// ```
///
/// into stub class units. Every `ref` must be defined by another source or
/// found on the classpath.
#[derive(Default)]
pub struct FakeCompiler {
    pub runs: AtomicUsize,
}

impl FakeCompiler {
    fn known_classes(classpath: &[Utf8PathBuf]) -> BTreeSet<String> {
        let mut known = BTreeSet::new();

        for path in classpath {
            let contents = match path.is_dir() {
                true => archive::read_dir(path, "dir").unwrap(),
                false => archive::read_jar(path, "jar").unwrap(),
            };
            known.extend(
                contents
                    .entries
                    .iter()
                    .filter_map(|entry| entry.path.strip_suffix(".class"))
                    .map(String::from),
            );
        }

        known
    }
}

impl Compiler for FakeCompiler {
    fn compile(
        &self,
        classpath: &[Utf8PathBuf],
        sources: &SourceSet,
        out: &Utf8Path,
    ) -> Result<(), CompileError> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let _ = fs::remove_dir_all(out);
        fs::create_dir_all(out).unwrap();

        let parsed: Vec<(Utf8PathBuf, String, Vec<(usize, String)>)> = sources
            .files
            .iter()
            .map(|file| {
                let text = fs::read_to_string(file).unwrap();
                let mut name = String::new();
                let mut refs = Vec::new();
                for (number, line) in text.lines().enumerate() {
                    if let Some(class) = line.strip_prefix("class ") {
                        name = class.trim().to_string();
                    } else if let Some(reference) = line.strip_prefix("ref ") {
                        refs.push((number + 1, reference.trim().to_string()));
                    }
                }
                (file.clone(), name, refs)
            })
            .collect();

        let mut known = Self::known_classes(classpath);
        known.extend(parsed.iter().map(|(_, name, _)| name.clone()));

        let diagnostics: Vec<Diagnostic> = parsed
            .iter()
            .flat_map(|(file, _, refs)| {
                refs.iter()
                    .filter(|(_, reference)| !known.contains(reference))
                    .map(|(line, reference)| Diagnostic {
                        file: file.clone(),
                        line: Some(*line),
                        message: format!("cannot find symbol {reference}"),
                    })
            })
            .collect();
        if !diagnostics.is_empty() {
            return Err(CompileError::Failed(diagnostics));
        }

        for (_, name, refs) in &parsed {
            let refs: Vec<&str> = refs.iter().map(|(_, r)| r.as_str()).collect();
            let unit = ClassFile::stub(name, "java/lang/Object", &refs);
            let path = out.join(format!("{name}.class"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, unit.to_bytes()).unwrap();
        }

        Ok(())
    }

    fn describe(&self) -> String {
        "fake-javac".into()
    }
}

pub fn class_entry(name: &str, references: &[&str]) -> Entry {
    let unit = ClassFile::stub(name, "java/lang/Object", references);
    Entry::new(format!("{name}.class"), unit.to_bytes())
}

pub fn write_jar(path: &Utf8Path, entries: &[Entry]) {
    archive::write_jar(
        path,
        entries.iter().map(|e| (e.path.as_str(), e.data.as_slice())),
    )
    .unwrap();
}

pub fn write(path: &Utf8Path, text: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

pub fn lib_a() -> Coordinate {
    Coordinate::new("com.liba", "liba", "1.0")
}

pub fn lib_b() -> Coordinate {
    Coordinate::new("com.libb", "libb", "2.0")
}

/// A plugin project bundling `libA` (relocated to
/// `com.example.shaded.liba`) and compiling against a host API jar.
pub struct Fixture {
    pub dir: TempDir,
    pub config: ProjectConfig,
    pub repository: Vec<(Coordinate, Utf8PathBuf)>,
    pub compiler: Arc<FakeCompiler>,
}

impl Fixture {
    pub fn new(label: &str) -> Self {
        let dir = TempDir::new(label);
        let root = dir.path();

        write_jar(
            &root.join("libs/HostServer.jar"),
            &[class_entry("com/hypixel/Server", &[])],
        );
        let lib_a_jar = root.join("repo/liba-1.0.jar");
        write_jar(
            &lib_a_jar,
            &[
                class_entry("com/liba/Util", &["com/liba/Helper"]),
                class_entry("com/liba/Helper", &[]),
                Entry::new("META-INF/LICENSE", "MIT"),
                Entry::new("META-INF/MANIFEST.MF", "Manifest-Version: 1.0\r\n"),
            ],
        );

        write(
            &root.join("src/main/java/com/example/demo/Main.java"),
            "class com/example/demo/Main\nref com/liba/Util\nref com/hypixel/Server\n",
        );
        write(
            &root.join("src/main/resources/manifest.json"),
            "{\"Name\": \"${name}\", \"Version\": \"${version}\", \"Main\": \"${mainClass}\"}\n",
        );

        let mut config = ProjectConfig::new(root, "demo", "1.0");
        config.dependencies.bundled = vec![lib_a()];
        config.dependencies.compile_only_files = vec!["libs/HostServer.jar".into()];
        config.host.namespaces = vec!["com.hypixel".into()];
        config.relocations = vec![RelocationRule::new("com.liba", "com.example.shaded.liba")];

        Self {
            dir,
            config,
            repository: vec![(lib_a(), lib_a_jar)],
            compiler: Arc::new(FakeCompiler::default()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        self.dir.path()
    }

    /// Adds a bundled library whose jar carries its own `META-INF/LICENSE`.
    pub fn bundle_lib_b(&mut self) {
        let jar = self.root().join("repo/libb-2.0.jar");
        write_jar(
            &jar,
            &[
                class_entry("com/libb/Codec", &[]),
                Entry::new("META-INF/LICENSE", "Apache-2.0"),
            ],
        );
        self.config.dependencies.bundled.push(lib_b());
        self.repository.push((lib_b(), jar));
    }

    pub fn pipeline(&self) -> Pipeline {
        let mut repository = MemoryRepository::new();
        for (coordinate, file) in &self.repository {
            repository.insert(coordinate.clone(), file, []);
        }
        let repositories: Vec<Box<dyn RepositoryIndex>> = vec![Box::new(repository)];

        Pipeline::new(self.config.clone(), self.compiler.clone(), repositories)
            .unwrap()
            .with_jobs(2)
    }

    pub fn compiler_runs(&self) -> usize {
        self.compiler.runs.load(Ordering::SeqCst)
    }

    pub fn archive(&self) -> Utf8PathBuf {
        self.config.archive_path()
    }

    pub fn staged(&self) -> Utf8PathBuf {
        self.config.deploy_dir().join("demo-1.0.jar")
    }
}
