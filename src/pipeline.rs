//! The standard task graph of a plugin build.
//!
//! ```text
//! resolve ──┬─> compileJava ──┬─> compileTest ─────────────────┐
//!           │                 ├─> jar (disabled) ──┐           │
//!           └─────────────────┴─> relocate ──┐     ├─> assemble ┴─> build ─┐
//! processResources ──────────────────────────┴─> shadowJar ─┬─────────────┤
//!                                                          └─> deploy ───┴─> buildAndDeploy
//! ```
//!
//! `deploy` must run after `build` whenever both are requested. A fresh graph,
//! with fresh hand-over slots between tasks, is built for every invocation.

use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::archive::{self, Contents};
use crate::compile::{self, CommandCompiler, Compiler, SourceSet};
use crate::config::ProjectConfig;
use crate::core::{Fingerprint, Hash32};
use crate::engine::{BuildReport, Graph, GraphBuilder, Outcome, TaskContext};
use crate::error::{GraphError, ShadepackError, TaskError};
use crate::fingerprint::{FingerprintStore, Record};
use crate::package::{PackageArtifact, PackageInputs, Packager};
use crate::relocate::{RelocatedUnits, Relocator};
use crate::resolve::{LocalRepository, RepositoryIndex, Resolution, Resolver};
use crate::stage::{StageOutcome, Stager};
use crate::template::Templater;

pub const RESOLVE: &str = "resolve";
pub const COMPILE_JAVA: &str = "compileJava";
pub const COMPILE_TEST: &str = "compileTest";
pub const PROCESS_RESOURCES: &str = "processResources";
pub const RELOCATE: &str = "relocate";
pub const JAR: &str = "jar";
pub const SHADOW_JAR: &str = "shadowJar";
pub const ASSEMBLE: &str = "assemble";
pub const BUILD: &str = "build";
pub const DEPLOY: &str = "deploy";
pub const BUILD_AND_DEPLOY: &str = "buildAndDeploy";

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// Compile, relocate, template and package.
    Build,
    /// Package, then stage the package.
    Deploy,
    /// The full build, then staging, in one run.
    BuildAndDeploy,
}

impl Invocation {
    pub fn target(self) -> &'static str {
        match self {
            Invocation::Build => BUILD,
            Invocation::Deploy => DEPLOY,
            Invocation::BuildAndDeploy => BUILD_AND_DEPLOY,
        }
    }
}

/// Everything the task actions share, fixed before the graph is built.
struct Components {
    config: ProjectConfig,
    compiler: Arc<dyn Compiler>,
    resolver: Resolver,
    relocator: Relocator,
    templater: Templater,
    packager: Packager,
    stager: Stager,
    fingerprints: FingerprintStore,
}

/// Values handed from one task to the next within one invocation.
#[derive(Default)]
struct Products {
    resolution: OnceLock<Resolution>,
    resources: OnceLock<Contents>,
    relocated: OnceLock<RelocatedUnits>,
    artifact: OnceLock<PackageArtifact>,
}

fn product<'a, T>(slot: &'a OnceLock<T>, task: &'static str) -> Result<&'a T, TaskError> {
    slot.get().ok_or(TaskError::MissingInput(task))
}

/// Fingerprint of a classpath element, a jar or a directory of classes.
fn hash_path(path: &Utf8Path) -> Result<Hash32, TaskError> {
    if path.is_dir() {
        let contents = archive::read_dir(path, path.as_str())?;
        let mut fp = Fingerprint::new("directory");
        for entry in &contents.entries {
            fp.field(&entry.path).field(&entry.data);
        }
        return Ok(fp.finish());
    }

    Hash32::hash_file(path).map_err(|source| TaskError::Fingerprint {
        path: path.to_owned(),
        source,
    })
}

impl Components {
    fn save(&self, task: &str, record: Record) -> Result<(), TaskError> {
        self.fingerprints
            .save(task, record)
            .map_err(|source| TaskError::Fingerprint {
                path: self.fingerprints.path(task),
                source,
            })
    }

    fn resolve(&self, products: &Products) -> Result<Outcome, TaskError> {
        let resolution = self.resolver.resolve(&self.config.dependency_specs())?;

        tracing::info!(
            "Resolved {} compile, {} bundled and {} test artifacts",
            resolution.compile_classpath.len(),
            resolution.bundle.len(),
            resolution.test_classpath.len()
        );

        let _ = products.resolution.set(resolution);
        Ok(Outcome::Executed)
    }

    fn compile_main(&self, ctx: &TaskContext<'_>, products: &Products) -> Result<Outcome, TaskError> {
        let resolution = product(&products.resolution, RESOLVE)?;
        let sources = SourceSet::scan(&self.config.sources_dir(), &self.config.compiler.include)?;

        self.compile(ctx, &sources, &resolution.compile_files(), &self.config.classes_dir())
    }

    fn compile_test(&self, ctx: &TaskContext<'_>, products: &Products) -> Result<Outcome, TaskError> {
        let resolution = product(&products.resolution, RESOLVE)?;
        let sources =
            SourceSet::scan(&self.config.test_sources_dir(), &self.config.compiler.include)?;

        let mut classpath = vec![self.config.classes_dir()];
        classpath.extend(resolution.test_files());

        self.compile(ctx, &sources, &classpath, &self.config.test_classes_dir())
    }

    fn compile(
        &self,
        ctx: &TaskContext<'_>,
        sources: &SourceSet,
        classpath: &[Utf8PathBuf],
        out: &Utf8Path,
    ) -> Result<Outcome, TaskError> {
        if sources.is_empty() {
            compile::clean_dir(out)?;
            self.fingerprints.forget(ctx.name);
            return Ok(Outcome::NoSource);
        }

        let mut fp = Fingerprint::new("compile");
        fp.field(self.compiler.describe()).hash(sources.fingerprint()?);
        for path in classpath {
            fp.field(path.as_str()).hash(hash_path(path)?);
        }
        let inputs = fp.finish();

        if out.is_dir() && self.fingerprints.is_up_to_date(ctx.name, inputs, None) {
            tracing::debug!(task = ctx.name, "Classes are up to date");
            return Ok(Outcome::UpToDate);
        }

        ctx.span
            .pb_set_message(&format!("Compiling {} sources ({})", sources.files.len(), ctx.name));

        self.fingerprints.forget(ctx.name);
        self.compiler.compile(classpath, sources, out)?;
        self.save(ctx.name, Record { inputs, output: None })?;

        Ok(Outcome::Executed)
    }

    fn process_resources(&self, products: &Products) -> Result<Outcome, TaskError> {
        let resources = self.templater.process(
            &self.config.resources_dir(),
            &self.config.processed_resources_dir(),
        )?;

        tracing::debug!(count = resources.entries.len(), "Processed resources");
        let _ = products.resources.set(resources);
        Ok(Outcome::Executed)
    }

    fn relocate(&self, products: &Products) -> Result<Outcome, TaskError> {
        let resolution = product(&products.resolution, RESOLVE)?;
        let project = archive::read_dir(&self.config.classes_dir(), "project")?;

        let bundle = resolution
            .bundle
            .par_iter()
            .map(|artifact| archive::read_jar(&artifact.file, artifact.to_string()))
            .collect::<Result<Vec<_>, _>>()?;

        let units = self.relocator.relocate(&project, &bundle)?;
        tracing::info!(
            "Relocated {} entries from {} bundled artifacts",
            units.moved,
            bundle.len()
        );

        let _ = products.relocated.set(units);
        Ok(Outcome::Executed)
    }

    fn plain_jar(&self, products: &Products) -> Result<Outcome, TaskError> {
        let project = archive::read_dir(&self.config.classes_dir(), "project")?;
        let resources = product(&products.resources, PROCESS_RESOURCES)?;
        let inputs = PackageInputs {
            project: &project,
            bundle: &[],
            resources,
        };

        self.packager.package(
            &inputs,
            &self.config.plain_archive_path(),
            &self.config.package.plain_classifier,
        )?;

        Ok(Outcome::Executed)
    }

    fn shadow_jar(&self, ctx: &TaskContext<'_>, products: &Products) -> Result<Outcome, TaskError> {
        let units = product(&products.relocated, RELOCATE)?;
        let resources = product(&products.resources, PROCESS_RESOURCES)?;
        let inputs = PackageInputs {
            project: &units.project,
            bundle: &units.bundle,
            resources,
        };
        let classifier = &self.config.package.classifier;
        let output = self.config.archive_path();

        let fingerprint = self.packager.merge(&inputs)?.fingerprint(classifier);
        if let Some(record) = self.fingerprints.load(ctx.name)
            && record.inputs == fingerprint
            && let Some(content) = record.output
            && Hash32::hash_file(&output).is_ok_and(|actual| actual == content)
        {
            tracing::debug!(path = %output, "Package is up to date");
            let _ = products.artifact.set(PackageArtifact {
                path: output,
                classifier: classifier.clone(),
                inputs: fingerprint,
                content,
            });
            return Ok(Outcome::UpToDate);
        }

        let artifact = self.packager.package(&inputs, &output, classifier)?;
        tracing::info!("Packaged {} ({})", artifact.path, artifact.content);

        self.save(
            ctx.name,
            Record {
                inputs: artifact.inputs,
                output: Some(artifact.content),
            },
        )?;

        let _ = products.artifact.set(artifact);
        Ok(Outcome::Executed)
    }

    fn deploy(&self, products: &Products) -> Result<Outcome, TaskError> {
        let artifact = product(&products.artifact, SHADOW_JAR)?;

        match self.stager.stage(artifact)? {
            StageOutcome::Copied(_) => Ok(Outcome::Executed),
            StageOutcome::UpToDate(_) => Ok(Outcome::UpToDate),
        }
    }
}

/// A configured project, ready to be invoked any number of times.
pub struct Pipeline {
    components: Arc<Components>,
    jobs: usize,
}

impl Pipeline {
    pub fn new(
        config: ProjectConfig,
        compiler: Arc<dyn Compiler>,
        repositories: Vec<Box<dyn RepositoryIndex>>,
    ) -> Result<Self, ShadepackError> {
        config.validate()?;

        let resolver = Resolver::new(repositories).with_host_api(config.host_api_keys());
        let relocator = Relocator::new(&config.relocations, &config.host.namespaces)?;
        let templater = Templater::from_config(&config)?;
        let packager = Packager::from_config(&config)?;
        let stager = Stager::new(config.deploy_dir(), config.deploy.always);
        let fingerprints = FingerprintStore::new(config.fingerprints_dir());

        Ok(Self {
            components: Arc::new(Components {
                config,
                compiler,
                resolver,
                relocator,
                templater,
                packager,
                stager,
                fingerprints,
            }),
            jobs: 0,
        })
    }

    /// Uses the configured compiler executable and the repositories on disk.
    pub fn from_config(config: ProjectConfig) -> Result<Self, ShadepackError> {
        let compiler = Arc::new(CommandCompiler::from_config(&config.compiler));
        let repositories = config
            .repository_paths()
            .into_iter()
            .map(|path| {
                LocalRepository::open(path).map(|repo| Box::new(repo) as Box<dyn RepositoryIndex>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(config, compiler, repositories)
    }

    /// Upper bound of concurrently running tasks, `0` for one per core.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.components.config
    }

    /// A new graph instance with empty hand-over slots.
    pub fn graph(&self) -> Result<Graph, GraphError> {
        let config = &self.components.config;
        let products = Arc::new(Products::default());
        let shared = || (self.components.clone(), products.clone());

        let mut builder = GraphBuilder::new();

        let (c, p) = shared();
        builder
            .task(RESOLVE)
            .group("build")
            .description("Resolves declared dependencies into classpaths and the bundle set")
            .run(move |_| c.resolve(&p));

        let (c, p) = shared();
        builder
            .task(COMPILE_JAVA)
            .group("build")
            .description("Compiles the main sources")
            .output(config.classes_dir())
            .run(move |ctx| c.compile_main(ctx, &p));

        let (c, p) = shared();
        builder
            .task(COMPILE_TEST)
            .group("verification")
            .description("Compiles the test sources against the main classes")
            .output(config.test_classes_dir())
            .run(move |ctx| c.compile_test(ctx, &p));

        let (c, p) = shared();
        builder
            .task(PROCESS_RESOURCES)
            .group("build")
            .description("Copies resources and expands placeholders in templates")
            .output(config.processed_resources_dir())
            .run(move |_| c.process_resources(&p));

        let (c, p) = shared();
        builder
            .task(RELOCATE)
            .group("shadow")
            .description("Moves bundled packages beneath their relocation targets")
            .run(move |_| c.relocate(&p));

        let (c, p) = shared();
        builder
            .task(JAR)
            .group("build")
            .description("Assembles the plain archive without bundled libraries")
            .output(config.plain_archive_path())
            .enabled(config.package.plain_archive)
            .run(move |_| c.plain_jar(&p));

        let (c, p) = shared();
        builder
            .task(SHADOW_JAR)
            .group("shadow")
            .description("Assembles the archive with the relocated bundled libraries")
            .output(config.archive_path())
            .run(move |ctx| c.shadow_jar(ctx, &p));

        builder
            .task(ASSEMBLE)
            .group("build")
            .description("Assembles the outputs of this project")
            .aggregate();

        builder
            .task(BUILD)
            .group("build")
            .description("Assembles and compiles the tests of this project")
            .aggregate();

        let (c, p) = shared();
        builder
            .task(DEPLOY)
            .group("distribution")
            .description("Copies the archive into the host's load directory")
            .output(self.components.stager.target(&config.archive_path()))
            .run(move |_| c.deploy(&p));

        builder
            .task(BUILD_AND_DEPLOY)
            .group("distribution")
            .description("Builds the project, then deploys the archive")
            .aggregate();

        builder
            .depends_on(COMPILE_JAVA, RESOLVE)
            .depends_on(COMPILE_TEST, RESOLVE)
            .depends_on(COMPILE_TEST, COMPILE_JAVA)
            .depends_on(RELOCATE, RESOLVE)
            .depends_on(RELOCATE, COMPILE_JAVA)
            .depends_on(JAR, COMPILE_JAVA)
            .depends_on(JAR, PROCESS_RESOURCES)
            .depends_on(SHADOW_JAR, RELOCATE)
            .depends_on(SHADOW_JAR, PROCESS_RESOURCES)
            .depends_on(ASSEMBLE, SHADOW_JAR)
            .depends_on(ASSEMBLE, JAR)
            .depends_on(BUILD, ASSEMBLE)
            .depends_on(BUILD, COMPILE_TEST)
            .depends_on(DEPLOY, SHADOW_JAR)
            .depends_on(BUILD_AND_DEPLOY, BUILD)
            .depends_on(BUILD_AND_DEPLOY, DEPLOY)
            .must_run_after(DEPLOY, BUILD);

        builder.finish()
    }

    /// Runs `targets` on a fresh graph. Task failures are part of the report.
    pub fn run(&self, targets: &[&str]) -> Result<BuildReport, ShadepackError> {
        let graph = self.graph()?;
        Ok(graph.run(targets, self.jobs)?)
    }

    /// Runs `invocation`; the first failed task, together with everything it
    /// kept from running, becomes the error.
    pub fn invoke(&self, invocation: Invocation) -> Result<BuildReport, ShadepackError> {
        let report = self.run(&[invocation.target()])?;

        match report.first_failure() {
            Some((task, cause)) => Err(ShadepackError::TaskFailed {
                task: task.to_string(),
                cause: cause.clone(),
                skipped: report.propagated().into_iter().map(String::from).collect(),
            }),
            None => Ok(report),
        }
    }
}
