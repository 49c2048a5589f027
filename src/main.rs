use std::time::Instant;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use shadepack::engine::{BuildReport, Graph, TaskState};
use shadepack::utils::{as_overhead, init_logging};
use shadepack::{CONFIG_FILE, Invocation, Pipeline, ProjectConfig, ShadepackError};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Project directory, every relative path is resolved against it.
    #[arg(long, short = 'p', default_value = ".", global = true)]
    project_dir: Utf8PathBuf,

    /// Configuration file, relative to the project directory.
    #[arg(long, short = 'c', default_value = CONFIG_FILE, global = true)]
    config: Utf8PathBuf,

    /// Maximum number of tasks running at once, 0 for one per core.
    #[arg(long, short = 'j', default_value_t = 0, global = true)]
    jobs: usize,

    /// Overrides the host directory the package is deployed to.
    #[arg(long, global = true)]
    deploy_dir: Option<Utf8PathBuf>,

    /// Writes the outcome of every task as a Mermaid diagram.
    #[arg(long, global = true)]
    mermaid: Option<Utf8PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Compile, relocate, template and package.
    Build,
    /// Package and copy the package into the host directory.
    Deploy,
    /// Build, then deploy, in one run.
    BuildAndDeploy,
    /// Run arbitrary tasks by name.
    Run {
        #[arg(required = true)]
        tasks: Vec<String>,
    },
    /// List the tasks by group.
    Tasks,
    /// Print the task graph as a Mermaid diagram.
    Graph,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;

    let mut config = ProjectConfig::load(args.project_dir.join(&args.config))?;
    if let Some(dir) = &args.deploy_dir {
        config.deploy.dir = dir.clone();
    }

    let pipeline = Pipeline::from_config(config)?.with_jobs(args.jobs);

    let invocation = match &args.command {
        Command::Build => Invocation::Build,
        Command::Deploy => Invocation::Deploy,
        Command::BuildAndDeploy => Invocation::BuildAndDeploy,
        Command::Run { tasks } => {
            let targets: Vec<&str> = tasks.iter().map(String::as_str).collect();
            let s = Instant::now();
            let report = pipeline.run(&targets)?;
            finish(&pipeline, &args, &report, s)?;

            if let Some((task, cause)) = report.first_failure() {
                anyhow::bail!("Task '{task}' failed: {cause}");
            }
            return Ok(());
        }
        Command::Tasks => {
            print_tasks(&pipeline.graph()?);
            return Ok(());
        }
        Command::Graph => {
            print!("{}", pipeline.graph()?);
            return Ok(());
        }
    };

    let s = Instant::now();
    match pipeline.invoke(invocation) {
        Ok(report) => finish(&pipeline, &args, &report, s),
        Err(ShadepackError::TaskFailed {
            task,
            cause,
            skipped,
        }) => {
            eprintln!("{} {}: {}", style("FAILED").red().bold(), task, cause);
            for name in &skipped {
                eprintln!("  {} {}", style("not run").yellow(), name);
            }
            anyhow::bail!("Task '{task}' failed")
        }
        Err(err) => Err(err.into()),
    }
}

fn finish(pipeline: &Pipeline, args: &Args, report: &BuildReport, s: Instant) -> anyhow::Result<()> {
    for record in &report.records {
        let state = match &record.state {
            TaskState::Succeeded => style(record.state.to_string()).green(),
            TaskState::Skipped(_) => style(record.state.to_string()).blue(),
            TaskState::Failed(error) => style(format!("failed: {error}")).red(),
            state => style(state.to_string()).yellow(),
        };

        match record.execution {
            Some(execution) => eprintln!("  {:<18} {} ({:.2?})", record.name, state, execution.duration),
            None => eprintln!("  {:<18} {}", record.name, state),
        }
    }

    if let Some(path) = &args.mermaid {
        std::fs::write(path, report.render_mermaid(&pipeline.graph()?))?;
    }

    eprintln!("Finished {} tasks {}", report.records.len(), as_overhead(s));
    Ok(())
}

fn print_tasks(graph: &Graph) {
    let mut tasks: Vec<_> = graph.tasks().collect();
    tasks.sort_by_key(|task| (task.group(), task.name()));

    let mut group = None;
    for task in tasks {
        if group != Some(task.group()) {
            group = Some(task.group());
            println!("\n{}", style(task.group()).bold());
        }

        let disabled = match task.is_enabled() {
            true => "",
            false => " (disabled)",
        };
        println!("  {:<18} {}{}", task.name(), task.description(), disabled);
    }
}
