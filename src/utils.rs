use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

use crate::error::ShadepackError;

const ANSI_BLUE: Style = Style::new().blue();

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg} [{elapsed}]")
        .expect("Error setting task spinner template")
});

/// Style of the bar tracking the whole invocation.
pub fn progress_style() -> ProgressStyle {
    PROGRESS_STYLE.clone()
}

/// Style of a single running task, no progress of its own.
pub fn task_style() -> ProgressStyle {
    TASK_STYLE.clone()
}

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Installs the global subscriber: `RUST_LOG` filtering (default `info`) and
/// log lines routed around the progress bars. Calling it again is a no-op.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), ShadepackError> {
    use std::sync::OnceLock;

    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    INIT.get_or_init(|| {
        let indicatif = IndicatifLayer::new();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(indicatif.get_stderr_writer()),
            )
            .with(indicatif)
            .try_init()
            .map_err(|err| err.to_string())
    })
    .clone()
    .map_err(ShadepackError::Logging)
}

#[cfg(not(feature = "logging"))]
pub fn init_logging() -> Result<(), ShadepackError> {
    Ok(())
}
