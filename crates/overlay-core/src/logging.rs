use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogRotation, LoggingSettings};

/// Initialize logging from settings: a file layer under `settings.dir` and,
/// unless disabled, a stderr layer. `RUST_LOG` overrides `settings.level`.
/// Returns a guard that must be held for the lifetime of the application
/// to ensure log messages are flushed.
///
/// Console output goes to stderr so command output on stdout stays
/// machine-readable.
pub fn init_logging(
    settings: &LoggingSettings,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&settings.dir)?;

    let filter = build_filter(&settings.level, std::env::var("RUST_LOG").ok().as_deref())?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(settings));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            settings
                .console
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .try_init()?;

    Ok(guard)
}

fn file_appender(settings: &LoggingSettings) -> RollingFileAppender {
    let dir = &settings.dir;
    let name = &settings.file_name;
    match settings.rotation {
        LogRotation::Never => rolling::never(dir, name),
        LogRotation::Daily => rolling::daily(dir, name),
        LogRotation::Hourly => rolling::hourly(dir, name),
    }
}

/// A non-empty `env` directive wins over the configured level.
fn build_filter(level: &str, env: Option<&str>) -> anyhow::Result<EnvFilter> {
    let directives = env.filter(|v| !v.trim().is_empty()).unwrap_or(level);
    Ok(EnvFilter::try_new(directives)?)
}
