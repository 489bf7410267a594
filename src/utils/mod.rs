use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod device;
pub(crate) mod poll;
pub mod sys_route;

/// Initializes the global tracing subscriber.
///
/// The verbosity level sets the default directive (0 info, 1 debug, 2 and
/// up trace); `RUST_LOG` still overrides it. With an error-log path the
/// output goes to that file instead of stderr, without ANSI colors.
pub fn init_tracing(verbose: u8, error_log: Option<&Path>) -> anyhow::Result<()> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_line_number(true)
        .with_file(true);

    match error_log {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("cannot open error log {}", path.display()))?;
            tracing::subscriber::set_global_default(
                builder.with_ansi(false).with_writer(Arc::new(file)).finish(),
            )?;
        }
        None => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}
