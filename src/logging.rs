use std::{fs::File, io, path::Path};

use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber.
///
/// The console shows `level` unless `RUST_LOG` says otherwise. With `log_file`, everything down
/// to trace is also written there, overwriting the previous run.
pub fn init(level: Level, log_file: Option<&Path>) -> io::Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let console = fmt::layer().with_target(true).with_filter(console_filter);

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let writer = File::create(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new("trace")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry().with(console).with(file).init();
    Ok(())
}
