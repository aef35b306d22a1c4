use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

/// Installs the global subscriber: human-readable output on stdout plus, if
/// `log_file` is given, a plain-text copy appended to that file.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. If the log file
/// cannot be opened the process keeps running with stdout only.
pub fn init_tracing(log_file: Option<&Path>) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| match open_append(path) {
        Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
        Err(err) => {
            open_error = Some((path.display().to_string(), err));
            None
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();

    if let Some((path, error)) = open_error {
        warn!(%path, %error, "could not open log file; logging to stdout only");
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
