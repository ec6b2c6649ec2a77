use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "TOGGL_NOW_LOG";
const DEFAULT_DIRECTIVE: &str = "toggl_now=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    File,
    Stderr,
    Off,
}

pub fn init(target: LogTarget) -> Option<PathBuf> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match target {
        LogTarget::Stderr => {
            let _ = builder.with_writer(io::stderr).try_init();
            None
        }
        LogTarget::File => match open_log_file() {
            Some((path, file)) => {
                let _ = builder
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .try_init();
                Some(path)
            }
            None => {
                let _ = builder.with_writer(io::sink).try_init();
                None
            }
        },
        LogTarget::Off => {
            let _ = builder.with_writer(io::sink).try_init();
            None
        }
    }
}

fn open_log_file() -> Option<(PathBuf, File)> {
    let mut path = dirs::data_local_dir()?;
    path.push("toggl-now");
    fs::create_dir_all(&path).ok()?;
    path.push("toggl-now.log");
    let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    Some((path, file))
}
