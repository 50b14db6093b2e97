use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::LogSettings;
use crate::error::{AppError, AppResult};

const DEFAULT_FILTER: &str = "info";

pub fn log_file_name(date: chrono::NaiveDate) -> String {
    format!("app-{}.txt", date.format("%Y-%m-%d"))
}

pub fn current_log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(log_file_name(chrono::Local::now().date_naive()))
}

fn env_filter(settings: &LogSettings) -> EnvFilter {
    let directive = settings.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {:?} ({}), using {}", directive, err, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Installs the global subscriber. With a log directory, output is appended to that day's
/// `app-YYYY-MM-DD.txt`; otherwise it goes to stderr.
pub fn init_logging(settings: &LogSettings) -> AppResult<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(settings));

    let result = match &settings.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(current_log_file_path(dir))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    result.map_err(|e| AppError::Other(format!("Failed to install logger: {}", e)))
}

/// Log file names in `log_dir`, most recent first.
pub fn list_log_files(log_dir: &Path) -> AppResult<Vec<String>> {
    let entries = fs::read_dir(log_dir)?;

    let mut log_files: Vec<String> = entries
        .filter_map(|entry| {
            entry.ok().and_then(|e| {
                let path = e.path();
                if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("txt") {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(|s| s.to_string())
                } else {
                    None
                }
            })
        })
        .collect();

    log_files.sort_by(|a, b| b.cmp(a)); // Most recent first
    Ok(log_files)
}
