//! Tracing setup.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_FILE_NAME: &str = "reelq.log";

/// The log file is cut down to its most recent 10 MiB at startup.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Install the global subscriber: stderr always, plus `<log_dir>/reelq.log`
/// when a log directory is configured. `RUST_LOG` overrides the `info` default.
pub fn init(log_dir: Option<&Path>, json: bool) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let path = dir.join(LOG_FILE_NAME);
            trim_log(&path, MAX_LOG_BYTES)
                .with_context(|| format!("Failed to trim log file: {}", path.display()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some((path, Arc::new(file)))
        }
        None => None,
    };

    let (stderr_plain, stderr_json) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };
    let file_layer = file
        .as_ref()
        .map(|(_, f)| fmt::layer().with_ansi(false).with_writer(f.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_plain)
        .with(stderr_json)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(file.map(|(path, _)| path))
}

/// Keep only the last `max_bytes` of `path`, starting at a line boundary.
/// A missing file is left alone.
pub fn trim_log(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len <= max_bytes {
        return Ok(());
    }

    file.seek(SeekFrom::Start(len - max_bytes))?;
    let mut tail = Vec::with_capacity(max_bytes as usize);
    file.read_to_end(&mut tail)?;
    drop(file);

    let start = tail
        .iter()
        .position(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    let mut out = File::create(path)?;
    out.write_all(&tail[start..])?;
    out.flush()
}
