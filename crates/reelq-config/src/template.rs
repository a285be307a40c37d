//! Starter configuration written by `reelq init`.

use crate::settings::DEFAULT_CONFIG_FILE;
use crate::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

pub const TEMPLATE: &str = r#"// reelq configuration

database {
    host "localhost"
    port 5432
    user "reelq"
    password "change-me"
    name "reelq"
}

pool {
    max-connections 10
}

scheduler {
    batch-size 10
    workers 4
    poll-interval-ms 1000
    recover-on-start #true
    max-retry-times 3
    retry-delay-ms 500
    completion-acquire-timeout-ms 10000
}

job {
    command "python3" "application.py"
    output-path "output"
}

log-path "./logging_dir"
"#;

/// Write [`TEMPLATE`] to `<dir>/reelq.kdl`, creating `dir` if needed.
/// An existing file is never overwritten.
pub fn write_template(dir: &Path) -> ConfigResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }
    std::fs::write(&path, TEMPLATE)?;
    Ok(path)
}
