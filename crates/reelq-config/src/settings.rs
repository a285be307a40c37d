//! Scheduler configuration parsing.
//!
//! A config file has one node per section:
//!
//! ```kdl
//! database { host "localhost"; port 5432; user "reelq"; name "reelq" }
//! pool { max-connections 10 }
//! scheduler { batch-size 10; workers 4; poll-interval-ms 1000 }
//! job { command "python3" "application.py"; output-path "output" }
//! log-path "./logging_dir"
//! ```
//!
//! Every section is optional and falls back to its defaults, but nodes the
//! parser does not know are rejected rather than ignored.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "reelq.kdl";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReelqConfig {
    pub database: DatabaseConfig,
    pub pool: PoolSettings,
    pub scheduler: SchedulerSettings,
    pub job: JobSettings,
    /// Directory for the log file. Logs go to stderr only when unset.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "reelq".to_string(),
            password: None,
            name: "reelq".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub max_connections: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub workers: usize,
    pub poll_interval: Duration,
    pub recover_on_start: bool,
    pub max_retry_times: u32,
    pub retry_delay: Duration,
    pub completion_acquire_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            recover_on_start: true,
            max_retry_times: 3,
            retry_delay: Duration::from_millis(500),
            completion_acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// External command run for every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Each job gets `<output_path>/<task_uuid>/` as working directory.
    pub output_path: PathBuf,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "application.py".to_string()],
            output_path: PathBuf::from("output"),
        }
    }
}

/// Parse a configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<ReelqConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ReelqConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }
        match name {
            "database" => parse_database(node, &mut config.database)?,
            "pool" => parse_pool(node, &mut config.pool)?,
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "job" => parse_job(node, &mut config.job)?,
            "log-path" => {
                let path = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("log-path".to_string()))?;
                config.log_path = Some(PathBuf::from(path));
            }
            other => return Err(ConfigError::UnknownNode(other.to_string())),
        }
    }

    validate(&config)?;
    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_config(path: &Path) -> ConfigResult<ReelqConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

fn validate(config: &ReelqConfig) -> ConfigResult<()> {
    if config.pool.max_connections == 0 {
        return Err(ConfigError::invalid(
            "pool.max-connections",
            "must be at least 1",
        ));
    }
    if config.scheduler.batch_size == 0 {
        return Err(ConfigError::invalid("scheduler.batch-size", "must be at least 1"));
    }
    if config.scheduler.workers == 0 {
        return Err(ConfigError::invalid("scheduler.workers", "must be at least 1"));
    }
    if config.job.command.is_empty() {
        return Err(ConfigError::MissingField("job command".to_string()));
    }
    Ok(())
}

fn parse_database(node: &KdlNode, db: &mut DatabaseConfig) -> ConfigResult<()> {
    for child in section_children(node) {
        match child.name().value() {
            "host" => db.host = required_string(child, "database.host")?,
            "port" => {
                let port = get_int_arg(child, "database.port")?;
                db.port = u16::try_from(port).map_err(|_| {
                    ConfigError::invalid("database.port", format!("{port} is not a port"))
                })?;
            }
            "user" => db.user = required_string(child, "database.user")?,
            "password" => db.password = Some(required_string(child, "database.password")?),
            "name" => db.name = required_string(child, "database.name")?,
            other => return Err(ConfigError::UnknownNode(format!("database.{other}"))),
        }
    }
    Ok(())
}

fn parse_pool(node: &KdlNode, pool: &mut PoolSettings) -> ConfigResult<()> {
    for child in section_children(node) {
        match child.name().value() {
            "max-connections" => {
                pool.max_connections = get_count_arg(child, "pool.max-connections")?
            }
            other => return Err(ConfigError::UnknownNode(format!("pool.{other}"))),
        }
    }
    Ok(())
}

fn parse_scheduler(node: &KdlNode, sched: &mut SchedulerSettings) -> ConfigResult<()> {
    for child in section_children(node) {
        let name = child.name().value();
        let field = format!("scheduler.{name}");
        match name {
            "batch-size" => sched.batch_size = get_count_arg(child, &field)?,
            "workers" => sched.workers = get_count_arg(child, &field)?,
            "poll-interval-ms" => sched.poll_interval = get_millis_arg(child, &field)?,
            "recover-on-start" => {
                sched.recover_on_start = get_first_bool_arg(child)
                    .ok_or_else(|| ConfigError::invalid(&field, "expected #true or #false"))?
            }
            "max-retry-times" => {
                let n = get_int_arg(child, &field)?;
                sched.max_retry_times = u32::try_from(n)
                    .map_err(|_| ConfigError::invalid(&field, format!("{n} is out of range")))?;
            }
            "retry-delay-ms" => sched.retry_delay = get_millis_arg(child, &field)?,
            "completion-acquire-timeout-ms" => {
                sched.completion_acquire_timeout = get_millis_arg(child, &field)?
            }
            other => return Err(ConfigError::UnknownNode(format!("scheduler.{other}"))),
        }
    }
    Ok(())
}

fn parse_job(node: &KdlNode, job: &mut JobSettings) -> ConfigResult<()> {
    for child in section_children(node) {
        match child.name().value() {
            "command" => job.command = get_all_string_args(child),
            "output-path" => {
                job.output_path = PathBuf::from(required_string(child, "job.output-path")?)
            }
            other => return Err(ConfigError::UnknownNode(format!("job.{other}"))),
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn section_children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn get_int_arg(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    let entry = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    entry
        .value()
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))
}

fn get_count_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let n = get_int_arg(node, field)?;
    usize::try_from(n).map_err(|_| ConfigError::invalid(field, format!("{n} is not a count")))
}

fn get_millis_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let n = get_int_arg(node, field)?;
    let ms = u64::try_from(n)
        .map_err(|_| ConfigError::invalid(field, format!("{n} is not a duration")))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            database {
                host "db.internal"
                port 6432
                user "render"
                password "hunter2"
                name "movies"
            }
            pool { max-connections 4; }
            scheduler {
                batch-size 20
                workers 2
                poll-interval-ms 250
                recover-on-start #false
                max-retry-times 5
                retry-delay-ms 100
                completion-acquire-timeout-ms 3000
            }
            job {
                command "python3" "application.py" "--fast"
                output-path "/var/lib/reelq"
            }
            log-path "./logging_dir"
        "#;

        let config = parse_config(kdl).unwrap();
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6432);
        assert_eq!(config.database.password.as_deref(), Some("hunter2"));
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.scheduler.batch_size, 20);
        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(250));
        assert!(!config.scheduler.recover_on_start);
        assert_eq!(config.scheduler.max_retry_times, 5);
        assert_eq!(
            config.scheduler.completion_acquire_timeout,
            Duration::from_secs(3)
        );
        assert_eq!(config.job.command, vec!["python3", "application.py", "--fast"]);
        assert_eq!(config.log_path, Some(PathBuf::from("./logging_dir")));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ReelqConfig::default());
        assert!(config.scheduler.recover_on_start);
        assert_eq!(config.pool.max_connections, 10);
    }

    #[test]
    fn test_unknown_top_level_node_is_rejected() {
        let result = parse_config(r#"queue { size 3; }"#);
        assert!(matches!(result, Err(ConfigError::UnknownNode(name)) if name == "queue"));
    }

    #[test]
    fn test_unknown_section_key_is_rejected() {
        let result = parse_config("scheduler { threads 4; }");
        assert!(matches!(
            result,
            Err(ConfigError::UnknownNode(name)) if name == "scheduler.threads"
        ));
    }

    #[test]
    fn test_duplicate_section_is_rejected() {
        let result = parse_config("pool { max-connections 1; }\npool { max-connections 2; }");
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let result = parse_config("scheduler { workers 0; }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_negative_port_is_rejected() {
        let result = parse_config("database { port -1; }");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_non_integer_value_is_rejected() {
        let result = parse_config(r#"pool { max-connections "ten"; }"#);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let result = parse_config("job { command; }");
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }
}
