//! KDL configuration parsing for reelq.
//!
//! This crate handles:
//! - The scheduler configuration file (reelq.kdl)
//! - The starter template written by `reelq init`

pub mod error;
pub mod settings;
pub mod template;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    DEFAULT_CONFIG_FILE, DatabaseConfig, JobSettings, PoolSettings, ReelqConfig,
    SchedulerSettings, load_config, parse_config,
};
pub use template::{TEMPLATE, write_template};
