/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PAGINATION_LIMIT: u16 = 30;
const MAX_PAGINATION_LIMIT: u16 = 100;

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the sled database (chunks, events, sync cursor)
    pub data_dir: PathBuf,

    /// Optional JSON fixture of sync responses replayed by the `core` binary
    pub fixture: Option<PathBuf>,

    /// Server-side long-poll timeout sent with each sync request
    pub long_poll_timeout: Duration,

    /// Fixed wait after a non-connectivity sync failure
    pub retry_backoff: Duration,

    /// Re-check interval while the server is unreachable but the monitor says we're online
    pub offline_recheck_interval: Duration,

    /// Events requested per backward page
    pub pagination_limit: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".timeline-sync"),
            fixture: None,
            long_poll_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(10),
            offline_recheck_interval: Duration::from_secs(10),
            pagination_limit: DEFAULT_PAGINATION_LIMIT,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <data-dir> [--fixture <path>] [--pagination-limit <n>] [--retry-backoff-ms <ms>] [--long-poll-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("timeline-sync")
            )));
        }

        let mut config = Self {
            data_dir: PathBuf::from(&args[1]),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--fixture" => {
                    let path = flag_value(args, i)?;
                    config.fixture = Some(PathBuf::from(path));
                }
                "--pagination-limit" => {
                    config.pagination_limit = parse_number(args, i)?;
                }
                "--retry-backoff-ms" => {
                    config.retry_backoff = Duration::from_millis(parse_number(args, i)?);
                }
                "--long-poll-ms" => {
                    config.long_poll_timeout = Duration::from_millis(parse_number(args, i)?);
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        config.apply_env_overrides();
        config.pagination_limit = bounded_pagination_limit(config.pagination_limit);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TIMELINE_SYNC_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Some(limit) = std::env::var("TIMELINE_SYNC_PAGINATION_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.pagination_limit = limit;
        }
    }
}

/// Clamp a requested page size into `1..=100`.
pub fn bounded_pagination_limit(requested: u16) -> u16 {
    requested.clamp(1, MAX_PAGINATION_LIMIT)
}

fn flag_value(args: &[String], i: usize) -> Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires an argument", args[i])))
}

fn parse_number<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
    flag_value(args, i)?
        .parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number", args[i])))
}
