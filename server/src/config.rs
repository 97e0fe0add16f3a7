//! Relay configuration.
//!
//! Everything is driven from the command line; [`Config`] is the resolved
//! form with defaults applied.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_CLIENT_PORT: u16 = 3478;
pub const DEFAULT_PEER_PORT: u16 = 3479;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// Command line arguments for the relay daemon.
#[derive(Debug, Parser)]
#[command(name = "relayd")]
#[command(about = "Multi-threaded UDP relay", version)]
pub struct Args {
    /// Number of worker threads (default: number of CPUs)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Client-facing listen address
    #[arg(long, default_value_t = default_addr(DEFAULT_CLIENT_PORT))]
    pub client: SocketAddr,

    /// Peer-facing listen address
    #[arg(long, default_value_t = default_addr(DEFAULT_PEER_PORT))]
    pub peer: SocketAddr,

    /// Statistics reporting interval in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_STATS_INTERVAL_SECS)]
    pub stats_interval: u64,

    /// CPU cores to pin workers to (Linux-style list, e.g. "0-3,6")
    #[arg(long)]
    pub cpu_affinity: Option<String>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

fn default_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable output
    Pretty,
    /// Newline-delimited JSON
    Json,
    /// Single-line compact output
    Compact,
}

/// Logging settings handed to [`crate::logging::init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Include module target in output.
    pub target: bool,
    /// Include thread names; workers are named, so this attributes log
    /// lines to their event loop.
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            target: true,
            thread_names: true,
        }
    }
}

/// Resolved relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub threads: usize,
    pub client_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    /// `None` disables the statistics timer.
    pub stats_interval: Option<Duration>,
    pub cpu_affinity: Option<Vec<usize>>,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, String> {
        let threads = match args.threads {
            Some(0) => return Err("threads must be at least 1".to_string()),
            Some(n) => n,
            None => default_threads(),
        };

        let cpu_affinity = match args.cpu_affinity.as_deref() {
            Some(list) => Some(parse_cpu_list(list)?),
            None => None,
        };

        let stats_interval = match args.stats_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            threads,
            client_addr: args.client,
            peer_addr: args.peer,
            stats_interval,
            cpu_affinity,
            logging: LoggingConfig {
                level: args.log_level,
                format: args.log_format,
                ..LoggingConfig::default()
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            client_addr: default_addr(DEFAULT_CLIENT_PORT),
            peer_addr: default_addr(DEFAULT_PEER_PORT),
            stats_interval: Some(Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS)),
            cpu_affinity: None,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_threads() -> usize {
    num_cpus::get().max(1)
}

/// Parse a Linux-style CPU list: comma-separated entries, each a single
/// core or an inclusive range, e.g. "0-3,6,8-9".
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(format!("empty entry in cpu list '{}'", list));
        }
        match entry.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid cpu range '{}'", entry))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid cpu range '{}'", entry))?;
                if end < start {
                    return Err(format!("descending cpu range '{}'", entry));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(
                entry
                    .parse()
                    .map_err(|_| format!("invalid cpu id '{}'", entry))?,
            ),
        }
    }
    Ok(cpus)
}
