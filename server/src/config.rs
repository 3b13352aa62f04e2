//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use mm_memcache::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Per-partition task spinlock.
    Locking,
    /// Ship actions to the partition's owning core.
    Delegate,
    /// Combining lock per partition.
    Combine,
}

impl From<Mode> for AccessMode {
    fn from(mode: Mode) -> AccessMode {
        match mode {
            Mode::Locking => AccessMode::Locking,
            Mode::Delegate => AccessMode::Delegate,
            Mode::Combine => AccessMode::Combine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "mainmem", about = "Thread-per-core memcache server")]
pub struct ServerConfig {
    /// Worker threads; 0 means one per detected CPU.
    #[arg(long, default_value_t = 0)]
    pub cores: usize,

    /// Maximum worker tasks per core.
    #[arg(long, default_value_t = 256)]
    pub max_workers: u32,

    /// Cache partitions; 0 means one per core, rounded to a power of two.
    #[arg(long, default_value_t = 0)]
    pub partitions: u16,

    /// Total cache volume in bytes, split across partitions.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    pub volume: usize,

    /// Initial bucket count per partition.
    #[arg(long, default_value_t = 2048, hide = true)]
    pub buckets_min: u32,

    /// Partition access strategy.
    #[arg(long, value_enum, default_value_t = Mode::Locking)]
    pub mode: Mode,

    /// TCP listen address.
    #[arg(long, default_value = "127.0.0.1:11211")]
    pub listen: SocketAddr,

    /// Unix socket path for the admin command channel.
    #[arg(long, default_value = "mm_cmd.sock")]
    pub admin_sock: Option<PathBuf>,

    /// Pin core threads to CPUs.
    #[arg(long, default_value_t = false)]
    pub pin_threads: bool,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::parse_from(["mainmem"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = ServerConfig::default();
        assert_eq!(config.cores, 0);
        assert_eq!(config.max_workers, 256);
        assert_eq!(config.partitions, 0);
        assert_eq!(config.mode, Mode::Locking);
        assert_eq!(config.listen, "127.0.0.1:11211".parse().unwrap());
        assert_eq!(config.admin_sock, Some(PathBuf::from("mm_cmd.sock")));
    }

    #[test]
    fn mode_flag_parses() {
        let config =
            ServerConfig::parse_from(["mainmem", "--mode", "combine", "--partitions", "8"]);
        assert_eq!(config.mode, Mode::Combine);
        assert_eq!(config.partitions, 8);
    }
}
