//! Startup configuration (§4.H): resolves CLI arguments into an
//! immutable snapshot consumed by the engine.
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("destination directory must not be empty")]
    EmptyDestination,

    #[error("worker count must be greater than zero")]
    ZeroWorkers,
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 256;
const DEFAULT_WORKER_COUNT: usize = 16;
const DEFAULT_LISTEN_PORT: u16 = 6881;
const DEFAULT_BITFIELD_DIR: &str = "bitfield";

/// Immutable snapshot of the settings a download run is driven by.
#[derive(Debug, Clone)]
pub struct Config {
    pub torrent_path: PathBuf,
    pub dest_dir: PathBuf,
    pub bitfield_dir: PathBuf,
    pub worker_count: usize,
    pub listen_port: u16,
}

impl Config {
    /// Builds a `Config`, validating `dest_dir` is non-empty and clamping
    /// `worker_count` into `[1, 256]` (zero is rejected rather than
    /// silently clamped, since it signals a caller mistake).
    pub fn new(
        torrent_path: PathBuf,
        dest_dir: PathBuf,
        bitfield_dir: Option<PathBuf>,
        worker_count: Option<usize>,
        listen_port: Option<u16>,
    ) -> ConfigResult<Self> {
        if dest_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDestination);
        }
        let worker_count = worker_count.unwrap_or(DEFAULT_WORKER_COUNT);
        if worker_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let worker_count = worker_count.clamp(MIN_WORKERS, MAX_WORKERS);

        Ok(Self {
            torrent_path,
            dest_dir,
            bitfield_dir: bitfield_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_BITFIELD_DIR)),
            worker_count,
            listen_port: listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults() {
        let cfg = Config::new(PathBuf::from("a.torrent"), PathBuf::from("out"), None, None, None).unwrap();
        assert_eq!(cfg.bitfield_dir, PathBuf::from("bitfield"));
        assert_eq!(cfg.worker_count, 16);
        assert_eq!(cfg.listen_port, 6881);
    }

    #[test]
    fn rejects_empty_destination() {
        let result = Config::new(PathBuf::from("a.torrent"), PathBuf::new(), None, None, None);
        assert!(matches!(result, Err(ConfigError::EmptyDestination)));
    }

    #[test]
    fn rejects_zero_workers() {
        let result = Config::new(
            PathBuf::from("a.torrent"),
            PathBuf::from("out"),
            None,
            Some(0),
            None,
        );
        assert!(matches!(result, Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn clamps_worker_count_above_max() {
        let cfg = Config::new(
            PathBuf::from("a.torrent"),
            PathBuf::from("out"),
            None,
            Some(10_000),
            None,
        )
        .unwrap();
        assert_eq!(cfg.worker_count, 256);
    }
}
