//! Runtime configuration: an optional TOML file, with CLI flags (see the
//! `stalkd` binary's `args` module) always taking precedence over whatever
//! the file says.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 11300;
pub const DEFAULT_MAX_JOB_SIZE: u32 = 65_535;
pub const DEFAULT_WAL_DIR: &str = "./wal";
pub const DEFAULT_WAL_FILES: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: IpAddr,
    pub port: u16,
    pub max_job_size: u32,
    pub wal_enable: bool,
    pub wal_dir: PathBuf,
    pub wal_files: usize,
}

/// Any CLI-supplied override. `None` means "fall back to the config file,
/// then to the built-in default" — this is why every field here is
/// optional even though [`Config`]'s aren't.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_job_size: Option<u32>,
    pub wal_dir: Option<PathBuf>,
}

/// The on-disk shape of the config file, e.g.:
/// ```toml
/// [server]
/// port = 11300
///
/// [wal]
/// enable = true
/// dir = "/var/lib/stalkd"
/// files = 3
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FileConfig {
    server: ServerSection,
    job: JobSection,
    wal: WalSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ServerSection {
    listen: Option<IpAddr>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct JobSection {
    max_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct WalSection {
    enable: Option<bool>,
    dir: Option<PathBuf>,
    files: Option<usize>,
}

impl Config {
    /// Builds the effective configuration from an optional TOML file plus
    /// CLI overrides. A `wal_dir` override implies WAL is enabled,
    /// regardless of what `wal.enable` in the file says — there would be no
    /// other way to turn WAL on from the command line.
    pub fn resolve(file_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file = match file_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let listen = overrides
            .listen
            .or(file.server.listen)
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));

        let port = overrides.port.or(file.server.port).unwrap_or(DEFAULT_PORT);

        let max_job_size = overrides
            .max_job_size
            .or(file.job.max_size)
            .unwrap_or(DEFAULT_MAX_JOB_SIZE);

        let wal_files = file.wal.files.unwrap_or(DEFAULT_WAL_FILES);

        let (wal_enable, wal_dir) = match overrides.wal_dir {
            Some(dir) => (true, dir),
            None => {
                let enable = file.wal.enable.unwrap_or(false);
                let dir = file.wal.dir.unwrap_or_else(|| PathBuf::from(DEFAULT_WAL_DIR));
                (enable, dir)
            },
        };

        Ok(Self {
            listen,
            port,
            max_job_size,
            wal_enable,
            wal_dir,
            wal_files,
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_toml() {
        let text = "[server]\nport = 11301\n\n[wal]\nenable = true\ndir = \"/var/lib/stalkd\"\n";
        let file: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(file.server.port, Some(11301));
        assert_eq!(file.wal.enable, Some(true));
        assert_eq!(file.wal.dir, Some(PathBuf::from("/var/lib/stalkd")));
    }

    #[test]
    fn cli_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stalkd.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();

        let cfg = Config::resolve(
            Some(&path),
            Overrides {
                port: Some(11300),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(cfg.port, 11300);
    }

    #[test]
    fn file_value_used_when_no_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stalkd.toml");
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();

        let cfg = Config::resolve(Some(&path), Overrides::default()).unwrap();
        assert_eq!(cfg.port, 9999);
    }

    #[test]
    fn wal_dir_override_implies_enable() {
        let cfg = Config::resolve(
            None,
            Overrides {
                wal_dir: Some(PathBuf::from("/tmp/stalkd-wal")),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(cfg.wal_enable);
        assert_eq!(cfg.wal_dir, PathBuf::from("/tmp/stalkd-wal"));
    }

    #[test]
    fn absent_config_file_uses_defaults() {
        let cfg = Config::resolve(None, Overrides::default()).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.max_job_size, DEFAULT_MAX_JOB_SIZE);
        assert!(!cfg.wal_enable);
    }
}
