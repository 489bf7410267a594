//! Server configuration
//!
//! CLI options are parsed first; when `--config` names a TOML file, its
//! keys overwrite the CLI values. Validation happens once, at startup,
//! and any failure is fatal with a non-zero exit.

use anyhow::{Context, bail};
use clap::Args;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 55555;
pub const DEFAULT_THREADS: u8 = 8;
pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_DEV: &str = "teavpn";
pub const DEFAULT_INET4: &str = "5.5.0.1/16";

/// Options for the `server` subcommand.
#[derive(Args, Debug)]
pub struct ServerOpts {
    /// Bind address (default 0.0.0.0)
    #[arg(long)]
    pub address: Option<Ipv4Addr>,

    /// Bind port (default 55555)
    #[arg(long)]
    pub port: Option<u16>,

    /// Writer worker count (default 8, minimum 3 effective)
    #[arg(long)]
    pub threads: Option<u8>,

    /// Configuration file; its keys overwrite these options
    #[arg(long, alias = "config-file")]
    pub config: Option<PathBuf>,

    /// Append log output to this file instead of stderr
    #[arg(long)]
    pub error_log: Option<PathBuf>,

    /// Verbosity level (0 info, 1 debug, 2+ trace)
    #[arg(long, value_name = "LEVEL", num_args = 0..=1, default_missing_value = "1")]
    pub verbose: Option<u8>,

    /// TUN device name
    #[arg(long)]
    pub dev: Option<String>,
}

/// Keys recognized in the server configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerFile {
    dev: Option<String>,
    mtu: Option<u16>,
    inet4: Option<String>,
    inet4_broadcast: Option<String>,
    bind_addr: Option<Ipv4Addr>,
    bind_port: Option<u16>,
    threads: Option<u8>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: Ipv4Addr,
    pub bind_port: u16,
    pub threads: u8,
    pub dev: String,
    pub mtu: u16,
    pub inet4: Ipv4Net,
    pub inet4_broadcast: Ipv4Addr,
    pub data_dir: PathBuf,
    pub verbose: u8,
    pub error_log: Option<PathBuf>,
}

impl ServerConfig {
    pub fn resolve(opts: ServerOpts) -> anyhow::Result<Self> {
        let file = load_file(opts.config.as_deref())?;

        let inet4: Ipv4Net = file
            .inet4
            .as_deref()
            .unwrap_or(DEFAULT_INET4)
            .parse()
            .context("invalid inet4 address")?;

        let inet4_broadcast = match file.inet4_broadcast {
            Some(s) => s.parse().context("invalid inet4_broadcast address")?,
            None => inet4.broadcast(),
        };

        // the user store root only comes from the configuration file
        let Some(data_dir) = file.data_dir else {
            bail!("data_dir cannot be empty");
        };

        Ok(Self {
            bind_addr: file
                .bind_addr
                .or(opts.address)
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            bind_port: file.bind_port.or(opts.port).unwrap_or(DEFAULT_PORT),
            threads: file.threads.or(opts.threads).unwrap_or(DEFAULT_THREADS),
            dev: file
                .dev
                .or(opts.dev)
                .unwrap_or_else(|| DEFAULT_DEV.to_string()),
            mtu: file.mtu.unwrap_or(DEFAULT_MTU),
            inet4,
            inet4_broadcast,
            data_dir,
            verbose: opts.verbose.unwrap_or(0),
            error_log: opts.error_log,
        })
    }
}

fn load_file(path: Option<&std::path::Path>) -> anyhow::Result<ServerFile> {
    let Some(path) = path else {
        return Ok(ServerFile::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot open config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("config error in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_opts() -> ServerOpts {
        ServerOpts {
            address: None,
            port: None,
            threads: None,
            config: None,
            error_log: None,
            verbose: None,
            dev: None,
        }
    }

    fn minimal_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "data_dir = \"/var/lib/teavpn\"\n").unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_fill_everything_but_data_dir() {
        let (_dir, path) = minimal_file();
        let mut opts = no_opts();
        opts.config = Some(path);
        let cfg = ServerConfig::resolve(opts).unwrap();
        assert_eq!(cfg.bind_addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(cfg.bind_port, DEFAULT_PORT);
        assert_eq!(cfg.threads, DEFAULT_THREADS);
        assert_eq!(cfg.dev, DEFAULT_DEV);
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert_eq!(cfg.inet4.to_string(), DEFAULT_INET4);
        assert_eq!(cfg.inet4_broadcast, Ipv4Addr::new(5, 5, 255, 255));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/teavpn"));
    }

    #[test]
    fn file_overwrites_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
# server endpoint
bind_addr = "127.0.0.1"
bind_port = 44444
threads = 4
dev = "tea0"
mtu = 1400
inet4 = "10.9.0.1/24"
inet4_broadcast = "10.9.0.255"
data_dir = "/srv/teavpn"
"#,
        )
        .unwrap();

        let mut opts = no_opts();
        opts.port = Some(55556);
        opts.config = Some(path);
        let cfg = ServerConfig::resolve(opts).unwrap();
        assert_eq!(cfg.bind_addr, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(cfg.bind_port, 44444);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.dev, "tea0");
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/teavpn"));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "no_such_key = 1\n").unwrap();
        let mut opts = no_opts();
        opts.config = Some(path);
        assert!(ServerConfig::resolve(opts).is_err());
    }

    #[test]
    fn missing_data_dir_is_fatal() {
        let err = ServerConfig::resolve(no_opts()).unwrap_err();
        assert!(err.to_string().contains("data_dir"));
    }

    #[test]
    fn invalid_inet4_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "inet4 = \"not-an-addr\"\ndata_dir = \"/srv\"\n").unwrap();
        let mut opts = no_opts();
        opts.config = Some(path);
        assert!(ServerConfig::resolve(opts).is_err());
    }
}
