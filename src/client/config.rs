//! Client configuration
//!
//! Same shape as the server side: CLI options first, overwritten by the
//! TOML file when `--config` is given. Credentials only come from the
//! file. Validation is fatal at startup.

use crate::server::config::{DEFAULT_DEV, DEFAULT_MTU, DEFAULT_PORT};
use anyhow::{Context, bail};
use clap::Args;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Options for the `connect` subcommand.
#[derive(Args, Debug)]
pub struct ClientOpts {
    /// Server address
    #[arg(long, alias = "server-ip")]
    pub address: Option<Ipv4Addr>,

    /// Server port (default 55555)
    #[arg(long)]
    pub port: Option<u16>,

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

/// Keys recognized in the client configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientFile {
    dev: Option<String>,
    mtu: Option<u16>,
    threads: Option<u8>,
    server_ip: Option<Ipv4Addr>,
    server_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    pub dev: String,
    pub mtu: u16,
    pub threads: u8,
    pub username: String,
    pub password: String,
    pub verbose: u8,
    pub error_log: Option<PathBuf>,
}

impl ClientConfig {
    pub fn resolve(opts: ClientOpts) -> anyhow::Result<Self> {
        let file = load_file(opts.config.as_deref())?;

        let Some(server_ip) = file.server_ip.or(opts.address) else {
            bail!("server_ip cannot be empty");
        };
        let Some(username) = file.username.filter(|u| !u.is_empty()) else {
            bail!("username cannot be empty");
        };
        let Some(password) = file.password.filter(|p| !p.is_empty()) else {
            bail!("password cannot be empty");
        };

        Ok(Self {
            server_ip,
            server_port: file.server_port.or(opts.port).unwrap_or(DEFAULT_PORT),
            dev: file
                .dev
                .or(opts.dev)
                .unwrap_or_else(|| DEFAULT_DEV.to_string()),
            mtu: file.mtu.unwrap_or(DEFAULT_MTU),
            threads: file.threads.unwrap_or(1),
            username,
            password,
            verbose: opts.verbose.unwrap_or(0),
            error_log: opts.error_log,
        })
    }
}

fn load_file(path: Option<&std::path::Path>) -> anyhow::Result<ClientFile> {
    let Some(path) = path else {
        return Ok(ClientFile::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot open config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("config error in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_with_config(path: PathBuf) -> ClientOpts {
        ClientOpts {
            address: None,
            port: None,
            config: Some(path),
            error_log: None,
            verbose: None,
            dev: None,
        }
    }

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn full_file_resolves() {
        let (_dir, path) = write_config(
            r#"
server_ip = "203.0.113.7"
server_port = 55556
dev = "tea0"
mtu = 1400
username = "alice"
password = "s3cretpass"
"#,
        );
        let cfg = ClientConfig::resolve(opts_with_config(path)).unwrap();
        assert_eq!(cfg.server_ip, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(cfg.server_port, 55556);
        assert_eq!(cfg.dev, "tea0");
        assert_eq!(cfg.mtu, 1400);
        assert_eq!(cfg.username, "alice");
        assert_eq!(cfg.password, "s3cretpass");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let (_dir, path) = write_config("server_ip = \"203.0.113.7\"\n");
        let err = ClientConfig::resolve(opts_with_config(path)).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn missing_server_ip_is_fatal() {
        let (_dir, path) = write_config("username = \"alice\"\npassword = \"pw\"\n");
        let err = ClientConfig::resolve(opts_with_config(path)).unwrap_err();
        assert!(err.to_string().contains("server_ip"));
    }

    #[test]
    fn defaults_fill_the_rest() {
        let (_dir, path) =
            write_config("server_ip = \"203.0.113.7\"\nusername = \"alice\"\npassword = \"pw\"\n");
        let cfg = ClientConfig::resolve(opts_with_config(path)).unwrap();
        assert_eq!(cfg.server_port, DEFAULT_PORT);
        assert_eq!(cfg.dev, DEFAULT_DEV);
        assert_eq!(cfg.mtu, DEFAULT_MTU);
    }
}
