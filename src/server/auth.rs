//! User store
//!
//! Credentials and address leases live on disk under the configured data
//! directory: `<data_dir>/users/<name>/password` holds the plaintext
//! password and `<data_dir>/users/<name>/ip` holds one line of the form
//! `"<addr/prefix> <broadcast>"`. Both files are opened per
//! authentication attempt, so edits take effect without a restart.

use crate::codec::frame::{IfaceConf, INET4_CAPACITY, INET4_PLAIN_CAPACITY};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Address assignment handed to an authenticated client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub priv_ip: Ipv4Addr,
    pub conf: IfaceConf,
}

pub struct UserStore {
    root: PathBuf,
}

impl UserStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    /// Checks the credentials and, on a match, reads the user's address
    /// record. Any failure (unknown user, wrong password, unreadable or
    /// malformed record) yields None; the caller rejects the client the
    /// same way in every case.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<Lease> {
        if !valid_username(username) {
            tracing::debug!("rejecting invalid username {username:?}");
            return None;
        }

        let user_dir = self.root.join("users").join(username);
        let stored = match std::fs::read_to_string(user_dir.join("password")) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("no password record for {username}: {e}");
                return None;
            }
        };

        if first_line(&stored) != password {
            tracing::debug!("wrong password for {username}");
            return None;
        }

        let record = match std::fs::read_to_string(user_dir.join("ip")) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("no ip record for {username}: {e}");
                return None;
            }
        };

        match parse_ip_record(first_line(&record)) {
            Some(lease) => Some(lease),
            None => {
                tracing::warn!("invalid ip configuration for username {username}");
                None
            }
        }
    }
}

/// Usernames are path components; anything that could escape the users
/// directory is rejected outright.
fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Parses `"<addr/prefix> <broadcast>"`, validating both halves against
/// the CONF region capacities.
fn parse_ip_record(line: &str) -> Option<Lease> {
    let mut parts = line.split_whitespace();
    let inet4 = parts.next()?;
    let broadcast = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if inet4.len() >= INET4_CAPACITY || broadcast.len() >= INET4_PLAIN_CAPACITY {
        return None;
    }

    let net: Ipv4Net = inet4.parse().ok()?;
    let bcast: Ipv4Addr = broadcast.parse().ok()?;

    Some(Lease {
        priv_ip: net.addr(),
        conf: IfaceConf {
            inet4: inet4.to_string(),
            inet4_broadcast: bcast.to_string(),
            inet4_route: bcast.to_string(),
        },
    })
}
