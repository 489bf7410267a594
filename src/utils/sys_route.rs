//! Client-side route installation
//!
//! After the handshake the client pins the server's public address
//! through the current default gateway, then supersedes the default
//! route with the two half-default routes via the VPN gateway. The
//! original default route stays in place underneath.

use crate::utils::device::run_ip;
use anyhow::{Context, bail};
use std::process::Command;

pub fn install_vpn_routes(server_ip: &str, vpn_gateway: &str) -> anyhow::Result<()> {
    let gateway = route_via(server_ip)?;
    run_ip(&["route", "add", &format!("{server_ip}/32"), "via", &gateway])?;
    run_ip(&["route", "add", "0.0.0.0/1", "via", vpn_gateway])?;
    run_ip(&["route", "add", "128.0.0.0/1", "via", vpn_gateway])?;
    Ok(())
}

/// Asks the kernel which gateway currently routes towards `addr`.
fn route_via(addr: &str) -> anyhow::Result<String> {
    tracing::info!("executing: /sbin/ip route get {addr}");
    let output = Command::new("/sbin/ip")
        .args(["route", "get", addr])
        .output()
        .context("executing /sbin/ip route get")?;

    if !output.status.success() {
        bail!(
            "/sbin/ip route get {addr} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_via(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| anyhow::anyhow!("cannot find gateway towards {addr}"))
}

fn parse_via(route: &str) -> Option<String> {
    let mut tokens = route.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "via" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::parse_via;

    #[test]
    fn parses_gateway_from_route_output() {
        let out = "93.184.216.34 via 192.168.1.1 dev eth0 src 192.168.1.7 uid 0\n    cache\n";
        assert_eq!(parse_via(out).as_deref(), Some("192.168.1.1"));
    }

    #[test]
    fn direct_route_has_no_gateway() {
        let out = "192.168.1.9 dev eth0 src 192.168.1.7\n";
        assert_eq!(parse_via(out), None);
    }
}
