//! TUN allocation and interface configuration
//!
//! The device itself comes from the tun crate; addressing and bring-up go
//! through the host's `/sbin/ip` utility, invoked with argument vectors
//! (no shell), matching how the interface is administered elsewhere on
//! the system.

use anyhow::{Context, bail};
use std::process::Command;

/// Allocates the TUN device by name. The interface comes up unaddressed;
/// [`bring_up`] and [`assign_addr`] finish the job.
pub fn create_tun(name: &str) -> anyhow::Result<tun::Device> {
    let mut config = tun::Configuration::default();
    config.tun_name(name);

    #[cfg(target_os = "linux")]
    config.platform_config(|config| {
        config.ensure_root_privileges(true);
    });

    tun::create(&config).with_context(|| format!("cannot create TUN interface {name}"))
}

/// `ip link set dev <dev> up mtu <mtu>`
pub fn bring_up(dev: &str, mtu: u16) -> anyhow::Result<()> {
    run_ip(&["link", "set", "dev", dev, "up", "mtu", &mtu.to_string()])
}

/// `ip addr add dev <dev> <inet4> broadcast <broadcast>`
pub fn assign_addr(dev: &str, inet4: &str, broadcast: &str) -> anyhow::Result<()> {
    run_ip(&["addr", "add", "dev", dev, inet4, "broadcast", broadcast])
}

pub(crate) fn run_ip(args: &[&str]) -> anyhow::Result<()> {
    tracing::info!("executing: /sbin/ip {}", args.join(" "));
    let output = Command::new("/sbin/ip")
        .args(args)
        .output()
        .context("executing /sbin/ip")?;

    if !output.status.success() {
        bail!(
            "/sbin/ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
