//! Kernel redirect rules
//!
//! Installs the netfilter NAT rules that steer traffic destined for the
//! proxy CIDR into the transparent proxy listener. The rules exclude the
//! process's own uid so tunnel traffic is not redirected back into the
//! proxy. Installation failures are reported but treated as non-fatal by the
//! caller: without the rules the intercept still runs, it just intercepts
//! nothing.

use std::process::Command;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::error::TproxyError;

/// Chain holding the redirect rules
const CHAIN: &str = "CLUSTER_BRIDGE";

/// Installed redirect rules, removed on drop
#[derive(Debug)]
pub struct RedirectGuard {
    cidr: Ipv4Net,
    installed: bool,
}

impl RedirectGuard {
    /// Install the NAT REDIRECT rules for `cidr` → `proxy_port`.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::RedirectError` when the `iptables` binary is
    /// missing or a command fails.
    pub fn install(cidr: Ipv4Net, proxy_port: u16) -> Result<Self, TproxyError> {
        let uid = process_uid();
        let cidr_str = cidr.to_string();
        let port_str = proxy_port.to_string();

        let commands: Vec<Vec<&str>> = vec![
            vec!["-t", "nat", "-N", CHAIN],
            vec![
                "-t", "nat", "-A", CHAIN,
                "-d", &cidr_str,
                "-p", "tcp",
                "-m", "owner", "!", "--uid-owner", &uid,
                "-j", "REDIRECT", "--to-ports", &port_str,
            ],
            vec![
                "-t", "nat", "-A", "OUTPUT",
                "-d", &cidr_str,
                "-p", "tcp",
                "-j", CHAIN,
            ],
        ];

        for args in &commands {
            run_iptables(args)?;
        }

        info!(%cidr, proxy_port, "redirect rules installed");
        Ok(Self {
            cidr,
            installed: true,
        })
    }

    /// Remove the rules. Idempotent; errors are ignored because teardown
    /// runs on best effort during shutdown.
    pub fn cleanup(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;

        let cidr_str = self.cidr.to_string();
        let commands: Vec<Vec<&str>> = vec![
            vec![
                "-t", "nat", "-D", "OUTPUT",
                "-d", &cidr_str,
                "-p", "tcp",
                "-j", CHAIN,
            ],
            vec!["-t", "nat", "-F", CHAIN],
            vec!["-t", "nat", "-X", CHAIN],
        ];
        for args in &commands {
            let _ = run_iptables(args);
        }
        info!("redirect rules removed");
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn run_iptables(args: &[&str]) -> Result<(), TproxyError> {
    debug!(?args, "running iptables");
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| TproxyError::RedirectError(format!("failed to run iptables: {e}")))?;

    if !output.status.success() {
        return Err(TproxyError::RedirectError(format!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn process_uid() -> String {
    // SAFETY: getuid has no failure mode.
    unsafe { libc::getuid() }.to_string()
}

#[cfg(not(unix))]
fn process_uid() -> String {
    "0".to_string()
}
