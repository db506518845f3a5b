//! Configuration types

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::dns::PatternSet;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workstation (intercept) side
    #[serde(default)]
    pub intercept: InterceptConfig,
    /// In-cluster proxy server side
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate both sides.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.intercept.validate()?;
        self.server.validate()?;
        Ok(())
    }

    /// A fully defaulted configuration, for `--generate-config`
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Workstation-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Private CIDR proxy IPs are allocated from
    pub proxy_cidr: Ipv4Net,
    /// Ordered glob patterns selecting intercepted hostnames
    pub forward_domains: Vec<String>,
    /// DNS interceptor port on loopback
    pub dns_listen_port: u16,
    /// Transparent proxy port; 0 picks an ephemeral port
    pub proxy_listen_port: u16,
    /// Local application port ingress connections are dialed to
    pub app_port: u16,
    /// WebSocket URL of the in-cluster proxy server
    pub tunnel_url: String,
    /// Resolver file to rewrite
    pub resolv_conf: PathBuf,
    /// Idle window before an unused registry entry is released
    pub unused_timeout_secs: u64,
    /// Registry sweeper tick
    pub cleanup_interval_secs: u64,
    /// Skip installing kernel redirect rules (testing without privileges)
    pub no_redirect: bool,
    /// Skip rewriting the resolver file
    pub no_resolv_conf: bool,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            proxy_cidr: "10.128.0.0/16".parse().expect("valid default CIDR"),
            forward_domains: vec!["**.svc.cluster.local".to_string()],
            dns_listen_port: 53,
            proxy_listen_port: 0,
            app_port: 3000,
            tunnel_url: "ws://127.0.0.1:4600/tunnel".to_string(),
            resolv_conf: PathBuf::from(crate::dns::DEFAULT_RESOLV_CONF),
            unused_timeout_secs: 10,
            cleanup_interval_secs: 5,
            no_redirect: false,
            no_resolv_conf: false,
        }
    }
}

impl InterceptConfig {
    /// Validate the CIDR, the patterns, and the timing.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_cidr.prefix_len() > 30 {
            return Err(ConfigError::validation(format!(
                "proxy CIDR {} has no usable host addresses",
                self.proxy_cidr
            )));
        }
        let network = self.proxy_cidr.network();
        let loopback: std::net::Ipv4Addr = std::net::Ipv4Addr::LOCALHOST;
        if network.is_loopback() || self.proxy_cidr.contains(&loopback) {
            return Err(ConfigError::validation(format!(
                "proxy CIDR {} overlaps loopback",
                self.proxy_cidr
            )));
        }
        if !network.is_private() {
            return Err(ConfigError::validation(format!(
                "proxy CIDR {} is not a private range",
                self.proxy_cidr
            )));
        }

        PatternSet::parse(&self.forward_domains)?;

        if self.unused_timeout_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(ConfigError::validation(
                "unused_timeout_secs and cleanup_interval_secs must be non-zero",
            ));
        }
        Ok(())
    }

    /// Idle window as a duration
    #[must_use]
    pub fn unused_timeout(&self) -> Duration {
        Duration::from_secs(self.unused_timeout_secs)
    }

    /// Sweeper tick as a duration
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// In-cluster proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Tunnel listener bind address
    pub bind_addr: SocketAddr,
    /// Workstation application port ingress connections are addressed to
    pub app_port: u16,
    /// Ingress listen specs, e.g. `"8080"` or `"8080/tcp"`
    pub listen_ports: Vec<String>,
    /// Upstream dial deadline in seconds
    pub dial_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4600".parse().expect("valid default bind"),
            app_port: 3000,
            listen_ports: Vec::new(),
            dial_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Validate listen specs: parseable, TCP, and free of duplicates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let specs = self.parsed_listen_ports()?;
        let mut seen = std::collections::HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.port) {
                return Err(ConfigError::validation(format!(
                    "duplicate listen port {}",
                    spec.port
                )));
            }
        }
        Ok(())
    }

    /// Parse the configured listen specs.
    ///
    /// # Errors
    ///
    /// Returns the first spec's parse error.
    pub fn parsed_listen_ports(&self) -> Result<Vec<ListenPortSpec>, ConfigError> {
        self.listen_ports
            .iter()
            .map(|s| s.parse::<ListenPortSpec>())
            .collect()
    }

    /// Upstream dial deadline as a duration
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter, e.g. `info` or `cluster_bridge=debug`
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Protocol of an ingress listen spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenProto {
    Tcp,
    Udp,
}

/// One `port[/proto]` ingress listener spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenPortSpec {
    pub port: u16,
    pub proto: ListenProto,
}

impl FromStr for ListenPortSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (port_str, proto) = match s.split_once('/') {
            None => (s, ListenProto::Tcp),
            Some((port, "tcp")) => (port, ListenProto::Tcp),
            Some((port, "udp")) => (port, ListenProto::Udp),
            Some((_, other)) => {
                return Err(ConfigError::validation(format!(
                    "unknown protocol {other:?} in listen port {s:?}"
                )))
            }
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| ConfigError::validation(format!("invalid listen port {s:?}")))?;
        if port == 0 {
            return Err(ConfigError::validation("listen port must be non-zero"));
        }

        // The data plane carries byte streams; datagram ingress has no
        // faithful mapping onto it.
        if proto == ListenProto::Udp {
            return Err(ConfigError::validation(format!(
                "listen port {port}/udp is not supported, only tcp ingress is"
            )));
        }

        Ok(Self { port, proto })
    }
}

impl std::fmt::Display for ListenPortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.proto {
            ListenProto::Tcp => write!(f, "{}/tcp", self.port),
            ListenProto::Udp => write!(f, "{}/udp", self.port),
        }
    }
}
