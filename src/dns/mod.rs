//! DNS interception
//!
//! A minimal DNS server on the workstation's loopback. Hostnames matching
//! the configured forward-domain patterns are resolved through the tunnel
//! and answered with a freshly allocated proxy IP; everything else is
//! relayed verbatim to the nameserver that was configured before the
//! resolver file rewrite.

pub mod pattern;
pub mod processor;
pub mod resolvconf;
pub mod server;
mod tcp_server;
mod udp_server;
pub mod upstream;

pub use pattern::{normalize_hostname, ForwardPattern, PatternSet};
pub use processor::{handle_query, DnsContext, QueryDisposition, SharedDnsContext, ANSWER_TTL};
pub use resolvconf::{first_nameserver, ResolvConfGuard, DEFAULT_RESOLV_CONF};
pub use server::DnsInterceptor;
pub use upstream::UpstreamResolver;
