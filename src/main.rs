//! cluster-bridge binary
//!
//! Two subcommands:
//!
//! ```bash
//! # Inside the devcontainer on the workstation
//! cluster-bridge intercept --tunnel-url ws://proxy.bridge.svc:4600/tunnel
//!
//! # Inside the cluster-side proxy pod
//! cluster-bridge server --listen-port 8080/tcp
//! ```

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cluster_bridge::config;

enum Command {
    Intercept,
    Server,
    GenerateConfig(PathBuf),
}

struct Args {
    command: Command,
    config_path: Option<PathBuf>,
    tunnel_url: Option<String>,
    dns_port: Option<u16>,
    proxy_port: Option<u16>,
    app_port: Option<u16>,
    forward_domains: Vec<String>,
    bind_addr: Option<String>,
    listen_ports: Vec<String>,
    no_redirect: bool,
    no_resolv_conf: bool,
}

impl Args {
    #[allow(clippy::too_many_lines)]
    fn parse() -> Self {
        let mut raw = std::env::args().skip(1);

        let command = match raw.next().as_deref() {
            Some("intercept") => Command::Intercept,
            Some("server") => Command::Server,
            Some("generate-config") => {
                let path = raw
                    .next()
                    .map_or_else(|| PathBuf::from("cluster-bridge.json"), PathBuf::from);
                Command::GenerateConfig(path)
            }
            Some("-h" | "--help") | None => {
                print_help();
                std::process::exit(0);
            }
            Some("-v" | "--version") => {
                println!("cluster-bridge v{}", cluster_bridge::VERSION);
                std::process::exit(0);
            }
            Some(other) => {
                eprintln!("Unknown command: {other}");
                print_help();
                std::process::exit(1);
            }
        };

        let mut args = Self {
            command,
            config_path: None,
            tunnel_url: None,
            dns_port: None,
            proxy_port: None,
            app_port: None,
            forward_domains: Vec::new(),
            bind_addr: None,
            listen_ports: Vec::new(),
            no_redirect: false,
            no_resolv_conf: false,
        };

        while let Some(arg) = raw.next() {
            match arg.as_str() {
                "-c" | "--config" => args.config_path = raw.next().map(PathBuf::from),
                "--tunnel-url" => args.tunnel_url = raw.next(),
                "--dns-port" => args.dns_port = parse_port(raw.next(), "--dns-port"),
                "--proxy-port" => args.proxy_port = parse_port(raw.next(), "--proxy-port"),
                "--app-port" => args.app_port = parse_port(raw.next(), "--app-port"),
                "--forward-domain" => {
                    if let Some(domain) = raw.next() {
                        args.forward_domains.push(domain);
                    }
                }
                "--bind" => args.bind_addr = raw.next(),
                "--listen-port" => {
                    if let Some(spec) = raw.next() {
                        args.listen_ports.push(spec);
                    }
                }
                "--no-redirect" => args.no_redirect = true,
                "--no-resolv-conf" => args.no_resolv_conf = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        args
    }
}

fn parse_port(value: Option<String>, flag: &str) -> Option<u16> {
    let value = value?;
    match value.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            eprintln!("Invalid port for {flag}: {value}");
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r"cluster-bridge v{}

Transparent intercept data plane between a devcontainer and a cluster.

USAGE:
    cluster-bridge intercept [OPTIONS]     Run the workstation side
    cluster-bridge server [OPTIONS]        Run the in-cluster proxy server
    cluster-bridge generate-config [PATH]  Write a default config file

OPTIONS:
    -c, --config <PATH>        Configuration file (JSON)
    --tunnel-url <URL>         WebSocket URL of the proxy server (intercept)
    --dns-port <PORT>          DNS interceptor port [default: 53]
    --proxy-port <PORT>        Transparent proxy port [default: ephemeral]
    --app-port <PORT>          Local application port [default: 3000]
    --forward-domain <GLOB>    Intercepted domain pattern; repeatable
    --no-redirect              Skip installing iptables redirect rules
    --no-resolv-conf           Skip rewriting the resolver file
    --bind <ADDR>              Tunnel listener bind address (server)
    --listen-port <PORT/PROTO> Ingress listener spec; repeatable (server)

ENVIRONMENT:
    CLUSTER_BRIDGE_TUNNEL_URL   Override the tunnel URL
    CLUSTER_BRIDGE_LOG_LEVEL    Log filter (trace, debug, info, warn, error)
    CLUSTER_BRIDGE_APP_PORT     Override the application port
    CLUSTER_BRIDGE_PROXY_CIDR   Override the proxy CIDR
",
        cluster_bridge::VERSION
    );
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env("CLUSTER_BRIDGE_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::GenerateConfig(path) = &args.command {
        config::create_default_config(path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let mut cfg = config::load(args.config_path.as_deref())?;

    // Command-line flags override file and environment.
    if let Some(url) = args.tunnel_url {
        cfg.intercept.tunnel_url = url;
    }
    if let Some(port) = args.dns_port {
        cfg.intercept.dns_listen_port = port;
    }
    if let Some(port) = args.proxy_port {
        cfg.intercept.proxy_listen_port = port;
    }
    if let Some(port) = args.app_port {
        cfg.intercept.app_port = port;
        cfg.server.app_port = port;
    }
    if !args.forward_domains.is_empty() {
        cfg.intercept.forward_domains = args.forward_domains;
    }
    if let Some(bind) = args.bind_addr {
        cfg.server.bind_addr = bind.parse()?;
    }
    if !args.listen_ports.is_empty() {
        cfg.server.listen_ports = args.listen_ports;
    }
    cfg.intercept.no_redirect |= args.no_redirect;
    cfg.intercept.no_resolv_conf |= args.no_resolv_conf;
    cfg.validate()?;

    init_tracing(&cfg.log.level);

    let result = match args.command {
        Command::Intercept => cluster_bridge::intercept::run(cfg).await,
        Command::Server => {
            let server = cluster_bridge::ProxyServer::new(cfg.server)?;
            let (shutdown_tx, _) = broadcast::channel(1);
            let signal_tx = shutdown_tx.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = signal_tx.send(());
            });
            server.run(shutdown_tx).await
        }
        Command::GenerateConfig(_) => unreachable!("handled above"),
    };

    if let Err(e) = result {
        error!(error = %e, "cluster-bridge exited with error");
        return Err(e.into());
    }
    Ok(())
}
