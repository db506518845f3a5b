//! End-to-end intercept flow over loopback
//!
//! Exercises the full egress path without kernel privileges: the DNS
//! interceptor answers with a proxy IP backed by a registry entry, and the
//! connection a transparent-proxy handler would make travels the tunnel to
//! a real upstream. The netfilter REDIRECT step is the only piece missing,
//! so the registry lookup is driven with the proxy IP the DNS answer
//! returned.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

use cluster_bridge::config::ServerConfig;
use cluster_bridge::dns::{DnsContext, DnsInterceptor, PatternSet, UpstreamResolver};
use cluster_bridge::registry::{ConnectionRegistry, IpPool};
use cluster_bridge::{tunnel, ProxyServer};

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

async fn ephemeral_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

async fn start_proxy_server(tunnel_port: u16) -> broadcast::Sender<()> {
    let server = ProxyServer::new(ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], tunnel_port)),
        app_port: 3000,
        listen_ports: vec![],
        dial_timeout_secs: 5,
    })
    .unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let tx = shutdown_tx.clone();
    tokio::spawn(async move { server.run(tx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx
}

fn build_query(name: &str, record_type: RecordType) -> Message {
    let mut query = Message::new();
    query.set_id(4242);
    query.set_message_type(MessageType::Query);
    query.set_op_code(OpCode::Query);
    query.set_recursion_desired(true);
    query.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
    query
}

async fn dns_exchange(server: SocketAddr, query: &Message) -> Message {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&query.to_vec().unwrap(), server)
        .await
        .unwrap();
    let mut buf = [0u8; 4096];
    let (n, _) = client.recv_from(&mut buf).await.unwrap();
    Message::from_vec(&buf[..n]).unwrap()
}

#[tokio::test]
async fn happy_path_egress_with_aaaa_followup() {
    let echo_addr = spawn_echo_server().await;
    let tunnel_port = ephemeral_port().await;
    let _server_shutdown = start_proxy_server(tunnel_port).await;

    let handle = tunnel::connect(&format!("ws://127.0.0.1:{tunnel_port}/tunnel"), 3000)
        .await
        .unwrap();

    let registry = Arc::new(ConnectionRegistry::new(
        IpPool::new("10.128.0.0/16".parse().unwrap()),
        Duration::from_secs(10),
        Duration::from_secs(5),
    ));
    // A literal-address "hostname" keeps the cluster-side resolution
    // deterministic in the test environment.
    let ctx = Arc::new(DnsContext {
        patterns: PatternSet::parse(&["127.0.0.1"]).unwrap(),
        registry: Arc::clone(&registry),
        resolver: Arc::new(handle.clone()),
        upstream: UpstreamResolver::new(None),
    });

    let dns = DnsInterceptor::bind("127.0.0.1:0".parse().unwrap(), ctx)
        .await
        .unwrap();
    let dns_addr = dns.local_addr().unwrap();
    let (dns_shutdown, _) = broadcast::channel(1);
    let dns_tx = dns_shutdown.clone();
    tokio::spawn(async move { dns.run(&dns_tx).await });

    // 1. The A query is intercepted: resolution happens through the tunnel,
    //    the answer is a freshly allocated proxy IP.
    let response = dns_exchange(dns_addr, &build_query("127.0.0.1.", RecordType::A)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert_eq!(response.answers().len(), 1);
    assert!(response.answers()[0].ttl() <= 30);

    let Some(RData::A(A(proxy_ip))) = response.answers()[0].data() else {
        panic!("expected an A record");
    };
    let proxy_ip = *proxy_ip;
    assert_eq!(proxy_ip.octets()[0], 10);
    assert_eq!(proxy_ip.octets()[1], 128);

    // 2. The AAAA follow-up is NOERROR with zero answers, and the A mapping
    //    stays live.
    let response = dns_exchange(dns_addr, &build_query("127.0.0.1.", RecordType::AAAA)).await;
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.answers().is_empty());

    // 3. What the transparent proxy does after the kernel redirect: look up
    //    the proxy IP, open a logical connection to the real destination,
    //    pipe bytes.
    let entry = registry.lookup(proxy_ip).expect("registry entry is live");
    assert_eq!(entry.real_ip, Ipv4Addr::LOCALHOST);

    let real_dst = SocketAddr::new(IpAddr::V4(entry.real_ip), echo_addr.port());
    let src: SocketAddr = "127.0.0.1:39882".parse().unwrap();
    let mut stream = handle.open_stream(src, real_dst).await.unwrap();

    stream.write_all(b"GET /healthz").await.unwrap();
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /healthz");

    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn idle_entries_expire_and_free_the_pool() {
    let tunnel_port = ephemeral_port().await;
    let _server_shutdown = start_proxy_server(tunnel_port).await;
    let handle = tunnel::connect(&format!("ws://127.0.0.1:{tunnel_port}/tunnel"), 3000)
        .await
        .unwrap();

    let registry = Arc::new(ConnectionRegistry::new(
        IpPool::new("10.128.0.0/24".parse().unwrap()),
        Duration::from_millis(100),
        Duration::from_millis(30),
    ));
    let sweeper = registry.spawn_sweeper();

    let ctx = Arc::new(DnsContext {
        patterns: PatternSet::parse(&["127.0.0.1"]).unwrap(),
        registry: Arc::clone(&registry),
        resolver: Arc::new(handle.clone()),
        upstream: UpstreamResolver::new(None),
    });
    let dns = DnsInterceptor::bind("127.0.0.1:0".parse().unwrap(), ctx)
        .await
        .unwrap();
    let dns_addr = dns.local_addr().unwrap();
    let (dns_shutdown, _) = broadcast::channel(1);
    let dns_tx = dns_shutdown.clone();
    tokio::spawn(async move { dns.run(&dns_tx).await });

    // Resolve but never connect.
    let response = dns_exchange(dns_addr, &build_query("127.0.0.1.", RecordType::A)).await;
    assert_eq!(response.answers().len(), 1);
    assert_eq!(registry.len(), 1);
    let available_after_allocation = registry.pool().available();

    // Past the idle window the sweeper returns the address to the pool.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(registry.len(), 0);
    assert_eq!(registry.pool().available(), available_after_allocation + 1);

    registry.stop();
    sweeper.await.unwrap();
}
