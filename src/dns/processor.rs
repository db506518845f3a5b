//! DNS query interception
//!
//! For each query: normalize the name, test the forward-domain patterns in
//! order, and either answer locally (matched A/AAAA) or hand the raw query
//! back for verbatim upstream forwarding.
//!
//! A matched A query resolves the hostname through the tunnel, allocates a
//! proxy IP, registers the mapping, and answers with exactly that address —
//! allocation and answer are atomic from the client's point of view. A
//! matched AAAA query answers NOERROR with zero records: musl's resolver
//! discards the A result when the AAAA side reports NXDOMAIN, so the empty
//! success keeps A alive.

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use tracing::{debug, trace, warn};

use super::pattern::{normalize_hostname, PatternSet};
use super::upstream::UpstreamResolver;
use crate::error::PoolError;
use crate::registry::ConnectionRegistry;
use crate::tunnel::Resolve;

/// TTL on intercepted A answers. Kept short so clients re-resolve before the
/// registry's idle expiry can release the proxy IP under them.
pub const ANSWER_TTL: Duration = Duration::from_secs(10);

/// Everything a query needs: patterns, registry, the tunnel resolver seam,
/// and the upstream relay for unmatched traffic
pub struct DnsContext {
    pub patterns: PatternSet,
    pub registry: Arc<ConnectionRegistry>,
    pub resolver: Arc<dyn Resolve>,
    pub upstream: UpstreamResolver,
}

/// What the server should do with a query
#[derive(Debug)]
pub enum QueryDisposition {
    /// Send this locally built response
    Respond(Message),
    /// Relay the raw query bytes upstream and return the response verbatim
    Forward,
}

/// Decide and, for intercepted queries, build the response.
pub async fn handle_query(req: &Message, ctx: &DnsContext) -> QueryDisposition {
    // Anything that is not a plain query belongs to the real resolver.
    if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
        return QueryDisposition::Forward;
    }

    let Some(query) = req.queries().first() else {
        return QueryDisposition::Forward;
    };
    if query.query_class() != DNSClass::IN {
        return QueryDisposition::Forward;
    }

    let hostname = normalize_hostname(&query.name().to_string());
    if !ctx.patterns.matches(&hostname) {
        trace!(%hostname, "no forward-domain match");
        return QueryDisposition::Forward;
    }

    match query.query_type() {
        RecordType::A => {
            let proxy_ip = match ctx.resolver.resolve(&hostname).await {
                Ok(addresses) => {
                    let Some(real_ip) = addresses.first().copied() else {
                        debug!(%hostname, "tunnel resolver returned no addresses");
                        return QueryDisposition::Respond(servfail(req));
                    };
                    match ctx.registry.allocate(&hostname, real_ip) {
                        Ok(proxy_ip) => proxy_ip,
                        Err(PoolError::Exhausted { size }) => {
                            warn!(%hostname, size, "proxy IP pool exhausted");
                            return QueryDisposition::Respond(servfail(req));
                        }
                    }
                }
                Err(e) => {
                    debug!(%hostname, error = %e, "tunnel resolve failed");
                    return QueryDisposition::Respond(servfail(req));
                }
            };

            debug!(%hostname, %proxy_ip, "answering intercepted A query");
            let mut response = response_for(req);
            let mut record = Record::from_rdata(
                query.name().clone(),
                ANSWER_TTL.as_secs() as u32,
                RData::A(A(proxy_ip)),
            );
            record.set_dns_class(query.query_class());
            response.add_answer(record);
            QueryDisposition::Respond(response)
        }
        // Empty success, never NXDOMAIN: see the module docs.
        RecordType::AAAA => {
            trace!(%hostname, "answering intercepted AAAA query with no records");
            QueryDisposition::Respond(response_for(req))
        }
        other => {
            trace!(%hostname, query_type = %other, "forwarding non-address query type");
            QueryDisposition::Forward
        }
    }
}

/// Response skeleton echoing the request's queries
fn response_for(req: &Message) -> Message {
    let mut response = Message::new();
    response.set_header(Header::response_from_request(req.header()));
    for query in req.queries() {
        response.add_query(query.clone());
    }
    response
}

/// SERVFAIL for this request
#[must_use]
pub fn servfail(req: &Message) -> Message {
    let mut response = response_for(req);
    response.set_response_code(ResponseCode::ServFail);
    response
}

/// Context carried by the UDP and TCP servers
pub type SharedDnsContext = Arc<DnsContext>;

/// Hand the raw query upstream; on failure answer SERVFAIL.
pub async fn forward_or_servfail(
    raw_query: &[u8],
    req: &Message,
    upstream: &UpstreamResolver,
    use_tcp: bool,
) -> Vec<u8> {
    let forwarded = if use_tcp {
        upstream.forward_tcp(raw_query).await
    } else {
        upstream.forward_udp(raw_query).await
    };

    match forwarded {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "upstream forward failed, answering SERVFAIL");
            servfail(req).to_vec().unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::registry::IpPool;
    use async_trait::async_trait;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    struct StubResolver {
        addresses: Vec<Ipv4Addr>,
        fail: bool,
    }

    #[async_trait]
    impl Resolve for StubResolver {
        async fn resolve(&self, _hostname: &str) -> Result<Vec<Ipv4Addr>, TunnelError> {
            if self.fail {
                Err(TunnelError::ResolveFailed("no such host".into()))
            } else {
                Ok(self.addresses.clone())
            }
        }
    }

    fn test_context(cidr: &str, resolver: StubResolver) -> DnsContext {
        DnsContext {
            patterns: PatternSet::parse(&["*.svc.cluster.local", "**.cluster.local"]).unwrap(),
            registry: Arc::new(ConnectionRegistry::new(
                IpPool::new(cidr.parse().unwrap()),
                Duration::from_secs(10),
                Duration::from_secs(5),
            )),
            resolver: Arc::new(resolver),
            upstream: UpstreamResolver::new(None),
        }
    }

    fn query(name: &str, record_type: RecordType) -> Message {
        let mut req = Message::new();
        req.set_id(42);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.set_recursion_desired(true);
        req.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
        req
    }

    fn resolver_ok(addresses: &[&str]) -> StubResolver {
        StubResolver {
            addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
            fail: false,
        }
    }

    #[tokio::test]
    async fn test_matched_a_query_allocates_and_answers() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&["10.43.0.15"]));
        let req = query("redis.svc.cluster.local.", RecordType::A);

        let QueryDisposition::Respond(response) = handle_query(&req, &ctx).await else {
            panic!("expected a local response");
        };

        assert_eq!(response.id(), 42);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        let answer = &response.answers()[0];
        assert!(answer.ttl() <= 30, "TTL must stay under the 30s cap");
        let Some(RData::A(A(proxy_ip))) = answer.data() else {
            panic!("expected an A record");
        };

        // The registered mapping is exactly the answered address.
        let entry = ctx.registry.lookup(*proxy_ip).unwrap();
        assert_eq!(entry.hostname, "redis.svc.cluster.local");
        assert_eq!(entry.real_ip, "10.43.0.15".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_matched_aaaa_query_answers_empty_noerror() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&["10.43.0.15"]));
        let req = query("redis.svc.cluster.local.", RecordType::AAAA);

        let QueryDisposition::Respond(response) = handle_query(&req, &ctx).await else {
            panic!("expected a local response");
        };

        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());
        // No allocation happens for AAAA.
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_query_forwards() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&["10.43.0.15"]));
        let req = query("example.com.", RecordType::A);

        assert!(matches!(
            handle_query(&req, &ctx).await,
            QueryDisposition::Forward
        ));
        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.registry.pool().available(), ctx.registry.pool().size());
    }

    #[tokio::test]
    async fn test_matched_other_type_forwards() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&["10.43.0.15"]));
        let req = query("redis.svc.cluster.local.", RecordType::MX);

        assert!(matches!(
            handle_query(&req, &ctx).await,
            QueryDisposition::Forward
        ));
    }

    #[tokio::test]
    async fn test_resolver_failure_is_servfail() {
        let ctx = test_context(
            "10.128.0.0/24",
            StubResolver {
                addresses: vec![],
                fail: true,
            },
        );
        let req = query("down.svc.cluster.local.", RecordType::A);

        let QueryDisposition::Respond(response) = handle_query(&req, &ctx).await else {
            panic!("expected a local response");
        };
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_empty_resolution_is_servfail() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&[]));
        let req = query("empty.svc.cluster.local.", RecordType::A);

        let QueryDisposition::Respond(response) = handle_query(&req, &ctx).await else {
            panic!("expected a local response");
        };
        assert_eq!(response.response_code(), ResponseCode::ServFail);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_servfail_and_preserves_entries() {
        // A /30 has two usable addresses.
        let ctx = test_context("10.128.0.0/30", resolver_ok(&["10.43.0.15"]));

        for name in ["a.svc.cluster.local.", "b.svc.cluster.local."] {
            let QueryDisposition::Respond(response) =
                handle_query(&query(name, RecordType::A), &ctx).await
            else {
                panic!("expected a local response");
            };
            assert_eq!(response.response_code(), ResponseCode::NoError);
        }

        let QueryDisposition::Respond(response) =
            handle_query(&query("c.svc.cluster.local.", RecordType::A), &ctx).await
        else {
            panic!("expected a local response");
        };
        assert_eq!(response.response_code(), ResponseCode::ServFail);

        // Prior registrations keep working.
        assert_eq!(ctx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_case_and_trailing_dot_insensitive() {
        let ctx = test_context("10.128.0.0/24", resolver_ok(&["10.43.0.15"]));
        let req = query("Redis.SVC.Cluster.Local.", RecordType::A);

        let QueryDisposition::Respond(response) = handle_query(&req, &ctx).await else {
            panic!("expected a local response");
        };
        assert_eq!(response.answers().len(), 1);

        let Some(RData::A(A(proxy_ip))) = response.answers()[0].data() else {
            panic!("expected an A record");
        };
        let entry = ctx.registry.lookup(*proxy_ip).unwrap();
        assert_eq!(entry.hostname, "redis.svc.cluster.local");
    }
}
