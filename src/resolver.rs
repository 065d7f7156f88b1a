//! Backend hostname resolution

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Resolves a backend hostname to a single address.
///
/// `None` covers every failure mode (no records, resolver error, timeout);
/// callers treat absence as a normal transient state.
pub trait Resolver {
    fn resolve(&self, hostname: &str) -> impl Future<Output = Option<IpAddr>> + Send;
}

/// System resolver bounded by a fixed timeout
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Resolver for DnsResolver {
    fn resolve(&self, hostname: &str) -> impl Future<Output = Option<IpAddr>> + Send {
        let hostname = hostname.to_string();
        let timeout = self.timeout;
        async move {
            let lookup = tokio::net::lookup_host((hostname.as_str(), 0));
            match tokio::time::timeout(timeout, lookup).await {
                // Prefer IPv4, matching what the proxy templates expect
                Ok(Ok(addrs)) => {
                    let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                    addrs
                        .iter()
                        .find(|a| a.is_ipv4())
                        .or_else(|| addrs.first())
                        .copied()
                }
                Ok(Err(e)) => {
                    debug!(hostname = %hostname, error = %e, "DNS lookup failed");
                    None
                }
                Err(_) => {
                    debug!(
                        hostname = %hostname,
                        timeout_ms = timeout.as_millis() as u64,
                        "DNS lookup timed out"
                    );
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let resolver = DnsResolver::new(Duration::from_secs(3));
        assert_eq!(
            resolver.resolve("127.0.0.1").await,
            Some("127.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let resolver = DnsResolver::new(Duration::from_secs(3));
        let addr = resolver.resolve("localhost").await;
        assert!(addr.map(|a| a.is_loopback()).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_resolve_invalid_name_is_none() {
        let resolver = DnsResolver::new(Duration::from_secs(3));
        assert_eq!(resolver.resolve("definitely not a hostname!").await, None);
    }
}
