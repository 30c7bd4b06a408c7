use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::{system_conf, TokioAsyncResolver};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// The three record kinds the policy pipeline consumes.
///
/// Implementations report NXDOMAIN, timeouts and empty answers as errors;
/// callers decide what a failure means (always "no match" in this crate).
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// A and AAAA records for `host`.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// MX exchange host names for `domain`, without the trailing root dot.
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>>;

    /// TXT records for `domain`, each with its character-strings joined.
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>>;
}

/// Whether any A/AAAA record of `host` equals `ip`.
pub async fn host_has_ip(dns: &dyn DnsLookup, host: &str, ip: IpAddr) -> bool {
    match dns.lookup_ip(host).await {
        Ok(addrs) => addrs.contains(&ip),
        Err(e) => {
            log::debug!("A/AAAA lookup failed for {host}: {e}");
            false
        }
    }
}

/// Whether `ip` is an address of any MX host of `domain`. Returns the
/// matching exchange name.
pub async fn mx_has_ip(dns: &dyn DnsLookup, domain: &str, ip: IpAddr) -> Option<String> {
    let exchanges = match dns.lookup_mx(domain).await {
        Ok(exchanges) => exchanges,
        Err(e) => {
            log::debug!("MX lookup failed for {domain}: {e}");
            return None;
        }
    };

    for exchange in exchanges {
        if host_has_ip(dns, &exchange, ip).await {
            return Some(exchange);
        }
    }
    None
}

/// System resolver backed lookup with a per-query deadline.
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryLookup {
    pub fn from_system_conf(timeout: Duration) -> Result<Self> {
        let (config, opts) = system_conf::read_system_conf()?;
        Ok(Self::with_config(config, opts, timeout))
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts, timeout: Duration) -> Self {
        let resolver = TokioAsyncResolver::tokio(config, lookup_opts(opts));
        HickoryLookup { resolver, timeout }
    }
}

/// Address lookups must see both families: an IPv6 client of a dual-stack
/// domain only matches on its AAAA records.
fn lookup_opts(mut opts: ResolverOpts) -> ResolverOpts {
    opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
    opts
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup_future = self.resolver.lookup_ip(host);
        match tokio::time::timeout(self.timeout, lookup_future).await {
            Ok(Ok(response)) => {
                let addrs: Vec<IpAddr> = response.iter().collect();
                if addrs.is_empty() {
                    return Err(anyhow!("no addresses for {host}"));
                }
                Ok(addrs)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow!(
                "A/AAAA lookup for {host} timed out after {:?}",
                self.timeout
            )),
        }
    }

    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>> {
        let mx_future = self.resolver.mx_lookup(domain);
        match tokio::time::timeout(self.timeout, mx_future).await {
            Ok(Ok(response)) => Ok(response
                .iter()
                .map(|mx| normalize_name(&mx.exchange().to_utf8()))
                .collect()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow!(
                "MX lookup for {domain} timed out after {:?}",
                self.timeout
            )),
        }
    }

    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>> {
        let txt_future = self.resolver.txt_lookup(domain);
        match tokio::time::timeout(self.timeout, txt_future).await {
            Ok(Ok(response)) => Ok(response
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow!(
                "TXT lookup for {domain} timed out after {:?}",
                self.timeout
            )),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// Fixed in-memory zone data for tests. Unknown names answer NXDOMAIN.
#[derive(Default)]
pub struct StaticDns {
    ips: HashMap<String, Vec<IpAddr>>,
    mxs: HashMap<String, Vec<String>>,
    txts: HashMap<String, Vec<String>>,
    queries: AtomicUsize,
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, host: &str, ip: IpAddr) -> Self {
        self.ips.entry(normalize_name(host)).or_default().push(ip);
        self
    }

    pub fn with_mx(mut self, domain: &str, exchange: &str) -> Self {
        self.mxs
            .entry(normalize_name(domain))
            .or_default()
            .push(normalize_name(exchange));
        self
    }

    pub fn with_txt(mut self, domain: &str, text: &str) -> Self {
        self.txts
            .entry(normalize_name(domain))
            .or_default()
            .push(text.to_string());
        self
    }

    /// Number of queries answered (or refused) so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    fn answer<T: Clone>(&self, table: &HashMap<String, Vec<T>>, name: &str) -> Result<Vec<T>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        match table.get(&normalize_name(name)) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => Err(anyhow!("NXDOMAIN: {name}")),
        }
    }
}

#[async_trait]
impl DnsLookup for StaticDns {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        self.answer(&self.ips, host)
    }

    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>> {
        self.answer(&self.mxs, domain)
    }

    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>> {
        self.answer(&self.txts, domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_static_dns_answers_and_nxdomain() {
        let dns = StaticDns::new()
            .with_ip("Example.COM.", ip("192.0.2.1"))
            .with_txt("example.com", "v=spf1 mx -all");

        assert_eq!(dns.lookup_ip("example.com").await.unwrap(), vec![ip("192.0.2.1")]);
        assert_eq!(
            dns.lookup_txt("EXAMPLE.com").await.unwrap(),
            vec!["v=spf1 mx -all".to_string()]
        );
        assert!(dns.lookup_mx("example.com").await.is_err());
        assert!(dns.lookup_ip("missing.example").await.is_err());
        assert_eq!(dns.queries(), 4);
    }

    #[tokio::test]
    async fn test_mx_has_ip_follows_exchanges() {
        let dns = StaticDns::new()
            .with_mx("example.com", "mx1.example.com.")
            .with_mx("example.com", "mx2.example.com")
            .with_ip("mx2.example.com", ip("192.0.2.25"));

        assert_eq!(
            mx_has_ip(&dns, "example.com", ip("192.0.2.25")).await,
            Some("mx2.example.com".to_string())
        );
        assert_eq!(mx_has_ip(&dns, "example.com", ip("192.0.2.26")).await, None);
        assert_eq!(mx_has_ip(&dns, "nomx.example", ip("192.0.2.25")).await, None);
    }

    #[test]
    fn test_lookup_opts_query_both_families() {
        let opts = lookup_opts(ResolverOpts::default());
        assert_eq!(opts.ip_strategy, LookupIpStrategy::Ipv4AndIpv6);
    }

    #[tokio::test]
    async fn test_host_has_ip_matches_ipv6_of_dual_stack_host() {
        let dns = StaticDns::new()
            .with_ip("example.com", ip("192.0.2.1"))
            .with_ip("example.com", ip("2001:db8::25"));
        assert!(host_has_ip(&dns, "example.com", ip("2001:db8::25")).await);
    }

    #[tokio::test]
    async fn test_host_has_ip_treats_failure_as_no_match() {
        let dns = StaticDns::new();
        assert!(!host_has_ip(&dns, "example.com", ip("192.0.2.1")).await);
    }
}
