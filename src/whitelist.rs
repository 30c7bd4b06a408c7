use crate::dns::DnsLookup;
use crate::domain_utils::DomainUtils;
use anyhow::{Context, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

/// DNS whitelists queried with the reversed client address.
pub const DNS_WHITELISTS: &[&str] = &[
    "list.dnswl.org",
    "wl.mailspike.net",
    "sa-accredit.habeas.com",
    "iadb.isipp.com",
];

/// Hostname fragments that legitimate mail infrastructure tends to carry.
pub const MAIL_SERVER_TOKENS: &[&str] = &["mail", "smtp", "mta", "mx"];

/// Why an origin was trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistMatch {
    Loopback,
    MailServerName(&'static str),
    ClientIp,
    ClientDomain(String),
    IpRange(IpNet),
    DnsWhitelist { zone: String, response: IpAddr },
}

impl WhitelistMatch {
    /// Short name of the list or rule that matched, for decision records.
    pub fn list(&self, local_list: &str) -> String {
        match self {
            WhitelistMatch::Loopback => "loopback".to_string(),
            WhitelistMatch::MailServerName(token) => format!("hostname-token:{token}"),
            WhitelistMatch::ClientIp
            | WhitelistMatch::ClientDomain(_)
            | WhitelistMatch::IpRange(_) => local_list.to_string(),
            WhitelistMatch::DnsWhitelist { zone, .. } => zone.clone(),
        }
    }
}

impl fmt::Display for WhitelistMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhitelistMatch::Loopback => write!(f, "Connection from localhost"),
            WhitelistMatch::MailServerName(_) => write!(f, "Hostname looks like a mail server"),
            WhitelistMatch::ClientIp => write!(f, "Whitelisted client IP"),
            WhitelistMatch::ClientDomain(domain) => {
                write!(f, "Whitelisted client domain {domain}")
            }
            WhitelistMatch::IpRange(range) => write!(f, "Whitelisted IP range {range}"),
            WhitelistMatch::DnsWhitelist { response, .. } => {
                write!(f, "Whitelisted client IP (response {response})")
            }
        }
    }
}

/// Static whitelist entries, read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct WhitelistEntries {
    pub exact: HashSet<String>,
    pub ranges: Vec<IpNet>,
}

impl WhitelistEntries {
    /// Parse the line-oriented whitelist format: `#` starts a comment, blank
    /// lines are skipped, CIDR literals become ranges and anything else is a
    /// literal host, domain or address.
    pub fn parse(content: &str) -> Self {
        let mut entries = WhitelistEntries::default();
        for line in content.lines() {
            let line = match line.find('#') {
                Some(hash) => &line[..hash],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(range) = line.parse::<IpNet>() {
                entries.ranges.push(range);
                continue;
            }
            entries.exact.insert(line.to_lowercase());
        }
        entries
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading whitelist {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers "is this origin trusted?" from local data first, DNS second.
pub struct Whitelist {
    entries: WhitelistEntries,
    zones: Vec<String>,
    source: String,
}

impl Whitelist {
    pub fn new(entries: WhitelistEntries, zones: Vec<String>, source: impl Into<String>) -> Self {
        Whitelist {
            entries,
            zones,
            source: source.into(),
        }
    }

    /// Local entries plus the built-in DNS whitelists.
    pub fn with_default_zones(entries: WhitelistEntries, source: impl Into<String>) -> Self {
        let zones = DNS_WHITELISTS.iter().map(|z| z.to_string()).collect();
        Self::new(entries, zones, source)
    }

    /// Name of the local list, usually the file it was loaded from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entries(&self) -> &WhitelistEntries {
        &self.entries
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Checks that need neither configuration nor DNS: loopback origins and
    /// hostnames that identify themselves as mail servers.
    pub fn trusted_origin(hostname: &str, ip: IpAddr) -> Option<WhitelistMatch> {
        if ip.is_loopback() {
            return Some(WhitelistMatch::Loopback);
        }
        let hostname = hostname.to_lowercase();
        MAIL_SERVER_TOKENS
            .iter()
            .find(|token| hostname.contains(*token))
            .map(|token| WhitelistMatch::MailServerName(*token))
    }

    /// Exact address, domain-suffix and CIDR checks against the local list.
    pub fn lookup_local(&self, hostname: &str, ip: IpAddr) -> Option<WhitelistMatch> {
        if self.entries.exact.contains(&ip.to_string()) {
            return Some(WhitelistMatch::ClientIp);
        }

        let hostname = hostname.trim_end_matches('.').to_lowercase();
        if let Some(domain) =
            DomainUtils::suffixes(&hostname).find(|domain| self.entries.exact.contains(*domain))
        {
            return Some(WhitelistMatch::ClientDomain(domain.to_string()));
        }

        self.entries
            .ranges
            .iter()
            .find(|range| range.contains(&ip))
            .map(|range| WhitelistMatch::IpRange(*range))
    }

    /// Query every DNS whitelist zone for an IPv4 client. Any answer counts.
    pub async fn lookup_dns(&self, dns: &dyn DnsLookup, ip: IpAddr) -> Option<WhitelistMatch> {
        let IpAddr::V4(v4) = ip else {
            return None;
        };
        let [a, b, c, d] = v4.octets();
        let reversed = format!("{d}.{c}.{b}.{a}");

        for zone in &self.zones {
            let query = format!("{reversed}.{zone}");
            match dns.lookup_ip(&query).await {
                Ok(addrs) => {
                    if let Some(response) = addrs.first() {
                        return Some(WhitelistMatch::DnsWhitelist {
                            zone: zone.clone(),
                            response: *response,
                        });
                    }
                }
                Err(e) => log::debug!("DNS whitelist {zone} has no entry for {ip}: {e}"),
            }
        }
        None
    }

    /// Full resolution in order, stopping at the first match.
    pub async fn is_whitelisted(
        &self,
        dns: &dyn DnsLookup,
        hostname: &str,
        ip: IpAddr,
    ) -> Option<WhitelistMatch> {
        if let Some(found) = Self::trusted_origin(hostname, ip) {
            return Some(found);
        }
        if let Some(found) = self.lookup_local(hostname, ip) {
            return Some(found);
        }
        self.lookup_dns(dns, ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticDns;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn whitelist(content: &str, zones: &[&str]) -> Whitelist {
        Whitelist::new(
            WhitelistEntries::parse(content),
            zones.iter().map(|z| z.to_string()).collect(),
            "test-whitelist",
        )
    }

    #[test]
    fn test_parse_whitelist_file() {
        let entries = WhitelistEntries::parse(
            "# partners\n\
             example.com   # main domain\n\
             \n\
             192.0.2.10\n\
             10.0.0.0/8\n\
             2001:db8::/32\n\
             Partner.Example\n",
        );

        assert!(entries.exact.contains("example.com"));
        assert!(entries.exact.contains("192.0.2.10"));
        assert!(entries.exact.contains("partner.example"));
        assert_eq!(entries.ranges.len(), 2);
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(WhitelistEntries::from_file("/nonexistent/grey-milter/whitelist").is_err());
    }

    #[test]
    fn test_trusted_origin() {
        assert_eq!(
            Whitelist::trusted_origin("localhost", ip("127.0.0.1")),
            Some(WhitelistMatch::Loopback)
        );
        assert_eq!(
            Whitelist::trusted_origin("[::1]", ip("::1")),
            Some(WhitelistMatch::Loopback)
        );
        assert_eq!(
            Whitelist::trusted_origin("MX1.example.net", ip("192.0.2.1")),
            Some(WhitelistMatch::MailServerName("mx"))
        );
        assert_eq!(
            Whitelist::trusted_origin("mx1.bigmailer.example", ip("192.0.2.1")),
            Some(WhitelistMatch::MailServerName("mail"))
        );
        assert_eq!(
            Whitelist::trusted_origin("dsl-42.isp.example", ip("192.0.2.1")),
            None
        );
    }

    #[test]
    fn test_domain_suffix_walk() {
        let wl = whitelist("example.com\n", &[]);

        assert_eq!(
            wl.lookup_local("mail.example.com", ip("192.0.2.1")),
            Some(WhitelistMatch::ClientDomain("example.com".to_string()))
        );
        assert_eq!(wl.lookup_local("notexample.com", ip("192.0.2.1")), None);
        assert_eq!(wl.lookup_local("example.com.evil.test", ip("192.0.2.1")), None);
    }

    #[test]
    fn test_exact_ip_and_ranges() {
        let wl = whitelist("192.0.2.10\n198.51.100.0/24\n2001:db8::/32\n", &[]);

        assert_eq!(
            wl.lookup_local("[192.0.2.10]", ip("192.0.2.10")),
            Some(WhitelistMatch::ClientIp)
        );
        assert!(matches!(
            wl.lookup_local("host.test", ip("198.51.100.77")),
            Some(WhitelistMatch::IpRange(_))
        ));
        assert!(matches!(
            wl.lookup_local("host.test", ip("2001:db8::25")),
            Some(WhitelistMatch::IpRange(_))
        ));
        assert_eq!(wl.lookup_local("host.test", ip("203.0.113.1")), None);
    }

    #[tokio::test]
    async fn test_dns_whitelist_reverses_octets() {
        let dns = StaticDns::new().with_ip("9.113.0.203.wl.example", ip("127.0.10.1"));
        let wl = whitelist("", &["bl.example", "wl.example"]);

        assert_eq!(
            wl.lookup_dns(&dns, ip("203.0.113.9")).await,
            Some(WhitelistMatch::DnsWhitelist {
                zone: "wl.example".to_string(),
                response: ip("127.0.10.1"),
            })
        );
        assert_eq!(wl.lookup_dns(&dns, ip("203.0.113.10")).await, None);
    }

    #[tokio::test]
    async fn test_dns_whitelist_skips_ipv6() {
        let dns = StaticDns::new();
        let wl = whitelist("", &["wl.example"]);

        assert_eq!(wl.lookup_dns(&dns, ip("2001:db8::1")).await, None);
        assert_eq!(dns.queries(), 0);
    }

    #[tokio::test]
    async fn test_adding_entries_only_widens_matches() {
        let dns = StaticDns::new().with_ip("9.113.0.203.wl.example", ip("127.0.0.2"));
        let cases = [
            ("relay.partner.example", ip("203.0.113.9")),
            ("host.other.example", ip("198.51.100.3")),
            ("dsl.isp.example", ip("192.0.2.200")),
        ];

        let narrow = whitelist("partner.example\n", &[]);
        let wide = whitelist(
            "partner.example\n198.51.100.0/24\n192.0.2.200\n",
            &["wl.example"],
        );

        for (hostname, addr) in cases {
            if narrow.is_whitelisted(&dns, hostname, addr).await.is_some() {
                assert!(wide.is_whitelisted(&dns, hostname, addr).await.is_some());
            }
            assert!(wide.is_whitelisted(&dns, hostname, addr).await.is_some());
        }
    }

    #[test]
    fn test_match_list_names() {
        assert_eq!(WhitelistMatch::ClientIp.list("/etc/wl"), "/etc/wl");
        assert_eq!(
            WhitelistMatch::DnsWhitelist {
                zone: "list.dnswl.org".to_string(),
                response: ip("127.0.10.0"),
            }
            .list("/etc/wl"),
            "list.dnswl.org"
        );
    }
}
