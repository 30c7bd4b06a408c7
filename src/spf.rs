//! Sender Policy Framework subset.
//!
//! Only the "pass" side of SPF is evaluated: a client is authorized when some
//! `+`-qualified (or unqualified) mechanism matches it. Failing qualifiers,
//! `all`, macros, and unknown modifiers never authorize and never reject.

use crate::dns::{host_has_ip, mx_has_ip, DnsLookup};
use ipnet::{Ipv4Net, Ipv6Net};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;

/// Recursion budget used when the caller has no opinion.
pub const DEFAULT_MAX_DEPTH: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    A(Option<String>),
    Mx(Option<String>),
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Include(String),
    Redirect(String),
}

impl Mechanism {
    /// Parse one whitespace-delimited term of a `v=spf1` record. Returns
    /// `None` for terms outside the supported subset, including any term
    /// carrying a `-`, `~` or `?` qualifier.
    pub fn parse(term: &str) -> Option<Self> {
        let term = term.strip_prefix('+').unwrap_or(term);
        if term.starts_with(['-', '~', '?']) {
            return None;
        }

        if let Some((name, value)) = term.split_once('=') {
            return match name.to_ascii_lowercase().as_str() {
                "redirect" if !value.is_empty() => Some(Mechanism::Redirect(value.to_string())),
                _ => None,
            };
        }

        let (name, value) = match term.split_once(':') {
            Some((name, value)) => (name.to_ascii_lowercase(), Some(value)),
            None => (term.to_ascii_lowercase(), None),
        };

        match (name.as_str(), value) {
            ("all", None) => Some(Mechanism::All),
            ("a", None) => Some(Mechanism::A(None)),
            ("a", Some(domain)) if !domain.is_empty() => Some(Mechanism::A(Some(domain.into()))),
            ("mx", None) => Some(Mechanism::Mx(None)),
            ("mx", Some(domain)) if !domain.is_empty() => {
                Some(Mechanism::Mx(Some(domain.into())))
            }
            ("ip4", Some(addr)) => parse_v4(addr).map(Mechanism::Ip4),
            ("ip6", Some(addr)) => parse_v6(addr).map(Mechanism::Ip6),
            ("include", Some(domain)) if !domain.is_empty() => {
                Some(Mechanism::Include(domain.to_string()))
            }
            _ => None,
        }
    }
}

fn parse_v4(addr: &str) -> Option<Ipv4Net> {
    if addr.contains('/') {
        addr.parse().ok()
    } else {
        addr.parse::<Ipv4Addr>().ok().map(Ipv4Net::from)
    }
}

fn parse_v6(addr: &str) -> Option<Ipv6Net> {
    if addr.contains('/') {
        addr.parse().ok()
    } else {
        addr.parse::<Ipv6Addr>().ok().map(Ipv6Net::from)
    }
}

/// Extract the mechanisms of the first `v=spf1` record among `records`.
pub fn parse_record<'a, I>(records: I) -> Option<Vec<Mechanism>>
where
    I: IntoIterator<Item = &'a String>,
{
    let record = records
        .into_iter()
        .find(|txt| txt.starts_with("v=spf1 "))?;

    Some(
        record
            .split_whitespace()
            .skip(1)
            .filter_map(|term| {
                let parsed = Mechanism::parse(term);
                if parsed.is_none() {
                    log::debug!("Ignoring SPF term {term}");
                }
                parsed
            })
            .collect(),
    )
}

type Authorization<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Stateless SPF evaluator; one instance serves every transaction.
#[derive(Clone)]
pub struct SpfEvaluator {
    dns: Arc<dyn DnsLookup>,
}

impl SpfEvaluator {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        SpfEvaluator { dns }
    }

    /// Whether `ip` is an authorized sender for `domain`. No more than
    /// `max_depth` records are evaluated along any include/redirect chain.
    pub fn is_authorized<'a>(
        &'a self,
        ip: IpAddr,
        domain: &'a str,
        max_depth: u32,
    ) -> Authorization<'a> {
        Box::pin(async move {
            if max_depth < 1 {
                log::debug!("SPF recursion limit reached at {domain}");
                return false;
            }

            let records = match self.dns.lookup_txt(domain).await {
                Ok(records) => records,
                Err(e) => {
                    log::debug!("SPF TXT lookup failed for {domain}: {e}");
                    return false;
                }
            };

            let Some(mechanisms) = parse_record(&records) else {
                log::debug!("No SPF record for {domain}");
                return false;
            };

            for mechanism in &mechanisms {
                match mechanism {
                    Mechanism::Redirect(target) => {
                        return self.is_authorized(ip, target, max_depth - 1).await;
                    }
                    other => {
                        if self.matches(other, ip, domain, max_depth).await {
                            log::debug!("SPF mechanism {other:?} of {domain} matches {ip}");
                            return true;
                        }
                    }
                }
            }

            false
        })
    }

    async fn matches(&self, mechanism: &Mechanism, ip: IpAddr, domain: &str, depth: u32) -> bool {
        let dns = self.dns.as_ref();
        match mechanism {
            Mechanism::All => false,
            Mechanism::A(target) => {
                host_has_ip(dns, target.as_deref().unwrap_or(domain), ip).await
            }
            Mechanism::Mx(target) => {
                mx_has_ip(dns, target.as_deref().unwrap_or(domain), ip)
                    .await
                    .is_some()
            }
            Mechanism::Ip4(net) => match ip {
                IpAddr::V4(v4) => net.contains(&v4),
                IpAddr::V6(_) => false,
            },
            Mechanism::Ip6(net) => match ip {
                IpAddr::V6(v6) => net.contains(&v6),
                IpAddr::V4(_) => false,
            },
            Mechanism::Include(target) => self.is_authorized(ip, target, depth - 1).await,
            Mechanism::Redirect(_) => false,
        }
    }
}
