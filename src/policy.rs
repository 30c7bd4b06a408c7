use crate::config::Config;
use crate::dns::{host_has_ip, mx_has_ip, DnsLookup};
use crate::domain_utils::DomainUtils;
use crate::greylist::{GreylistOutcome, GreylistStore};
use crate::spf::SpfEvaluator;
use crate::whitelist::Whitelist;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Product name written into the delay trace header.
pub const PRODUCT_NAME: &str = "grey-milter";

/// SMTP reply carried by a temporary rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: &'static str,
    pub status: &'static str,
    pub text: &'static str,
}

pub const GREYLISTED: Reply = Reply {
    code: "450",
    status: "4.2.0",
    text: "Greylisted",
};

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.code, self.status, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Stop checking; the rest of the connection or message goes through.
    Accept,
    /// No objection at this stage.
    Continue,
    /// Reject with a 4xx reply so the sender retries later.
    TempFail(Reply),
}

/// Where a connection came from, as reported by the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Tcp(SocketAddr),
    /// Unix socket or an unknown address family.
    Local(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Started,
    HostKnown,
    SenderKnown,
    Decided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Accept,
    Whitelist,
    Continue,
    Greylist,
    Pass,
    Observe,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Accept => "accept",
            Category::Whitelist => "whitelist",
            Category::Continue => "continue",
            Category::Greylist => "greylist",
            Category::Pass => "pass",
            Category::Observe => "observe",
        };
        f.write_str(name)
    }
}

/// One structured log line per decision.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    message: String,
    category: Category,
    fields: Vec<(&'static str, String)>,
}

impl DecisionRecord {
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        DecisionRecord {
            message: message.into(),
            category,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.fields.push((key, value));
        }
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn emit(self) {
        log::info!("{self}");
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: category={}", self.message, self.category)?;
        for (key, value) in &self.fields {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// Render a delay the way operators read it in headers: `1h30m0s`.
pub fn format_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Long-lived service object shared by every transaction.
pub struct Policy {
    greylist: GreylistStore,
    whitelist: Whitelist,
    spf: SpfEvaluator,
    dns: Arc<dyn DnsLookup>,
    spf_max_depth: u32,
    spf_timeout: Duration,
    header_name: String,
}

impl Policy {
    pub fn new(config: &Config, whitelist: Whitelist, dns: Arc<dyn DnsLookup>) -> Self {
        Policy {
            greylist: GreylistStore::new(config.min_retry_delay()),
            whitelist,
            spf: SpfEvaluator::new(dns.clone()),
            dns,
            spf_max_depth: config.spf_max_depth,
            spf_timeout: config.spf_timeout(),
            header_name: config.header_name.clone(),
        }
    }

    pub fn greylist(&self) -> &GreylistStore {
        &self.greylist
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Fresh per-connection state machine.
    pub fn transaction(self: &Arc<Self>) -> Transaction {
        Transaction::new(self.clone())
    }
}

/// State of one mail transaction, driven by milter events in protocol order.
pub struct Transaction {
    policy: Arc<Policy>,
    stage: Stage,
    hostname: String,
    ip: Option<IpAddr>,
    sender: String,
    delay: Option<Duration>,
    // Set when the connection itself was accepted; later messages skip checks.
    trusted_host: bool,
}

impl Transaction {
    pub fn new(policy: Arc<Policy>) -> Self {
        Transaction {
            policy,
            stage: Stage::Started,
            hostname: String::new(),
            ip: None,
            sender: String::new(),
            delay: None,
            trusted_host: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    fn record(&self, category: Category, message: &str) -> DecisionRecord {
        DecisionRecord::new(category, message)
            .field("hostname", &self.hostname)
            .field("ip", self.ip.map(|ip| ip.to_string()).unwrap_or_default())
            .field("from", &self.sender)
    }

    fn decide(&mut self, record: DecisionRecord) -> Verdict {
        record.emit();
        self.stage = Stage::Decided;
        Verdict::Accept
    }

    fn trust_host(&mut self, record: DecisionRecord) -> Verdict {
        self.trusted_host = true;
        self.decide(record)
    }

    pub async fn on_connect(&mut self, hostname: &str, origin: Origin) -> Verdict {
        self.hostname = hostname.to_string();
        self.stage = Stage::HostKnown;

        let ip = match origin {
            Origin::Tcp(addr) => addr.ip(),
            Origin::Local(address) => {
                let record = DecisionRecord::new(Category::Accept, "Non-TCP connection")
                    .field("address", address);
                return self.trust_host(record);
            }
        };
        self.ip = Some(ip);
        let policy = self.policy.clone();

        if let Some(found) = Whitelist::trusted_origin(hostname, ip) {
            let list = found.list(policy.whitelist.source());
            let record = self
                .record(Category::Whitelist, &found.to_string())
                .field("list", list);
            return self.trust_host(record);
        }

        if policy.greylist.already_passed(&ip.to_string()) {
            let record = self.record(Category::Accept, "Already passed greylist");
            return self.trust_host(record);
        }

        let whitelist = &policy.whitelist;
        let found = match whitelist.lookup_local(hostname, ip) {
            Some(found) => Some(found),
            None => whitelist.lookup_dns(policy.dns.as_ref(), ip).await,
        };
        if let Some(found) = found {
            let list = found.list(whitelist.source());
            let record = self
                .record(Category::Whitelist, &found.to_string())
                .field("list", list);
            return self.trust_host(record);
        }

        self.record(Category::Continue, "Client not whitelisted").emit();
        Verdict::Continue
    }

    pub fn on_helo(&mut self, name: &str) -> Verdict {
        log::debug!("HELO {name} from {}", self.hostname);
        Verdict::Continue
    }

    /// `authenticated_as` is the SASL login name when the MTA reports one.
    pub async fn on_sender(&mut self, address: &str, authenticated_as: Option<&str>) -> Verdict {
        if self.trusted_host {
            return Verdict::Accept;
        }
        self.sender = DomainUtils::strip_angle_brackets(address).to_string();
        self.delay = None;
        self.stage = Stage::SenderKnown;

        if let Some(user) = authenticated_as {
            let record = self
                .record(Category::Accept, "Authenticated connection")
                .field("user", user);
            return self.decide(record);
        }

        let (ip, domain) = match self.checkable_sender() {
            Ok(found) => found,
            Err(record) => {
                record.emit();
                return Verdict::Continue;
            }
        };

        let policy = self.policy.clone();
        let dns = policy.dns.as_ref();
        if host_has_ip(dns, &domain, ip).await {
            let record = self
                .record(Category::Accept, "IP matches A record")
                .field("domain", &domain);
            return self.decide(record);
        }

        if let Some(exchange) = mx_has_ip(dns, &domain, ip).await {
            let record = self
                .record(Category::Accept, "IP matches MX record")
                .field("domain", &domain)
                .field("mx", exchange);
            return self.decide(record);
        }

        let spf = policy.spf.is_authorized(ip, &domain, policy.spf_max_depth);
        match tokio::time::timeout(policy.spf_timeout, spf).await {
            Ok(true) => {
                let record = self
                    .record(Category::Accept, "IP authorized by SPF")
                    .field("domain", &domain);
                return self.decide(record);
            }
            Ok(false) => {}
            Err(_) => log::debug!(
                "SPF evaluation for {domain} timed out after {:?}",
                policy.spf_timeout
            ),
        }

        self.record(Category::Continue, "Sender not verified")
            .field("domain", &domain)
            .emit();
        Verdict::Continue
    }

    /// Client address and sender domain for the ownership checks, or the
    /// continue record explaining why they cannot run.
    fn checkable_sender(&self) -> Result<(IpAddr, String), DecisionRecord> {
        let Some(ip) = self.ip else {
            return Err(self.record(Category::Continue, "No client address"));
        };
        let Some(domain) = DomainUtils::extract_domain(&self.sender) else {
            return Err(self.record(Category::Continue, "No sender domain"));
        };
        if !DomainUtils::is_registrable(&domain) {
            return Err(self
                .record(Category::Continue, "Sender domain too deep")
                .field("domain", domain));
        }
        Ok((ip, domain))
    }

    pub fn on_recipient(&mut self, address: &str) -> Verdict {
        if self.stage == Stage::Decided {
            return Verdict::Continue;
        }
        let Some(ip) = self.ip else {
            log::debug!("Recipient {address} without a client address, not greylisting");
            return Verdict::Continue;
        };
        let recipient = DomainUtils::strip_angle_brackets(address);

        match self
            .policy
            .greylist
            .check(&ip.to_string(), &self.sender, recipient)
        {
            GreylistOutcome::Passed(delay) => {
                self.record(Category::Pass, "Passed greylist")
                    .field("to", recipient)
                    .field("delay", format_delay(delay))
                    .emit();
                if !delay.is_zero() {
                    self.delay = Some(delay);
                }
                Verdict::Continue
            }
            GreylistOutcome::TooSoon(delay) => {
                self.record(Category::Greylist, "Greylisted, retried too soon")
                    .field("to", recipient)
                    .field("delay", format_delay(delay))
                    .emit();
                Verdict::TempFail(GREYLISTED)
            }
            GreylistOutcome::New => {
                self.record(Category::Greylist, "Greylisted")
                    .field("to", recipient)
                    .emit();
                Verdict::TempFail(GREYLISTED)
            }
        }
    }

    /// `headers` is keyed by lower-cased header name.
    pub fn on_headers(&mut self, headers: &HashMap<String, String>) -> Verdict {
        let Some(delay) = self.delay else {
            return Verdict::Continue;
        };
        let ham = headers
            .get("x-spam-status")
            .is_some_and(|status| status.trim_start().starts_with("No"));
        if ham {
            let header = |name: &str| headers.get(name).cloned().unwrap_or_default();
            self.record(Category::Observe, "Delayed good message")
                .field("to", header("to"))
                .field("delay", format_delay(delay))
                .field("subject", header("subject"))
                .emit();
        }
        Verdict::Continue
    }

    /// Header to add at end of message, if this message was delayed.
    pub fn on_body(&mut self) -> Option<(String, String)> {
        let delay = self.delay.take();
        self.stage = Stage::Decided;
        delay.map(|delay| {
            (
                self.policy.header_name.clone(),
                format!("delayed {} by {PRODUCT_NAME}", format_delay(delay)),
            )
        })
    }

    /// Message aborted or finished; the connection may start another.
    pub fn reset(&mut self) {
        self.sender.clear();
        self.delay = None;
        self.stage = if self.trusted_host {
            Stage::Decided
        } else if self.ip.is_some() {
            Stage::HostKnown
        } else {
            Stage::Started
        };
    }
}
