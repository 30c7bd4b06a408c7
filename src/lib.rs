pub mod config;
pub mod dns;
pub mod domain_utils;
pub mod greylist;
pub mod milter;
pub mod policy;
pub mod spf;
pub mod whitelist;

pub use config::Config;
pub use dns::{DnsLookup, HickoryLookup, StaticDns};
pub use greylist::{GreylistOutcome, GreylistStore, Triplet};
pub use milter::Milter;
pub use policy::{Origin, Policy, Transaction, Verdict};
pub use spf::SpfEvaluator;
pub use whitelist::{Whitelist, WhitelistEntries, WhitelistMatch};
