use clap::{Arg, ArgAction, Command};
use grey_milter::config::{parse_duration, Config};
use grey_milter::dns::{DnsLookup, HickoryLookup};
use grey_milter::milter::Milter;
use grey_milter::policy::{Origin, Policy, Verdict};
use grey_milter::whitelist::{Whitelist, WhitelistEntries};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use log::LevelFilter;
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("grey-milter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Greylisting milter with whitelist, DNS whitelist and SPF bypasses")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/grey-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration and whitelist validity")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("whitelist")
                .short('w')
                .long("whitelist")
                .value_name("FILE")
                .help("File of whitelisted domains, IPs, and CIDR ranges")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .value_name("DURATION")
                .help("Minimum time before a retry is accepted (e.g. 90, 30s, 5m)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("SPEC")
                .help("inetd, unix:/path, inet:port@host or host:port")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-transaction")
                .long("test-transaction")
                .value_names(["IP", "HOSTNAME", "SENDER", "RECIPIENT"])
                .num_args(4)
                .help("Run one transaction through the policy using live DNS")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    // Initialize logger based on verbose flag
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/grey-milter.yaml");

    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if let Some(whitelist) = matches.get_one::<String>("whitelist") {
        config.whitelist_file = Some(whitelist.clone());
    }
    if let Some(socket) = matches.get_one::<String>("socket") {
        config.socket = socket.clone();
    }
    if let Some(delay) = matches.get_one::<String>("delay") {
        match parse_duration(delay) {
            Ok(delay) => config.min_retry_delay_secs = delay.as_secs(),
            Err(e) => {
                eprintln!("Invalid --delay: {e}");
                process::exit(1);
            }
        }
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        process::exit(1);
    }

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let whitelist = load_whitelist(&config);
    let dns = build_resolver(&config);
    let policy = Arc::new(Policy::new(&config, whitelist, dns));

    if let Some(values) = matches.get_many::<String>("test-transaction") {
        let args: Vec<&str> = values.map(String::as_str).collect();
        test_transaction(&policy, &args).await;
        return;
    }

    log::info!(
        "Starting grey-milter (minimum retry delay {}s)",
        config.min_retry_delay_secs
    );

    let milter = Milter::new(policy);
    if let Err(e) = milter.run(&config.socket, config.sweep_interval()).await {
        log::error!("Could not run milter on {}: {e:#}", config.socket);
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

/// A missing or unreadable whitelist is not fatal; run with an empty one.
fn load_whitelist(config: &Config) -> Whitelist {
    let Some(path) = config.whitelist_file.as_deref() else {
        return Whitelist::with_default_zones(WhitelistEntries::default(), "");
    };
    let entries = match WhitelistEntries::from_file(path) {
        Ok(entries) => {
            log::info!("Loaded {} whitelist entries from {path}", entries.len());
            entries
        }
        Err(e) => {
            log::warn!("Error loading whitelist file: file={path}, error={e:#}");
            WhitelistEntries::default()
        }
    };
    Whitelist::with_default_zones(entries, path)
}

fn build_resolver(config: &Config) -> Arc<dyn DnsLookup> {
    match HickoryLookup::from_system_conf(config.dns_timeout()) {
        Ok(lookup) => Arc::new(lookup),
        Err(e) => {
            log::warn!("Failed to read system resolver configuration, using defaults: {e}");
            Arc::new(HickoryLookup::with_config(
                ResolverConfig::default(),
                ResolverOpts::default(),
                config.dns_timeout(),
            ))
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Socket: {}", config.socket);
    println!("Minimum retry delay: {}s", config.min_retry_delay_secs);
    println!("SPF depth limit: {}", config.spf_max_depth);

    match config.whitelist_file.as_deref() {
        Some(path) => match WhitelistEntries::from_file(path) {
            Ok(entries) => {
                println!(
                    "Whitelist {path}: {} hosts/domains, {} ranges",
                    entries.exact.len(),
                    entries.ranges.len()
                );
            }
            Err(e) => {
                println!("❌ Whitelist could not be loaded: {e:#}");
                process::exit(1);
            }
        },
        None => println!("No whitelist file configured"),
    }
    println!("✅ Configuration validated");
}

async fn test_transaction(policy: &Arc<Policy>, args: &[&str]) {
    let [ip, hostname, sender, recipient] = args else {
        eprintln!("--test-transaction needs IP HOSTNAME SENDER RECIPIENT");
        process::exit(1);
    };
    let ip: IpAddr = match ip.parse() {
        Ok(ip) => ip,
        Err(e) => {
            eprintln!("❌ Invalid IP address {ip}: {e}");
            process::exit(1);
        }
    };

    println!("🧪 Testing transaction from {hostname} [{ip}]");
    println!();

    let mut txn = policy.transaction();
    let connect = txn.on_connect(hostname, Origin::Tcp(SocketAddr::new(ip, 25))).await;
    print_verdict("Connect", connect);
    if connect == Verdict::Accept {
        return;
    }

    let from = txn.on_sender(sender, None).await;
    print_verdict("Sender", from);
    if from == Verdict::Accept {
        return;
    }

    print_verdict("Recipient", txn.on_recipient(recipient));
}

fn print_verdict(stage: &str, verdict: Verdict) {
    match verdict {
        Verdict::Accept => println!("✅ {stage}: ACCEPT"),
        Verdict::Continue => println!("➡️  {stage}: CONTINUE"),
        Verdict::TempFail(reply) => println!("⏳ {stage}: TEMPFAIL {reply}"),
    }
}
