use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `inetd` to inherit the listening socket on stdin, `unix:/path`,
    /// `inet:port@host`, or `host:port`.
    pub socket: String,
    /// Domains, host names, addresses and CIDR ranges to trust.
    pub whitelist_file: Option<String>,
    /// Retries sooner than this are greylisted again. Zero disables the check.
    pub min_retry_delay_secs: u64,
    pub dns_timeout_secs: u64,
    pub spf_max_depth: u32,
    pub spf_timeout_secs: u64,
    /// How often expired triplets are dropped from memory.
    pub sweep_interval_secs: u64,
    pub header_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: "inetd".to_string(),
            whitelist_file: None,
            min_retry_delay_secs: 0,
            dns_timeout_secs: 5,
            spf_max_depth: crate::spf::DEFAULT_MAX_DEPTH,
            spf_timeout_secs: 15,
            sweep_interval_secs: 600,
            header_name: "X-Greylist".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.socket.trim().is_empty() {
            bail!("socket must not be empty");
        }
        if self.dns_timeout_secs == 0 {
            bail!("dns_timeout_secs must be positive");
        }
        if self.spf_timeout_secs == 0 {
            bail!("spf_timeout_secs must be positive");
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be positive");
        }
        let valid_header = !self.header_name.is_empty()
            && self
                .header_name
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b':');
        if !valid_header {
            bail!("invalid header_name {:?}", self.header_name);
        }
        Ok(())
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::from_secs(self.min_retry_delay_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn spf_timeout(&self) -> Duration {
        Duration::from_secs(self.spf_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Parse a delay such as `90`, `30s`, `5m`, `2h` or `1h30m`. Bare numbers are seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        bail!("empty duration");
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => bail!("invalid duration {text:?}: unknown unit {c:?}"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| anyhow!("invalid duration {text:?}: missing number before {c:?}"))?;
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| anyhow!("duration {text:?} is too large"))?;
        digits.clear();
    }
    if !digits.is_empty() {
        bail!("invalid duration {text:?}: trailing number without unit");
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_retry_delay(), Duration::ZERO);
        assert_eq!(config.header_name, "X-Greylist");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "socket: unix:/var/run/grey-milter.sock\nmin_retry_delay_secs: 300\n",
        )
        .unwrap();
        assert_eq!(config.socket, "unix:/var/run/grey-milter.sock");
        assert_eq!(config.min_retry_delay(), Duration::from_secs(300));
        assert_eq!(config.dns_timeout_secs, 5);
        assert_eq!(config.whitelist_file, None);
    }

    #[test]
    fn test_file_round_trip() {
        let file = format!("grey-milter-config-{}.yaml", std::process::id());
        let path = std::env::temp_dir().join(file);
        let path = path.to_str().unwrap();
        let config = Config {
            whitelist_file: Some("/etc/grey-milter/whitelist".to_string()),
            spf_max_depth: 4,
            ..Config::default()
        };

        config.to_file(path).unwrap();
        let loaded = Config::from_file(path).unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_sweep = Config {
            sweep_interval_secs: 0,
            ..Config::default()
        };
        assert!(zero_sweep.validate().is_err());

        let bad_header = Config {
            header_name: "X Greylist:".to_string(),
            ..Config::default()
        };
        assert!(bad_header.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("1h30").is_err());
    }
}
