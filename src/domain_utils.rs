/// Minimal address and domain hierarchy utilities
pub struct DomainUtils;

impl DomainUtils {
    /// Strip surrounding whitespace and SMTP angle brackets from an envelope address
    pub fn strip_angle_brackets(address: &str) -> &str {
        let trimmed = address.trim();
        trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed)
    }

    /// Extract domain from email address
    pub fn extract_domain(email: &str) -> Option<String> {
        let (_, domain) = Self::strip_angle_brackets(email).split_once('@')?;
        let domain = domain.trim_end_matches('.');
        if domain.is_empty() {
            return None;
        }
        Some(domain.to_lowercase())
    }

    /// The name itself followed by every parent obtained by dropping the
    /// leftmost label: `a.b.c` yields `a.b.c`, `b.c`, `c`.
    pub fn suffixes(name: &str) -> impl Iterator<Item = &str> {
        let mut next = if name.is_empty() { None } else { Some(name) };
        std::iter::from_fn(move || {
            let current = next?;
            next = current
                .split_once('.')
                .map(|(_, rest)| rest)
                .filter(|rest| !rest.is_empty());
            Some(current)
        })
    }

    /// The part of `domain` that sits above its public suffix, e.g. `gmail`
    /// for `gmail.com` and `l.to2van` for `l.to2van.com`.
    pub fn label_above_suffix(domain: &str) -> &str {
        let suffix = psl::suffix_str(domain)
            .unwrap_or_else(|| domain.rsplit('.').next().unwrap_or(domain));
        domain
            .strip_suffix(suffix)
            .unwrap_or(domain)
            .trim_end_matches('.')
    }

    /// Whether the domain has at most one label above its public suffix.
    /// Legitimate mail mostly comes from such domains (`@gmail.com`), while
    /// throwaway sending hosts tend to be deeper (`@l.to2van.com`).
    pub fn is_registrable(domain: &str) -> bool {
        !Self::label_above_suffix(domain).contains('.')
    }
}
