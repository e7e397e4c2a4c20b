//! Blocklist snapshot and host matching

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How a host is compared against blocklist entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Blocked when any entry occurs anywhere in the host.
    /// `mybet365.com` matches `bet365.com`.
    #[default]
    Substring,
    /// Blocked when the host equals an entry or is a subdomain of it.
    Suffix,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substring" => Ok(MatchPolicy::Substring),
            "suffix" => Ok(MatchPolicy::Suffix),
            other => Err(format!(
                "unknown match policy '{other}' (expected 'substring' or 'suffix')"
            )),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Substring => f.write_str("substring"),
            MatchPolicy::Suffix => f.write_str("suffix"),
        }
    }
}

/// Immutable set of blocked domains produced by one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedDomainSet {
    domains: BTreeSet<String>,
}

impl BlockedDomainSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw entries, trimming and lowercasing each one
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = entries
            .into_iter()
            .map(|entry| entry.as_ref().trim().to_ascii_lowercase())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    /// Whether `host` is blocked under `policy`
    pub fn matches(&self, host: &str, policy: MatchPolicy) -> bool {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        match policy {
            MatchPolicy::Substring => self.domains.iter().any(|entry| host.contains(entry.as_str())),
            MatchPolicy::Suffix => self.domains.iter().any(|entry| {
                host == *entry
                    || (host.len() > entry.len()
                        && host.ends_with(entry.as_str())
                        && host.as_bytes()[host.len() - entry.len() - 1] == b'.')
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_entries() {
        let set = BlockedDomainSet::from_entries(["  Bet365.COM ", "", "bet365.com", "tiktok.com"]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("bet365.com"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["bet365.com", "tiktok.com"]);
    }

    #[test]
    fn substring_policy_matches_embedded_entries() {
        let set = BlockedDomainSet::from_entries(["bet365.com"]);
        assert!(set.matches("bet365.com", MatchPolicy::Substring));
        assert!(set.matches("www.bet365.com", MatchPolicy::Substring));
        assert!(set.matches("mybet365.com", MatchPolicy::Substring));
        assert!(set.matches("notexamplebet365.com", MatchPolicy::Substring));
        assert!(set.matches("BET365.com", MatchPolicy::Substring));
        assert!(!set.matches("example.com", MatchPolicy::Substring));
    }

    #[test]
    fn suffix_policy_requires_label_boundary() {
        let set = BlockedDomainSet::from_entries(["bet365.com"]);
        assert!(set.matches("bet365.com", MatchPolicy::Suffix));
        assert!(set.matches("www.bet365.com", MatchPolicy::Suffix));
        assert!(set.matches("bet365.com.", MatchPolicy::Suffix));
        assert!(!set.matches("mybet365.com", MatchPolicy::Suffix));
        assert!(!set.matches("bet365.com.evil.org", MatchPolicy::Suffix));
    }

    #[test]
    fn empty_set_blocks_nothing() {
        let set = BlockedDomainSet::empty();
        assert!(!set.matches("example.com", MatchPolicy::Substring));
        assert!(!set.matches("", MatchPolicy::Suffix));
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("Substring".parse::<MatchPolicy>(), Ok(MatchPolicy::Substring));
        assert_eq!("suffix".parse::<MatchPolicy>(), Ok(MatchPolicy::Suffix));
        assert!("exact".parse::<MatchPolicy>().is_err());
    }
}
