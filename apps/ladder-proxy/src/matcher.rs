//! Rule selection and the outbound domain allow-list.

use std::{fmt, str::FromStr};

use crate::rules::{Rule, RuleSet};

static NO_MATCH: Rule = Rule::EMPTY;

/// Returns the first rule whose domain set covers `host` and whose path
/// filters (if any) accept `path`, or [`Rule::EMPTY`] when none does.
///
/// A domain covers `host` when it is equal to it or is a whole-label suffix
/// of it: `news.example` covers `a.news.example` but not `badnews.example`.
///
/// Path filters are prefixes of the request path. A filter of `/a` accepts
/// `/a`, `/a/b` and also `/about`.
pub fn match_rule<'a>(ruleset: &'a RuleSet, host: &str, path: &str) -> &'a Rule {
    ruleset
        .iter()
        .find(|rule| {
            rule.domain_set()
                .any(|candidate| host_matches(host, candidate))
                && path_matches(path, &rule.paths)
        })
        .unwrap_or(&NO_MATCH)
}

fn host_matches(host: &str, candidate: &str) -> bool {
    if host.eq_ignore_ascii_case(candidate) {
        return true;
    }
    let host = host.to_ascii_lowercase();
    let suffix = format!(".{}", candidate.to_ascii_lowercase());
    host.ends_with(&suffix)
}

fn path_matches(path: &str, filters: &[String]) -> bool {
    filters.is_empty() || filters.iter().any(|filter| path.starts_with(filter.as_str()))
}

/// How allow-list entries are compared against a target host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DomainMatch {
    /// The entry is a string prefix of the host. `example.com` also admits
    /// `example.com.attacker.io`.
    #[default]
    Prefix,
    /// The entry equals the host or is a whole-label suffix of it, the same
    /// test the rule matcher uses.
    LabelSuffix,
}

impl DomainMatch {
    pub fn matches(self, host: &str, entry: &str) -> bool {
        match self {
            DomainMatch::Prefix => host.starts_with(entry),
            DomainMatch::LabelSuffix => host_matches(host, entry),
        }
    }
}

impl FromStr for DomainMatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefix" => Ok(DomainMatch::Prefix),
            "label-suffix" | "label_suffix" | "suffix" => Ok(DomainMatch::LabelSuffix),
            other => Err(format!(
                "unknown domain match strategy '{other}' (expected prefix or label-suffix)"
            )),
        }
    }
}

impl fmt::Display for DomainMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainMatch::Prefix => f.write_str("prefix"),
            DomainMatch::LabelSuffix => f.write_str("label-suffix"),
        }
    }
}

/// Hosts the proxy may fetch from. An empty list admits every host.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<String>,
    strategy: DomainMatch,
}

impl AllowList {
    pub fn new(entries: impl IntoIterator<Item = String>, strategy: DomainMatch) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { entries, strategy }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn permits(&self, host: &str) -> bool {
        self.entries.is_empty()
            || self
                .entries
                .iter()
                .any(|entry| self.strategy.matches(host, entry))
    }
}
