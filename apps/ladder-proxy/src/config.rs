use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use crate::matcher::DomainMatch;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
pub const DEFAULT_FORWARDED_FOR: &str = "66.249.66.1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Which link-rewriting passes run before rule substitutions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RewriteMode {
    /// Plain substring replacement of `href="/`, `src="/` and `url(/`.
    #[default]
    Literal,
    /// `<img>` and `<script>` sources are rewritten with tag-aware patterns
    /// instead of the bare `src="/` replacement.
    TagRegex,
}

impl FromStr for RewriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "literal" => Ok(RewriteMode::Literal),
            "tag-regex" | "tag_regex" | "regex" => Ok(RewriteMode::TagRegex),
            other => Err(format!(
                "unknown rewrite mode '{other}' (expected literal or tag-regex)"
            )),
        }
    }
}

impl fmt::Display for RewriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteMode::Literal => f.write_str("literal"),
            RewriteMode::TagRegex => f.write_str("tag-regex"),
        }
    }
}

/// Process-wide settings for the pipeline. Built once at startup and
/// shared read-only by every request.
#[derive(Debug, Clone)]
pub struct LadderConfig {
    pub user_agent: String,
    pub forwarded_for: String,
    pub timeout: Duration,
    pub allowed_domains: Vec<String>,
    /// Also admit every domain named by the ruleset.
    pub allowed_domains_ruleset: bool,
    pub domain_match: DomainMatch,
    pub log_urls: bool,
    pub expose_ruleset: bool,
    pub rewrite_mode: RewriteMode,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            forwarded_for: DEFAULT_FORWARDED_FOR.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            allowed_domains: Vec::new(),
            allowed_domains_ruleset: false,
            domain_match: DomainMatch::default(),
            log_urls: false,
            expose_ruleset: true,
            rewrite_mode: RewriteMode::default(),
        }
    }
}

/// Splits a comma-separated domain list, dropping blanks.
pub fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}
