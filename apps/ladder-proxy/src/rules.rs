//! Per-site rule model and ruleset loading.
//!
//! Rules are written by operators as YAML lists:
//!
//! ```yaml
//! - domain: example.com
//!   domains: [www.example.com]
//!   paths: [/news]
//!   headers:
//!     user-agent: "Mozilla/5.0"
//!     x-forwarded-for: none
//!   googleCache: false
//!   regexRules:
//!     - match: "<script.*?paywall.*?</script>"
//!       replace: ""
//!   urlMods:
//!     query:
//!       - key: amp
//!         value: "1"
//!   injections:
//!     - position: body
//!       append: "<p>proxied</p>"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LadderError, LadderResult};

const NONE_SENTINEL: &str = "none";

/// Outbound header directive: inherit the proxy default, send a fixed
/// value, or drop the header entirely (`"none"` in rule files).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum HeaderOverride {
    #[default]
    Unset,
    Value(String),
    Omit,
}

impl HeaderOverride {
    pub fn is_unset(&self) -> bool {
        matches!(self, HeaderOverride::Unset)
    }
}

impl From<Option<String>> for HeaderOverride {
    fn from(value: Option<String>) -> Self {
        match value {
            None => HeaderOverride::Unset,
            Some(value) if value.is_empty() => HeaderOverride::Unset,
            Some(value) if value.eq_ignore_ascii_case(NONE_SENTINEL) => HeaderOverride::Omit,
            Some(value) => HeaderOverride::Value(value),
        }
    }
}

impl From<HeaderOverride> for Option<String> {
    fn from(value: HeaderOverride) -> Self {
        match value {
            HeaderOverride::Unset => None,
            HeaderOverride::Value(value) => Some(value),
            HeaderOverride::Omit => Some(NONE_SENTINEL.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderOverrides {
    #[serde(rename = "user-agent", skip_serializing_if = "HeaderOverride::is_unset")]
    pub user_agent: HeaderOverride,
    #[serde(
        rename = "x-forwarded-for",
        skip_serializing_if = "HeaderOverride::is_unset"
    )]
    pub forwarded_for: HeaderOverride,
    #[serde(skip_serializing_if = "HeaderOverride::is_unset")]
    pub referer: HeaderOverride,
    #[serde(skip_serializing_if = "HeaderOverride::is_unset")]
    pub cookie: HeaderOverride,
    #[serde(
        rename = "content-security-policy",
        skip_serializing_if = "HeaderOverride::is_unset"
    )]
    pub csp: HeaderOverride,
}

impl HeaderOverrides {
    const UNSET: HeaderOverrides = HeaderOverrides {
        user_agent: HeaderOverride::Unset,
        forwarded_for: HeaderOverride::Unset,
        referer: HeaderOverride::Unset,
        cookie: HeaderOverride::Unset,
        csp: HeaderOverride::Unset,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::UNSET
    }
}

/// A find-and-replace pair. `replace` may reference capture groups (`$1`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexRule {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub replace: String,
}

impl RegexRule {
    pub fn new(pattern: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replace: replace.into(),
        }
    }

    pub fn compile(&self) -> LadderResult<Regex> {
        Regex::new(&self.pattern).map_err(|source| LadderError::RuleRegex {
            pattern: self.pattern.clone(),
            source,
        })
    }
}

/// Query directive: an empty `value` deletes `key`, anything else sets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDirective {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlMods {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<RegexRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<RegexRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<QueryDirective>,
}

impl UrlMods {
    pub fn is_empty(&self) -> bool {
        self.domain.is_empty() && self.path.is_empty() && self.query.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOp {
    /// Replace the inner content of every matched element.
    Replace(String),
    Append(String),
    Prepend(String),
}

/// A structural edit applied at every element matching `selector`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawInjection", into = "RawInjection")]
pub struct Injection {
    pub selector: String,
    pub op: InjectionOp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawInjection {
    #[serde(default)]
    position: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    append: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prepend: Option<String>,
}

impl TryFrom<RawInjection> for Injection {
    type Error = String;

    fn try_from(raw: RawInjection) -> Result<Self, Self::Error> {
        let mut ops = [
            raw.replace.filter(|s| !s.is_empty()).map(InjectionOp::Replace),
            raw.append.filter(|s| !s.is_empty()).map(InjectionOp::Append),
            raw.prepend.filter(|s| !s.is_empty()).map(InjectionOp::Prepend),
        ]
        .into_iter()
        .flatten();

        match (ops.next(), ops.next()) {
            (Some(op), None) => Ok(Injection {
                selector: raw.position,
                op,
            }),
            (None, _) => Err(format!(
                "injection at '{}' needs one of replace, append or prepend",
                raw.position
            )),
            (Some(_), Some(_)) => Err(format!(
                "injection at '{}' sets more than one of replace, append or prepend",
                raw.position
            )),
        }
    }
}

impl From<Injection> for RawInjection {
    fn from(injection: Injection) -> Self {
        let mut raw = RawInjection {
            position: injection.selector,
            ..RawInjection::default()
        };
        match injection.op {
            InjectionOp::Replace(html) => raw.replace = Some(html),
            InjectionOp::Append(html) => raw.append = Some(html),
            InjectionOp::Prepend(html) => raw.prepend = Some(html),
        }
        raw
    }
}

/// One site's customization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Path prefixes this rule is limited to. Empty means every path.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "HeaderOverrides::is_empty")]
    pub headers: HeaderOverrides,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub google_cache: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub regex_rules: Vec<RegexRule>,
    #[serde(skip_serializing_if = "UrlMods::is_empty")]
    pub url_mods: UrlMods,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub injections: Vec<Injection>,
}

impl Rule {
    /// The rule every request gets when nothing in the ruleset matches.
    pub const EMPTY: Rule = Rule {
        domain: String::new(),
        domains: Vec::new(),
        paths: Vec::new(),
        headers: HeaderOverrides::UNSET,
        google_cache: false,
        regex_rules: Vec::new(),
        url_mods: UrlMods {
            domain: Vec::new(),
            path: Vec::new(),
            query: Vec::new(),
        },
        injections: Vec::new(),
    };

    /// Primary domain followed by the alternates, skipping blanks.
    pub fn domain_set(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.domain.as_str())
            .chain(self.domains.iter().map(String::as_str))
            .filter(|domain| !domain.is_empty())
    }

    pub fn has_content_rules(&self) -> bool {
        !self.regex_rules.is_empty() || !self.injections.is_empty()
    }
}

/// Ordered rule collection; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn from_yaml_str(source: &str) -> LadderResult<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(source).map_err(|e| LadderError::RulesetLoad(e.to_string()))
    }

    /// Loads every `*.yml`/`*.yaml` file named by `paths`, a `;`-separated
    /// list of files or directories. Directories are walked recursively in
    /// name order so rule precedence is stable across runs.
    pub fn load(paths: &str) -> LadderResult<Self> {
        let sources: Vec<&str> = paths
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if sources.is_empty() {
            warn!("no ruleset specified; proxying without site rules");
            return Ok(Self::default());
        }

        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for source in sources {
            let mut files = Vec::new();
            if let Err(err) = collect_rule_files(Path::new(source), &mut files) {
                errors.push(format!("'{source}': {err}"));
                continue;
            }
            for file in files {
                match load_file(&file) {
                    Ok(set) => rules.extend(set.rules),
                    Err(LadderError::RulesetLoad(reason)) => errors.push(reason),
                    Err(err) => errors.push(err.to_string()),
                }
            }
        }

        if !errors.is_empty() {
            return Err(LadderError::RulesetLoad(errors.join("; ")));
        }

        let set = Self::new(rules);
        info!(
            rules = set.len(),
            domains = set.domain_count(),
            "loaded ruleset"
        );
        Ok(set)
    }

    pub fn to_yaml(&self) -> LadderResult<String> {
        serde_yaml::to_string(self).map_err(|e| LadderError::RulesetLoad(e.to_string()))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn domains(&self) -> Vec<String> {
        self.rules
            .iter()
            .flat_map(Rule::domain_set)
            .map(str::to_string)
            .collect()
    }

    pub fn domain_count(&self) -> usize {
        self.rules.iter().map(|rule| rule.domain_set().count()).sum()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

fn is_rule_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml" | "yaml")
    )
}

fn collect_rule_files(path: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !path.is_dir() {
        // Missing paths are an error.
        fs::metadata(path)?;
        if is_rule_file(path) {
            out.push(path.to_path_buf());
        }
        return Ok(());
    }

    let mut entries = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    for entry in entries {
        collect_rule_files(&entry, out)?;
    }
    Ok(())
}

fn load_file(path: &Path) -> LadderResult<RuleSet> {
    let content = fs::read_to_string(path).map_err(|err| {
        LadderError::RulesetLoad(format!("failed to read '{}': {err}", path.display()))
    })?;
    if content.trim().is_empty() {
        return Ok(RuleSet::default());
    }
    serde_yaml::from_str(&content).map_err(|err| {
        LadderError::RulesetLoad(format!("syntax error in '{}': {err}", path.display()))
    })
}
