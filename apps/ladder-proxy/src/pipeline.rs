use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::LadderConfig,
    error::{LadderError, LadderResult},
    fetch::Fetcher,
    matcher::{AllowList, match_rule},
    resolve::{authority, resolve},
    rewrite::rewrite,
    rules::RuleSet,
    transform::transform,
};

/// Outcome of one proxied request.
#[derive(Debug, Clone)]
pub struct ProxyResult {
    /// The URL actually fetched, after rule rewrites and redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub request_headers: HeaderMap,
    pub body: Bytes,
}

/// The request pipeline: resolve, allow-list, match, transform, fetch,
/// rewrite.
///
/// Built once at startup from an immutable config and ruleset; shared
/// behind an `Arc` by every connection.
pub struct Ladder {
    config: LadderConfig,
    rules: RuleSet,
    allow_list: AllowList,
    fetcher: Fetcher,
}

impl Ladder {
    pub fn new(config: LadderConfig, rules: RuleSet) -> Self {
        let mut allowed = config.allowed_domains.clone();
        if config.allowed_domains_ruleset {
            allowed.extend(rules.domains());
        }
        let allow_list = AllowList::new(allowed, config.domain_match);
        if !allow_list.is_empty() {
            info!(
                entries = allow_list.entries().len(),
                strategy = %config.domain_match,
                "domain allow-list active"
            );
        }

        let fetcher = Fetcher::new(&config);
        Self {
            config,
            rules,
            allow_list,
            fetcher,
        }
    }

    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Runs every stage once. The first failing stage aborts the request
    /// and its error is returned as is.
    pub async fn process_request(
        &self,
        raw_path: &str,
        raw_query: Option<&str>,
        inbound: &HeaderMap,
    ) -> LadderResult<ProxyResult> {
        let referer = inbound
            .get(header::REFERER)
            .and_then(|value| value.to_str().ok());
        let target = resolve(raw_path, raw_query, referer)?;
        if self.config.log_urls {
            info!(url = %target, "proxying");
        }

        let host = target.host_str().unwrap_or_default();
        if !self.allow_list.permits(host) {
            return Err(LadderError::DomainNotAllowed(host.to_string()));
        }

        let rule = match_rule(&self.rules, host, target.path());
        let final_url = transform(&target, rule)?;
        if final_url != target {
            debug!(from = %target, to = %final_url, "rule rewrote url");
        }

        let fetched = self
            .fetcher
            .fetch(&target, &final_url, rule, inbound)
            .await?;
        // Links are anchored to the requested host unless the origin
        // redirected elsewhere.
        let link_host = if fetched.url == final_url {
            authority(&target)
        } else {
            debug!(from = %final_url, to = %fetched.url, "followed redirect");
            authority(&fetched.url)
        };
        let body = rewrite(fetched.body, &link_host, rule, self.config.rewrite_mode)?;

        Ok(ProxyResult {
            url: fetched.url,
            status: fetched.status,
            headers: fetched.headers,
            request_headers: fetched.request_headers,
            body,
        })
    }
}
