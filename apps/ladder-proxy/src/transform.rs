use std::collections::BTreeMap;

use url::Url;

use crate::{
    error::{LadderError, LadderResult},
    resolve::authority,
    rules::Rule,
};

pub const CACHE_MIRROR_PREFIX: &str = "https://webcache.googleusercontent.com/search?q=cache:";

/// Applies a rule's URL rewrites in order: domain patterns against
/// `host[:port]`, path patterns against the path, then query directives.
/// The query is always re-encoded sorted by key. With `googleCache` set
/// the result is wrapped in a cache-mirror lookup.
pub fn transform(url: &Url, rule: &Rule) -> LadderResult<Url> {
    let mut url = url.clone();

    if !rule.url_mods.domain.is_empty() {
        let mut host = authority(&url);
        for rewrite in &rule.url_mods.domain {
            host = rewrite
                .compile()?
                .replace_all(&host, rewrite.replace.as_str())
                .into_owned();
        }
        set_authority(&mut url, &host)?;
    }

    for rewrite in &rule.url_mods.path {
        let path = rewrite
            .compile()?
            .replace_all(url.path(), rewrite.replace.as_str())
            .into_owned();
        url.set_path(&path);
    }

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    for directive in &rule.url_mods.query {
        if directive.value.is_empty() {
            params.remove(&directive.key);
        } else {
            params.insert(directive.key.clone(), vec![directive.value.clone()]);
        }
    }
    if params.is_empty() {
        url.set_query(None);
    } else {
        let mut encoded = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &params {
            for value in values {
                encoded.append_pair(key, value);
            }
        }
        url.set_query(Some(&encoded.finish()));
    }

    if rule.google_cache {
        let mirrored = format!("{CACHE_MIRROR_PREFIX}{url}");
        return Url::parse(&mirrored).map_err(|err| LadderError::url_parse(mirrored, err));
    }

    Ok(url)
}

fn set_authority(url: &mut Url, authority: &str) -> LadderResult<()> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) && !host.is_empty() =>
        {
            let port = port
                .parse::<u16>()
                .map_err(|err| LadderError::url_parse(authority, err))?;
            (host, Some(port))
        }
        _ => (authority, None),
    };

    url.set_host(Some(host))
        .map_err(|err| LadderError::url_parse(authority, err))?;
    url.set_port(port)
        .map_err(|_| LadderError::url_parse(authority, "port not allowed for this URL"))
}
