//! Recovers the absolute target URL from a proxied request path.
//!
//! A first visit looks like `/https://example.com/page`. Pages rewritten by
//! the proxy then issue root-relative requests such as `/img/logo.png`; the
//! browser sends those with the previous page's proxied URL as the referer
//! (`https://proxy/https://example.com/page`), and the referer's own path
//! carries the origin to resolve against.

use std::borrow::Cow;

use url::Url;

use crate::error::{LadderError, LadderResult};

/// Resolves `raw_path` (the proxy request path, possibly percent-encoded)
/// and the proxy request's query string into the URL to fetch.
pub fn resolve(raw_path: &str, raw_query: Option<&str>, referer: Option<&str>) -> LadderResult<Url> {
    let decoded = decode(raw_path);
    let target = decoded.strip_prefix('/').unwrap_or(&*decoded);

    if let Some(mut url) = parse_absolute(target)? {
        append_query(&mut url, raw_query);
        return Ok(url);
    }

    let origin = referer_origin(&decoded, referer)?;
    let (path, inner_query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let mut url = origin;
    url.set_path(&format!("/{path}"));
    url.set_query(inner_query.filter(|q| !q.is_empty()));
    url.set_fragment(None);
    append_query(&mut url, raw_query);
    Ok(url)
}

/// `host[:port]`, the form rule rewrites and link rewriting operate on.
pub fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

fn decode(raw: &str) -> Cow<'_, str> {
    urlencoding::decode(raw).unwrap_or(Cow::Borrowed(raw))
}

fn has_web_scheme(candidate: &str) -> bool {
    let lower = candidate.get(..8).unwrap_or(candidate).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|h| !h.is_empty())
}

/// `Ok(None)` means the target is relative; a target that claims an
/// http(s) scheme but does not parse is an error rather than a relative path.
fn parse_absolute(target: &str) -> LadderResult<Option<Url>> {
    match Url::parse(target) {
        Ok(url) if is_web_url(&url) => Ok(Some(url)),
        Ok(_) | Err(_) if !has_web_scheme(target) => Ok(None),
        Ok(url) => Err(LadderError::url_parse(target, format!("no host in '{url}'"))),
        Err(err) => Err(LadderError::url_parse(target, err)),
    }
}

fn referer_origin(path: &str, referer: Option<&str>) -> LadderResult<Url> {
    let referer = referer
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| LadderError::unresolvable(path, "without a referer"))?;

    let referer_url = Url::parse(referer).map_err(|err| {
        LadderError::unresolvable(path, format!("from unparseable referer '{referer}': {err}"))
    })?;

    let referer_path = decode(referer_url.path());
    let embedded = referer_path.strip_prefix('/').unwrap_or(&*referer_path);
    let real = Url::parse(embedded)
        .ok()
        .filter(is_web_url)
        .ok_or_else(|| {
            LadderError::unresolvable(
                path,
                format!("from referer '{referer}': its path holds no target URL"),
            )
        })?;

    let origin = format!("{}://{}", real.scheme(), authority(&real));
    Url::parse(&origin).map_err(|err| LadderError::url_parse(origin, err))
}

fn append_query(url: &mut Url, raw_query: Option<&str>) {
    let Some(extra) = raw_query.filter(|q| !q.is_empty()) else {
        return;
    };
    let merged = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{extra}"),
        _ => extra.to_string(),
    };
    url.set_query(Some(&merged));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_absolute_url_is_returned() {
        let url = resolve("/https://example.com/a", Some("x=1"), None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?x=1");
    }

    #[test]
    fn percent_encoded_target_is_decoded() {
        let url = resolve("/https%3A%2F%2Fexample.com%2Fa%3Fq%3D1", None, None).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?q=1");
    }

    #[test]
    fn relative_path_resolves_against_referer_origin() {
        let first = resolve("/https://example.com/a", Some("x=1"), None).unwrap();
        assert_eq!(first.as_str(), "https://example.com/a?x=1");

        let next = resolve(
            "/b.jpg",
            None,
            Some("https://proxyhost/https://example.com/a?x=1"),
        )
        .unwrap();
        assert_eq!(next.as_str(), "https://example.com/b.jpg");
    }

    #[test]
    fn relative_path_keeps_its_own_query_and_the_referer_port() {
        let url = resolve(
            "/api/items",
            Some("page=2"),
            Some("http://127.0.0.1:8080/http://site.test:8443/list"),
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://site.test:8443/api/items?page=2");
    }

    #[test]
    fn relative_path_without_referer_is_unresolvable() {
        let err = resolve("/images/foo.jpg", None, None).unwrap_err();
        assert!(matches!(err, LadderError::UnresolvableRelativePath { .. }));

        let err = resolve("/images/foo.jpg", None, Some("  ")).unwrap_err();
        assert!(matches!(err, LadderError::UnresolvableRelativePath { .. }));
    }

    #[test]
    fn referer_without_embedded_target_is_unresolvable() {
        let err = resolve("/foo.jpg", None, Some("https://proxyhost/")).unwrap_err();
        assert!(matches!(err, LadderError::UnresolvableRelativePath { .. }));

        let err = resolve("/foo.jpg", None, Some("not a url")).unwrap_err();
        assert!(matches!(err, LadderError::UnresolvableRelativePath { .. }));
    }

    #[test]
    fn malformed_absolute_target_is_a_parse_error() {
        let err = resolve("/https://exa mple.com/", None, None).unwrap_err();
        assert!(matches!(err, LadderError::UrlParse { .. }));
    }

    #[test]
    fn authority_includes_explicit_port() {
        let url = Url::parse("http://a.test:81/x").unwrap();
        assert_eq!(authority(&url), "a.test:81");
        let url = Url::parse("https://a.test/x").unwrap();
        assert_eq!(authority(&url), "a.test");
    }
}
