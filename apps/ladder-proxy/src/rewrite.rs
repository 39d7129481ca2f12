//! Body rewriting: link re-anchoring, rule substitutions, rule injections.
//!
//! Link re-anchoring and substitutions work on raw text rather than a
//! parsed document; rule authors write their patterns against the page
//! source as served. Only injections go through an HTML rewriter.

use std::{borrow::Cow, sync::OnceLock};

use bytes::Bytes;
use lol_html::{
    ElementContentHandlers, HandlerResult, HtmlRewriter, Selector, Settings,
    errors::{RewritingError, SelectorError},
    html_content::{ContentType, Element},
};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::RewriteMode,
    error::LadderResult,
    rules::{Injection, InjectionOp, RegexRule, Rule},
};

/// Why a single injection was skipped. Never fails the request.
#[derive(Debug, Error)]
pub enum InjectionError {
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("html rewrite failed: {0}")]
    Rewrite(#[from] RewritingError),
    #[error("rewritten html is not valid utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Rewrites a fetched body for delivery through the proxy. `host` is the
/// original target's `host[:port]`. Bodies that are not UTF-8 text
/// (images, fonts) are returned untouched.
pub fn rewrite(body: Bytes, host: &str, rule: &Rule, mode: RewriteMode) -> LadderResult<Bytes> {
    let Ok(text) = std::str::from_utf8(&body) else {
        debug!(len = body.len(), "binary body; skipping rewrite");
        return Ok(body);
    };

    let mut text = absolutize_links(text, host, mode);
    if rule.has_content_rules() {
        text = apply_regex_rules(text, &rule.regex_rules)?;
        text = apply_injections(text, &rule.injections);
    }
    Ok(Bytes::from(text))
}

/// Re-anchors root-relative links under `/https://<host>/` so the browser
/// requests them through the proxy, and turns absolute self-links into
/// proxied ones.
pub fn absolutize_links(body: &str, host: &str, mode: RewriteMode) -> String {
    let proxied = format!("/https://{host}/");

    let mut out = body.replace(r#"href="/"#, &format!(r#"href="{proxied}"#));
    out = match mode {
        RewriteMode::Literal => out.replace(r#"src="/"#, &format!(r#"src="{proxied}"#)),
        RewriteMode::TagRegex => rewrite_tag_sources(&out, &proxied),
    };
    out = out.replace("url('/", &format!("url('{proxied}"));
    out = out.replace("url(/", &format!("url({proxied}"));
    out.replace(
        &format!(r#"href="https://{host}"#),
        &format!(r#"href="/https://{host}"#),
    )
}

fn tag_source_patterns() -> &'static [(Regex, &'static str); 2] {
    static PATTERNS: OnceLock<[(Regex, &'static str); 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                Regex::new(r#"(?i)<img\s+([^>]*\s+)?src="/([^"]*)""#).expect("static pattern"),
                "img",
            ),
            (
                Regex::new(r#"(?i)<script\s+([^>]*\s+)?src="/([^"]*)""#).expect("static pattern"),
                "script",
            ),
        ]
    })
}

/// Tag-aware form of the `src="/` rewrite for `<img>` and `<script>`,
/// keeping any attributes that precede `src`.
fn rewrite_tag_sources(body: &str, proxied: &str) -> String {
    let proxied = proxied.replace('$', "$$");
    let mut out = Cow::Borrowed(body);
    for (pattern, tag) in tag_source_patterns() {
        let replacement = format!(r#"<{tag} ${{1}}src="{proxied}${{2}}""#);
        out = Cow::Owned(pattern.replace_all(&out, replacement.as_str()).into_owned());
    }
    out.into_owned()
}

fn apply_regex_rules(mut body: String, rules: &[RegexRule]) -> LadderResult<String> {
    for rule in rules {
        let pattern = rule.compile()?;
        body = pattern
            .replace_all(&body, rule.replace.as_str())
            .into_owned();
    }
    Ok(body)
}

/// Applies each injection to the output of the previous one. A failed
/// injection is logged and leaves the body as it was.
fn apply_injections(body: String, injections: &[Injection]) -> String {
    injections
        .iter()
        .fold(body, |current, injection| match apply_injection(&current, injection) {
            Ok(next) => next,
            Err(err) => {
                warn!(selector = %injection.selector, %err, "skipping injection");
                current
            }
        })
}

pub fn apply_injection(body: &str, injection: &Injection) -> Result<String, InjectionError> {
    let selector: Selector = injection.selector.parse()?;
    let op = &injection.op;
    let handler = move |el: &mut Element<'_, '_>| -> HandlerResult {
        match op {
            InjectionOp::Replace(html) => el.set_inner_content(html, ContentType::Html),
            InjectionOp::Append(html) => el.append(html, ContentType::Html),
            InjectionOp::Prepend(html) => el.prepend(html, ContentType::Html),
        }
        Ok(())
    };

    let mut output = Vec::with_capacity(body.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![(
                Cow::Owned(selector),
                ElementContentHandlers::default().element(handler),
            )],
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );
    rewriter.write(body.as_bytes())?;
    rewriter.end()?;

    Ok(String::from_utf8(output)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RegexRule;

    fn injection(selector: &str, op: InjectionOp) -> Injection {
        Injection {
            selector: selector.to_string(),
            op,
        }
    }

    fn rewrite_str(body: &str, rule: &Rule) -> String {
        let out = rewrite(
            Bytes::from(body.to_string()),
            "example.com",
            rule,
            RewriteMode::Literal,
        )
        .unwrap();
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn root_relative_href_is_proxied() {
        assert_eq!(
            absolutize_links(r#"<a href="/x">"#, "example.com", RewriteMode::Literal),
            r#"<a href="/https://example.com/x">"#
        );
    }

    #[test]
    fn src_and_css_urls_are_proxied() {
        let body = r#"<img src="/a.png"><style>b{background:url('/b.png')} i{background:url(/i.png)}</style>"#;
        let out = absolutize_links(body, "example.com", RewriteMode::Literal);
        assert_eq!(
            out,
            r#"<img src="/https://example.com/a.png"><style>b{background:url('/https://example.com/b.png')} i{background:url(/https://example.com/i.png)}</style>"#
        );
    }

    #[test]
    fn absolute_self_links_are_proxied() {
        let out = absolutize_links(
            r#"<a href="https://example.com/page">"#,
            "example.com",
            RewriteMode::Literal,
        );
        assert_eq!(out, r#"<a href="/https://example.com/page">"#);
    }

    #[test]
    fn foreign_absolute_links_are_untouched() {
        let body = r#"<a href="https://other.test/page">"#;
        assert_eq!(
            absolutize_links(body, "example.com", RewriteMode::Literal),
            body
        );
    }

    #[test]
    fn tag_regex_mode_keeps_preceding_attributes() {
        let body = r#"<img class="hero" src="/h.png"><script defer src="/app.js"></script><img src="/p.png">"#;
        let out = absolutize_links(body, "example.com", RewriteMode::TagRegex);
        assert_eq!(
            out,
            r#"<img class="hero" src="/https://example.com/h.png"><script defer src="/https://example.com/app.js"></script><img src="/https://example.com/p.png">"#
        );
    }

    #[test]
    fn regex_rules_run_in_declaration_order() {
        let rule = Rule {
            regex_rules: vec![
                RegexRule::new("Copyright 2020", "Copyright 2024"),
                RegexRule::new("2024", "MMXXIV"),
            ],
            ..Rule::default()
        };
        let out = rewrite_str("<p>Copyright 2020</p><p>Copyright 2020</p>", &rule);
        assert_eq!(out, "<p>Copyright MMXXIV</p><p>Copyright MMXXIV</p>");
    }

    #[test]
    fn regex_replacement_supports_capture_groups() {
        let rule = Rule {
            regex_rules: vec![RegexRule::new(r#"class="(\w+)-locked""#, r#"class="$1""#)],
            ..Rule::default()
        };
        assert_eq!(
            rewrite_str(r#"<div class="article-locked">"#, &rule),
            r#"<div class="article">"#
        );
    }

    #[test]
    fn invalid_content_pattern_is_an_error() {
        let rule = Rule {
            regex_rules: vec![RegexRule::new("[", "")],
            ..Rule::default()
        };
        let result = rewrite(
            Bytes::from_static(b"<p></p>"),
            "example.com",
            &rule,
            RewriteMode::Literal,
        );
        assert!(result.is_err());
    }

    #[test]
    fn injections_append_prepend_and_replace() {
        let body = "<html><body><div id=\"paywall\">pay</div><p>text</p></body></html>";

        let appended = apply_injection(
            body,
            &injection("body", InjectionOp::Append("<footer>f</footer>".into())),
        )
        .unwrap();
        assert!(appended.contains("<p>text</p><footer>f</footer></body>"));

        let prepended = apply_injection(
            body,
            &injection("body", InjectionOp::Prepend("<header>h</header>".into())),
        )
        .unwrap();
        assert!(prepended.contains("<body><header>h</header><div"));

        let replaced = apply_injection(
            body,
            &injection("#paywall", InjectionOp::Replace("free".into())),
        )
        .unwrap();
        assert!(replaced.contains("<div id=\"paywall\">free</div>"));
    }

    #[test]
    fn malformed_selector_does_not_block_later_injections() {
        let rule = Rule {
            injections: vec![
                injection("p[", InjectionOp::Append("<b>never</b>".into())),
                injection("body", InjectionOp::Append("<i>ok</i>".into())),
            ],
            ..Rule::default()
        };
        let out = rewrite_str("<html><body><p>x</p></body></html>", &rule);
        assert!(!out.contains("never"));
        assert!(out.contains("<p>x</p><i>ok</i></body>"));
    }

    #[test]
    fn injection_applies_to_every_match() {
        let out = apply_injection(
            "<ul><li>a</li><li>b</li></ul>",
            &injection("li", InjectionOp::Prepend("*".into())),
        )
        .unwrap();
        assert_eq!(out, "<ul><li>*a</li><li>*b</li></ul>");
    }

    #[test]
    fn binary_bodies_pass_through() {
        let png = Bytes::from_static(&[0x89, b'P', b'N', b'G', 0xff, 0xfe, b'h', b'r']);
        let out = rewrite(png.clone(), "example.com", &Rule::EMPTY, RewriteMode::Literal).unwrap();
        assert_eq!(out, png);
    }
}
