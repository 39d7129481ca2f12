use std::{
    io::{self, Cursor, Read},
    time::Duration,
};

use brotli::Decompressor;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::{
    HeaderMap, Request, StatusCode, Uri,
    header::{self, HeaderName, HeaderValue},
};
use hyper::{Body, Client, Response, body, client::HttpConnector};
use hyper_rustls::HttpsConnectorBuilder;
use tracing::debug;
use url::Url;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::{
    config::LadderConfig,
    error::{LadderError, LadderResult},
    rules::{HeaderOverride, Rule},
};

type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

pub const MAX_REDIRECTS: usize = 10;

/// What the origin sent back, body already decoded.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// The URL that produced the response, after any redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Headers the proxy sent upstream.
    pub request_headers: HeaderMap,
}

/// Issues the single outbound GET for a proxied request.
pub struct Fetcher {
    client: HttpClient,
    user_agent: String,
    forwarded_for: String,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &LadderConfig) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client: HttpClient = Client::builder().build(https);

        Self {
            client,
            user_agent: config.user_agent.clone(),
            forwarded_for: config.forwarded_for.clone(),
            timeout: config.timeout,
        }
    }

    /// Fetches `final_url`, following up to [`MAX_REDIRECTS`] redirects
    /// with the same outbound headers. The timeout covers every hop and the
    /// final body. `target` is the URL the client asked for and only feeds
    /// the default referer.
    pub async fn fetch(
        &self,
        target: &Url,
        final_url: &Url,
        rule: &Rule,
        inbound: &HeaderMap,
    ) -> LadderResult<Fetched> {
        let request_headers = self.outbound_headers(target, rule, inbound)?;

        let exchange = async {
            let mut current = final_url.clone();
            for _ in 0..=MAX_REDIRECTS {
                debug!(url = %current, "fetching upstream");
                let response = self.send(&current, &request_headers).await?;
                match redirect_target(&current, &response) {
                    Some(next) => current = next?,
                    None => {
                        let (parts, body) = response.into_parts();
                        let bytes = body::to_bytes(body)
                            .await
                            .map_err(|err| LadderError::BodyRead(err.to_string()))?;
                        return Ok::<_, LadderError>((current, parts, bytes));
                    }
                }
            }
            Err(LadderError::Fetch(format!(
                "stopped after {MAX_REDIRECTS} redirects"
            )))
        };
        let (url, parts, raw) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                LadderError::Fetch(format!("timed out after {}s", self.timeout.as_secs_f32()))
            })??;

        let encoding = parts
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let decoded = decode_body_with_encoding(&raw, encoding.as_deref())
            .map_err(|err| LadderError::BodyRead(err.to_string()))?;

        let mut headers = sanitize_headers(&parts.headers);
        match &rule.headers.csp {
            HeaderOverride::Unset => {}
            HeaderOverride::Omit => {
                headers.remove(header::CONTENT_SECURITY_POLICY);
            }
            HeaderOverride::Value(policy) => {
                headers.insert(header::CONTENT_SECURITY_POLICY, header_value(policy)?);
            }
        }

        Ok(Fetched {
            url,
            status: parts.status,
            headers,
            body: Bytes::from(decoded),
            request_headers,
        })
    }

    async fn send(&self, url: &Url, headers: &HeaderMap) -> LadderResult<Response<Body>> {
        let uri = url
            .as_str()
            .parse::<Uri>()
            .map_err(|err| LadderError::url_parse(url.as_str(), err))?;
        let mut request = Request::get(uri)
            .body(Body::empty())
            .map_err(|err| LadderError::Fetch(err.to_string()))?;
        *request.headers_mut() = headers.clone();

        self.client
            .request(request)
            .await
            .map_err(|err| LadderError::Fetch(err.to_string()))
    }

    /// Rule overrides win; `"none"` drops the header. Without an override
    /// the user agent and forwarded-for fall back to the process defaults
    /// and the referer to the inbound referer, then to the target itself.
    pub fn outbound_headers(
        &self,
        target: &Url,
        rule: &Rule,
        inbound: &HeaderMap,
    ) -> LadderResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        match &rule.headers.user_agent {
            HeaderOverride::Value(agent) => {
                headers.insert(header::USER_AGENT, header_value(agent)?);
            }
            HeaderOverride::Unset | HeaderOverride::Omit => {
                headers.insert(header::USER_AGENT, header_value(&self.user_agent)?);
            }
        }

        match &rule.headers.forwarded_for {
            HeaderOverride::Value(addr) => {
                headers.insert(X_FORWARDED_FOR, header_value(addr)?);
            }
            HeaderOverride::Omit => {}
            HeaderOverride::Unset => {
                headers.insert(X_FORWARDED_FOR, header_value(&self.forwarded_for)?);
            }
        }

        match &rule.headers.referer {
            HeaderOverride::Value(referer) => {
                headers.insert(header::REFERER, header_value(referer)?);
            }
            HeaderOverride::Omit => {}
            HeaderOverride::Unset => {
                let inbound_referer = inbound
                    .get(header::REFERER)
                    .filter(|value| !value.is_empty())
                    .cloned();
                let referer = match inbound_referer {
                    Some(value) => value,
                    None => header_value(target.as_str())?,
                };
                headers.insert(header::REFERER, referer);
            }
        }

        if let HeaderOverride::Value(cookie) = &rule.headers.cookie {
            headers.insert(header::COOKIE, header_value(cookie)?);
        }

        Ok(headers)
    }
}

/// The next hop when `response` is a followable redirect. `Location` is
/// resolved against `current`.
fn redirect_target(current: &Url, response: &Response<Body>) -> Option<LadderResult<Url>> {
    if !matches!(
        response.status(),
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    ) {
        return None;
    }
    let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
    Some(
        current
            .join(location)
            .map_err(|err| LadderError::url_parse(location, err)),
    )
}

fn header_value(value: &str) -> LadderResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|err| LadderError::Fetch(format!("invalid header value '{value}': {err}")))
}

pub(crate) fn decode_body_with_encoding(bytes: &[u8], encoding: Option<&str>) -> io::Result<Vec<u8>> {
    match encoding.map(|enc| enc.trim().to_ascii_lowercase()) {
        None => Ok(bytes.to_vec()),
        Some(enc) => match enc.as_str() {
            "" | "identity" => Ok(bytes.to_vec()),
            "gzip" | "x-gzip" => {
                let mut decoder = GzDecoder::new(Cursor::new(bytes));
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "deflate" => {
                let mut decoder = ZlibDecoder::new(Cursor::new(bytes));
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "br" => {
                let mut decoder = Decompressor::new(Cursor::new(bytes), 4096);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            "zstd" => {
                let mut decoder = ZstdDecoder::new(Cursor::new(bytes))?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported content-encoding: {}", other),
            )),
        },
    }
}

/// Drops payload metadata that no longer describes the decoded, rewritten body.
fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let ignored_payload_headers = [
        "content-length",
        "content-encoding",
        "transfer-encoding",
        "content-md5",
        "content-digest",
        "etag",
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if ignored_payload_headers.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_FORWARDED_FOR, DEFAULT_USER_AGENT};
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    fn fetcher() -> Fetcher {
        Fetcher::new(&LadderConfig::default())
    }

    fn target() -> Url {
        Url::parse("https://news.example/index.html").unwrap()
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let headers = fetcher()
            .outbound_headers(&target(), &Rule::EMPTY, &HeaderMap::new())
            .unwrap();
        assert_eq!(headers[header::USER_AGENT], DEFAULT_USER_AGENT);
        assert_eq!(headers["x-forwarded-for"], DEFAULT_FORWARDED_FOR);
        assert_eq!(headers[header::REFERER], "https://news.example/index.html");
        assert!(headers.get(header::COOKIE).is_none());
    }

    #[test]
    fn inbound_referer_is_preferred_over_target() {
        let mut inbound = HeaderMap::new();
        inbound.insert(
            header::REFERER,
            HeaderValue::from_static("https://proxy/https://news.example/"),
        );
        let headers = fetcher()
            .outbound_headers(&target(), &Rule::EMPTY, &inbound)
            .unwrap();
        assert_eq!(
            headers[header::REFERER],
            "https://proxy/https://news.example/"
        );
    }

    #[test]
    fn rule_overrides_and_none_sentinel() {
        let mut rule = Rule::default();
        rule.headers.user_agent = HeaderOverride::Value("TestBot/1.0".into());
        rule.headers.forwarded_for = HeaderOverride::Omit;
        rule.headers.referer = HeaderOverride::Omit;
        rule.headers.cookie = HeaderOverride::Value("paywall=off".into());

        let headers = fetcher()
            .outbound_headers(&target(), &rule, &HeaderMap::new())
            .unwrap();
        assert_eq!(headers[header::USER_AGENT], "TestBot/1.0");
        assert!(headers.get("x-forwarded-for").is_none());
        assert!(headers.get(header::REFERER).is_none());
        assert_eq!(headers[header::COOKIE], "paywall=off");
    }

    #[test]
    fn explicit_forwarded_for_and_referer() {
        let mut rule = Rule::default();
        rule.headers.forwarded_for = HeaderOverride::Value("10.0.0.1".into());
        rule.headers.referer = HeaderOverride::Value("https://www.google.com/".into());

        let headers = fetcher()
            .outbound_headers(&target(), &rule, &HeaderMap::new())
            .unwrap();
        assert_eq!(headers["x-forwarded-for"], "10.0.0.1");
        assert_eq!(headers[header::REFERER], "https://www.google.com/");
    }

    #[test]
    fn invalid_override_value_is_rejected() {
        let mut rule = Rule::default();
        rule.headers.cookie = HeaderOverride::Value("a=1\nInjected: yes".into());
        assert!(
            fetcher()
                .outbound_headers(&target(), &rule, &HeaderMap::new())
                .is_err()
        );
    }

    fn redirect(status: StatusCode, location: Option<&str>) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        if let Some(location) = location {
            response
                .headers_mut()
                .insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
        }
        response
    }

    #[test]
    fn redirect_location_resolves_against_current_url() {
        let current = Url::parse("http://news.example/section/old?x=1").unwrap();

        let next = redirect_target(&current, &redirect(StatusCode::MOVED_PERMANENTLY, Some("/new")))
            .unwrap()
            .unwrap();
        assert_eq!(next.as_str(), "http://news.example/new");

        let next = redirect_target(&current, &redirect(StatusCode::FOUND, Some("latest")))
            .unwrap()
            .unwrap();
        assert_eq!(next.as_str(), "http://news.example/section/latest");

        let next = redirect_target(
            &current,
            &redirect(StatusCode::PERMANENT_REDIRECT, Some("https://www.news.example/")),
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.as_str(), "https://www.news.example/");
    }

    #[test]
    fn non_redirects_are_final() {
        let current = Url::parse("http://news.example/").unwrap();
        assert!(redirect_target(&current, &redirect(StatusCode::OK, Some("/x"))).is_none());
        assert!(redirect_target(&current, &redirect(StatusCode::NOT_MODIFIED, Some("/x"))).is_none());
        assert!(redirect_target(&current, &redirect(StatusCode::FOUND, None)).is_none());
    }

    #[test]
    fn sanitize_drops_payload_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let out = sanitize_headers(&headers);
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::CONTENT_ENCODING).is_none());
        assert_eq!(out[header::CONTENT_TYPE], "text/html");
        assert_eq!(out.get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn decodes_identity_and_none_encodings() {
        let payload = b"hello world";
        assert_eq!(decode_body_with_encoding(payload, None).unwrap(), payload);
        assert_eq!(
            decode_body_with_encoding(payload, Some("identity")).unwrap(),
            payload
        );
        assert_eq!(
            decode_body_with_encoding(payload, Some("")).unwrap(),
            payload
        );
    }

    #[test]
    fn decodes_gzip_payloads() {
        let payload = b"compressed content";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body_with_encoding(&compressed, Some("gzip")).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn errors_on_unsupported_encoding() {
        let err = decode_body_with_encoding(b"noop", Some("unknown-enc")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
