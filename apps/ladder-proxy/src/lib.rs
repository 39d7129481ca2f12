pub mod config;
pub mod error;
pub mod fetch;
pub mod matcher;
pub mod pipeline;
pub mod resolve;
pub mod rewrite;
pub mod rules;
pub mod transform;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use http::{
    HeaderMap, Method, Request, Response, StatusCode,
    header::{self, HeaderValue},
};
use hyper::{
    Body,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
};
use serde_json::{Value, json};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info};

pub use crate::{
    config::{LadderConfig, RewriteMode, ServerConfig},
    error::{LadderError, LadderResult},
    matcher::{AllowList, DomainMatch},
    pipeline::{Ladder, ProxyResult},
    rules::RuleSet,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ProxyHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

pub async fn spawn_proxy(
    config: ServerConfig,
    ladder: Arc<Ladder>,
) -> Result<ProxyHandle, ProxyError> {
    let listener = std::net::TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |_conn: &AddrStream| {
        let ladder = ladder.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let ladder = ladder.clone();
                async move { Ok::<_, hyper::Error>(handle_request(ladder, req).await) }
            }))
        }
    });

    let server = hyper::Server::from_tcp(listener)?.serve(make_svc);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(%err, "proxy server error");
        }
    });

    info!(addr = %local_addr, "ladder listening");
    Ok(ProxyHandle {
        addr: local_addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn handle_request(ladder: Arc<Ladder>, req: Request<Body>) -> Response<Body> {
    let (parts, _body) = req.into_parts();
    if parts.method != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    let path = parts.uri.path();
    if path == "/health" {
        return json_response(
            StatusCode::OK,
            json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
    }

    if path == "/ruleset" {
        return ruleset_response(&ladder);
    }

    let query = parts.uri.query();
    let headers = &parts.headers;
    if let Some(target) = path.strip_prefix("/raw/") {
        return match ladder
            .process_request(&format!("/{target}"), query, headers)
            .await
        {
            Ok(result) => Response::new(Body::from(result.body)),
            Err(err) => error_response(err),
        };
    }

    if let Some(target) = path.strip_prefix("/api/") {
        return match ladder
            .process_request(&format!("/{target}"), query, headers)
            .await
        {
            Ok(result) => json_response(StatusCode::OK, api_payload(&result)),
            Err(err) => error_response(err),
        };
    }

    match ladder.process_request(path, query, headers).await {
        Ok(result) => proxied_response(result),
        Err(err) => error_response(err),
    }
}

fn ruleset_response(ladder: &Ladder) -> Response<Body> {
    if !ladder.config().expose_ruleset {
        return text_response(StatusCode::FORBIDDEN, "Ruleset Disabled");
    }
    match ladder.rules().to_yaml() {
        Ok(yaml) => {
            let mut response = Response::new(Body::from(yaml));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/yaml; charset=utf-8"),
            );
            response
        }
        Err(err) => error_response(err),
    }
}

/// Forwards the origin status with the headers the rewritten body still
/// agrees with.
fn proxied_response(result: ProxyResult) -> Response<Body> {
    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = result.status;
    for name in [header::CONTENT_TYPE, header::CONTENT_SECURITY_POLICY] {
        if let Some(value) = result.headers.get(&name) {
            response.headers_mut().insert(name, value.clone());
        }
    }
    response
}

fn api_payload(result: &ProxyResult) -> Value {
    json!({
        "version": VERSION,
        "body": String::from_utf8_lossy(&result.body),
        "request": { "headers": header_list(&result.request_headers) },
        "response": { "headers": header_list(&result.headers) },
    })
}

fn header_list(headers: &HeaderMap) -> Vec<Value> {
    headers
        .iter()
        .map(|(name, value)| {
            json!({
                "key": name.as_str(),
                "value": String::from_utf8_lossy(value.as_bytes()),
            })
        })
        .collect()
}

fn error_response(err: LadderError) -> Response<Body> {
    let status = err.status_code();
    error!(%err, status = status.as_u16(), "request failed");
    text_response(status, &err.to_string())
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
