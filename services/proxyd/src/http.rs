//! Client-facing HTTP surface, bound only on the leader.
//!
//! One fallback handler catches every method and path. The target host comes
//! from the absolute-form request URI when a client speaks proper proxy
//! form, else from the `Host` header; `host + path` becomes the rendezvous
//! key for the cluster. Blocked hosts are answered 200 with the block
//! message (not 403; the block is a page, not an HTTP-level refusal), and a
//! rendezvous timeout surfaces as 504 with an empty body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use axum::Router;
use mesh_protocol::ProxiedRequest;
use tracing::{error, info, warn};

use crate::cache::CachedPage;
use crate::node::{ClientOutcome, ProxyNode};

/// Bind `config.public_url` and start serving, once. Safe to call again:
/// promotion after an election races the explicit startup bind on a node
/// launched with `--leader`. Returns the bound address.
pub async fn ensure_public_endpoint(
    node: &Arc<ProxyNode>,
) -> std::io::Result<Option<SocketAddr>> {
    if node.endpoint_starting.swap(true, Ordering::SeqCst) {
        return Ok(node.public_addr());
    }
    let listener = match tokio::net::TcpListener::bind(&node.config.public_url).await {
        Ok(listener) => listener,
        Err(e) => {
            node.endpoint_starting.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };
    let addr = listener.local_addr()?;
    let _ = node.public_endpoint.set(addr);
    info!(%addr, "public endpoint bound");

    let app = router(Arc::clone(node));
    let serve = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "public endpoint terminated");
        }
    });
    node.tasks.lock().unwrap().push(serve);
    Ok(Some(addr))
}

fn router(node: Arc<ProxyNode>) -> Router {
    Router::new().fallback(proxy_handler).with_state(node)
}

async fn proxy_handler(State(node): State<Arc<ProxyNode>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(host) = target_host(&parts.uri, &parts.headers) else {
        return plain(StatusCode::BAD_REQUEST, "no target host\n");
    };
    let request_url = format!("{host}{}", parts.uri.path());

    let mut header: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(text) => header
                .entry(name.as_str().to_owned())
                .or_default()
                .push(text.to_owned()),
            Err(_) => warn!(header = %name, "dropping non-UTF-8 request header"),
        }
    }

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return plain(StatusCode::BAD_REQUEST, "unreadable request body\n"),
    };

    let proxied = ProxiedRequest {
        method: parts.method.as_str().to_owned(),
        request_url,
        header,
        content_length: body.len() as i64,
        body,
    };

    match node.handle_client_request(proxied).await {
        ClientOutcome::Blocked => plain(StatusCode::OK, "Site is blocked!\n"),
        ClientOutcome::Page(page) => page_response(&page),
        ClientOutcome::TimedOut => plain(StatusCode::GATEWAY_TIMEOUT, ""),
    }
}

/// The upstream host this request targets: the absolute-form authority if
/// the client sent one, else the `Host` header.
fn target_host(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    if let Some(authority) = uri.authority() {
        return Some(authority.to_string());
    }
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .filter(|host| !host.is_empty())
}

fn page_response(page: &CachedPage) -> Response {
    let mut response = Response::new(Body::from(page.body.clone()));
    *response.status_mut() = StatusCode::from_u16(page.status_code()).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    for (name, values) in &page.header {
        // hyper reframes the body itself; forwarding the upstream framing
        // headers would conflict with it.
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            warn!(header = %name, "dropping invalid cached header name");
            continue;
        };
        for value in values {
            match HeaderValue::try_from(value.as_str()) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => warn!(header = %name, "dropping invalid cached header value"),
            }
        }
    }
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
