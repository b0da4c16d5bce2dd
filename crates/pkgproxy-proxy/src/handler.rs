//! HTTP request handler.
//!
//! Every proxied request, plain or decrypted from an intercepted tunnel, is
//! resolved through the provider chain and answered by the cache transport.
//! CONNECT requests go through untouched and `should_intercept` decides
//! whether hudsucker decrypts the tunnel or relays it blind.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::{Method, StatusCode};
use pkgproxy_core::{ProviderChain, Url};

use crate::error::ProxyError;
use crate::tls::InterceptPolicy;
use crate::transport::{CacheStatus, CacheTransport, CANONICAL_URL_HEADER, MAX_AGE_HEADER};

/// Path of the CA certificate download on the proxy itself.
pub const CA_CERT_PATH: &str = "/package-proxy.pem";

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

fn plain_response(status: StatusCode, text: impl Into<String>) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(text.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// Provider chain resolving upstream URL, key and max-age.
    pub chain: Arc<ProviderChain>,
    /// Cache transport answering resolved requests.
    pub transport: Arc<CacheTransport>,
    /// Hosts whose tunnels are decrypted.
    pub intercept: Arc<InterceptPolicy>,
    /// CA certificate served at [`CA_CERT_PATH`], when interception is on.
    pub ca_cert_pem: Option<Arc<str>>,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("providers", &self.chain.providers().len())
            .field("patterns", &self.chain.patterns().len())
            .field("transport", &self.transport)
            .field("intercept", &self.intercept)
            .field("ca_cert_pem", &self.ca_cert_pem.is_some())
            .finish()
    }
}

/// HTTP handler for the caching proxy.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    config: HandlerConfig,
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self { config }
    }

    /// Answers a request addressed to the proxy itself.
    fn serve_local(&self, req: &Request<Body>) -> Response<Bytes> {
        match (&self.config.ca_cert_pem, req.uri().path()) {
            (Some(pem), CA_CERT_PATH) if req.method() == Method::GET => {
                let mut response = Response::new(Bytes::copy_from_slice(pem.as_bytes()));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-pem-file"),
                );
                response
            }
            _ => plain_response(StatusCode::NOT_FOUND, "Not Found\n"),
        }
    }

    /// Resolves and forwards a buffered proxy request.
    ///
    /// Never fails: upstream errors become 502 and store errors 500.
    pub async fn forward(&self, mut req: Request<Bytes>) -> Response<Bytes> {
        let url = match Url::parse(&req.uri().to_string()) {
            Ok(url) => url,
            Err(e) => return plain_response(StatusCode::BAD_REQUEST, format!("Bad URL: {}\n", e)),
        };

        let resolution = self.config.chain.resolve(&url);
        tracing::debug!(
            "{} resolved {} -> {} (key {}, max-age {:?})",
            resolution.provider,
            resolution.canonical_url,
            resolution.upstream,
            resolution.cache_key,
            resolution.max_age
        );

        let upstream_uri = match resolution.upstream.as_str().parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => return plain_response(StatusCode::BAD_GATEWAY, format!("Bad upstream URL: {}\n", e)),
        };
        *req.uri_mut() = upstream_uri;

        // Directives from clients are not trusted.
        let headers = req.headers_mut();
        headers.remove(MAX_AGE_HEADER);
        headers.remove(CANONICAL_URL_HEADER);
        if let Some(max_age) = resolution.max_age {
            let value = humantime::format_duration(max_age).to_string();
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(MAX_AGE_HEADER, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&resolution.cache_key) {
            headers.insert(CANONICAL_URL_HEADER, value);
        }

        match self.config.transport.round_trip(req).await {
            Ok(response) => response,
            Err(e @ ProxyError::Upstream(_)) => {
                tracing::warn!("Upstream request for {} failed: {}", url, e);
                plain_response(StatusCode::BAD_GATEWAY, format!("{}\n", e))
            }
            Err(e) => {
                tracing::error!("Cache error for {}: {}", url, e);
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e))
            }
        }
    }

    fn log_access(client: SocketAddr, method: &Method, uri: &str, response: &Response<Bytes>) {
        let status = CacheStatus::from_response(response)
            .map(|s| s.as_str())
            .unwrap_or("-");
        tracing::info!(
            "{} {} {} {} {} {}",
            client,
            method,
            uri,
            response.status().as_u16(),
            response.body().len(),
            status
        );
    }
}

impl HttpHandler for ProxyHandler {
    async fn handle_request(
        &mut self,
        ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        // Origin-form: addressed to us, not proxied.
        if req.uri().scheme().is_none() {
            let response = self.serve_local(&req);
            Self::log_access(ctx.client_addr, req.method(), &req.uri().to_string(), &response);
            return RequestOrResponse::Response(response.map(bytes_to_body));
        }

        let method = req.method().clone();
        let uri = req.uri().to_string();

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                let response = plain_response(StatusCode::BAD_REQUEST, "Unreadable request body\n");
                return RequestOrResponse::Response(response.map(bytes_to_body));
            }
        };

        let response = self.forward(Request::from_parts(parts, body)).await;
        Self::log_access(ctx.client_addr, &method, &uri, &response);

        RequestOrResponse::Response(response.map(bytes_to_body))
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        res
    }

    fn should_intercept(
        &mut self,
        _ctx: &HttpContext,
        req: &Request<Body>,
    ) -> impl Future<Output = bool> + Send {
        let intercept = match req.uri().host() {
            Some(host) => {
                let intercept = self.config.intercept.should_intercept(host);
                tracing::debug!(
                    "CONNECT {} -> {}",
                    host,
                    if intercept { "intercept" } else { "tunnel" }
                );
                intercept
            }
            None => false,
        };
        async move { intercept }
    }
}
