//! Cache-aware HTTP transport.
//!
//! Wraps an [`Upstream`] and decides per request whether to serve from the
//! store, fetch and populate it, or pass straight through.
//!
//! A request is cacheable only when it carries [`MAX_AGE_HEADER`], its
//! method is GET or HEAD and it is not a range request. The cache key comes
//! from [`CANONICAL_URL_HEADER`] when present, otherwise from the canonical
//! form of the request URL. Both headers are stripped before the request
//! leaves the proxy.
//!
//! Responses are stored as HTTP/1.1 wire-format blobs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Version};
use parking_lot::Mutex;
use pkgproxy_core::{canonical_url, Url};
use pkgproxy_storage::ExpiringStore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{ProxyError, Result};

/// Request header carrying the freshness window, e.g. `72h`.
pub const MAX_AGE_HEADER: &str = "x-package-proxy-maxage";
/// Request header carrying the cache key identity.
pub const CANONICAL_URL_HEADER: &str = "x-canonical-url";
/// Response header with the cache outcome.
pub const CACHE_HEADER: &str = "x-cache";
/// Response header telling whether the key was in the store.
pub const CACHE_LOOKUP_HEADER: &str = "x-cache-lookup";

/// Headers that apply to a single connection and are never stored.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Date format used in `Date` headers.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Skip,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Skip => "SKIP",
        }
    }

    /// Reads the status back from an `X-Cache` header.
    pub fn from_response<B>(response: &Response<B>) -> Option<Self> {
        let value = response.headers().get(CACHE_HEADER)?.to_str().ok()?;
        match value.split_whitespace().next()? {
            "HIT" => Some(CacheStatus::Hit),
            "MISS" => Some(CacheStatus::Miss),
            "SKIP" => Some(CacheStatus::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a fetched response is written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreMode {
    /// Write on the blocking pool after the response is returned.
    #[default]
    Background,
    /// Write before returning the response.
    Sync,
}

/// The thing that actually talks to origin servers.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    /// Sends `request` and buffers the full response.
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// [`Upstream`] backed by a `reqwest` client.
///
/// Redirects are relayed, never followed, and environment proxies ignored.
#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // The target may have been rewritten, so let the client derive these.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let upstream = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Statuses worth storing: 2xx except 206, and 302.
pub fn is_cacheable_status(status: StatusCode) -> bool {
    (status.is_success() && status != StatusCode::PARTIAL_CONTENT) || status == StatusCode::FOUND
}

/// Removes connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Serializes a buffered response as an HTTP/1.1 message.
pub fn encode_blob(response: &Response<Bytes>) -> Vec<u8> {
    let status = response.status();
    let mut blob = Vec::with_capacity(response.body().len() + 512);

    blob.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in response.headers() {
        blob.extend_from_slice(name.as_str().as_bytes());
        blob.extend_from_slice(b": ");
        blob.extend_from_slice(value.as_bytes());
        blob.extend_from_slice(b"\r\n");
    }
    blob.extend_from_slice(b"\r\n");
    blob.extend_from_slice(response.body());
    blob
}

/// Parses a blob written by [`encode_blob`].
pub fn parse_blob(blob: Vec<u8>) -> std::result::Result<Response<Bytes>, String> {
    let blob = Bytes::from(blob);
    let mut capacity = 64;

    loop {
        let mut headers = vec![httparse::EMPTY_HEADER; capacity];
        let mut parsed = httparse::Response::new(&mut headers);

        let header_len = match parsed.parse(&blob) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Err("truncated response head".into()),
            Err(httparse::Error::TooManyHeaders) if capacity < 1024 => {
                capacity *= 2;
                continue;
            }
            Err(e) => return Err(e.to_string()),
        };

        let code = parsed.code.ok_or("missing status code")?;
        let status = StatusCode::from_u16(code).map_err(|e| e.to_string())?;

        let mut response = Response::new(blob.slice(header_len..));
        *response.status_mut() = status;
        *response.version_mut() = Version::HTTP_11;

        let map = response.headers_mut();
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| e.to_string())?;
            let value = HeaderValue::from_bytes(h.value).map_err(|e| e.to_string())?;
            map.append(name, value);
        }

        return Ok(response);
    }
}

/// Seconds elapsed since the response's `Date` header.
fn age_of(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let date = headers.get(header::DATE)?.to_str().ok()?;
    let date = DateTime::parse_from_rfc2822(date).ok()?;
    Some((now - date.with_timezone(&Utc)).num_seconds().max(0) as u64)
}

fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

/// HTTP round-tripper that reads and fills an [`ExpiringStore`].
pub struct CacheTransport {
    store: ExpiringStore,
    upstream: Arc<dyn Upstream>,
    server_id: String,
    mode: StoreMode,
    pending: Mutex<JoinSet<()>>,
}

impl fmt::Debug for CacheTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTransport")
            .field("store", &self.store.base_dir())
            .field("upstream", &self.upstream)
            .field("server_id", &self.server_id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CacheTransport {
    pub fn new(store: ExpiringStore, upstream: Arc<dyn Upstream>, server_id: impl Into<String>) -> Self {
        Self {
            store,
            upstream,
            server_id: server_id.into(),
            mode: StoreMode::default(),
            pending: Mutex::new(JoinSet::new()),
        }
    }

    /// Sets when fetched responses are written.
    pub fn with_store_mode(mut self, mode: StoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn store(&self) -> &ExpiringStore {
        &self.store
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Waits for every background store write issued so far.
    pub async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!("Store write task failed: {}", e);
            }
        }
    }

    /// Serves `request` from the store or upstream.
    pub async fn round_trip(&self, mut request: Request<Bytes>) -> Result<Response<Bytes>> {
        let headers = request.headers_mut();
        let max_age = headers
            .remove(MAX_AGE_HEADER)
            .and_then(|v| v.to_str().ok().map(str::to_owned))
            .and_then(|v| match humantime::parse_duration(&v) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Ignoring invalid max-age {:?}: {}", v, e);
                    None
                }
            });
        let key_hint = headers
            .remove(CANONICAL_URL_HEADER)
            .and_then(|v| v.to_str().ok().map(str::to_owned));

        let method = request.method().clone();
        let cacheable = max_age.is_some()
            && (method == Method::GET || method == Method::HEAD)
            && !request.headers().contains_key(header::RANGE);

        let Some(max_age) = max_age.filter(|_| cacheable) else {
            let mut response = self.upstream.send(request).await?;
            self.annotate(&mut response, CacheStatus::Skip, false);
            return Ok(response);
        };

        let key = self.cache_key(&request, key_hint);

        match self.store.read(&key) {
            Ok(blob) => {
                let mut response = parse_blob(blob).map_err(|reason| ProxyError::CorruptEntry {
                    key: key.clone(),
                    reason,
                })?;
                let age = age_of(response.headers(), Utc::now()).unwrap_or(0);
                response.headers_mut().insert(header::AGE, HeaderValue::from(age));
                debug!("Cache hit for {} (age {}s)", key, age);
                self.annotate(&mut response, CacheStatus::Hit, true);
                return Ok(response);
            }
            // Never stored, or swept after the record was looked at.
            Err(e) if e.is_not_found() => {
                if self.store.record(&key).is_some() {
                    debug!("{} vanished before read", key);
                }
            }
            Err(e) => return Err(e.into()),
        }

        let mut response = self.upstream.send(request).await?;
        if !is_cacheable_status(response.status()) {
            self.annotate(&mut response, CacheStatus::Skip, false);
            return Ok(response);
        }

        self.prepare_for_store(&mut response, &method);
        self.store_blob(key, encode_blob(&response), max_age).await;

        self.annotate(&mut response, CacheStatus::Miss, false);
        Ok(response)
    }

    fn cache_key(&self, request: &Request<Bytes>, hint: Option<String>) -> String {
        let key = hint.unwrap_or_else(|| match Url::parse(&request.uri().to_string()) {
            Ok(url) => canonical_url(&url),
            Err(_) => request.uri().to_string(),
        });

        if request.method() == Method::HEAD {
            format!("HEAD:{}", key)
        } else {
            key
        }
    }

    /// Normalizes headers of a response that is about to be stored.
    fn prepare_for_store(&self, response: &mut Response<Bytes>, method: &Method) {
        let len = response.body().len();
        let headers = response.headers_mut();
        strip_hop_by_hop(headers);
        headers.remove(CACHE_HEADER);
        headers.remove(CACHE_LOOKUP_HEADER);

        // HEAD keeps the entity length announced by upstream.
        if method != Method::HEAD {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        if !headers.contains_key(header::DATE) {
            let now = Utc::now().format(HTTP_DATE).to_string();
            if let Ok(value) = HeaderValue::from_str(&now) {
                headers.insert(header::DATE, value);
            }
        }
    }

    async fn store_blob(&self, key: String, blob: Vec<u8>, max_age: Duration) {
        let store = self.store.clone();
        let write = move || {
            if let Err(e) = store.write(&key, &blob, max_age) {
                error!("Failed to store {}: {}", key, e);
            }
        };

        match self.mode {
            StoreMode::Sync => {
                if let Err(e) = tokio::task::spawn_blocking(write).await {
                    error!("Store write task failed: {}", e);
                }
            }
            StoreMode::Background => {
                let mut pending = self.pending.lock();
                while pending.try_join_next().is_some() {}
                pending.spawn_blocking(write);
            }
        }
    }

    /// Adds `X-Cache`, `X-Cache-Lookup` and `Via` to an outgoing response.
    fn annotate(&self, response: &mut Response<Bytes>, status: CacheStatus, found: bool) {
        let version = version_label(response.version());
        let headers = response.headers_mut();
        headers.remove(CACHE_HEADER);
        headers.remove(CACHE_LOOKUP_HEADER);

        let lookup = match status {
            CacheStatus::Skip => "NONE",
            _ if found => "HIT",
            _ => "MISS",
        };
        let pairs = [
            (CACHE_HEADER, format!("{} from {}", status, self.server_id)),
            (CACHE_LOOKUP_HEADER, format!("{} from {}", lookup, self.server_id)),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }

        let hop = format!("{} {}", version, self.server_id);
        let via = match headers.get(header::VIA).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, hop),
            None => hop,
        };
        if let Ok(value) = HeaderValue::from_str(&via) {
            headers.insert(header::VIA, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct StaticUpstream {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for StaticUpstream {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.headers().get(MAX_AGE_HEADER).is_none());
            assert!(request.headers().get(CANONICAL_URL_HEADER).is_none());

            let mut response = Response::new(Bytes::from_static(b"payload"));
            *response.status_mut() = StatusCode::from_u16(self.status).unwrap();
            response
                .headers_mut()
                .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            response
                .headers_mut()
                .insert(CACHE_HEADER, HeaderValue::from_static("MISS from squid"));
            Ok(response)
        }
    }

    fn transport(status: u16) -> (TempDir, Arc<StaticUpstream>, CacheTransport) {
        let temp_dir = TempDir::new().unwrap();
        let store = ExpiringStore::open(temp_dir.path()).unwrap();
        let upstream = Arc::new(StaticUpstream {
            status,
            ..Default::default()
        });
        let transport =
            CacheTransport::new(store, upstream.clone(), "test-proxy").with_store_mode(StoreMode::Sync);
        (temp_dir, upstream, transport)
    }

    fn get(url: &str, max_age: Option<&str>) -> Request<Bytes> {
        let mut builder = Request::get(url);
        if let Some(max_age) = max_age {
            builder = builder.header(MAX_AGE_HEADER, max_age);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[test]
    fn cacheable_statuses() {
        assert!(is_cacheable_status(StatusCode::OK));
        assert!(is_cacheable_status(StatusCode::NO_CONTENT));
        assert!(is_cacheable_status(StatusCode::FOUND));
        assert!(!is_cacheable_status(StatusCode::PARTIAL_CONTENT));
        assert!(!is_cacheable_status(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_cacheable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn strip_removes_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        headers.insert(header::ETAG, HeaderValue::from_static("\"abc\""));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ETAG));
    }

    #[test]
    fn blob_preserves_status_headers_and_body() {
        let mut response = Response::new(Bytes::from_static(b"\r\nbinary\r\n\r\nbody"));
        *response.status_mut() = StatusCode::FOUND;
        let headers = response.headers_mut();
        headers.insert(header::LOCATION, HeaderValue::from_static("http://mirror/x"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let parsed = parse_blob(encode_blob(&response)).unwrap();

        assert_eq!(parsed.status(), StatusCode::FOUND);
        assert_eq!(parsed.headers().get(header::LOCATION).unwrap(), "http://mirror/x");
        assert_eq!(parsed.headers().get_all("x-multi").iter().count(), 2);
        assert_eq!(parsed.body().as_ref(), b"\r\nbinary\r\n\r\nbody");
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(parse_blob(b"HTTP/1.1 200 OK\r\nContent-Le".to_vec()).is_err());
    }

    #[test]
    fn age_from_date_header() {
        let now = Utc::now();
        let then = (now - chrono::Duration::seconds(42)).format(HTTP_DATE).to_string();
        let mut headers = HeaderMap::new();
        headers.insert(header::DATE, HeaderValue::from_str(&then).unwrap());

        assert_eq!(age_of(&headers, now), Some(42));
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (_dir, upstream, transport) = transport(200);

        let first = transport
            .round_trip(get("http://example.com/pkg.deb", Some("1h")))
            .await
            .unwrap();
        assert_eq!(CacheStatus::from_response(&first), Some(CacheStatus::Miss));
        assert_eq!(first.headers().get(CACHE_HEADER).unwrap(), "MISS from test-proxy");
        assert!(first.headers().get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(first.headers().get(header::CONTENT_LENGTH).unwrap(), "7");

        let second = transport
            .round_trip(get("http://example.com/pkg.deb", Some("1h")))
            .await
            .unwrap();
        assert_eq!(CacheStatus::from_response(&second), Some(CacheStatus::Hit));
        assert_eq!(second.headers().get(CACHE_LOOKUP_HEADER).unwrap(), "HIT from test-proxy");
        assert!(second.headers().contains_key(header::AGE));
        assert_eq!(second.body().as_ref(), b"payload");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_max_age_skips_store() {
        let (_dir, upstream, transport) = transport(200);

        for _ in 0..2 {
            let response = transport
                .round_trip(get("http://example.com/pkg.deb", None))
                .await
                .unwrap();
            assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Skip));
        }

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
        assert!(transport.store().index().is_empty());
    }

    #[tokio::test]
    async fn uncacheable_status_is_not_stored() {
        let (_dir, upstream, transport) = transport(404);

        for _ in 0..2 {
            let response = transport
                .round_trip(get("http://example.com/missing.deb", Some("1h")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Skip));
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn range_requests_bypass_cache() {
        let (_dir, _upstream, transport) = transport(200);
        let mut request = get("http://example.com/big.deb", Some("1h"));
        request
            .headers_mut()
            .insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));

        let response = transport.round_trip(request).await.unwrap();
        assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Skip));
        assert!(transport.store().index().is_empty());
    }

    #[tokio::test]
    async fn post_is_never_cached() {
        let (_dir, _upstream, transport) = transport(200);
        let request = Request::post("http://example.com/upload")
            .header(MAX_AGE_HEADER, "1h")
            .body(Bytes::from_static(b"data"))
            .unwrap();

        let response = transport.round_trip(request).await.unwrap();
        assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Skip));
    }

    #[tokio::test]
    async fn head_and_get_use_separate_entries() {
        let (_dir, upstream, transport) = transport(200);

        let head = Request::head("http://example.com/pkg.deb")
            .header(MAX_AGE_HEADER, "1h")
            .body(Bytes::new())
            .unwrap();
        transport.round_trip(head).await.unwrap();

        let response = transport
            .round_trip(get("http://example.com/pkg.deb", Some("1h")))
            .await
            .unwrap();
        assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Miss));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn canonical_header_overrides_key() {
        let (_dir, upstream, transport) = transport(200);

        let mut first = get("http://mirror-a.example/pool/x.deb", Some("1h"));
        first
            .headers_mut()
            .insert(CANONICAL_URL_HEADER, HeaderValue::from_static("ubuntu/pool/x.deb"));
        transport.round_trip(first).await.unwrap();

        let mut second = get("http://mirror-b.example/pool/x.deb", Some("1h"));
        second
            .headers_mut()
            .insert(CANONICAL_URL_HEADER, HeaderValue::from_static("ubuntu/pool/x.deb"));
        let response = transport.round_trip(second).await.unwrap();

        assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Hit));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert!(transport.store().has("ubuntu/pool/x.deb"));
    }

    #[tokio::test]
    async fn corrupt_entry_fails_closed() {
        let (_dir, upstream, transport) = transport(200);
        transport
            .store()
            .write("http://example.com/bad.deb", b"garbage", Duration::from_secs(60))
            .unwrap();

        let err = transport
            .round_trip(get("http://example.com/bad.deb", Some("1h")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::CorruptEntry { .. }));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blob_removed_under_record_is_a_miss() {
        let (_dir, upstream, transport) = transport(200);
        let url = "http://example.com/swept.deb";

        transport.round_trip(get(url, Some("1h"))).await.unwrap();
        std::fs::remove_file(transport.store().blob_path(url)).unwrap();
        assert!(transport.store().record(url).is_some());

        let response = transport.round_trip(get(url, Some("1h"))).await.unwrap();
        assert_eq!(CacheStatus::from_response(&response), Some(CacheStatus::Miss));
        assert_eq!(response.body().as_ref(), b"payload");
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
        assert!(transport.store().has(url));
    }

    #[tokio::test]
    async fn unreadable_blob_fails_closed() {
        let (_dir, upstream, transport) = transport(200);
        let url = "http://example.com/unreadable.deb";
        std::fs::create_dir_all(transport.store().blob_path(url)).unwrap();

        let err = transport.round_trip(get(url, Some("1h"))).await.unwrap_err();
        assert!(matches!(err, ProxyError::Storage(_)));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn via_is_appended() {
        let (_dir, _upstream, transport) = transport(200);
        let mut response = Response::new(Bytes::new());
        response
            .headers_mut()
            .insert(header::VIA, HeaderValue::from_static("1.1 squid"));

        transport.annotate(&mut response, CacheStatus::Skip, false);

        assert_eq!(response.headers().get(header::VIA).unwrap(), "1.1 squid, 1.1 test-proxy");
        assert_eq!(
            response.headers().get(CACHE_LOOKUP_HEADER).unwrap(),
            "NONE from test-proxy"
        );
    }

    #[tokio::test]
    async fn background_writes_complete_on_flush() {
        let temp_dir = TempDir::new().unwrap();
        let store = ExpiringStore::open(temp_dir.path()).unwrap();
        let upstream = Arc::new(StaticUpstream {
            status: 200,
            ..Default::default()
        });
        let transport = CacheTransport::new(store, upstream, "test-proxy");

        transport
            .round_trip(get("http://example.com/pkg.deb", Some("1h")))
            .await
            .unwrap();
        transport.flush().await;

        assert!(transport.store().has("http://example.com/pkg.deb"));
    }
}
