//! MITM engine adapter.
//!
//! Production [`InterceptEngine`] built on hudsucker. Each connection gets a
//! cloned handler; the handler builds an [`Exchange`] per request, runs the
//! registered hooks, and honors the routing target the request hook may have
//! set by forwarding the request through the configured upstream proxy.
//!
//! The interception authority is provisioned in memory at startup and lives
//! only as long as the engine; nothing is written to disk or trust stores.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::hyper::{Request, Response};
use hudsucker::rcgen::{CertificateParams, Issuer, KeyPair};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::{Body, HttpContext, HttpHandler, Proxy, RequestOrResponse};
use hyper::body::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use periscope_core::{Exchange, UpstreamTarget};

use crate::engine::{BeforeRequestHook, BeforeResponseHook, InterceptEngine};
use crate::error::EngineError;

/// Common name on the in-memory interception authority.
const CA_COMMON_NAME: &str = "Periscope Interception CA";

/// Helper to convert bytes to Body
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Hook slots shared between the engine facade and its per-connection
/// handlers.
#[derive(Default)]
struct HookSlots {
    request: RwLock<Option<BeforeRequestHook>>,
    response: RwLock<Option<BeforeResponseHook>>,
}

/// Interception engine backed by a hudsucker MITM proxy.
///
/// `start` must be called from within a tokio runtime; the listener runs as
/// a background task until `stop` signals it down.
pub struct MitmEngine {
    hooks: Arc<HookSlots>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl MitmEngine {
    /// Creates an engine with empty hook slots.
    pub fn new() -> Self {
        Self {
            hooks: Arc::new(HookSlots::default()),
            shutdown: Mutex::new(None),
        }
    }

    /// Returns true while the background listener task is up.
    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }
}

impl Default for MitmEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MitmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmEngine")
            .field("running", &self.is_running())
            .finish()
    }
}

impl InterceptEngine for MitmEngine {
    fn register_before_request(&self, hook: BeforeRequestHook) {
        *self.hooks.request.write() = Some(hook);
    }

    fn unregister_before_request(&self) {
        *self.hooks.request.write() = None;
    }

    fn register_before_response(&self, hook: BeforeResponseHook) {
        *self.hooks.response.write() = Some(hook);
    }

    fn unregister_before_response(&self) {
        *self.hooks.response.write() = None;
    }

    fn start(&self, addr: SocketAddr) -> Result<(), EngineError> {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_some() {
            return Ok(());
        }

        // Probe the address synchronously so a bind conflict surfaces to the
        // caller instead of dying inside the background task.
        let probe = std::net::TcpListener::bind(addr)
            .map_err(|source| EngineError::Bind { addr, source })?;
        drop(probe);

        let authority = interception_authority()?;
        let handler = HookHandler::new(self.hooks.clone());

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let proxy = match Proxy::builder()
                .with_addr(addr)
                .with_ca(authority)
                .with_rustls_connector(default_provider())
                .with_http_handler(handler)
                .build()
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!("failed to build proxy engine: {}", e);
                    return;
                }
            };

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("proxy engine error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("proxy engine shutdown signal received");
                }
            }
        });

        tracing::info!(%addr, "proxy engine listening");
        *shutdown = Some(shutdown_tx);
        Ok(())
    }

    fn stop(&self) {
        if let Some(shutdown_tx) = self.shutdown.lock().take() {
            let _ = shutdown_tx.send(());
        }
    }
}

/// Generates the in-memory interception authority.
fn interception_authority() -> Result<RcgenAuthority, EngineError> {
    let key_pair = KeyPair::generate().map_err(|e| EngineError::Setup(e.to_string()))?;

    let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
        .map_err(|e| EngineError::Setup(e.to_string()))?;
    params.is_ca = hudsucker::rcgen::IsCa::Ca(hudsucker::rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        hudsucker::rcgen::KeyUsagePurpose::KeyCertSign,
        hudsucker::rcgen::KeyUsagePurpose::CrlSign,
        hudsucker::rcgen::KeyUsagePurpose::DigitalSignature,
    ];

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| EngineError::Setup(e.to_string()))?;

    let issuer = Issuer::from_ca_cert_pem(&cert.pem(), key_pair)
        .map_err(|e| EngineError::Setup(e.to_string()))?;

    Ok(RcgenAuthority::new(issuer, 1000, default_provider()))
}

/// Builds the exchange snapshot for one incoming request.
fn exchange_for_request(req: &Request<Body>) -> Exchange {
    let uri = req.uri().to_string();
    let path = req.uri().path().to_string();

    let host = req
        .uri()
        .host()
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(|s| s.split(':').next().unwrap_or(s).to_string())
        })
        .unwrap_or_default();

    let secure = req.uri().scheme_str() == Some("https");

    Exchange::new(host, uri, path).with_secure_flag(secure)
}

/// Attaches the response content-type to a pending exchange.
fn with_response_content_type(exchange: Exchange, res: &Response<Body>) -> Exchange {
    match res
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(ct) => exchange.with_content_type(ct),
        None => exchange,
    }
}

/// Per-connection HTTP handler running the registered hooks.
///
/// hudsucker clones one handler per connection and drives a connection's
/// requests sequentially, so the pending exchange for request/response
/// correlation can live in the clone itself.
#[derive(Clone)]
struct HookHandler {
    hooks: Arc<HookSlots>,
    pending: Option<Exchange>,
}

impl HookHandler {
    fn new(hooks: Arc<HookSlots>) -> Self {
        Self {
            hooks,
            pending: None,
        }
    }

    fn fire_response_hook(&self, exchange: &Exchange) {
        if let Some(hook) = self.hooks.response.read().clone() {
            hook(exchange);
        }
    }

    /// Re-issues the request through the upstream proxy the router chose.
    async fn forward_upstream(
        &self,
        req: Request<Body>,
        exchange: Exchange,
        target: UpstreamTarget,
    ) -> RequestOrResponse {
        let (parts, body) = req.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("failed to read request body: {}", e);
                Bytes::new()
            }
        };

        let attempt = send_via_upstream(
            parts.method.clone(),
            parts.uri.to_string(),
            &parts.headers,
            bytes.clone(),
            &target,
        )
        .await;

        match attempt {
            Ok(response) => {
                let exchange = with_response_content_type(exchange, &response);
                self.fire_response_hook(&exchange);
                RequestOrResponse::Response(response)
            }
            Err(e) => {
                tracing::warn!(upstream = %target, error = %e, "upstream forward failed, sending direct");
                RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(bytes)))
            }
        }
    }
}

impl HttpHandler for HookHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        let mut exchange = exchange_for_request(&req);

        if let Some(hook) = self.hooks.request.read().clone() {
            hook(&mut exchange);
        }

        if let Some(target) = exchange.routing_target().cloned() {
            tracing::debug!(host = exchange.host(), upstream = %target, "routing via upstream");
            // The forward path answers the client itself, so no engine
            // response callback will follow for this exchange.
            self.pending = None;
            return self.forward_upstream(req, exchange, target).await;
        }

        self.pending = Some(exchange);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        if let Some(exchange) = self.pending.take() {
            let exchange = with_response_content_type(exchange, &res);
            self.fire_response_hook(&exchange);
        }
        res
    }
}

/// Sends the collected request through `target` and converts the reply back
/// into an engine response.
async fn send_via_upstream(
    method: hyper::Method,
    uri: String,
    headers: &hyper::HeaderMap,
    body: Bytes,
    target: &UpstreamTarget,
) -> Result<Response<Body>, EngineError> {
    let proxy = reqwest::Proxy::all(format!("http://{target}"))
        .map_err(|e| EngineError::Upstream(e.to_string()))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .build()
        .map_err(|e| EngineError::Upstream(e.to_string()))?;

    let upstream = client
        .request(method, uri)
        .headers(headers.clone())
        .body(body.to_vec())
        .send()
        .await
        .map_err(|e| EngineError::Upstream(e.to_string()))?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // hyper frames the body itself from the buffered bytes.
    headers.remove(hyper::header::TRANSFER_ENCODING);
    headers.remove(hyper::header::CONTENT_LENGTH);

    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| EngineError::Upstream(e.to_string()))?;

    let mut response = Response::new(bytes_to_body(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn exchange_from_absolute_uri() {
        let req = request("http://game.example.com/kcsapi/api_port/port");
        let exchange = exchange_for_request(&req);

        assert_eq!(exchange.host(), "game.example.com");
        assert_eq!(exchange.path(), "/kcsapi/api_port/port");
        assert_eq!(exchange.uri(), "http://game.example.com/kcsapi/api_port/port");
        assert!(!exchange.secure_flag());
    }

    #[test]
    fn exchange_from_https_uri_sets_secure_flag() {
        let req = request("https://game.example.com/kcsapi/api_start2");
        let exchange = exchange_for_request(&req);
        assert!(exchange.secure_flag());
    }

    #[test]
    fn exchange_host_falls_back_to_host_header() {
        let req = Request::builder()
            .uri("/kcsapi/api_port/port")
            .header(hyper::header::HOST, "game.example.com:8080")
            .body(Body::empty())
            .unwrap();
        let exchange = exchange_for_request(&req);

        assert_eq!(exchange.host(), "game.example.com");
        assert_eq!(exchange.path(), "/kcsapi/api_port/port");
    }

    #[test]
    fn response_content_type_is_attached() {
        let exchange = Exchange::new(
            "game.example.com",
            "http://game.example.com/kcsapi/api_start2",
            "/kcsapi/api_start2",
        );
        let res = Response::builder()
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Body::empty())
            .unwrap();

        let exchange = with_response_content_type(exchange, &res);
        assert_eq!(exchange.content_type(), Some("text/plain"));
    }

    #[test]
    fn engine_stop_without_start_is_safe() {
        let engine = MitmEngine::new();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn engine_start_rejects_taken_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let engine = MitmEngine::new();
        let err = engine.start(addr).unwrap_err();
        assert!(matches!(err, EngineError::Bind { .. }));
        assert!(!engine.is_running());
    }

    #[test]
    fn interception_authority_is_buildable() {
        assert!(interception_authority().is_ok());
    }
}
