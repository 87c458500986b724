//! The reverse-proxy listeners.
//!
//! One TCP listener per distinct proxy port, bound to loopback only. Each
//! accepted connection is served on its own task; handler panics are turned
//! into 500s and serve-task failures are logged, never propagated, so one
//! bad listener cannot take down its peers.

use crate::error::{Error, Result};
use crate::proxy::resolver::{parse_slug_from_host, Resolver};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::catch_panic::CatchPanicLayer;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
// Slow-loris protection on request heads only. There is deliberately no
// write deadline: dev backends stream SSE and HMR indefinitely, and a fixed
// deadline would truncate those streams.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the proxy listeners. Constructed with an optional TLS config; the
/// reported scheme follows it.
pub struct ProxyServer {
    resolver: Arc<Resolver>,
    tls: Option<Arc<rustls::ServerConfig>>,
    listeners: parking_lot::Mutex<Vec<ListenerHandle>>,
}

struct ListenerHandle {
    port: u16,
    token: CancellationToken,
    tracker: TaskTracker,
    accept_task: tokio::task::JoinHandle<()>,
}

#[derive(Clone)]
struct ProxyContext {
    resolver: Arc<Resolver>,
    listen_port: u16,
    scheme: &'static str,
    client: Client<HttpConnector, Body>,
}

impl ProxyServer {
    pub fn new(resolver: Arc<Resolver>, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self {
            resolver,
            tls,
            listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// `https` iff a TLS config was supplied.
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Bind a listener per distinct proxy port. On any bind failure the
    /// already-bound listeners are shut down before the error is returned.
    pub async fn start(&self, proxy_ports: &BTreeMap<String, u16>) -> Result<()> {
        let ports: BTreeSet<u16> = proxy_ports.values().copied().collect();

        for port in ports {
            match self.start_listener(port).await {
                Ok(handle) => self.listeners.lock().push(handle),
                Err(err) => {
                    self.stop().await;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn start_listener(&self, port: u16) -> Result<ListenerHandle> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::ProxyBind { addr, source })?;

        let ctx = ProxyContext {
            resolver: self.resolver.clone(),
            listen_port: port,
            scheme: self.scheme(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        };
        let app = Router::new()
            .fallback(proxy_request)
            .layer(CatchPanicLayer::new())
            .with_state(ctx);

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor = self.tls.clone().map(TlsAcceptor::from);

        tracing::info!("proxy listening on {}://127.0.0.1:{port}", self.scheme());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            app,
            acceptor,
            token.clone(),
            tracker.clone(),
        ));

        Ok(ListenerHandle {
            port,
            token,
            tracker,
            accept_task,
        })
    }

    /// Gracefully shut down every listener: signal cancellation, give
    /// in-flight connections a 5-second deadline to drain, then abort
    /// whatever is left so file descriptors cannot leak.
    pub async fn stop(&self) {
        let handles: Vec<ListenerHandle> = std::mem::take(&mut *self.listeners.lock());

        for handle in handles {
            handle.token.cancel();
            handle.tracker.close();

            let mut accept_task = handle.accept_task;
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut accept_task).await {
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!("panic in proxy accept loop on port {}: {e}", handle.port);
                }
                Ok(_) => {}
                Err(_) => accept_task.abort(),
            }
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.tracker.wait())
                .await
                .is_err()
            {
                tracing::warn!(
                    "proxy connections on port {} did not drain within {:?}",
                    handle.port,
                    SHUTDOWN_TIMEOUT
                );
            }
        }
    }
}

/// Accept connections until cancelled. The listener socket closes when this
/// task returns and drops it.
async fn accept_loop(
    listener: TcpListener,
    app: Router,
    acceptor: Option<TlsAcceptor>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("proxy accept error: {e}");
                        continue;
                    }
                };
                let app = app.clone();
                let acceptor = acceptor.clone();
                let token = token.clone();
                tracker.spawn(async move {
                    serve_connection(stream, app, acceptor, token).await;
                });
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    app: Router,
    acceptor: Option<TlsAcceptor>,
    token: CancellationToken,
) {
    let service = TowerToHyperService::new(app);
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    match acceptor {
        Some(acceptor) => {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("tls handshake failed: {e}");
                    return;
                }
            };
            drive_connection(&builder, TokioIo::new(stream), service, token).await;
        }
        None => drive_connection(&builder, TokioIo::new(stream), service, token).await,
    }
}

async fn drive_connection<I>(
    builder: &auto::Builder<TokioExecutor>,
    io: I,
    service: TowerToHyperService<Router>,
    token: CancellationToken,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let conn = builder.serve_connection_with_upgrades(io, service);
    let mut conn = std::pin::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                tracing::debug!("proxy connection ended with error: {e}");
            }
        }
        _ = token.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                tracing::debug!("proxy connection ended during shutdown: {e}");
            }
        }
    }
}

/// Per-request handler: parse the slug from Host, resolve the backend, and
/// stream the request through while preserving the inbound Host header.
async fn proxy_request(State(ctx): State<ProxyContext>, req: Request<Body>) -> Response {
    let host = request_host(&req);

    let Some(slug) = parse_slug_from_host(&host) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!(
                "portree: missing subdomain in Host header.\nUse {}://<branch-slug>.localhost:{}\n",
                ctx.scheme, ctx.listen_port
            ),
        );
    };
    let slug = slug.to_string();

    let backend = match ctx.resolver.resolve(&slug, ctx.listen_port).await {
        Ok(port) => port,
        Err(err) => {
            tracing::debug!("resolve failed for {slug:?} on port {}: {err}", ctx.listen_port);
            let mut msg = format!("portree: no worktree found for slug {slug:?}");
            if let Ok(slugs) = ctx.resolver.available_slugs().await {
                if !slugs.is_empty() {
                    msg.push_str("\nAvailable: ");
                    msg.push_str(&slugs.join(", "));
                }
            }
            msg.push('\n');
            return text_response(StatusCode::NOT_FOUND, msg);
        }
    };

    forward(&ctx, req, &host, backend).await
}

async fn forward(ctx: &ProxyContext, mut req: Request<Body>, host: &str, backend: u16) -> Response {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target: Uri = match format!("http://127.0.0.1:{backend}{path_and_query}").parse() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!("invalid backend URI for port {backend}: {e}");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "portree: invalid backend URL\n".to_string(),
            );
        }
    };
    *req.uri_mut() = target;

    // The backend sees the original Host plus X-Forwarded-Host, so
    // subdomain-aware dev servers keep working behind the proxy.
    if let Ok(value) = HeaderValue::from_str(host) {
        req.headers_mut().insert(header::HOST, value.clone());
        req.headers_mut().insert("x-forwarded-host", value);
    }

    match ctx.client.request(req).await {
        Ok(response) => response.map(Body::new).into_response(),
        Err(e) => {
            tracing::debug!("upstream on port {backend} unreachable: {e}");
            text_response(
                StatusCode::BAD_GATEWAY,
                format!("portree: upstream on port {backend} unreachable\n"),
            )
        }
    }
}

fn request_host(req: &Request<Body>) -> String {
    if let Some(host) = req.headers().get(header::HOST) {
        if let Ok(host) = host.to_str() {
            return host.to_string();
        }
    }
    // HTTP/2 carries the authority in the URI instead of a Host header.
    req.uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default()
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PortRange, ServiceConfig};
    use crate::state::{FileStore, State};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn test_router(backend_port: u16, dir: &std::path::Path) -> Router {
        let store = Arc::new(FileStore::new(dir.join(".portree")).unwrap());
        let mut config = Config::default();
        config.services.insert(
            "web".to_string(),
            ServiceConfig {
                command: "true".to_string(),
                dir: String::new(),
                port_range: PortRange {
                    min: 3100,
                    max: 3199,
                },
                proxy_port: 3000,
            },
        );
        let mut state = State::default();
        state.set_port_assignment("feature/auth", "web", backend_port);
        store.save(&state).unwrap();

        let resolver = Arc::new(Resolver::new(Arc::new(config), store));
        let ctx = ProxyContext {
            resolver,
            listen_port: 3000,
            scheme: "http",
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        };
        Router::new()
            .fallback(proxy_request)
            .layer(CatchPanicLayer::new())
            .with_state(ctx)
    }

    async fn spawn_backend(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().route("/", axum::routing::get(move || async move { body }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn routes_known_slug_to_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend_port = spawn_backend("hello from backend").await;
        let app = test_router(backend_port, dir.path());

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "feature-auth.localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello from backend");
    }

    #[tokio::test]
    async fn bare_localhost_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(3150, dir.path());

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("<branch-slug>.localhost"));
    }

    #[tokio::test]
    async fn unknown_slug_is_not_found_with_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_router(3150, dir.path());

        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "unknown.localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_text(response).await;
        assert!(body.contains("no worktree found for slug \"unknown\""));
        assert!(body.contains("Available: feature-auth"));
    }

    #[tokio::test]
    async fn dead_backend_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        // Reserve a port, then free it so nothing listens there.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let app = test_router(dead_port, dir.path());
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "feature-auth.localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn forwards_host_headers_to_backend() {
        let dir = tempfile::tempdir().unwrap();

        // Backend that echoes the received headers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = listener.local_addr().unwrap().port();
        let echo = Router::new().route(
            "/",
            axum::routing::get(|req: Request<Body>| async move {
                let host = request_host(&req);
                let forwarded = req
                    .headers()
                    .get("x-forwarded-host")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("{host}|{forwarded}")
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, echo).await.unwrap();
        });

        let app = test_router(backend_port, dir.path());
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "feature-auth.localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(
            body_text(response).await,
            "feature-auth.localhost:3000|feature-auth.localhost:3000"
        );
    }

    #[tokio::test]
    async fn start_and_stop_real_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join(".portree")).unwrap());
        let config = Arc::new(Config::default());
        let resolver = Arc::new(Resolver::new(config, store));
        let server = ProxyServer::new(resolver, None);
        assert_eq!(server.scheme(), "http");

        // Grab two ephemeral ports for the listeners.
        let (p1, p2) = {
            let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
            (
                a.local_addr().unwrap().port(),
                b.local_addr().unwrap().port(),
            )
        };
        let ports = BTreeMap::from([("web".to_string(), p1), ("api".to_string(), p2)]);

        server.start(&ports).await.unwrap();
        // Both ports should now be occupied.
        assert!(TcpListener::bind(("127.0.0.1", p1)).await.is_err());
        assert!(TcpListener::bind(("127.0.0.1", p2)).await.is_err());

        server.stop().await;
        // And released after stop.
        assert!(TcpListener::bind(("127.0.0.1", p1)).await.is_ok());
        assert!(TcpListener::bind(("127.0.0.1", p2)).await.is_ok());
    }

    #[tokio::test]
    async fn bind_conflict_tears_down_peers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join(".portree")).unwrap());
        let resolver = Arc::new(Resolver::new(Arc::new(Config::default()), store));
        let server = ProxyServer::new(resolver, None);

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let occupied_port = occupied.local_addr().unwrap().port();

        let ports = BTreeMap::from([
            ("web".to_string(), free_port),
            ("api".to_string(), occupied_port),
        ]);
        let err = server.start(&ports).await.unwrap_err();
        assert!(matches!(err, Error::ProxyBind { .. }));

        // The successfully-bound listener must have been released.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpListener::bind(("127.0.0.1", free_port)).await.is_ok());
    }
}
