//! HTTP server implementation using hyper.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{Config, SharedConfig};
use crate::rate_limit::RateLimiter;
use crate::response::{self, HttpResponse};
use crate::router::{Context, RouteMatch, RouterHandle};

/// Maximum request body size in bytes (1 MB).
const MAX_BODY_SIZE: usize = 1_048_576;

/// Maximum number of concurrent connections.
const MAX_CONNECTIONS: usize = 128;

/// Timeout for reading request headers (slowloris protection).
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Tokens charged per request by the server-wide limiter.
const REQUEST_COST: f64 = 1.0;

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Shared server state.
pub struct State {
    pub config: SharedConfig,
    pub router: Arc<RouterHandle>,
    /// Server-wide per-IP limiter, present when `[rate_limit]` is configured.
    pub limiter: Option<Arc<RateLimiter<IpAddr>>>,
}

/// Handle to a running server instance.
pub struct Server {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<crate::Result<()>>,
}

impl Server {
    /// The address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the accept loop and wait for it to finish.
    ///
    /// Connections already accepted keep running until their requests
    /// complete.
    pub async fn shutdown(self) -> crate::Result<()> {
        let _ = self.shutdown_tx.send(());
        join(self.task).await
    }
}

async fn join(task: JoinHandle<crate::Result<()>>) -> crate::Result<()> {
    task.await
        .map_err(|e| crate::Error::Internal(format!("accept loop failed: {e}")))?
}

/// Reuse a valid client-supplied request id, otherwise mint one.
fn request_id(headers: &hyper::HeaderMap) -> Uuid {
    headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::try_parse(v.trim()).ok())
        .unwrap_or_else(Uuid::new_v4)
}

/// The origin to reflect in CORS headers, if it is allowed.
fn allowed_origin(config: &Config, origin: Option<&str>) -> Option<HeaderValue> {
    let origin = origin?;
    let allowed = config
        .server
        .cors_origins
        .iter()
        .any(|o| o == "*" || o == origin);
    if allowed {
        HeaderValue::from_str(origin).ok()
    } else {
        None
    }
}

/// Add security, CORS, and tracing headers to a response.
fn add_standard_headers(
    response: &mut HttpResponse,
    config: &Config,
    origin: Option<&HeaderValue>,
    request_id: Uuid,
) {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    if config.server.hsts {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        );
    }
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    if let Ok(id) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(X_REQUEST_ID.clone(), id);
    }
}

/// Answer a CORS preflight with the methods registered for `path`.
fn preflight(state: &State, path: &str, origin: Option<&HeaderValue>) -> HttpResponse {
    let mut response = response::no_content();
    let mut methods: Vec<String> = state
        .router
        .allowed_methods(path)
        .iter()
        .map(|m| m.as_str().to_string())
        .collect();
    methods.push(Method::OPTIONS.as_str().to_string());

    if let Ok(value) = HeaderValue::from_str(&methods.join(", ")) {
        let headers = response.headers_mut();
        headers.insert(header::ALLOW, value.clone());
        if origin.is_some() {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("content-type, x-request-id"),
            );
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
        }
    }
    response
}

/// Handle an incoming HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<State>,
    client_ip: IpAddr,
) -> Result<HttpResponse, std::convert::Infallible> {
    let request_id = request_id(req.headers());
    let span = info_span!(
        "request",
        id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
        client_ip = %client_ip,
    );

    async move {
        let origin = allowed_origin(
            &state.config,
            req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()),
        );
        let mut response = route(req, &state, client_ip, origin.as_ref()).await;
        add_standard_headers(&mut response, &state.config, origin.as_ref(), request_id);
        debug!(status = response.status().as_u16(), "request complete");
        Ok(response)
    }
    .instrument(span)
    .await
}

async fn route(
    req: Request<Incoming>,
    state: &State,
    client_ip: IpAddr,
    origin: Option<&HeaderValue>,
) -> HttpResponse {
    // Admission control runs before any other work.
    if let Some(limiter) = &state.limiter
        && let Err(e) = limiter.throttle(client_ip, REQUEST_COST)
    {
        warn!("server rate limit exceeded");
        return e.into_response();
    }

    let (parts, body) = req.into_parts();

    if parts.method == Method::OPTIONS {
        return preflight(state, parts.uri.path(), origin);
    }

    // Reject oversized bodies early via Content-Length header
    let declared_len = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > MAX_BODY_SIZE) {
        return response::error(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
    }

    // Read body with size limit (fallback for chunked encoding)
    let body: Bytes = match BodyExt::collect(Limited::new(body, MAX_BODY_SIZE)).await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return response::error(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large"),
    };

    let path = parts.uri.path().to_string();
    match state.router.match_route(&parts.method, &path) {
        RouteMatch::Matched { handler, params } => {
            let ctx = Context {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                params,
                body,
                client_ip,
                config: Arc::clone(&state.config),
            };

            // Run on its own task so a panicking handler becomes a 500.
            match tokio::spawn(handler(ctx)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => e.into_response(),
                Err(e) => {
                    error!("Handler failed: {e}");
                    response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                }
            }
        }
        RouteMatch::MethodNotAllowed => {
            response::error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        RouteMatch::NotFound => response::error(StatusCode::NOT_FOUND, "Not found"),
    }
}

/// Wait for the next sweep tick, or forever when no limiter is configured.
async fn next_sweep(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn connection_builder() -> auto::Builder<TokioExecutor> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    builder
}

/// Bind, start accepting connections, and return a handle.
///
/// The returned [`Server`] exposes the bound address and a
/// [`shutdown`](Server::shutdown) method for graceful termination.
pub async fn start(config: Config, router: Arc<RouterHandle>) -> crate::Result<Server> {
    let limiter = match &config.rate_limit {
        Some(rl) => Some(Arc::new(RateLimiter::new(rl.capacity, rl.refill_per_sec)?)),
        None => None,
    };
    let sweep_idle = config
        .rate_limit
        .as_ref()
        .map(|rl| Duration::from_secs(rl.sweep_idle_secs));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let state = Arc::new(State {
        config: Arc::new(config),
        router,
        limiter,
    });

    info!("Server listening on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    let mut sweep = sweep_idle.map(tokio::time::interval);

    let task = tokio::spawn(async move {
        tokio::pin!(shutdown_rx);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, remote_addr) = result?;
                    let io = TokioIo::new(stream);
                    let client_ip = remote_addr.ip().to_canonical();

                    match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, Arc::clone(&state), client_ip)
                                });

                                let builder = connection_builder();
                                if let Err(e) = builder.serve_connection(io, service).await {
                                    error!("Error serving connection from {}: {}", remote_addr, e);
                                }

                                drop(permit);
                            });
                        }
                        Err(_) => {
                            warn!("Connection limit reached, rejecting {}", remote_addr);
                            tokio::spawn(async move {
                                let service = service_fn(|_req: Request<Incoming>| async {
                                    Ok::<_, std::convert::Infallible>(response::error(
                                        StatusCode::SERVICE_UNAVAILABLE,
                                        "Service unavailable",
                                    ))
                                });

                                let builder = connection_builder();
                                let _ = builder.serve_connection(io, service).await;
                            });
                        }
                    }
                }
                _ = next_sweep(&mut sweep) => {
                    if let (Some(limiter), Some(idle)) = (&state.limiter, sweep_idle) {
                        let removed = limiter.sweep(idle);
                        if removed > 0 {
                            debug!(removed, remaining = limiter.len(), "swept idle rate limit buckets");
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }

        Ok::<(), crate::Error>(())
    });

    Ok(Server {
        addr,
        shutdown_tx,
        task,
    })
}

/// Run the HTTP server until the accept loop fails.
///
/// # Arguments
/// * `config` - Server configuration
/// * `router` - Router handle with registered routes
pub async fn run(config: Config, router: Arc<RouterHandle>) -> crate::Result<()> {
    let server = start(config, router).await?;
    join(server.task).await
}
