//! The HTTP server: request dispatch and the hyper transport.

mod idle;

use crate::body::{RequestBody, ResponseBody};
use crate::config::{Config, ConfigError};
use crate::context::{Context, Shared};
use crate::cors::{Cors, CorsConfig, CorsError};
use crate::error::{ErrorHandler, ErrorMode, ErrorPipeline, ProblemConfig, WebError};
use crate::middleware::Next;
use crate::openapi::{DocEndpoint, OpenApi, OpenApiConfig};
use crate::render::Renderer;
use crate::router::{RouteMatch, Router};
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use idle::IdleTimeout;
use std::convert::Infallible;
use std::future::Future;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tracing::{Level, debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("router must be set")]
    MissingRouter,

    #[error(transparent)]
    Cors(#[from] CorsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid log level `{0}`")]
    LogLevel(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read TLS material {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(String),
}

pub struct ServerBuilder {
    router: Option<Router>,
    config: Config,
    state: http::Extensions,
    renderer: Option<Arc<dyn Renderer>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self { router: None, config: Config::default(), state: http::Extensions::new(), renderer: None, error_handler: None }
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Replaces the whole configuration; later setters still apply on top of it.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.config.addr = addr;
        self.config.port = None;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn max_body_size(mut self, limit: usize) -> Self {
        self.config.max_body_size = limit;
        self
    }

    pub fn max_multipart_memory(mut self, limit: usize) -> Self {
        self.config.max_multipart_memory = limit;
        self
    }

    pub fn strict_slash(mut self, strict: bool) -> Self {
        self.config.strict_slash = strict;
        self
    }

    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.config.cors = Some(cors);
        self
    }

    pub fn tls(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.config.tls = Some(crate::config::TlsConfig { cert_file: cert_file.into(), key_file: key_file.into() });
        self
    }

    pub fn openapi(mut self, openapi: OpenApiConfig) -> Self {
        self.config.openapi = openapi;
        self
    }

    pub fn problem_details(mut self, problem: ProblemConfig) -> Self {
        self.config.error_handler = crate::config::ErrorHandlerConfig::ProblemDetails(problem);
        self
    }

    /// Installs a handler that renders every error response, replacing the configured shape.
    pub fn error_handler<H: ErrorHandler>(mut self, handler: H) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn renderer<R: Renderer>(mut self, renderer: R) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// Shares `value` with every handler through [`Context::state`].
    pub fn state<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.state.insert(value);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = Some(level.into());
        self
    }

    pub fn build(self) -> Result<Server, ServerError> {
        let router = self.router.ok_or(ServerError::MissingRouter)?;
        let cors = self.config.cors.clone().map(Cors::new).transpose()?;
        let mode = match self.error_handler {
            Some(handler) => ErrorMode::Custom(handler),
            None => self.config.error_handler.mode(),
        };
        let shared = Shared {
            errors: ErrorPipeline::new(mode),
            limits: self.config.limits(),
            renderer: self.renderer,
            state: self.state,
        };
        let openapi = OpenApi::new(self.config.openapi.clone());
        Ok(Server { router: Arc::new(router), shared: Arc::new(shared), openapi, cors, config: self.config })
    }
}

pub struct Server {
    router: Arc<Router>,
    shared: Arc<Shared>,
    openapi: OpenApi,
    cors: Option<Cors>,
    config: Config,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// A handle on the route table that stays usable after the server is moved into [`Server::start`].
    pub fn routes(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub fn openapi(&self) -> &OpenApi {
        &self.openapi
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one request through CORS, the documentation endpoints, routing, the middleware chain
    /// and the error pipeline.
    pub async fn dispatch(&self, request: Request<RequestBody>) -> Response<ResponseBody> {
        let started = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        let mut response = self.respond(request).await;

        debug!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
        if method == Method::HEAD {
            *response.body_mut() = ResponseBody::empty();
        }
        response
    }

    async fn respond(&self, request: Request<RequestBody>) -> Response<ResponseBody> {
        let cors_headers = match &self.cors {
            Some(cors) => {
                if let Some(preflight) = cors.preflight(request.method(), request.headers()) {
                    return preflight;
                }
                Some(request.headers().clone())
            }
            None => None,
        };

        let mut response = self.route(request).await;

        if let (Some(cors), Some(headers)) = (&self.cors, cors_headers) {
            cors.decorate(&headers, &mut response);
        }
        response
    }

    async fn route(&self, request: Request<RequestBody>) -> Response<ResponseBody> {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        if matches!(method, Method::GET | Method::HEAD)
            && let Some(endpoint) = self.openapi.endpoint(&path)
        {
            return self.documentation(endpoint);
        }

        let mut ctx = Context::with_shared(request, self.shared.clone());
        let errors = &self.shared.errors;

        match self.router.at(&method, &path) {
            RouteMatch::Found { route, params } => {
                ctx.set_params(params);
                ctx.set_route(route.pattern_arc());
                let next = Next::new(route.chain(), route.handler());
                let result = match self.config.write_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, next.run(&mut ctx))
                        .await
                        .unwrap_or(Err(WebError::Timeout(timeout))),
                    None => next.run(&mut ctx).await,
                };
                if let Err(e) = result {
                    errors.handle_error(&mut ctx, e);
                }
            }
            RouteMatch::MethodNotAllowed { allowed } => {
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                if let Err(e) = ctx.set_header(header::ALLOW, allow.as_str()) {
                    warn!(cause = %e, "failed to set Allow header");
                }
                errors.handle_error(&mut ctx, WebError::method_not_allowed(format!("{method} is not allowed on {path}")));
            }
            RouteMatch::NotFound => {
                if let Some(location) = self.slash_redirect(&method, ctx.uri()) {
                    if let Err(e) = ctx.redirect(StatusCode::MOVED_PERMANENTLY, &location) {
                        warn!(%location, cause = %e, "failed to redirect");
                        errors.handle_error(&mut ctx, e);
                    }
                } else {
                    errors.handle_error(&mut ctx, WebError::not_found(format!("no route for {path}")));
                }
            }
        }
        ctx.into_response()
    }

    /// With `strict_slash`, the registered spelling of a path that differs only by a trailing `/`.
    fn slash_redirect(&self, method: &Method, uri: &http::Uri) -> Option<String> {
        if !self.config.strict_slash {
            return None;
        }
        let path = uri.path();
        let alternative = match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed.to_owned(),
            Some(_) => return None,
            None => format!("{path}/"),
        };
        if matches!(self.router.at(method, &alternative), RouteMatch::NotFound) {
            return None;
        }
        Some(match uri.query() {
            Some(query) => format!("{alternative}?{query}"),
            None => alternative,
        })
    }

    fn documentation(&self, endpoint: DocEndpoint) -> Response<ResponseBody> {
        let (content_type, body) = match endpoint {
            DocEndpoint::Json => ("application/json", ResponseBody::once(self.openapi.snapshot(&self.router).json().clone())),
            DocEndpoint::SwaggerUi => ("text/html; charset=utf-8", ResponseBody::from(self.openapi.swagger_ui())),
            DocEndpoint::Redoc => ("text/html; charset=utf-8", ResponseBody::from(self.openapi.redoc())),
        };
        let mut response = Response::new(body);
        response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        response
    }

    /// Serves until Ctrl-C.
    pub async fn start(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(cause = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("received Ctrl-C, shutting down");
        })
        .await
    }

    /// Serves until `signal` completes, then lets open connections finish.
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener, signal).await
    }

    /// Serves on an already bound `listener` until `signal` completes.
    pub async fn serve<S>(self, listener: TcpListener, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        self.install_logging()?;
        let tls = self.config.tls.as_ref().map(|tls| tls_acceptor(&tls.cert_file, &tls.key_file)).transpose()?;
        let handshake_timeout = self.config.read_timeout.unwrap_or(TLS_HANDSHAKE_TIMEOUT);
        match listener.local_addr() {
            Ok(addr) => info!(%addr, tls = tls.is_some(), "start listening"),
            Err(e) => warn!(cause = %e, "listener has no local address"),
        }

        let server = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(cause = %e, "failed to accept");
                            continue;
                        }
                    };
                    let server = server.clone();
                    let tls = tls.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                                Ok(Ok(stream)) => server.serve_connection(stream, shutdown_rx).await,
                                Ok(Err(e)) => warn!(%remote_addr, cause = %e, "TLS handshake failed"),
                                Err(_) => {
                                    warn!(%remote_addr, timeout = %humantime::format_duration(handshake_timeout), "TLS handshake timed out");
                                }
                            },
                            None => server.serve_connection(stream, shutdown_rx).await,
                        }
                    });
                }
                _ = &mut signal => {
                    info!("shutdown signal received, stopping new connections");
                    break;
                }
            }
        }

        drop(shutdown_rx);
        let _ = shutdown_tx.send(true);
        shutdown_tx.closed().await;
        info!("server stopped");
        Ok(())
    }

    async fn serve_connection<IO>(self: Arc<Self>, stream: IO, mut shutdown_rx: watch::Receiver<bool>)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = hyper::service::service_fn(move |request: Request<Incoming>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.dispatch(request.map(RequestBody::new)).await) }
        });

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder.http1().timer(TokioTimer::new());
        if let Some(timeout) = self.config.read_timeout {
            builder.http1().header_read_timeout(timeout);
        }

        let io: Box<dyn Io> = match self.config.idle_timeout {
            Some(timeout) => Box::new(IdleTimeout::new(stream, timeout)),
            None => Box::new(stream),
        };
        let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
        tokio::pin!(connection);

        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!(cause = %e, "connection closed with error");
                }
            }
            _ = shutdown_rx.changed() => {
                connection.as_mut().graceful_shutdown();
                if tokio::time::timeout(SHUTDOWN_GRACE, connection).await.is_err() {
                    warn!("connection did not drain in time");
                }
            }
        }
    }

    fn install_logging(&self) -> Result<(), ServerError> {
        let Some(level) = &self.config.log_level else {
            return Ok(());
        };
        let level = level.parse::<Level>().map_err(|_| ServerError::LogLevel(level.clone()))?;
        // another subscriber may already be installed by the application
        if tracing_subscriber::fmt().with_max_level(level).try_init().is_err() {
            debug!("global tracing subscriber already set");
        }
        Ok(())
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

fn tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, ServerError> {
    let open = |path: &Path| {
        std::fs::File::open(path)
            .map(BufReader::new)
            .map_err(|source| ServerError::TlsFile { path: path.to_owned(), source })
    };

    let certs = rustls_pemfile::certs(&mut open(cert_file)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ServerError::TlsFile { path: cert_file.to_owned(), source })?;
    let key = rustls_pemfile::private_key(&mut open(key_file)?)
        .map_err(|source| ServerError::TlsFile { path: key_file.to_owned(), source })?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", key_file.display())))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::router::{get, post};
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn hello(ctx: &mut Context) -> Result<(), WebError> {
        ctx.text(StatusCode::OK, "hello")
    }

    async fn slow(_ctx: &mut Context) -> Result<(), WebError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    fn server(configure: impl FnOnce(ServerBuilder) -> ServerBuilder) -> Server {
        let router = Router::builder()
            .route("/hello", get(handler_fn(hello)))
            .route("/hello", post(handler_fn(hello)))
            .route("/dir/", get(handler_fn(hello)))
            .route("/slow", get(handler_fn(slow)))
            .build()
            .unwrap();
        configure(Server::builder().router(router)).build().unwrap()
    }

    fn request(method: Method, uri: &str) -> Request<RequestBody> {
        Request::builder().method(method).uri(uri).body(RequestBody::empty()).unwrap()
    }

    async fn json(response: Response<ResponseBody>) -> Value {
        serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_and_method_not_allowed() {
        let server = server(|b| b);

        let response = server.dispatch(request(Method::GET, "/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["code"], 404);

        let response = server.dispatch(request(Method::DELETE, "/hello")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST");
    }

    #[tokio::test]
    async fn test_head_falls_back_to_get_without_body() {
        let server = server(|b| b);
        let response = server.dispatch(request(Method::HEAD, "/hello")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_strict_slash_redirects() {
        let server = server(|b| b.strict_slash(true));

        let response = server.dispatch(request(Method::GET, "/hello/?x=1")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/hello?x=1");

        let response = server.dispatch(request(Method::GET, "/dir")).await;
        assert_eq!(response.headers()[header::LOCATION], "/dir/");

        let lenient = self::server(|b| b).dispatch(request(Method::GET, "/hello/")).await;
        assert_eq!(lenient.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_write_timeout() {
        let server = server(|b| b.write_timeout(Duration::from_millis(20)));
        let response = server.dispatch(request(Method::GET, "/slow")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_cors_preflight_and_decoration() {
        let server = server(|b| b.cors(CorsConfig::default()));

        let preflight = Request::builder()
            .method(Method::OPTIONS)
            .uri("/hello")
            .header(header::ORIGIN, "https://app.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(RequestBody::empty())
            .unwrap();
        let response = server.dispatch(preflight).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let actual = Request::get("/hello")
            .header(header::ORIGIN, "https://app.example.com")
            .body(RequestBody::empty())
            .unwrap();
        let response = server.dispatch(actual).await;
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_documentation_endpoints() {
        let server = server(|b| b.openapi(OpenApiConfig::default().title("Greeter")));

        let response = server.dispatch(request(Method::GET, "/openapi.json")).await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let document = json(response).await;
        assert_eq!(document["info"]["title"], "Greeter");
        assert!(document["paths"]["/hello"]["post"].is_object());

        let response = server.dispatch(request(Method::GET, "/docs")).await;
        assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));

        let disabled = self::server(|b| b.openapi(OpenApiConfig { enabled: false, ..Default::default() }));
        let response = disabled.dispatch(request(Method::GET, "/openapi.json")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_custom_error_handler_and_state() {
        #[derive(Clone)]
        struct Greeting(&'static str);

        async fn greet(ctx: &mut Context) -> Result<(), WebError> {
            let text = ctx.state::<Greeting>().map(|g| g.0).unwrap_or("none");
            ctx.text(StatusCode::OK, text)
        }

        let router = Router::builder().route("/greet", get(handler_fn(greet))).build().unwrap();
        let server = Server::builder()
            .router(router)
            .state(Greeting("hi"))
            .error_handler(|ctx: &mut Context, status: StatusCode, message: &str, _err: Option<&WebError>| {
                ctx.text(status, format!("custom: {message}"))
            })
            .build()
            .unwrap();

        let response = server.dispatch(request(Method::GET, "/greet")).await;
        assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), "hi");

        let response = server.dispatch(request(Method::GET, "/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), "custom: no route for /nope");
    }

    #[test]
    fn test_build_errors() {
        assert!(matches!(Server::builder().build(), Err(ServerError::MissingRouter)));

        let router = Router::builder().build().unwrap();
        let cors = CorsConfig { allow_credentials: true, ..Default::default() };
        assert!(matches!(Server::builder().router(router).cors(cors).build(), Err(ServerError::Cors(_))));
    }

    #[tokio::test]
    async fn test_serve_with_shutdown() {
        let router = Router::builder().route("/hello", get(handler_fn(hello))).build().unwrap();
        let server = Server::builder().router(router).address(SocketAddr::from(([127, 0, 0, 1], 0))).build().unwrap();
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }

    async fn fetch(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_toggle_routes_while_serving() {
        let router = Router::builder().route("/hello", get(handler_fn(hello))).build().unwrap();
        let server = Server::builder().router(router).build().unwrap();
        let routes = server.routes();

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(listener, async {
            let _ = stop_rx.await;
        }));

        assert!(fetch(addr, "/hello").await.starts_with("HTTP/1.1 200"));

        routes.disable(Method::GET, "/hello").unwrap();
        assert!(fetch(addr, "/hello").await.starts_with("HTTP/1.1 404"));

        routes.enable(Method::GET, "/hello").unwrap();
        let response = fetch(addr, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        stop_tx.send(()).unwrap();
        assert!(serving.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_tls_handshake_does_not_block_shutdown() {
        let testdata = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata");
        let router = Router::builder().route("/hello", get(handler_fn(hello))).build().unwrap();
        let server = Server::builder()
            .router(router)
            .tls(testdata.join("localhost.crt"), testdata.join("localhost.key"))
            .read_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(listener, async {
            let _ = stop_rx.await;
        }));

        // connects but never sends a ClientHello
        let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(()).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), serving).await;
        assert!(stopped.expect("shutdown waited on the stalled handshake").unwrap().is_ok());
    }
}
