//! # HTTP Server
//!
//! HTTP/1 server built on Hyper and Tokio, feeding every request through
//! [`Application::handle`].
//!
//! ## Key Features
//!
//! - One task per connection
//! - Graceful shutdown on SIGINT/SIGTERM with a drain timeout
//! - Connection keep-alive support
//! - Request body limit enforced before the kernel runs

use crate::application::Application;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::router::Method;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Headers kept to render errors for requests that never became a [`Request`]
const NEGOTIATION_HEADERS: [&str; 3] = ["accept", "content-type", "x-requested-with"];

/// HTTP server
#[derive(Debug, Clone, Default)]
pub struct Server {
    config: ServerConfig,
}

impl Server {
    /// Create a new Server instance
    #[must_use]
    pub const fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Server configuration
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address with `SO_REUSEADDR` (and `SO_REUSEPORT`
    /// on unix)
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` if the socket cannot be bound.
    pub fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.address;
        let bind_error = |source| Error::BindError {
            address: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        #[cfg(unix)]
        {
            socket.set_reuseport(true).map_err(bind_error)?;
        }
        socket.bind(addr).map_err(bind_error)?;
        socket.listen(1024).map_err(bind_error)
    }

    /// Start the server with graceful shutdown on Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` if the address cannot be bound.
    pub async fn serve(&self, app: Arc<Application>) -> Result<()> {
        let listener = self.bind()?;
        self.serve_with_shutdown(listener, app, shutdown_signal())
            .await
    }

    /// Accept connections on `listener` until `shutdown` completes, then
    /// wait up to the shutdown timeout for open connections to finish
    ///
    /// # Errors
    ///
    /// None at present: accept failures are logged and retried rather than
    /// returned.
    pub async fn serve_with_shutdown<F>(
        &self,
        listener: TcpListener,
        app: Arc<Application>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Server listening on http://{}", addr);
        }

        let active = Arc::new(AtomicUsize::new(0));
        let max_body_size = self.config.max_body_size;
        let keep_alive = self.config.keep_alive;
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Typically EMFILE or a connection reset before accept
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let app = Arc::clone(&app);
                    let active = Arc::clone(&active);
                    let mut stop = stop_rx.clone();

                    active.fetch_add(1, Ordering::Relaxed);
                    tokio::task::spawn(async move {
                        let service = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            async move {
                                Ok::<_, Infallible>(
                                    handle_request(req, &app, remote_addr, max_body_size).await,
                                )
                            }
                        });

                        let conn = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service);
                        tokio::pin!(conn);

                        // Idle keep-alive connections close right away on
                        // shutdown; in-flight requests are answered first.
                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = stop.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.as_mut().await
                            }
                        };
                        if let Err(err) = result {
                            error!(error = ?err, "Error serving connection");
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = &mut shutdown => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let _ = stop_tx.send(true);
        let timeout = self.config.shutdown_timeout;
        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                open = active.load(Ordering::Relaxed),
                "Shutdown timeout elapsed with connections still open"
            );
        }
        Ok(())
    }
}

async fn handle_request(
    req: hyper::Request<Incoming>,
    app: &Application,
    remote_addr: SocketAddr,
    max_body_size: usize,
) -> hyper::Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let version = req.version();
    let head = method == hyper::Method::HEAD;
    let negotiation: HashMap<String, String> = NEGOTIATION_HEADERS
        .iter()
        .filter_map(|name| {
            req.headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| ((*name).to_string(), v.to_string()))
        })
        .collect();

    let response = match Request::from_hyper_with_limit(req, max_body_size).await {
        Ok(mut request) => {
            request.set_header("x-client-ip", &remote_addr.ip().to_string());
            app.handle(request).await
        }
        Err(err) => {
            let fallback = Request::new(
                Method::from_hyper(&method).unwrap_or(Method::Get),
                path.clone(),
                negotiation,
                None,
            );
            app.render_error(&fallback, &err)
        }
    };

    info!(
        "    {} - \"{} {} {:?}\" {}",
        remote_addr, method, path, version, response.status
    );
    response.into_hyper(head)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_server(max_body_size: usize) -> Server {
        Server::new(ServerConfig {
            address: ([127, 0, 0, 1], 0).into(),
            max_body_size,
            shutdown_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        })
    }

    fn test_app() -> Arc<Application> {
        let mut app = Application::new(AppConfig::default());
        app.router_mut()
            .get("/ping", |_req: Request| async { Ok("pong") })
            .unwrap();
        app.router_mut()
            .post("/echo", |req: Request| async move {
                Ok(req.body_str().unwrap_or_default().to_string())
            })
            .unwrap();
        app.bootstrap().unwrap();
        Arc::new(app)
    }

    async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn test_serves_requests_over_tcp() {
        let server = test_server(1024);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, test_app(), async {
                    let _ = rx.await;
                })
                .await
        });

        let ok = roundtrip(
            addr,
            "GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.contains("x-request-id"));
        assert!(ok.ends_with("pong"));

        let missing = roundtrip(
            addr,
            "GET /missing HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(missing.starts_with("HTTP/1.1 404"));
        assert!(missing.contains(r#""status":404"#));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_body_limit_is_413() {
        let server = test_server(8);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, test_app(), async {
                    let _ = rx.await;
                })
                .await
        });

        let small = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi",
        )
        .await;
        assert!(small.starts_with("HTTP/1.1 200"));
        assert!(small.ends_with("hi"));

        let large = roundtrip(
            addr,
            "POST /echo HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n14\r\n01234567890123456789\r\n0\r\n\r\n",
        )
        .await;
        assert!(large.starts_with("HTTP/1.1 413"));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_keep_alive_connections() {
        let server = Server::new(ServerConfig {
            address: ([127, 0, 0, 1], 0).into(),
            shutdown_timeout: Duration::from_secs(30),
            ..ServerConfig::default()
        });
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve_with_shutdown(listener, test_app(), async {
                    let _ = rx.await;
                })
                .await
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        while !String::from_utf8_lossy(&buf).ends_with("pong") {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the response");
            buf.extend_from_slice(&chunk[..n]);
        }

        tx.send(()).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(stopped.is_ok(), "server waited on an idle connection");

        let mut rest = Vec::new();
        let closed = stream.read_to_end(&mut rest).await;
        assert!(closed.is_err() || rest.is_empty());
    }

    #[test]
    fn test_bind_error_names_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let server = Server::new(ServerConfig {
            address: addr,
            ..ServerConfig::default()
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        // SO_REUSEPORT may let the bind succeed on some platforms
        if let Err(err) = runtime.block_on(async { server.bind() }) {
            assert!(err.to_string().contains(&addr.to_string()));
        }
    }
}
