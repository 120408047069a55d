//! Admin API on the loopback interface

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the adapter
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API: liveness and version, never touches the backend
pub struct AdminServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(|req: Request<Incoming>| async move { handle_admin_request(req).await });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_admin_request<B>(req: Request<B>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
