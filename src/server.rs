//! HTTP front end
//!
//! Accepts HTTP/1.1 and HTTP/2 (optionally over TLS), collects each request
//! into an event and hands it to the [`Handler`]. Requests the backend could
//! never receive are answered here with a JSON rejection.

use crate::backend::{fits_argument, MAX_ARGUMENT_BYTES};
use crate::event::HttpEvent;
use crate::handler::Handler;
use crate::response::{AdapterResponse, Rejection};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// HTTP front end: one event and one backend run per request
pub struct AdapterServer {
    bind_addr: SocketAddr,
    handler: Arc<Handler>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    max_body_bytes: usize,
}

impl AdapterServer {
    pub fn new(
        bind_addr: SocketAddr,
        handler: Arc<Handler>,
        shutdown_rx: watch::Receiver<bool>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
            tls_acceptor: None,
            max_body_bytes,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown is signalled.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Adapter listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let max_body_bytes = self.max_body_bytes;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, handler, max_body_bytes, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handler, max_body_bytes, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Adapter server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<Handler>,
    max_body_bytes: usize,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { handle_request(req, handler, addr, max_body_bytes, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    handler: Arc<Handler>,
    client_addr: SocketAddr,
    max_body_bytes: usize,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(client = %client_addr, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let rejection = if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                AdapterResponse::rejected(
                    Rejection::PayloadTooLarge,
                    format!("Request body exceeds {} bytes", max_body_bytes),
                )
            } else {
                debug!(request_id, error = %e, "Failed to read request body");
                AdapterResponse::rejected(Rejection::BadRequest, "Failed to read request body")
            };
            return Ok(reject(rejection, &request_id));
        }
    };

    let event = match HttpEvent::from_parts(&parts, &body, &request_id, is_tls).to_value() {
        Ok(event) => event,
        Err(e) => {
            error!(request_id, error = %e, "Failed to serialize event");
            let rejection =
                AdapterResponse::rejected(Rejection::InternalError, "Failed to serialize event");
            return Ok(reject(rejection, &request_id));
        }
    };

    // Escaping and base64 can grow a body that passed the limit above
    let payload = event.to_string();
    if !fits_argument(&payload) {
        debug!(request_id, event_bytes = payload.len(), "Event too large for a process argument");
        let rejection = AdapterResponse::rejected(
            Rejection::PayloadTooLarge,
            format!("Request event exceeds {} bytes", MAX_ARGUMENT_BYTES),
        );
        return Ok(reject(rejection, &request_id));
    }

    let mut response = handler.handle(&event).await.into_hyper();
    debug!(request_id, status = response.status().as_u16(), "Request complete");
    set_request_id(&mut response, &request_id);
    Ok(response)
}

fn reject(rejection: AdapterResponse, request_id: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = rejection.into_hyper();
    set_request_id(&mut response, request_id);
    response
}

fn set_request_id<B>(response: &mut Response<B>, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
}

/// Build a TLS acceptor from PEM certificate and key files
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path, e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path, e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path)
}
