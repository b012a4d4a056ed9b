//! HTTP API for provisioning preview environments
//!
//! Endpoints:
//!   GET    /health                    liveness
//!   GET    /version                   package name and version
//!   POST   /api/v1/create             {"branch": "project.branch[.env]", "ip": "..."}
//!                                       an existing branch answers HTTP 200 with "code": 304
//!   DELETE /api/v1/delete             {"branch": "...", "ip": "..."}
//!   GET    /api/v1/projects/{branch}  stored record of a branch
//!   GET    /api/v1/pools/{ip}         port pool state of an IP

use crate::error::{json_error_response, ErrorCode, ProvisionError};
use crate::identifier::ProjectIdentifier;
use crate::lifecycle::{CreateOutcome, DeleteOutcome, LifecycleManager};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Body of create and delete requests
#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    pub branch: String,
    pub ip: String,
}

/// Body of create and delete responses
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct OperationResponse {
    pub code: u16,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl From<&CreateOutcome> for OperationResponse {
    fn from(outcome: &CreateOutcome) -> Self {
        let status = match outcome {
            CreateOutcome::Created { .. } => "Created",
            CreateOutcome::AlreadyProvisioned { .. } => "Not Modified",
        };
        Self {
            code: outcome.code(),
            status,
            ip: Some(outcome.ip().to_string()),
            port: Some(outcome.port()),
            message: Some(outcome.message()),
        }
    }
}

impl From<&DeleteOutcome> for OperationResponse {
    fn from(outcome: &DeleteOutcome) -> Self {
        match outcome {
            DeleteOutcome::Released { ip, port } => Self {
                code: outcome.code(),
                status: "Accepted",
                ip: Some(ip.clone()),
                port: Some(*port),
                message: Some(outcome.message()),
            },
            DeleteOutcome::NotFound => Self {
                code: outcome.code(),
                status: "Not Found",
                ip: None,
                port: None,
                message: None,
            },
        }
    }
}

/// Pool summary returned by `GET /api/v1/pools/{ip}`
#[derive(Debug, Serialize)]
struct PoolSummary {
    ip: String,
    size: usize,
    free: usize,
    allocated: Vec<u16>,
}

/// HTTP front end of the lifecycle manager
pub struct ApiServer {
    lifecycle: Arc<LifecycleManager>,
    base_domain: String,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        base_domain: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            lifecycle,
            base_domain: base_domain.into(),
            shutdown_rx,
        }
    }

    /// Bind `addr` and serve until shutdown
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            (Method::GET, "/version") => {
                let version = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }
            (Method::POST, "/api/v1/create") => self.create(req).await,
            (Method::DELETE, "/api/v1/delete") => self.delete(req).await,
            (Method::GET, path) if path.starts_with("/api/v1/projects/") => {
                let branch = path.strip_prefix("/api/v1/projects/").unwrap_or("");
                self.get_project(branch).await
            }
            (Method::GET, path) if path.starts_with("/api/v1/pools/") => {
                let ip = path.strip_prefix("/api/v1/pools/").unwrap_or("");
                self.get_pool(ip).await
            }
            _ => Ok(json_error_response(ErrorCode::NotFound, "Not found")),
        };

        Ok(response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error_response(ErrorCode::InternalError, format!("Internal error: {}", e))
        }))
    }

    async fn create(&self, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let (identifier, ip) = match read_provision_request(req).await? {
            Ok(parsed) => parsed,
            Err(e) => return Ok(provision_error_response(&e)),
        };

        let project_name = identifier.project.clone();
        let server_name = identifier.server_name(&self.base_domain);
        let lifecycle = Arc::clone(&self.lifecycle);

        let result = tokio::task::spawn_blocking(move || {
            lifecycle.create(identifier.key(), &ip, &project_name, &server_name)
        })
        .await?;

        match result {
            Ok(outcome) => {
                // 304 must not carry a body, so the code travels in the body only
                let status = match outcome {
                    CreateOutcome::Created { .. } => StatusCode::CREATED,
                    CreateOutcome::AlreadyProvisioned { .. } => StatusCode::OK,
                };
                let body = serde_json::to_string(&OperationResponse::from(&outcome))?;
                Ok(json_response(status, body))
            }
            Err(e) => Ok(provision_error_response(&e)),
        }
    }

    async fn delete(&self, req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>> {
        let (identifier, ip) = match read_provision_request(req).await? {
            Ok(parsed) => parsed,
            Err(e) => return Ok(provision_error_response(&e)),
        };

        let lifecycle = Arc::clone(&self.lifecycle);
        let result =
            tokio::task::spawn_blocking(move || lifecycle.delete(identifier.key(), &ip)).await?;

        match result {
            Ok(outcome) => {
                let status = match outcome {
                    DeleteOutcome::Released { .. } => StatusCode::ACCEPTED,
                    DeleteOutcome::NotFound => StatusCode::NOT_FOUND,
                };
                let body = serde_json::to_string(&OperationResponse::from(&outcome))?;
                Ok(json_response(status, body))
            }
            Err(e) => Ok(provision_error_response(&e)),
        }
    }

    async fn get_project(&self, branch: &str) -> Result<Response<Full<Bytes>>> {
        let identifier = match ProjectIdentifier::parse(branch) {
            Ok(identifier) => identifier,
            Err(e) => return Ok(provision_error_response(&e)),
        };

        let lifecycle = Arc::clone(&self.lifecycle);
        let result =
            tokio::task::spawn_blocking(move || lifecycle.project(identifier.key())).await?;

        match result {
            Ok(record) => Ok(json_response(StatusCode::OK, serde_json::to_string(&record)?)),
            Err(e) => Ok(provision_error_response(&e)),
        }
    }

    async fn get_pool(&self, ip: &str) -> Result<Response<Full<Bytes>>> {
        let ip = match normalize_ip(ip) {
            Ok(ip) => ip,
            Err(e) => return Ok(provision_error_response(&e)),
        };

        let lifecycle = Arc::clone(&self.lifecycle);
        let result = tokio::task::spawn_blocking(move || lifecycle.pool(&ip)).await?;

        match result {
            Ok(pool) => {
                let summary = PoolSummary {
                    ip: pool.ip.clone(),
                    size: pool.len(),
                    free: pool.free_count(),
                    allocated: pool.allocated(),
                };
                Ok(json_response(StatusCode::OK, serde_json::to_string(&summary)?))
            }
            Err(e) => Ok(provision_error_response(&e)),
        }
    }
}

/// Read and validate a create/delete body. The outer error is an I/O
/// failure, the inner one a client mistake.
async fn read_provision_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Result<(ProjectIdentifier, String), ProvisionError>> {
    let body = req.collect().await?.to_bytes();
    Ok(parse_provision_request(&body))
}

fn parse_provision_request(body: &[u8]) -> Result<(ProjectIdentifier, String), ProvisionError> {
    let request: ProvisionRequest = serde_json::from_slice(body)
        .map_err(|e| ProvisionError::InvalidInput(format!("Invalid JSON: {}", e)))?;

    let identifier = ProjectIdentifier::parse(&request.branch)?;
    let ip = normalize_ip(&request.ip)?;
    Ok((identifier, ip))
}

/// Canonical textual form of an IP address
fn normalize_ip(ip: &str) -> Result<String, ProvisionError> {
    ip.trim()
        .parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .map_err(|_| ProvisionError::InvalidInput(format!("'{}' is not an IP address", ip)))
}

fn provision_error_response(e: &ProvisionError) -> Response<Full<Bytes>> {
    match e {
        ProvisionError::InvalidInput(_)
        | ProvisionError::NotFound(_)
        | ProvisionError::Conflict(_) => {
            debug!(error = %e, "Request rejected");
        }
        _ => error!(error = %e, "Provisioning failed"),
    }
    json_error_response(e.error_code(), e.to_string())
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response")
}
