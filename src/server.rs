//! gRPC surface called by the Secrets Store CSI driver.
//!
//! The driver discovers providers by scanning its provider directory for
//! `<name>.sock` and speaks `v1alpha1.CSIDriverProvider` over it.

use anyhow::{Context, Result};
use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::broker::BrokerError;
use crate::mount::{MountError, MountOrchestrator, MountResponse, RenderedFile};
use crate::request::{MountRequest, ObjectVersion};

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("v1alpha1");
}

use proto::csi_driver_provider_server::{CsiDriverProvider, CsiDriverProviderServer};

/// Driver/provider API version.
pub const API_VERSION: &str = "v1alpha1";

/// Runtime name reported by `Version`.
pub const RUNTIME_NAME: &str = "secrets-store-csi-driver-provider-openstack";

/// `CSIDriverProvider` implementation.
#[derive(Clone)]
pub struct ProviderService {
    orchestrator: Arc<MountOrchestrator>,
}

impl ProviderService {
    pub fn new(orchestrator: Arc<MountOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[tonic::async_trait]
impl CsiDriverProvider for ProviderService {
    async fn version(
        &self,
        request: Request<proto::VersionRequest>,
    ) -> Result<Response<proto::VersionResponse>, Status> {
        debug!(driver_version = %request.get_ref().version, "Version requested");
        Ok(Response::new(proto::VersionResponse {
            version: API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn mount(
        &self,
        request: Request<proto::MountRequest>,
    ) -> Result<Response<proto::MountResponse>, Status> {
        let request = MountRequest::from(request.into_inner());
        let response = self
            .orchestrator
            .mount(&request)
            .await
            .map_err(|e| status_for(&e))?;

        info!(
            target_path = %request.target_path,
            files = response.files.len(),
            "Mount request completed"
        );
        Ok(Response::new(response.into()))
    }
}

impl From<proto::ObjectVersion> for ObjectVersion {
    fn from(v: proto::ObjectVersion) -> Self {
        Self {
            id: v.id,
            version: v.version,
        }
    }
}

impl From<ObjectVersion> for proto::ObjectVersion {
    fn from(v: ObjectVersion) -> Self {
        Self {
            id: v.id,
            version: v.version,
        }
    }
}

impl From<proto::MountRequest> for MountRequest {
    fn from(req: proto::MountRequest) -> Self {
        Self {
            target_path: req.target_path,
            attributes: req.attributes,
            secrets: req.secrets,
            permission: req.permission,
            current_object_version: req
                .current_object_version
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

impl From<RenderedFile> for proto::File {
    fn from(file: RenderedFile) -> Self {
        Self {
            path: file.path,
            // 0 tells the driver to fall back to the request permission
            mode: i32::try_from(file.mode).unwrap_or(0),
            contents: file.contents,
        }
    }
}

impl From<MountResponse> for proto::MountResponse {
    fn from(resp: MountResponse) -> Self {
        Self {
            object_version: resp.object_versions.into_iter().map(Into::into).collect(),
            error: None,
            files: resp.files.into_iter().map(Into::into).collect(),
        }
    }
}

/// Map a mount failure to the gRPC status returned to the driver.
pub fn status_for(error: &MountError) -> Status {
    let message = error.to_string();
    match error {
        MountError::Validation(_) | MountError::Manifest(_) | MountError::Render { .. } => {
            Status::invalid_argument(message)
        }
        MountError::Issuance {
            source: BrokerError::InvalidSecrets(_),
            ..
        } => Status::invalid_argument(message),
        MountError::Issuance { .. } => Status::unavailable(message),
        MountError::Timeout { .. } => Status::deadline_exceeded(message),
    }
}

/// Bind the provider socket, replacing a stale one left by a previous run.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match std::fs::remove_file(socket_path) {
        Ok(()) => debug!(socket = %socket_path.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to remove stale socket {}", socket_path.display())
            })
        }
    }
    UnixListener::bind(socket_path)
        .with_context(|| format!("failed to listen on {}", socket_path.display()))
}

/// Serve until `shutdown` resolves, then remove the socket.
pub async fn serve(
    listener: UnixListener,
    socket_path: &Path,
    service: ProviderService,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    info!(socket = %socket_path.display(), "Listening for driver requests");

    let result = Server::builder()
        .add_service(CsiDriverProviderServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .context("gRPC server failed");

    if let Err(e) = std::fs::remove_file(socket_path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(socket = %socket_path.display(), error = %e, "Failed to remove socket");
        }
    }
    info!("Provider stopped");
    result
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}
