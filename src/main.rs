//! OpenStack Secrets Store CSI Provider
//!
//! Listens on `<volume-path>/openstack.sock` for mount requests from the
//! Secrets Store CSI driver and answers each one with freshly issued
//! OpenStack application credentials.
//!
//! # Usage
//!
//! ```bash
//! secrets-store-csi-driver-provider-openstack \
//!     --volume-path /etc/kubernetes/secrets-store-csi-providers
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use openstack_csi_provider::config::ProviderConfig;
use openstack_csi_provider::mount::MountOrchestrator;
use openstack_csi_provider::openstack::KeystoneBroker;
use openstack_csi_provider::server::{self, ProviderService};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "secrets-store-csi-driver-provider-openstack")]
#[command(about = "Secrets Store CSI driver provider issuing OpenStack application credentials")]
struct Args {
    /// Directory the driver scans for provider sockets
    #[arg(long, env = "VOLUME_PATH")]
    volume_path: Option<PathBuf>,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "PROVIDER_VERBOSE")]
    verbose: bool,
}

impl Args {
    /// Load the config file, if any, and apply command line overrides.
    fn load_config(&self) -> Result<ProviderConfig> {
        let mut config = match &self.config {
            Some(path) => ProviderConfig::from_file(path)?,
            None => ProviderConfig::default(),
        };
        if let Some(volume_path) = &self.volume_path {
            config.volume_path = volume_path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "{}={},openstack_csi_provider={}",
            env!("CARGO_CRATE_NAME"),
            log_level,
            log_level
        ))
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting OpenStack secrets-store provider");

    let config = args.load_config()?;
    let socket_path = config.socket_path();

    info!(
        socket = %socket_path.display(),
        concurrency = config.mount.concurrency,
        credential_ttl_secs = config.mount.credential_ttl_secs,
        identity_timeout_ms = config.identity.timeout_ms,
        "Configuration loaded"
    );

    let broker = KeystoneBroker::new(&config.identity).context("Failed to create identity client")?;
    let orchestrator = MountOrchestrator::new(Arc::new(broker), config.mount)
        .context("Failed to parse default template")?;
    let service = ProviderService::new(Arc::new(orchestrator));

    let listener = server::bind(&socket_path)?;
    server::serve(listener, &socket_path, service, server::shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["provider"]).unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/etc/kubernetes/secrets-store-csi-providers/openstack.sock")
        );
    }

    #[test]
    fn test_volume_path_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"volume-path": "/from/file", "mount": {"concurrency": 3}}"#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "provider",
            "--config",
            path.to_str().unwrap(),
            "--volume-path",
            "/from/flag",
        ])
        .unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.socket_path(), PathBuf::from("/from/flag/openstack.sock"));
        assert_eq!(config.mount.concurrency, 3);
    }

    #[test]
    fn test_invalid_config_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mount": {"concurrency": 0}}"#).unwrap();

        let args = Args::try_parse_from(["provider", "-c", path.to_str().unwrap()]).unwrap();
        assert!(args.load_config().is_err());
    }
}
