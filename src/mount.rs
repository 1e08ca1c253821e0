//! Mount request pipeline.
//!
//! validate → parse manifest → (issue → render) per entry → assemble.
//! Any failure aborts the whole call; partial responses are never returned.

use chrono::{SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, CredentialBroker, IssueOptions};
use crate::config::MountSettings;
use crate::manifest::{parse_manifest, ManifestEntry, ManifestError};
use crate::request::{MountRequest, ObjectVersion, RequestError, Secrets};
use crate::template::{CloudConfig, TemplateError, TemplateRenderer};

/// Errors that fail a mount call.
#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Validation(#[from] RequestError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to create application credential for {file_name}, error: {source}")]
    Issuance {
        file_name: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to render contents for {file_name}, error: {source}")]
    Render {
        file_name: String,
        #[source]
        source: TemplateError,
    },

    #[error("timed out after {timeout:?} creating application credential for {file_name}")]
    Timeout { file_name: String, timeout: Duration },
}

/// A rendered file. Contents hold credential secrets and are not printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedFile {
    /// Path relative to the mount target.
    pub path: String,
    /// File mode requested by the driver.
    pub mode: u32,
    pub contents: Vec<u8>,
}

impl fmt::Debug for RenderedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedFile")
            .field("path", &self.path)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .finish()
    }
}

/// Index-aligned files and object versions, one per manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountResponse {
    pub files: Vec<RenderedFile>,
    pub object_versions: Vec<ObjectVersion>,
}

/// Drives one mount call end to end.
pub struct MountOrchestrator {
    broker: Arc<dyn CredentialBroker>,
    renderer: TemplateRenderer,
    settings: MountSettings,
}

impl MountOrchestrator {
    /// Create an orchestrator; fails when the configured default template
    /// does not parse.
    pub fn new(
        broker: Arc<dyn CredentialBroker>,
        settings: MountSettings,
    ) -> Result<Self, TemplateError> {
        let renderer = TemplateRenderer::new(&settings.default_template)?;
        Ok(Self {
            broker,
            renderer,
            settings,
        })
    }

    /// Process a mount request.
    pub async fn mount(&self, request: &MountRequest) -> Result<MountResponse, MountError> {
        let validated = request.validate()?;
        let entries = parse_manifest(&validated.attributes)?;

        info!(
            target_path = %validated.target_path.display(),
            entries = entries.len(),
            "Processing mount request"
        );

        // Futures are inert until `buffered` polls them. It yields in manifest
        // order, so the first error surfaced is the first by manifest order;
        // dropping the stream cancels the rest.
        let pending: Vec<_> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                self.provision(index, entry, &validated.secrets, validated.permission)
            })
            .collect();
        let provisioned: Vec<(RenderedFile, ObjectVersion)> = stream::iter(pending)
            .buffered(self.settings.concurrency.max(1))
            .try_collect()
            .await
            .inspect_err(|e| warn!(error = %e, "Mount request failed"))?;

        let (files, object_versions) = provisioned.into_iter().unzip();
        Ok(MountResponse {
            files,
            object_versions,
        })
    }

    /// Issue and render the credential for one manifest entry.
    async fn provision(
        &self,
        index: usize,
        entry: &ManifestEntry,
        secrets: &Secrets,
        permission: u32,
    ) -> Result<(RenderedFile, ObjectVersion), MountError> {
        let options = IssueOptions::for_entry(&self.settings, index, Utc::now());
        debug!(
            file_name = %entry.file_name,
            credential_name = %options.name,
            expires_at = %options.expires_at,
            "Issuing application credential"
        );

        let timeout = self.settings.issue_timeout();
        let issued = tokio::time::timeout(timeout, self.broker.issue(secrets, &options))
            .await
            .map_err(|_| MountError::Timeout {
                file_name: entry.file_name.clone(),
                timeout,
            })?
            .map_err(|source| MountError::Issuance {
                file_name: entry.file_name.clone(),
                source,
            })?;

        let contents = self
            .renderer
            .render(entry.template.as_deref(), &CloudConfig::from_issued(&issued))
            .map_err(|source| MountError::Render {
                file_name: entry.file_name.clone(),
                source,
            })?;

        debug!(
            file_name = %entry.file_name,
            credential_id = %issued.credential.id,
            bytes = contents.len(),
            "Rendered application credential"
        );

        let version = issued
            .credential
            .expires_at
            .unwrap_or(options.expires_at)
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        Ok((
            RenderedFile {
                path: entry.file_name.clone(),
                mode: permission,
                contents,
            },
            ObjectVersion {
                id: issued.credential.id,
                version,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Issued, IssuedCredential};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Broker that records every call and answers from a script.
    #[derive(Default)]
    struct RecordingBroker {
        calls: Mutex<Vec<IssueOptions>>,
        /// Fail the n-th call (0-based).
        fail_on: Option<usize>,
        /// Fail every call.
        fail_all: bool,
        /// Sleep per call, indexed by call number.
        delays: Vec<Duration>,
    }

    impl RecordingBroker {
        fn calls(&self) -> Vec<IssueOptions> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CredentialBroker for RecordingBroker {
        async fn issue(
            &self,
            auth: &Secrets,
            options: &IssueOptions,
        ) -> Result<Issued, BrokerError> {
            assert_eq!(auth.get("OS_AUTH_URL"), Some("http://localhost:5000/v3"));
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(options.clone());
                calls.len() - 1
            };

            if let Some(delay) = self.delays.get(call) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail_all || self.fail_on == Some(call) {
                return Err(BrokerError::Api {
                    status: 403,
                    message: format!("call {} rejected", call),
                });
            }

            let id = if call == 0 {
                "abcdef1234".to_string()
            } else {
                format!("cred-{}", call)
            };
            Ok(Issued {
                credential: IssuedCredential::new(
                    id,
                    "random-generated-secret",
                    options.name.clone(),
                    Some(options.expires_at),
                ),
                auth_url: "http://localhost:5000/v3/".to_string(),
            })
        }
    }

    fn request(manifest: &str) -> MountRequest {
        let attributes = HashMap::from([("applicationCredentials", manifest)]);
        MountRequest {
            target_path: "/openstack-auth".to_string(),
            attributes: serde_json::to_string(&attributes).unwrap(),
            secrets: r#"{"OS_AUTH_URL": "http://localhost:5000/v3", "OS_USERNAME": "demo", "OS_PASSWORD": "pw"}"#.to_string(),
            permission: "420".to_string(),
            current_object_version: Vec::new(),
        }
    }

    fn orchestrator(broker: Arc<RecordingBroker>, settings: MountSettings) -> MountOrchestrator {
        MountOrchestrator::new(broker, settings).unwrap()
    }

    #[tokio::test]
    async fn test_default_template_mount() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let response = orch
            .mount(&request("- fileName: secure-clouds.yaml\n"))
            .await
            .unwrap();

        assert_eq!(response.files.len(), 1);
        assert_eq!(response.object_versions.len(), 1);
        assert_eq!(response.files[0].path, "secure-clouds.yaml");
        assert_eq!(response.files[0].mode, 0o644);
        assert_eq!(
            String::from_utf8(response.files[0].contents.clone()).unwrap(),
            r#"clouds:
  secrets-store-csi:
    auth:
      application_credential_id: "abcdef1234"
      application_credential_secret: "random-generated-secret"
      auth_url: "http://localhost:5000/v3/"
    auth_type: "v3applicationcredential"
"#
        );

        let calls = broker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(response.object_versions[0].id, "abcdef1234");
        assert_eq!(
            response.object_versions[0].version,
            calls[0]
                .expires_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        );
    }

    #[tokio::test]
    async fn test_custom_template_mount() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker, MountSettings::default());

        let manifest = "- fileName: env.sh\n  template: |\n    {{ .AuthInfo.ApplicationCredentialID }} {{ .AuthInfo.ApplicationCredentialSecret }} {{ .AuthInfo.AuthURL }} {{ .AuthType }}\n";
        let response = orch.mount(&request(manifest)).await.unwrap();

        assert_eq!(
            String::from_utf8(response.files[0].contents.clone()).unwrap(),
            "abcdef1234 random-generated-secret http://localhost:5000/v3/ v3applicationcredential\n"
        );
    }

    #[tokio::test]
    async fn test_empty_manifest_mount() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let response = orch.mount(&request("[]")).await.unwrap();
        assert_eq!(response, MountResponse::default());
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_path_makes_no_calls() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let req = MountRequest {
            target_path: String::new(),
            ..request("- fileName: a.yaml\n")
        };
        let err = orch.mount(&req).await.unwrap_err();
        assert!(matches!(
            err,
            MountError::Validation(RequestError::MissingTargetPath)
        ));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_secrets_fail_before_manifest() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        // Manifest is also missing; the secrets check must win
        let req = MountRequest {
            attributes: "{}".to_string(),
            secrets: "{}".to_string(),
            ..request("")
        };
        let err = orch.mount(&req).await.unwrap_err();
        assert!(matches!(
            err,
            MountError::Validation(RequestError::MissingSecrets)
        ));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let req = MountRequest {
            attributes: r#"{"other": "x"}"#.to_string(),
            ..request("")
        };
        assert!(matches!(
            orch.mount(&req).await,
            Err(MountError::Manifest(ManifestError::Missing))
        ));
        assert!(matches!(
            orch.mount(&request("")).await,
            Err(MountError::Manifest(ManifestError::Missing))
        ));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_multi_entry_mount_in_order() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let manifest = "- fileName: one.yaml\n- fileName: two.yaml\n- fileName: three.yaml\n";
        let response = orch.mount(&request(manifest)).await.unwrap();

        let paths: Vec<&str> = response.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["one.yaml", "two.yaml", "three.yaml"]);
        let ids: Vec<&str> = response
            .object_versions
            .iter()
            .map(|v| v.id.as_str())
            .collect();
        assert_eq!(ids, vec!["abcdef1234", "cred-1", "cred-2"]);

        let calls = broker.calls();
        assert_eq!(calls.len(), 3);
        let names: std::collections::HashSet<&str> =
            calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_broker_failure_discards_everything() {
        let broker = Arc::new(RecordingBroker {
            fail_on: Some(1),
            ..Default::default()
        });
        let orch = orchestrator(broker.clone(), MountSettings::default());

        let manifest = "- fileName: one.yaml\n- fileName: two.yaml\n- fileName: three.yaml\n";
        let err = orch.mount(&request(manifest)).await.unwrap_err();
        match err {
            MountError::Issuance { file_name, source } => {
                assert_eq!(file_name, "two.yaml");
                assert!(matches!(source, BrokerError::Api { status: 403, .. }));
            }
            other => panic!("expected issuance error, got {:?}", other),
        }
        // Sequential by default: nothing after the failing entry is issued
        assert_eq!(broker.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_render_failure_names_entry() {
        let broker = Arc::new(RecordingBroker::default());
        let orch = orchestrator(broker, MountSettings::default());

        let manifest = "- fileName: ok.yaml\n- fileName: broken.yaml\n  template: \"{{ .Nope }}\"\n";
        match orch.mount(&request(manifest)).await.unwrap_err() {
            MountError::Render { file_name, source } => {
                assert_eq!(file_name, "broken.yaml");
                assert!(matches!(source, TemplateError::Execute(_)));
            }
            other => panic!("expected render error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mount_keeps_manifest_order() {
        let broker = Arc::new(RecordingBroker {
            delays: vec![
                Duration::from_millis(300),
                Duration::from_millis(200),
                Duration::from_millis(100),
            ],
            ..Default::default()
        });
        let settings = MountSettings {
            concurrency: 3,
            ..Default::default()
        };
        let orch = orchestrator(broker.clone(), settings);

        let manifest = "- fileName: one.yaml\n- fileName: two.yaml\n- fileName: three.yaml\n";
        let response = orch.mount(&request(manifest)).await.unwrap();

        let paths: Vec<&str> = response.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["one.yaml", "two.yaml", "three.yaml"]);
        assert_eq!(response.object_versions.len(), 3);
        assert_eq!(broker.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failure_reports_first_by_manifest_order() {
        // The first entry finishes last, yet its error is the one reported
        let broker = Arc::new(RecordingBroker {
            fail_all: true,
            delays: vec![
                Duration::from_millis(300),
                Duration::from_millis(10),
                Duration::from_millis(10),
            ],
            ..Default::default()
        });
        let settings = MountSettings {
            concurrency: 3,
            ..Default::default()
        };
        let orch = orchestrator(broker, settings);

        let manifest = "- fileName: one.yaml\n- fileName: two.yaml\n- fileName: three.yaml\n";
        match orch.mount(&request(manifest)).await.unwrap_err() {
            MountError::Issuance { file_name, .. } => assert_eq!(file_name, "one.yaml"),
            other => panic!("expected issuance error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_issuance_timeout() {
        let broker = Arc::new(RecordingBroker {
            delays: vec![Duration::from_secs(120)],
            ..Default::default()
        });
        let orch = orchestrator(broker, MountSettings::default());

        match orch.mount(&request("- fileName: slow.yaml\n")).await.unwrap_err() {
            MountError::Timeout { file_name, timeout } => {
                assert_eq!(file_name, "slow.yaml");
                assert_eq!(timeout, Duration::from_secs(60));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    /// Sets its flag when the issuance future holding it is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Broker whose issuance never completes.
    #[derive(Default)]
    struct StalledBroker {
        calls: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CredentialBroker for StalledBroker {
        async fn issue(
            &self,
            _auth: &Secrets,
            options: &IssueOptions,
        ) -> Result<Issued, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _flag = DropFlag(self.dropped.clone());
            std::future::pending::<()>().await;
            Err(BrokerError::Request(format!("{} never completes", options.name)))
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_mount_future_is_send() {
        let orch = orchestrator(Arc::new(RecordingBroker::default()), MountSettings::default());
        let request = request("- fileName: a.yaml\n");
        let mount = orch.mount(&request);
        assert_send(&mount);
    }

    #[tokio::test]
    async fn test_dropping_mount_cancels_inflight_issuance() {
        let broker = Arc::new(StalledBroker::default());
        let orch = MountOrchestrator::new(broker.clone(), MountSettings::default()).unwrap();
        let request = request("- fileName: one.yaml\n- fileName: two.yaml\n");

        let mut mount = Box::pin(orch.mount(&request));
        assert!(futures::poll!(mount.as_mut()).is_pending());
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
        assert!(!broker.dropped.load(Ordering::SeqCst));

        drop(mount);
        assert!(broker.dropped.load(Ordering::SeqCst));

        // Nothing is issued after cancellation
        tokio::task::yield_now().await;
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_aborts_concurrent_issuance() {
        let broker = Arc::new(StalledBroker::default());
        let settings = MountSettings {
            concurrency: 2,
            ..Default::default()
        };
        let orch = MountOrchestrator::new(broker.clone(), settings).unwrap();
        let request = request("- fileName: one.yaml\n- fileName: two.yaml\n- fileName: three.yaml\n");

        let result = tokio::time::timeout(Duration::from_secs(1), orch.mount(&request)).await;
        assert!(result.is_err());
        assert!(broker.dropped.load(Ordering::SeqCst));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rendered_file_debug_hides_contents() {
        let file = RenderedFile {
            path: "clouds.yaml".to_string(),
            mode: 0o640,
            contents: b"application_credential_secret: s3cr3t".to_vec(),
        };
        let debug = format!("{:?}", file);
        assert!(debug.contains("clouds.yaml"));
        assert!(debug.contains("640"));
        assert!(!debug.contains("s3cr3t"));
    }
}
