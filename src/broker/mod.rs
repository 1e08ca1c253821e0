//! Credential issuance seam.
//!
//! The mount pipeline only depends on [`CredentialBroker`]; the Keystone
//! implementation lives in [`crate::openstack`] and tests substitute their
//! own.

mod options;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::request::Secrets;

pub use options::{random_suffix, IssueOptions};

/// Errors returned by a credential broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid authentication secrets: {0}")]
    InvalidSecrets(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("identity endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("multiple identity endpoints found: {0}")]
    AmbiguousEndpoint(String),

    #[error("identity service request failed: {0}")]
    Request(String),

    #[error("identity service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed identity service response: {0}")]
    Response(String),
}

/// A freshly issued application credential.
#[derive(Clone, PartialEq)]
pub struct IssuedCredential {
    /// Credential identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Expiry reported by the identity service.
    pub expires_at: Option<DateTime<Utc>>,
    secret: String,
}

impl IssuedCredential {
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        name: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            expires_at,
            secret: secret.into(),
        }
    }

    /// The credential secret. Never log this.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expires_at", &self.expires_at)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Result of one issuance: the credential and the identity service base URL
/// it authenticates against.
#[derive(Debug, Clone, PartialEq)]
pub struct Issued {
    pub credential: IssuedCredential,
    pub auth_url: String,
}

/// Issues one credential per call.
///
/// Implementations must be safe to call concurrently and must not cache
/// results across calls.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    /// Issue a credential using `auth` to authenticate.
    async fn issue(&self, auth: &Secrets, options: &IssueOptions) -> Result<Issued, BrokerError>;
}

#[async_trait]
impl<T: CredentialBroker + ?Sized> CredentialBroker for Arc<T> {
    async fn issue(&self, auth: &Secrets, options: &IssueOptions) -> Result<Issued, BrokerError> {
        (**self).issue(auth, options).await
    }
}
