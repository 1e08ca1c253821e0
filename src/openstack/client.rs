//! Keystone v3 client issuing application credentials.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::auth::{AuthOptions, EndpointOptions};
use crate::broker::{BrokerError, CredentialBroker, IssueOptions, Issued, IssuedCredential};
use crate::config::IdentityConfig;
use crate::request::Secrets;

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const IDENTITY_SERVICE_TYPE: &str = "identity";

/// Keystone accepts microsecond precision without an offset.
const EXPIRES_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Credential broker backed by the OpenStack identity service.
///
/// Every call authenticates from scratch; tokens are never cached.
#[derive(Debug, Clone)]
pub struct KeystoneBroker {
    http: Client,
    default_interface: String,
}

/// An authenticated token and the parts of it we need.
struct Session {
    token: String,
    user_id: String,
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    user: TokenUser,
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct ApplicationCredentialResponse {
    application_credential: ApplicationCredential,
}

#[derive(Deserialize)]
struct ApplicationCredential {
    id: String,
    name: String,
    secret: String,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Request(e.to_string())
    }
}

impl KeystoneBroker {
    pub fn new(config: &IdentityConfig) -> Result<Self, BrokerError> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            default_interface: config.default_interface.clone(),
        })
    }

    /// `POST /v3/auth/tokens`.
    async fn authenticate(&self, opts: &AuthOptions) -> Result<Session, BrokerError> {
        let url = format!("{}auth/tokens", identity_v3_base(&opts.identity_endpoint));
        debug!(url = %url, "Authenticating against identity service");

        let response = self.http.post(&url).json(&opts.token_request()).send().await?;
        let response = match response.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(BrokerError::Authentication(error_message(response).await))
            }
            status if !status.is_success() => {
                return Err(BrokerError::Api {
                    status: status.as_u16(),
                    message: error_message(response).await,
                })
            }
            _ => response,
        };

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Response(format!("missing {SUBJECT_TOKEN_HEADER} header")))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Response(e.to_string()))?;

        Ok(Session {
            token,
            user_id: body.token.user.id,
            catalog: body.token.catalog,
        })
    }

    /// `POST /v3/users/{user_id}/application_credentials`.
    async fn create_application_credential(
        &self,
        session: &Session,
        base: &str,
        options: &IssueOptions,
    ) -> Result<IssuedCredential, BrokerError> {
        let url = format!("{base}users/{}/application_credentials", session.user_id);
        let body = json!({
            "application_credential": {
                "name": options.name,
                "description": options.description,
                "expires_at": options.expires_at.format(EXPIRES_AT_FORMAT).to_string(),
            }
        });

        let response = self
            .http
            .post(&url)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: error_message(response).await,
            });
        }

        let created: ApplicationCredentialResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Response(e.to_string()))?;
        let credential = created.application_credential;

        Ok(IssuedCredential::new(
            credential.id,
            credential.secret,
            credential.name,
            credential.expires_at.as_deref().and_then(parse_expiry),
        ))
    }
}

#[async_trait]
impl CredentialBroker for KeystoneBroker {
    async fn issue(&self, auth: &Secrets, options: &IssueOptions) -> Result<Issued, BrokerError> {
        let auth_options = AuthOptions::from_secrets(auth)?;
        let endpoint = EndpointOptions::from_secrets(auth, &self.default_interface);

        let session = self.authenticate(&auth_options).await?;
        let base = match &endpoint {
            Some(endpoint) => identity_v3_base(identity_endpoint(&session.catalog, endpoint)?),
            None => identity_v3_base(&auth_options.identity_endpoint),
        };

        let credential = self
            .create_application_credential(&session, &base, options)
            .await?;

        info!(
            credential_id = %credential.id,
            credential_name = %credential.name,
            user_id = %session.user_id,
            "Created application credential"
        );

        Ok(Issued {
            credential,
            auth_url: base,
        })
    }
}

/// Find the single identity endpoint URL for the requested interface and
/// region. More than one match is an error.
fn identity_endpoint<'a>(
    catalog: &'a [CatalogEntry],
    opts: &EndpointOptions,
) -> Result<&'a str, BrokerError> {
    let matches: Vec<&str> = catalog
        .iter()
        .filter(|entry| entry.service_type == IDENTITY_SERVICE_TYPE)
        .flat_map(|entry| entry.endpoints.iter())
        .filter(|endpoint| {
            endpoint.interface == opts.interface
                && opts.region.as_ref().map_or(true, |region| {
                    endpoint.region.as_ref() == Some(region)
                        || endpoint.region_id.as_ref() == Some(region)
                })
        })
        .map(|endpoint| endpoint.url.as_str())
        .collect();

    let region = opts.region.as_deref().unwrap_or("<any>");
    match matches.as_slice() {
        [url] => Ok(*url),
        [] => Err(BrokerError::EndpointNotFound(format!(
            "no {} {} endpoint in region {}",
            opts.interface, IDENTITY_SERVICE_TYPE, region
        ))),
        urls => Err(BrokerError::AmbiguousEndpoint(format!(
            "{} {} {} endpoints in region {}: {}",
            urls.len(),
            opts.interface,
            IDENTITY_SERVICE_TYPE,
            region,
            urls.join(", ")
        ))),
    }
}

/// Normalise an identity URL to its v3 resource base, ending in `v3/`.
pub(crate) fn identity_v3_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/v3") {
        format!("{trimmed}/")
    } else {
        format!("{trimmed}/v3/")
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Best-effort extraction of the Keystone error message.
async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| {
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                }
            }),
        Err(_) => status.to_string(),
    }
}
