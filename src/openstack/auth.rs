//! Authentication options decoded from the node publish secret.
//!
//! Keys mirror the `OS_*` environment variables understood by the OpenStack
//! CLI, and the required-key combinations are checked in the same order so
//! that secrets which work for `openstack` work here too.

use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

use crate::request::Secrets;

pub const OS_AUTH_URL: &str = "OS_AUTH_URL";
pub const OS_USERNAME: &str = "OS_USERNAME";
pub const OS_USERID: &str = "OS_USERID";
pub const OS_PASSWORD: &str = "OS_PASSWORD";
pub const OS_PASSCODE: &str = "OS_PASSCODE";
pub const OS_TENANT_ID: &str = "OS_TENANT_ID";
pub const OS_TENANT_NAME: &str = "OS_TENANT_NAME";
pub const OS_PROJECT_ID: &str = "OS_PROJECT_ID";
pub const OS_PROJECT_NAME: &str = "OS_PROJECT_NAME";
pub const OS_DOMAIN_ID: &str = "OS_DOMAIN_ID";
pub const OS_DOMAIN_NAME: &str = "OS_DOMAIN_NAME";
pub const OS_APPLICATION_CREDENTIAL_ID: &str = "OS_APPLICATION_CREDENTIAL_ID";
pub const OS_APPLICATION_CREDENTIAL_NAME: &str = "OS_APPLICATION_CREDENTIAL_NAME";
pub const OS_APPLICATION_CREDENTIAL_SECRET: &str = "OS_APPLICATION_CREDENTIAL_SECRET";
pub const OS_SYSTEM_SCOPE: &str = "OS_SYSTEM_SCOPE";
pub const OS_INTERFACE: &str = "OS_INTERFACE";
pub const OS_REGION_NAME: &str = "OS_REGION_NAME";

const USER_KEYS: &[&str] = &[OS_USERID, OS_USERNAME];
const DOMAIN_KEYS: &[&str] = &[OS_DOMAIN_ID, OS_DOMAIN_NAME];

/// Missing-key combinations in the authentication secrets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthOptionsError {
    #[error("Missing environment variable [{0}]")]
    MissingVariable(&'static str),

    #[error("Missing one of the following environment variables [{}]", .0.join(", "))]
    MissingAnyOf(&'static [&'static str]),
}

/// Keystone v3 authentication options.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthOptions {
    pub identity_endpoint: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub passcode: Option<String>,
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,
    pub domain_id: Option<String>,
    pub domain_name: Option<String>,
    pub application_credential_id: Option<String>,
    pub application_credential_name: Option<String>,
    pub application_credential_secret: Option<String>,
    pub system_scope: bool,
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthOptions")
            .field("identity_endpoint", &self.identity_endpoint)
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("passcode", &redact(&self.passcode))
            .field("tenant_id", &self.tenant_id)
            .field("tenant_name", &self.tenant_name)
            .field("domain_id", &self.domain_id)
            .field("domain_name", &self.domain_name)
            .field("application_credential_id", &self.application_credential_id)
            .field("application_credential_name", &self.application_credential_name)
            .field(
                "application_credential_secret",
                &redact(&self.application_credential_secret),
            )
            .field("system_scope", &self.system_scope)
            .finish()
    }
}

impl AuthOptions {
    /// Decode and check the `OS_*` keys.
    pub fn from_secrets(secrets: &Secrets) -> Result<Self, AuthOptionsError> {
        let get = |key: &str| secrets.get(key).map(str::to_string);

        let auth_url = get(OS_AUTH_URL);
        let username = get(OS_USERNAME);
        let user_id = get(OS_USERID);
        let password = get(OS_PASSWORD);
        let passcode = get(OS_PASSCODE);
        // Project keys take precedence over the legacy tenant keys
        let tenant_id = get(OS_PROJECT_ID).or_else(|| get(OS_TENANT_ID));
        let tenant_name = get(OS_PROJECT_NAME).or_else(|| get(OS_TENANT_NAME));
        let domain_id = get(OS_DOMAIN_ID);
        let domain_name = get(OS_DOMAIN_NAME);
        let app_cred_id = get(OS_APPLICATION_CREDENTIAL_ID);
        let app_cred_name = get(OS_APPLICATION_CREDENTIAL_NAME);
        let app_cred_secret = get(OS_APPLICATION_CREDENTIAL_SECRET);
        let system_scope = secrets.get(OS_SYSTEM_SCOPE) == Some("all");

        let identity_endpoint = auth_url.ok_or(AuthOptionsError::MissingVariable(OS_AUTH_URL))?;

        let has_user = user_id.is_some() || username.is_some();
        let has_domain = domain_id.is_some() || domain_name.is_some();

        // An application credential id or secret stands in for the user
        if !has_user && app_cred_id.is_none() && app_cred_secret.is_none() {
            return Err(AuthOptionsError::MissingAnyOf(USER_KEYS));
        }

        // TOTP-only setups are rare, so only the password is reported
        if password.is_none()
            && passcode.is_none()
            && app_cred_id.is_none()
            && app_cred_name.is_none()
        {
            return Err(AuthOptionsError::MissingVariable(OS_PASSWORD));
        }

        if (app_cred_id.is_some() || app_cred_name.is_some()) && app_cred_secret.is_none() {
            return Err(AuthOptionsError::MissingVariable(
                OS_APPLICATION_CREDENTIAL_SECRET,
            ));
        }

        if !has_domain && tenant_id.is_none() && tenant_name.is_some() {
            return Err(AuthOptionsError::MissingVariable(OS_PROJECT_ID));
        }

        if app_cred_id.is_none() && app_cred_name.is_some() && app_cred_secret.is_some() {
            if !has_user {
                return Err(AuthOptionsError::MissingAnyOf(USER_KEYS));
            }
            if username.is_some() && !has_domain {
                return Err(AuthOptionsError::MissingAnyOf(DOMAIN_KEYS));
            }
        }

        Ok(Self {
            identity_endpoint,
            user_id,
            username,
            password,
            passcode,
            tenant_id,
            tenant_name,
            domain_id,
            domain_name,
            application_credential_id: app_cred_id,
            application_credential_name: app_cred_name,
            application_credential_secret: app_cred_secret,
            system_scope,
        })
    }

    /// `{"id": ..}` or `{"name": ..}` for the configured domain.
    fn domain(&self) -> Option<Value> {
        match (&self.domain_id, &self.domain_name) {
            (Some(id), _) => Some(json!({ "id": id })),
            (None, Some(name)) => Some(json!({ "name": name })),
            (None, None) => None,
        }
    }

    /// The user reference for password, TOTP and named application
    /// credential methods.
    fn user(&self) -> Map<String, Value> {
        let mut user = Map::new();
        if let Some(id) = &self.user_id {
            user.insert("id".to_string(), json!(id));
        } else if let Some(name) = &self.username {
            user.insert("name".to_string(), json!(name));
            if let Some(domain) = self.domain() {
                user.insert("domain".to_string(), domain);
            }
        }
        user
    }

    fn identity(&self) -> Value {
        if let Some(secret) = &self.application_credential_secret {
            if let Some(id) = &self.application_credential_id {
                return json!({
                    "methods": ["application_credential"],
                    "application_credential": { "id": id, "secret": secret },
                });
            }
            if let Some(name) = &self.application_credential_name {
                return json!({
                    "methods": ["application_credential"],
                    "application_credential": {
                        "name": name,
                        "secret": secret,
                        "user": self.user(),
                    },
                });
            }
        }

        let mut methods = Vec::new();
        let mut identity = Map::new();
        if let Some(password) = &self.password {
            let mut user = self.user();
            user.insert("password".to_string(), json!(password));
            methods.push("password");
            identity.insert("password".to_string(), json!({ "user": user }));
        }
        if let Some(passcode) = &self.passcode {
            let mut user = self.user();
            user.insert("passcode".to_string(), json!(passcode));
            methods.push("totp");
            identity.insert("totp".to_string(), json!({ "user": user }));
        }
        identity.insert("methods".to_string(), json!(methods));
        Value::Object(identity)
    }

    fn scope(&self) -> Option<Value> {
        // Application credentials carry their own scope
        if self.application_credential_secret.is_some() {
            return None;
        }
        if self.system_scope {
            return Some(json!({ "system": { "all": true } }));
        }
        if let Some(id) = &self.tenant_id {
            return Some(json!({ "project": { "id": id } }));
        }
        if let Some(name) = &self.tenant_name {
            let mut project = Map::new();
            project.insert("name".to_string(), json!(name));
            if let Some(domain) = self.domain() {
                project.insert("domain".to_string(), domain);
            }
            return Some(json!({ "project": project }));
        }
        None
    }

    /// Body of `POST /v3/auth/tokens`.
    pub fn token_request(&self) -> Value {
        let mut auth = Map::new();
        auth.insert("identity".to_string(), self.identity());
        if let Some(scope) = self.scope() {
            auth.insert("scope".to_string(), scope);
        }
        json!({ "auth": auth })
    }
}

/// Catalog endpoint selection hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOptions {
    /// `public`, `internal` or `admin`.
    pub interface: String,
    pub region: Option<String>,
}

impl EndpointOptions {
    /// Catalog hints from the secrets, or `None` when neither `OS_INTERFACE`
    /// nor `OS_REGION_NAME` is set and the auth URL should be used as is.
    pub fn from_secrets(secrets: &Secrets, default_interface: &str) -> Option<Self> {
        let interface = secrets.get(OS_INTERFACE);
        let region = secrets.get(OS_REGION_NAME);
        if interface.is_none() && region.is_none() {
            return None;
        }
        Some(Self {
            interface: interface
                .unwrap_or(default_interface)
                .trim_end_matches("URL")
                .to_string(),
            region: region.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(pairs: &[(&str, &str)]) -> Secrets {
        pairs.iter().copied().collect()
    }

    const URL: (&str, &str) = (OS_AUTH_URL, "http://localhost:5000/v3");

    #[test]
    fn test_password_auth() {
        let opts = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERNAME, "demo"),
            (OS_PASSWORD, "pw"),
            (OS_DOMAIN_NAME, "Default"),
            (OS_TENANT_NAME, "legacy"),
            (OS_PROJECT_NAME, "demo-project"),
        ]))
        .unwrap();

        assert_eq!(opts.identity_endpoint, "http://localhost:5000/v3");
        assert_eq!(opts.tenant_name.as_deref(), Some("demo-project"));
        assert!(!opts.system_scope);

        assert_eq!(
            opts.token_request(),
            json!({
                "auth": {
                    "identity": {
                        "methods": ["password"],
                        "password": {
                            "user": {
                                "name": "demo",
                                "domain": { "name": "Default" },
                                "password": "pw",
                            }
                        }
                    },
                    "scope": {
                        "project": { "name": "demo-project", "domain": { "name": "Default" } }
                    }
                }
            })
        );
    }

    #[test]
    fn test_application_credential_auth_needs_no_user() {
        let opts = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_APPLICATION_CREDENTIAL_ID, "ac-id"),
            (OS_APPLICATION_CREDENTIAL_SECRET, "ac-secret"),
            (OS_PROJECT_ID, "ignored"),
        ]))
        .unwrap();

        assert_eq!(
            opts.token_request(),
            json!({
                "auth": {
                    "identity": {
                        "methods": ["application_credential"],
                        "application_credential": { "id": "ac-id", "secret": "ac-secret" }
                    }
                }
            })
        );
    }

    #[test]
    fn test_named_application_credential_auth() {
        let opts = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERID, "u-1"),
            (OS_APPLICATION_CREDENTIAL_NAME, "ac"),
            (OS_APPLICATION_CREDENTIAL_SECRET, "ac-secret"),
        ]))
        .unwrap();

        assert_eq!(
            opts.token_request()["auth"]["identity"]["application_credential"],
            json!({ "name": "ac", "secret": "ac-secret", "user": { "id": "u-1" } })
        );
    }

    #[test]
    fn test_totp_and_system_scope() {
        let opts = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERID, "u-1"),
            (OS_PASSWORD, "pw"),
            (OS_PASSCODE, "123456"),
            (OS_SYSTEM_SCOPE, "all"),
        ]))
        .unwrap();

        let body = opts.token_request();
        assert_eq!(
            body["auth"]["identity"]["methods"],
            json!(["password", "totp"])
        );
        assert_eq!(
            body["auth"]["identity"]["totp"]["user"],
            json!({ "id": "u-1", "passcode": "123456" })
        );
        assert_eq!(body["auth"]["scope"], json!({ "system": { "all": true } }));
    }

    #[test]
    fn test_missing_auth_url() {
        let err = AuthOptions::from_secrets(&secrets(&[(OS_USERNAME, "demo")])).unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingVariable(OS_AUTH_URL));
        assert_eq!(err.to_string(), "Missing environment variable [OS_AUTH_URL]");
    }

    #[test]
    fn test_missing_user() {
        let err = AuthOptions::from_secrets(&secrets(&[URL, (OS_PASSWORD, "pw")])).unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingAnyOf(USER_KEYS));
        assert_eq!(
            err.to_string(),
            "Missing one of the following environment variables [OS_USERID, OS_USERNAME]"
        );
    }

    #[test]
    fn test_missing_password() {
        let err = AuthOptions::from_secrets(&secrets(&[URL, (OS_USERNAME, "demo")])).unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingVariable(OS_PASSWORD));
    }

    #[test]
    fn test_missing_application_credential_secret() {
        let err = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERNAME, "demo"),
            (OS_APPLICATION_CREDENTIAL_NAME, "ac"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            AuthOptionsError::MissingVariable(OS_APPLICATION_CREDENTIAL_SECRET)
        );
    }

    #[test]
    fn test_project_name_needs_domain_or_id() {
        let err = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERID, "u-1"),
            (OS_PASSWORD, "pw"),
            (OS_PROJECT_NAME, "demo"),
        ]))
        .unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingVariable(OS_PROJECT_ID));
    }

    #[test]
    fn test_named_application_credential_requirements() {
        // The secret alone satisfies the generic user check, the named
        // credential check still wants a user
        let err = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_APPLICATION_CREDENTIAL_NAME, "ac"),
            (OS_APPLICATION_CREDENTIAL_SECRET, "s"),
        ]))
        .unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingAnyOf(USER_KEYS));

        let err = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERNAME, "demo"),
            (OS_APPLICATION_CREDENTIAL_NAME, "ac"),
            (OS_APPLICATION_CREDENTIAL_SECRET, "s"),
        ]))
        .unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingAnyOf(DOMAIN_KEYS));
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let err = AuthOptions::from_secrets(&secrets(&[(OS_AUTH_URL, "")])).unwrap_err();
        assert_eq!(err, AuthOptionsError::MissingVariable(OS_AUTH_URL));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let opts = AuthOptions::from_secrets(&secrets(&[
            URL,
            (OS_USERID, "u-1"),
            (OS_PASSWORD, "hunter2"),
        ]))
        .unwrap();
        let debug = format!("{:?}", opts);
        assert!(debug.contains("u-1"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_endpoint_options() {
        let opts = EndpointOptions::from_secrets(
            &secrets(&[(OS_INTERFACE, "internalURL"), (OS_REGION_NAME, "RegionOne")]),
            "public",
        )
        .unwrap();
        assert_eq!(opts.interface, "internal");
        assert_eq!(opts.region.as_deref(), Some("RegionOne"));

        // A region alone selects the default interface
        let opts = EndpointOptions::from_secrets(&secrets(&[(OS_REGION_NAME, "RegionTwo")]), "public")
            .unwrap();
        assert_eq!(opts.interface, "public");
        assert_eq!(opts.region.as_deref(), Some("RegionTwo"));

        let opts = EndpointOptions::from_secrets(&secrets(&[(OS_INTERFACE, "admin")]), "public")
            .unwrap();
        assert_eq!(opts.interface, "admin");
        assert_eq!(opts.region, None);

        // Without hints the catalog is not consulted
        assert_eq!(EndpointOptions::from_secrets(&secrets(&[URL]), "public"), None);
    }
}
