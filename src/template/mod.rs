//! Credential file rendering.
//!
//! Each issued application credential is bound to a [`CloudConfig`] and
//! rendered through either the caller's template or the built-in
//! `clouds.yaml` template.

mod exec;
mod funcs;
mod parse;

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::broker::Issued;

/// Built-in template, a `clouds.yaml` with a single cloud entry.
pub const DEFAULT_TEMPLATE: &str = r#"clouds:
  secrets-store-csi:
    auth:
      application_credential_id: "{{ .AuthInfo.ApplicationCredentialID }}"
      application_credential_secret: "{{ .AuthInfo.ApplicationCredentialSecret }}"
      auth_url: "{{ .AuthInfo.AuthURL }}"
    auth_type: "{{ .AuthType }}"
"#;

/// Errors raised while parsing or executing a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template: line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("template: {0}")]
    Execute(String),

    #[error("failed to bind template data: {0}")]
    Bind(#[from] serde_json::Error),
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<parse::Node>,
}

impl Template {
    /// Parse template source.
    pub fn parse(src: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            nodes: parse::parse(src)?,
        })
    }

    /// Render the template with `data` bound to the root cursor.
    pub fn execute<T: Serialize>(&self, data: &T) -> Result<Vec<u8>, TemplateError> {
        let root = serde_json::to_value(data)?;
        let mut out = String::new();
        exec::Exec::new(&root).walk(&self.nodes, &root, &mut out)?;
        Ok(out.into_bytes())
    }
}

/// Renders credential views with a caller template or the default one.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    default_template: Template,
}

impl TemplateRenderer {
    /// Create a renderer; the default template is parsed once up front.
    pub fn new(default_template: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            default_template: Template::parse(default_template)?,
        })
    }

    /// Render `data`, preferring `template` when the caller supplied one.
    pub fn render<T: Serialize>(
        &self,
        template: Option<&str>,
        data: &T,
    ) -> Result<Vec<u8>, TemplateError> {
        match template {
            Some(src) => Template::parse(src)?.execute(data),
            None => self.default_template.execute(data),
        }
    }
}

/// Auth plugin tag written into rendered configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthType {
    #[serde(rename = "v3applicationcredential")]
    V3ApplicationCredential,
}

/// Credential fields exposed to templates as `.AuthInfo.*`.
#[derive(Clone, Serialize)]
pub struct AuthInfo {
    #[serde(rename = "AuthURL")]
    pub auth_url: String,
    #[serde(rename = "ApplicationCredentialID")]
    pub application_credential_id: String,
    #[serde(rename = "ApplicationCredentialSecret")]
    pub application_credential_secret: String,
    #[serde(rename = "ApplicationCredentialName")]
    pub application_credential_name: String,
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("auth_url", &self.auth_url)
            .field("application_credential_id", &self.application_credential_id)
            .field("application_credential_secret", &"<redacted>")
            .field("application_credential_name", &self.application_credential_name)
            .finish()
    }
}

/// Root object bound to every template.
#[derive(Debug, Clone, Serialize)]
pub struct CloudConfig {
    #[serde(rename = "AuthInfo")]
    pub auth_info: AuthInfo,
    #[serde(rename = "AuthType")]
    pub auth_type: AuthType,
}

impl CloudConfig {
    /// Build the template view of an issued credential.
    pub fn from_issued(issued: &Issued) -> Self {
        Self {
            auth_info: AuthInfo {
                auth_url: issued.auth_url.clone(),
                application_credential_id: issued.credential.id.clone(),
                application_credential_secret: issued.credential.secret().to_string(),
                application_credential_name: issued.credential.name.clone(),
            },
            auth_type: AuthType::V3ApplicationCredential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::IssuedCredential;

    fn issued() -> Issued {
        Issued {
            credential: IssuedCredential::new(
                "abcdef1234",
                "random-generated-secret",
                "secrets-store-csi-1-abcde",
                None,
            ),
            auth_url: "http://localhost:5000/v3/".to_string(),
        }
    }

    #[test]
    fn test_default_template_output() {
        let renderer = TemplateRenderer::new(DEFAULT_TEMPLATE).unwrap();
        let out = renderer
            .render(None, &CloudConfig::from_issued(&issued()))
            .unwrap();

        let expected = r#"clouds:
  secrets-store-csi:
    auth:
      application_credential_id: "abcdef1234"
      application_credential_secret: "random-generated-secret"
      auth_url: "http://localhost:5000/v3/"
    auth_type: "v3applicationcredential"
"#;
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_custom_template_output() {
        let renderer = TemplateRenderer::new(DEFAULT_TEMPLATE).unwrap();
        let template = "{{ .AuthInfo.ApplicationCredentialID }}:{{ .AuthInfo.ApplicationCredentialSecret }}@{{ .AuthInfo.AuthURL }} ({{ .AuthType }}, {{ .AuthInfo.ApplicationCredentialName }})";
        let out = renderer
            .render(Some(template), &CloudConfig::from_issued(&issued()))
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "abcdef1234:random-generated-secret@http://localhost:5000/v3/ (v3applicationcredential, secrets-store-csi-1-abcde)"
        );
    }

    #[test]
    fn test_custom_template_errors() {
        let renderer = TemplateRenderer::new(DEFAULT_TEMPLATE).unwrap();
        let data = CloudConfig::from_issued(&issued());

        assert!(matches!(
            renderer.render(Some("{{ .AuthInfo.ID "), &data),
            Err(TemplateError::Parse { .. })
        ));
        assert!(matches!(
            renderer.render(Some("{{ .AuthInfo.ID }}"), &data),
            Err(TemplateError::Execute(_))
        ));
    }

    #[test]
    fn test_custom_template_pipelines() {
        let renderer = TemplateRenderer::new(DEFAULT_TEMPLATE).unwrap();
        let template = r#"{{ with .AuthInfo -}}
{{ $id := .ApplicationCredentialID }}export OS_AUTH_URL={{ .AuthURL | printf "%q" }}
export OS_APPLICATION_CREDENTIAL_ID={{ $id }}
{{- end }}
export OS_AUTH_TYPE={{ printf "%s" .AuthType }}
"#;
        let out = renderer
            .render(Some(template), &CloudConfig::from_issued(&issued()))
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "export OS_AUTH_URL=\"http://localhost:5000/v3/\"\nexport OS_APPLICATION_CREDENTIAL_ID=abcdef1234\nexport OS_AUTH_TYPE=v3applicationcredential\n"
        );
    }

    #[test]
    fn test_cloud_config_debug_redacts_secret() {
        let debug = format!("{:?}", CloudConfig::from_issued(&issued()));
        assert!(debug.contains("abcdef1234"));
        assert!(!debug.contains("random-generated-secret"));
    }

    #[test]
    fn test_bad_default_template_is_rejected() {
        assert!(TemplateRenderer::new("{{ range .X }}").is_err());
    }
}
