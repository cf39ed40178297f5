//! Kubeconfig resolution
//!
//! Loading, merging and context selection are done by `kube`. This module
//! turns the resulting [`kube::Config`] into the [`ConnectionDescriptor`] the
//! SPDY dialer needs: endpoint, TLS material and one static `Authorization`
//! value. Exec credential plugins are run once at resolution time.

use crate::descriptor::{Auth, ConnectionDescriptor};
use base64::Engine;
use kube::config::{AuthInfo, AuthProviderConfig, ExecConfig, KubeConfigOptions, Kubeconfig};
use podtunnel_transport::TlsSettings;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use url::Url;

/// Namespace used when the context does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kubeconfig errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid server URL {url:?}: {reason}")]
    InvalidServer { url: String, reason: String },

    #[error("Invalid {field}: {reason}")]
    InvalidData { field: &'static str, reason: String },

    #[error("Credential plugin {command:?} failed: {reason}")]
    Exec { command: String, reason: String },

    #[error("Unsupported credentials: {0}")]
    UnsupportedAuth(String),
}

/// A kubeconfig context turned into something we can connect with
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub name: String,
    pub descriptor: ConnectionDescriptor,
    pub namespace: String,
    /// Resolved client configuration, used for API calls such as pod lookup
    pub config: kube::Config,
}

/// Read `path`, or the default locations when `None`
///
/// The defaults are every file listed in `$KUBECONFIG`, merged, falling back
/// to `~/.kube/config`.
pub fn load_kubeconfig(path: Option<&Path>) -> Result<Kubeconfig, ConfigError> {
    let kubeconfig = match path {
        Some(path) => {
            debug!("Loading kubeconfig from {}", path.display());
            Kubeconfig::read_from(path)?
        }
        None => Kubeconfig::read()?,
    };
    Ok(kubeconfig)
}

/// Resolve `context`, or the current context when `None`
pub async fn resolve_context(
    kubeconfig: Kubeconfig,
    context: Option<&str>,
) -> Result<ResolvedContext, ConfigError> {
    let name = context
        .map(str::to_string)
        .or_else(|| kubeconfig.current_context.clone())
        .unwrap_or_default();

    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    let descriptor = descriptor_from_config(&config).await?;

    let namespace = if config.default_namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        config.default_namespace.clone()
    };

    Ok(ResolvedContext {
        name,
        descriptor,
        namespace,
        config,
    })
}

/// Build the dialer's view of a resolved client configuration
pub async fn descriptor_from_config(
    config: &kube::Config,
) -> Result<ConnectionDescriptor, ConfigError> {
    let url = config.cluster_url.to_string();
    let server = Url::parse(&url).map_err(|e| ConfigError::InvalidServer {
        url: url.clone(),
        reason: e.to_string(),
    })?;

    let credentials = Credentials::resolve(&config.auth_info).await?;

    let tls = TlsSettings {
        ca_pem: config.root_cert.as_deref().map(der_to_pem),
        client_cert_pem: credentials.client_cert_pem,
        client_key_pem: credentials.client_key_pem,
        insecure_skip_verify: config.accept_invalid_certs,
        server_name: config.tls_server_name.clone(),
    };

    let descriptor = ConnectionDescriptor::new(server)
        .with_tls(tls)
        .with_auth(credentials.auth);
    descriptor
        .validate()
        .map_err(|reason| ConfigError::InvalidServer { url, reason })?;
    Ok(descriptor)
}

/// Static credentials for one user entry
#[derive(Default)]
struct Credentials {
    auth: Auth,
    client_cert_pem: Option<Vec<u8>>,
    client_key_pem: Option<Vec<u8>>,
}

impl Credentials {
    async fn resolve(user: &AuthInfo) -> Result<Self, ConfigError> {
        let mut credentials = Credentials {
            auth: Auth::None,
            client_cert_pem: material(
                "client-certificate-data",
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
            )?,
            client_key_pem: material(
                "client-key-data",
                user.client_key_data.as_ref().map(|k| k.expose_secret()),
                user.client_key.as_deref(),
            )?,
        };

        if let Some(token) = user
            .token
            .as_ref()
            .map(|t| t.expose_secret())
            .filter(|t| !t.is_empty())
        {
            credentials.auth = Auth::Bearer(token.to_string());
        } else if let Some(file) = user.token_file.as_deref().filter(|f| !f.is_empty()) {
            let token = read_file(Path::new(file))?;
            let token = String::from_utf8(token).map_err(|e| ConfigError::InvalidData {
                field: "tokenFile",
                reason: e.to_string(),
            })?;
            credentials.auth = Auth::Bearer(token.trim().to_string());
        } else if let Some(username) = user.username.as_deref().filter(|u| !u.is_empty()) {
            credentials.auth = Auth::Basic {
                username: username.to_string(),
                password: user
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_string())
                    .unwrap_or_default(),
            };
        } else if let Some(provider) = &user.auth_provider {
            credentials.auth = provider_token(provider)?;
        } else if let Some(exec) = &user.exec {
            let status = run_exec_plugin(exec).await?;
            if let Some(token) = status.token.filter(|t| !t.is_empty()) {
                credentials.auth = Auth::Bearer(token);
            }
            if let (Some(cert), Some(key)) =
                (status.client_certificate_data, status.client_key_data)
            {
                credentials.client_cert_pem = Some(cert.into_bytes());
                credentials.client_key_pem = Some(key.into_bytes());
            }
        }

        Ok(credentials)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Inline `-data` wins over the file reference, as kubectl does
fn material(
    field: &'static str,
    data: Option<&str>,
    file: Option<&str>,
) -> Result<Option<Vec<u8>>, ConfigError> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| ConfigError::InvalidData {
                field,
                reason: e.to_string(),
            })?;
        return Ok(Some(decoded));
    }
    match file.filter(|f| !f.is_empty()) {
        Some(file) => Ok(Some(read_file(Path::new(file))?)),
        None => Ok(None),
    }
}

fn der_to_pem(certs: &[Vec<u8>]) -> Vec<u8> {
    let mut pem = String::new();
    for der in certs {
        let encoded = base64::engine::general_purpose::STANDARD.encode(der);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
    }
    pem.into_bytes()
}

/// Cached token of a legacy `auth-provider` entry (gcp, oidc)
fn provider_token(provider: &AuthProviderConfig) -> Result<Auth, ConfigError> {
    ["access-token", "id-token"]
        .iter()
        .filter_map(|key| provider.config.get(*key))
        .find(|token| !token.is_empty())
        .map(|token| Auth::Bearer(token.clone()))
        .ok_or_else(|| {
            ConfigError::UnsupportedAuth(format!(
                "auth-provider {:?} has no cached token",
                provider.name
            ))
        })
}

#[derive(Debug, Deserialize)]
struct ExecCredential {
    status: Option<ExecCredentialStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
}

/// Run an `exec` credential plugin and parse its `ExecCredential`
async fn run_exec_plugin(exec: &ExecConfig) -> Result<ExecCredentialStatus, ConfigError> {
    let command = exec
        .command
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ConfigError::UnsupportedAuth("exec plugin without a command".to_string()))?;
    let failed = |reason: String| ConfigError::Exec {
        command: command.to_string(),
        reason,
    };

    let mut cmd = Command::new(command);
    if let Some(args) = &exec.args {
        cmd.args(args);
    }
    for var in exec.env.iter().flatten() {
        if let (Some(name), Some(value)) = (var.get("name"), var.get("value")) {
            cmd.env(name, value);
        }
    }
    if let Some(api_version) = &exec.api_version {
        let info = serde_json::json!({
            "apiVersion": api_version,
            "kind": "ExecCredential",
            "spec": { "interactive": false },
        });
        cmd.env("KUBERNETES_EXEC_INFO", info.to_string());
    }
    cmd.stdin(Stdio::null());

    debug!("Running credential plugin {}", command);
    let output = cmd.output().await.map_err(|e| failed(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failed(format!("{}: {}", output.status, stderr.trim())));
    }

    let credential: ExecCredential = serde_json::from_slice(&output.stdout)
        .map_err(|e| failed(format!("invalid ExecCredential: {}", e)))?;
    credential
        .status
        .ok_or_else(|| failed("ExecCredential has no status".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://10.0.0.1:6443
    tls-server-name: kubernetes
- name: local
  cluster:
    server: http://127.0.0.1:8001
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: payments
- name: proxy
  context:
    cluster: local
    user: anonymous
- name: gke
  context:
    cluster: dev-cluster
    user: gke-user
- name: legacy-gcp
  context:
    cluster: dev-cluster
    user: gcp-user
- name: azure
  context:
    cluster: dev-cluster
    user: azure-user
- name: certs
  context:
    cluster: dev-cluster
    user: cert-user
users:
- name: dev-user
  user:
    token: abc123
- name: anonymous
  user: {}
- name: gke-user
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: gke-gcloud-auth-plugin-not-installed
      installHint: Install gke-gcloud-auth-plugin
      provideClusterInfo: true
- name: gcp-user
  user:
    auth-provider:
      name: gcp
      config:
        access-token: ya29.cached
- name: azure-user
  user:
    auth-provider:
      name: azure
      config:
        tenant-id: example
- name: cert-user
  user:
    client-certificate-data: "not*base64"
    client-key-data: "not*base64"
"#;

    async fn resolve(context: Option<&str>) -> Result<ResolvedContext, ConfigError> {
        let kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        resolve_context(kubeconfig, context).await
    }

    #[tokio::test]
    async fn test_resolve_current_context() {
        let resolved = resolve(None).await.unwrap();

        assert_eq!(resolved.name, "dev");
        assert_eq!(resolved.namespace, "payments");
        assert_eq!(resolved.descriptor.server.as_str(), "https://10.0.0.1:6443/");
        assert_eq!(resolved.descriptor.auth, Auth::Bearer("abc123".to_string()));
        assert_eq!(
            resolved.descriptor.tls.server_name.as_deref(),
            Some("kubernetes")
        );
        assert_eq!(resolved.config.default_namespace, "payments");
    }

    #[tokio::test]
    async fn test_resolve_named_context_without_credentials() {
        let resolved = resolve(Some("proxy")).await.unwrap();

        assert_eq!(resolved.name, "proxy");
        assert_eq!(resolved.namespace, DEFAULT_NAMESPACE);
        assert_eq!(resolved.descriptor.auth, Auth::None);
        assert!(resolved.descriptor.tls.ca_pem.is_none());
    }

    #[tokio::test]
    async fn test_missing_context() {
        assert!(matches!(
            resolve(Some("prod")).await,
            Err(ConfigError::Kubeconfig(_))
        ));

        let empty = Kubeconfig::from_yaml("apiVersion: v1\nkind: Config\n").unwrap();
        assert!(matches!(
            resolve_context(empty, None).await,
            Err(ConfigError::Kubeconfig(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_base64() {
        match resolve(Some("certs")).await {
            Err(ConfigError::InvalidData { field, .. }) => {
                assert_eq!(field, "client-certificate-data")
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let yaml = KUBECONFIG.replace(
            "    tls-server-name: kubernetes",
            "    certificate-authority-data: \"not*base64\"",
        );
        let kubeconfig = Kubeconfig::from_yaml(&yaml).unwrap();
        assert!(matches!(
            resolve_context(kubeconfig, None).await,
            Err(ConfigError::Kubeconfig(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_exec_plugin_is_an_error() {
        match resolve(Some("gke")).await {
            Err(ConfigError::Exec { command, .. }) => {
                assert_eq!(command, "gke-gcloud-auth-plugin-not-installed")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_provider_tokens() {
        let resolved = resolve(Some("legacy-gcp")).await.unwrap();
        assert_eq!(
            resolved.descriptor.auth,
            Auth::Bearer("ya29.cached".to_string())
        );

        assert!(matches!(
            resolve(Some("azure")).await,
            Err(ConfigError::UnsupportedAuth(_))
        ));
    }

    #[test]
    fn test_der_to_pem_wraps_lines() {
        let pem = String::from_utf8(der_to_pem(&[vec![0u8; 60]])).unwrap();
        let lines: Vec<&str> = pem.lines().collect();

        assert_eq!(lines.first(), Some(&"-----BEGIN CERTIFICATE-----"));
        assert_eq!(lines.last(), Some(&"-----END CERTIFICATE-----"));
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines.len(), 4);
    }
}
