//! Connection descriptor for the control plane

use base64::Engine;
use podtunnel_transport::{Endpoint, TlsSettings};
use url::Url;

/// Credentials sent with every request
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => write!(f, "None"),
            Auth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
            Auth::Basic { username, .. } => write!(f, "Basic({}, <redacted>)", username),
        }
    }
}

impl Auth {
    /// Value for the `Authorization` header
    pub fn header_value(&self) -> Option<String> {
        match self {
            Auth::None => None,
            Auth::Bearer(token) => Some(format!("Bearer {}", token)),
            Auth::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                Some(format!("Basic {}", encoded))
            }
        }
    }
}

/// Endpoint, TLS material and credentials for the control plane
///
/// Resolved once (usually from a kubeconfig) and shared read-only by every
/// tunnel invocation.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub server: Url,
    pub tls: TlsSettings,
    pub auth: Auth,
}

impl ConnectionDescriptor {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            tls: TlsSettings::default(),
            auth: Auth::None,
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.server.scheme() {
            "http" | "https" => {}
            other => return Err(format!("unsupported scheme {:?} in {}", other, self.server)),
        }
        if self.server.host_str().is_none() {
            return Err(format!("server URL {} has no host", self.server));
        }
        Ok(())
    }

    /// Transport endpoint for the upgrade dialer
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            server: self.server.clone(),
            tls: self.tls.clone(),
            authorization: self.auth.header_value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_header_values() {
        assert_eq!(Auth::None.header_value(), None);
        assert_eq!(
            Auth::Bearer("abc".to_string()).header_value(),
            Some("Bearer abc".to_string())
        );
        assert_eq!(
            Auth::Basic {
                username: "admin".to_string(),
                password: "secret".to_string(),
            }
            .header_value(),
            Some("Basic YWRtaW46c2VjcmV0".to_string())
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let auth = Auth::Bearer("super-secret".to_string());
        assert!(!format!("{:?}", auth).contains("super-secret"));
    }

    #[test]
    fn test_validate() {
        let descriptor = ConnectionDescriptor::new(Url::parse("https://10.0.0.1:6443").unwrap());
        assert!(descriptor.validate().is_ok());
        assert_eq!(
            descriptor.endpoint().server.as_str(),
            "https://10.0.0.1:6443/"
        );

        let descriptor = ConnectionDescriptor::new(Url::parse("unix:/var/run/k8s.sock").unwrap());
        assert!(descriptor.validate().is_err());
    }
}
