//! Session dialers

use crate::config::SessionConfig;
use crate::session::{MuxSession, Role};
use crate::tls::TlsSettings;
use crate::upgrade::{client_handshake, upgrade_request};
use crate::{TransportError, TransportResult};
use async_trait::async_trait;
use podtunnel_proto::portforward::PROTOCOL_V1;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::{Host, Url};

/// Where and how to reach the control plane
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Base URL; a path here becomes a prefix of every request path
    pub server: Url,

    pub tls: TlsSettings,

    /// Full `Authorization` header value, if any
    pub authorization: Option<String>,
}

impl Endpoint {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            tls: TlsSettings::default(),
            authorization: None,
        }
    }

    /// Request URL for `path`, honouring any prefix in the server URL
    pub fn url_for(&self, path: &str) -> Url {
        let mut url = self.server.clone();
        let prefix = self.server.path().trim_end_matches('/');
        url.set_path(&format!("{}{}", prefix, path));
        url
    }

    fn authority(&self) -> TransportResult<String> {
        let host = self.server.host_str().ok_or_else(|| {
            TransportError::ConfigurationError(format!("Server URL {} has no host", self.server))
        })?;
        Ok(match self.server.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }
}

/// Produces upgraded sessions for request paths
#[async_trait]
pub trait SessionDialer: Send + Sync + std::fmt::Debug {
    /// Upgrade a connection to `path` and start a client session on it
    async fn dial(&self, path: &str) -> TransportResult<MuxSession>;

    /// Human readable target for `path`, used in error reports
    fn describe(&self, path: &str) -> String {
        path.to_string()
    }
}

/// Dials the control plane over TCP or TLS and performs the SPDY upgrade
#[derive(Clone)]
pub struct UpgradeDialer {
    endpoint: Arc<Endpoint>,
    session_config: SessionConfig,
    dial_timeout: Option<Duration>,
    protocol: String,
    tls_connector: Option<tokio_rustls::TlsConnector>,
}

impl std::fmt::Debug for UpgradeDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeDialer")
            .field("server", &self.endpoint.server.as_str())
            .field("protocol", &self.protocol)
            .field("tls", &self.tls_connector.is_some())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

impl UpgradeDialer {
    pub fn new(endpoint: Arc<Endpoint>, session_config: SessionConfig) -> TransportResult<Self> {
        session_config.validate()?;

        let tls_connector = match endpoint.server.scheme() {
            "https" => Some(endpoint.tls.connector()?),
            "http" => None,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme {:?} in {}",
                    other, endpoint.server
                )))
            }
        };

        Ok(Self {
            endpoint,
            session_config,
            dial_timeout: None,
            protocol: PROTOCOL_V1.to_string(),
            tls_connector,
        })
    }

    /// Bound the whole dial (connect, TLS and upgrade)
    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Request a different sub-protocol
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    async fn connect_tcp(&self) -> TransportResult<TcpStream> {
        let server = &self.endpoint.server;
        let port = server.port_or_known_default().ok_or_else(|| {
            TransportError::ConfigurationError(format!("Server URL {} has no port", server))
        })?;

        let stream = match server.host() {
            Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await,
            Some(Host::Ipv4(ip)) => TcpStream::connect((IpAddr::V4(ip), port)).await,
            Some(Host::Ipv6(ip)) => TcpStream::connect((IpAddr::V6(ip), port)).await,
            None => {
                return Err(TransportError::ConfigurationError(format!(
                    "Server URL {} has no host",
                    server
                )))
            }
        }
        .map_err(|e| TransportError::ConnectionError(format!("Failed to connect: {}", e)))?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn dial_inner(&self, path: &str) -> TransportResult<MuxSession> {
        let url = self.endpoint.url_for(path);
        let request = upgrade_request(
            &self.endpoint.authority()?,
            url.path(),
            &self.protocol,
            self.endpoint.authorization.as_deref(),
        )?;

        let tcp = self.connect_tcp().await?;
        debug!("TCP connection established to {}", url);

        match &self.tls_connector {
            Some(connector) => {
                let host = self.endpoint.server.host_str().unwrap_or_default();
                let server_name = self.endpoint.tls.server_name(host)?;
                let mut tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;
                debug!("TLS handshake completed with {}", host);

                let leftover = client_handshake(&mut tls, &request, &self.protocol).await?;
                MuxSession::new(tls, leftover, Role::Client, self.session_config.clone())
            }
            None => {
                let mut tcp = tcp;
                let leftover = client_handshake(&mut tcp, &request, &self.protocol).await?;
                MuxSession::new(tcp, leftover, Role::Client, self.session_config.clone())
            }
        }
    }
}

#[async_trait]
impl SessionDialer for UpgradeDialer {
    async fn dial(&self, path: &str) -> TransportResult<MuxSession> {
        let session = match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial_inner(path))
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => self.dial_inner(path).await?,
        };

        info!(
            "Upgraded {} to SPDY/3.1 ({})",
            self.endpoint.url_for(path),
            session.connection_id()
        );
        Ok(session)
    }

    fn describe(&self, path: &str) -> String {
        self.endpoint.url_for(path).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_keeps_prefix() {
        let endpoint = Endpoint::new(Url::parse("https://rancher.example.com/k8s/clusters/c-1/").unwrap());
        assert_eq!(
            endpoint.url_for("/api/v1/namespaces/default/pods/web/portforward").as_str(),
            "https://rancher.example.com/k8s/clusters/c-1/api/v1/namespaces/default/pods/web/portforward"
        );

        let endpoint = Endpoint::new(Url::parse("http://127.0.0.1:8001").unwrap());
        assert_eq!(
            endpoint.url_for("/api/v1/namespaces/a/pods/b/portforward").as_str(),
            "http://127.0.0.1:8001/api/v1/namespaces/a/pods/b/portforward"
        );
    }

    #[test]
    fn test_authority() {
        let endpoint = Endpoint::new(Url::parse("https://10.0.0.1:6443").unwrap());
        assert_eq!(endpoint.authority().unwrap(), "10.0.0.1:6443");

        let endpoint = Endpoint::new(Url::parse("https://kube.local").unwrap());
        assert_eq!(endpoint.authority().unwrap(), "kube.local");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let endpoint = Arc::new(Endpoint::new(Url::parse("ftp://kube.local").unwrap()));
        assert!(matches!(
            UpgradeDialer::new(endpoint, SessionConfig::default()),
            Err(TransportError::ConfigurationError(_))
        ));
    }
}
