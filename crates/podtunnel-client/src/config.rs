//! Tunnel configuration

use podtunnel_transport::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// `LOCAL:REMOTE` port pair; local port 0 picks a free port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
}

impl PortMapping {
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote_port)
    }
}

impl FromStr for PortMapping {
    type Err = String;

    /// Accepts `LOCAL:REMOTE`, `PORT` (same on both sides) and `:REMOTE`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port {:?} in {:?}: {}", part, s, e))
        };

        let mapping = match s.split_once(':') {
            Some(("", remote)) => PortMapping::new(0, parse(remote)?),
            Some((local, remote)) => PortMapping::new(parse(local)?, parse(remote)?),
            None => {
                let port = parse(s)?;
                PortMapping::new(port, port)
            }
        };

        if mapping.remote_port == 0 {
            return Err(format!("remote port in {:?} must not be 0", s));
        }
        Ok(mapping)
    }
}

/// Settings for one tunnel invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub bind_address: IpAddr,
    pub mapping: PortMapping,
    #[serde(default, with = "opt_duration_secs")]
    pub dial_timeout: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub stream_create_timeout: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub accept_timeout: Option<Duration>,
}

/// Helper module for serializing optional Durations as seconds
mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mapping: PortMapping::new(0, 0),
            dial_timeout: None,
            stream_create_timeout: Some(Duration::from_secs(30)),
            accept_timeout: None,
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Session settings derived from this tunnel's deadlines
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_stream_create_timeout(self.stream_create_timeout)
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = address;
        self
    }

    pub fn mapping(mut self, mapping: PortMapping) -> Self {
        self.config.mapping = mapping;
        self
    }

    pub fn ports(self, local_port: u16, remote_port: u16) -> Self {
        self.mapping(PortMapping::new(local_port, remote_port))
    }

    pub fn dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    pub fn stream_create_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.stream_create_timeout = timeout;
        self
    }

    pub fn accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.accept_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, String> {
        if self.config.mapping.remote_port == 0 {
            return Err("remote port is required".to_string());
        }
        for (name, timeout) in [
            ("dial_timeout", self.config.dial_timeout),
            ("stream_create_timeout", self.config.stream_create_timeout),
            ("accept_timeout", self.config.accept_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_parse() {
        assert_eq!("3000:8080".parse::<PortMapping>().unwrap(), PortMapping::new(3000, 8080));
        assert_eq!("5432".parse::<PortMapping>().unwrap(), PortMapping::new(5432, 5432));
        assert_eq!(":80".parse::<PortMapping>().unwrap(), PortMapping::new(0, 80));

        assert!("3000:0".parse::<PortMapping>().is_err());
        assert!("abc:80".parse::<PortMapping>().is_err());
        assert!("70000:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = TunnelConfig::builder()
            .ports(3000, 8080)
            .accept_timeout(Some(Duration::from_secs(5)))
            .build()
            .unwrap();

        assert_eq!(config.mapping.to_string(), "3000:8080");
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.stream_create_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            config.session_config().stream_create_timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_config_builder_missing_remote_port() {
        assert!(TunnelConfig::builder().build().is_err());
    }

    #[test]
    fn test_config_builder_zero_timeout() {
        let result = TunnelConfig::builder()
            .ports(0, 80)
            .dial_timeout(Some(Duration::ZERO))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serde() {
        let config = TunnelConfig::builder()
            .ports(3000, 8080)
            .dial_timeout(Some(Duration::from_secs(10)))
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"dial_timeout\":10"));
        assert!(json.contains("\"accept_timeout\":null"));

        let decoded: TunnelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.dial_timeout, Some(Duration::from_secs(10)));
        assert_eq!(decoded.mapping, config.mapping);
    }
}
