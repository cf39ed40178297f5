//! Port-forward sub-protocol
//!
//! After the upgrade each forwarded port uses two sub-streams that share a
//! request id: an `error` stream the remote side writes a failure message to,
//! and a `data` stream carrying the forwarded bytes.

use crate::headers::HeaderBlock;
use crate::{ProtoError, ProtoResult};
use std::fmt;
use std::str::FromStr;

/// Sub-protocol token negotiated during the upgrade
pub const PROTOCOL_V1: &str = "portforward.k8s.io";

/// Value of the `Upgrade` header
pub const SPDY_UPGRADE: &str = "SPDY/3.1";

/// Request and response header naming the negotiated sub-protocol
pub const STREAM_PROTOCOL_VERSION_HEADER: &str = "X-Stream-Protocol-Version";

/// Sent by the server with a 403 when no requested sub-protocol is supported
pub const ACCEPTED_STREAM_PROTOCOL_VERSIONS_HEADER: &str = "X-Accepted-Stream-Protocol-Versions";

pub const HEADER_STREAM_TYPE: &str = "streamtype";
pub const HEADER_PORT: &str = "port";
pub const HEADER_REQUEST_ID: &str = "requestid";

/// Role of a sub-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Error,
    Data,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Error => "error",
            StreamType::Data => "data",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(StreamType::Error),
            "data" => Ok(StreamType::Data),
            other => Err(ProtoError::InvalidHeader {
                name: HEADER_STREAM_TYPE.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Tag carried in the SYN_STREAM headers of every port-forward sub-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTag {
    pub stream_type: StreamType,
    pub port: u16,
    pub request_id: u32,
}

impl StreamTag {
    pub fn new(stream_type: StreamType, port: u16, request_id: u32) -> Self {
        Self {
            stream_type,
            port,
            request_id,
        }
    }

    pub fn to_headers(&self) -> HeaderBlock {
        HeaderBlock::new()
            .with(HEADER_STREAM_TYPE, self.stream_type.as_str())
            .with(HEADER_PORT, self.port.to_string())
            .with(HEADER_REQUEST_ID, self.request_id.to_string())
    }

    /// Read the tag back from received headers
    pub fn from_headers(headers: &HeaderBlock) -> ProtoResult<Self> {
        let stream_type = required(headers, HEADER_STREAM_TYPE)?.parse()?;
        let port = parse_number(headers, HEADER_PORT)?;
        if port == 0 {
            return Err(ProtoError::InvalidHeader {
                name: HEADER_PORT.to_string(),
                value: "0".to_string(),
            });
        }
        let request_id = parse_number(headers, HEADER_REQUEST_ID)?;

        Ok(Self {
            stream_type,
            port,
            request_id,
        })
    }
}

fn required<'a>(headers: &'a HeaderBlock, name: &str) -> ProtoResult<&'a str> {
    headers.get(name).ok_or_else(|| ProtoError::InvalidHeader {
        name: name.to_string(),
        value: String::new(),
    })
}

fn parse_number<T: FromStr>(headers: &HeaderBlock, name: &str) -> ProtoResult<T> {
    let value = required(headers, name)?;
    value.parse().map_err(|_| ProtoError::InvalidHeader {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Request path of the port-forward subresource for a pod
pub fn portforward_path(namespace: &str, pod: &str) -> String {
    format!("/api/v1/namespaces/{}/pods/{}/portforward", namespace, pod)
}
