//! HTTP/1.1 upgrade handshake
//!
//! The client side writes the `POST .../portforward` request head and checks
//! the `101 Switching Protocols` response. The server side ([`accept_upgrade`])
//! negotiates the sub-protocol and answers `403` with the accepted versions
//! when nothing matches, which is what the in-process control plane used in
//! tests relies on.

use crate::config::SessionConfig;
use crate::session::{MuxSession, Role};
use crate::{TransportError, TransportResult};
use bytes::{Buf, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use podtunnel_proto::portforward::{
    ACCEPTED_STREAM_PROTOCOL_VERSIONS_HEADER, SPDY_UPGRADE, STREAM_PROTOCOL_VERSION_HEADER,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 64;

/// Largest accepted request or response head
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Largest error body kept from a rejected upgrade
const MAX_ERROR_BODY: usize = 64 * 1024;

/// How long to keep reading the body of a rejected upgrade
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the upgrade request for a sub-protocol
pub fn upgrade_request(
    authority: &str,
    path: &str,
    protocol: &str,
    authorization: Option<&str>,
) -> TransportResult<Request<()>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(HOST, authority)
        .header(
            http::header::USER_AGENT,
            concat!("podtunnel/", env!("CARGO_PKG_VERSION")),
        )
        .header(CONTENT_LENGTH, "0")
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, SPDY_UPGRADE)
        .header(STREAM_PROTOCOL_VERSION_HEADER, protocol);

    if let Some(value) = authorization {
        let mut value = HeaderValue::from_str(value).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid Authorization header: {}", e))
        })?;
        value.set_sensitive(true);
        builder = builder.header(http::header::AUTHORIZATION, value);
    }

    builder
        .body(())
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid upgrade request: {}", e)))
}

fn encode_request_head(request: &Request<()>) -> Vec<u8> {
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(request.uri().to_string().as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    encode_headers(request.headers(), &mut head);
    head
}

fn encode_response_head(response: &Response<()>) -> Vec<u8> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    encode_headers(response.headers(), &mut head);
    head
}

fn encode_headers(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Read until a complete head is buffered, returning its length
async fn read_head<T>(io: &mut T, buf: &mut BytesMut) -> TransportResult<usize>
where
    T: AsyncRead + Unpin,
{
    let mut searched = 0;
    loop {
        if let Some(pos) = buf[searched..].windows(4).position(|w| w == b"\r\n\r\n") {
            return Ok(searched + pos + 4);
        }
        searched = buf.len().saturating_sub(3);

        if buf.len() > MAX_HEAD_SIZE {
            return Err(TransportError::ProtocolError(format!(
                "HTTP head exceeds {} bytes",
                MAX_HEAD_SIZE
            )));
        }

        if io.read_buf(buf).await? == 0 {
            return Err(TransportError::ConnectionError(
                "Connection closed before the HTTP head was complete".to_string(),
            ));
        }
    }
}

fn parse_response_head(head: &[u8]) -> TransportResult<Response<()>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TransportError::ProtocolError(
                "Incomplete response head".to_string(),
            ))
        }
        Err(e) => {
            return Err(TransportError::ProtocolError(format!(
                "Invalid response head: {}",
                e
            )))
        }
    }

    let mut builder = Response::builder().status(parsed.code.unwrap_or(0));
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    builder
        .body(())
        .map_err(|e| TransportError::ProtocolError(format!("Invalid response head: {}", e)))
}

fn parse_request_head(head: &[u8]) -> TransportResult<UpgradedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TransportError::ProtocolError(
                "Incomplete request head".to_string(),
            ))
        }
        Err(e) => {
            return Err(TransportError::ProtocolError(format!(
                "Invalid request head: {}",
                e
            )))
        }
    }

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|e| TransportError::ProtocolError(format!("Invalid method: {}", e)))?;
    let path = parsed.path.unwrap_or("/").to_string();

    let mut map = HeaderMap::new();
    for header in parsed.headers.iter() {
        let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| TransportError::ProtocolError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| TransportError::ProtocolError(format!("Invalid header value: {}", e)))?;
        map.append(name, value);
    }

    Ok(UpgradedRequest {
        method,
        path,
        headers: map,
        protocol: String::new(),
    })
}

fn header_contains(headers: &HeaderMap, name: impl http::header::AsHeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Check that a response completes the upgrade to `protocol`
pub fn verify_upgrade_response(response: &Response<()>, protocol: &str) -> TransportResult<()> {
    if !header_contains(response.headers(), UPGRADE, SPDY_UPGRADE) {
        return Err(TransportError::ProtocolNegotiation(format!(
            "server did not switch to {} (Upgrade: {:?})",
            SPDY_UPGRADE,
            response.headers().get(UPGRADE)
        )));
    }

    let negotiated = response
        .headers()
        .get(STREAM_PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if negotiated != protocol {
        return Err(TransportError::ProtocolNegotiation(format!(
            "client supports {:?}, server returned {:?}",
            protocol, negotiated
        )));
    }

    Ok(())
}

async fn read_error_body<T>(io: &mut T, mut buf: BytesMut, response: &Response<()>) -> String
where
    T: AsyncRead + Unpin,
{
    let expected = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    let limit = expected.unwrap_or(MAX_ERROR_BODY).min(MAX_ERROR_BODY);

    let read = async {
        while buf.len() < limit {
            match io.read_buf(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(ERROR_BODY_TIMEOUT, read).await.is_err() {
        trace!("Timed out reading upgrade error body");
    }

    buf.truncate(limit);
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Perform the client side of the upgrade
///
/// Returns the bytes that arrived after the response head; they already
/// belong to the SPDY session.
pub async fn client_handshake<T>(
    io: &mut T,
    request: &Request<()>,
    protocol: &str,
) -> TransportResult<BytesMut>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(&encode_request_head(request)).await?;
    io.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    let head_len = read_head(io, &mut buf).await?;
    let response = parse_response_head(&buf[..head_len])?;
    buf.advance(head_len);

    debug!("Upgrade response: {}", response.status());

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let body = read_error_body(io, buf, &response).await;
        return Err(TransportError::UpgradeRejected {
            status: response.status().as_u16(),
            body,
        });
    }

    verify_upgrade_response(&response, protocol)?;
    Ok(buf)
}

/// An upgrade request accepted by [`accept_upgrade`]
#[derive(Debug, Clone)]
pub struct UpgradedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Sub-protocol chosen for the session
    pub protocol: String,
}

/// Pick the first client protocol the server supports
pub fn negotiate_protocol(headers: &HeaderMap, supported: &[&str]) -> Option<String> {
    headers
        .get_all(STREAM_PROTOCOL_VERSION_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|requested| supported.contains(requested))
        .map(str::to_string)
}

async fn reject<T>(
    io: &mut T,
    status: StatusCode,
    extra: Option<(&str, String)>,
    message: &str,
) -> TransportResult<()>
where
    T: AsyncWrite + Unpin,
{
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(CONTENT_LENGTH, message.len());
    if let Some((name, value)) = extra {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(())
        .map_err(|e| TransportError::ProtocolError(format!("Invalid response: {}", e)))?;

    let mut out = encode_response_head(&response);
    out.extend_from_slice(message.as_bytes());
    io.write_all(&out).await?;
    io.flush().await?;
    io.shutdown().await?;
    Ok(())
}

/// Accept a SPDY upgrade on a freshly accepted connection
///
/// Answers `400` when the request is not a SPDY upgrade and `403` with
/// `X-Accepted-Stream-Protocol-Versions` when no sub-protocol matches.
pub async fn accept_upgrade<T>(
    mut io: T,
    supported: &[&str],
    config: SessionConfig,
) -> TransportResult<(UpgradedRequest, MuxSession)>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);
    let head_len = read_head(&mut io, &mut buf).await?;
    let mut request = parse_request_head(&buf[..head_len])?;
    buf.advance(head_len);

    debug!("Upgrade request: {} {}", request.method, request.path);

    if !header_contains(&request.headers, CONNECTION, "upgrade")
        || !header_contains(&request.headers, UPGRADE, SPDY_UPGRADE)
    {
        let message = "unable to upgrade: missing upgrade headers in request";
        reject(&mut io, StatusCode::BAD_REQUEST, None, message).await?;
        return Err(TransportError::ProtocolError(message.to_string()));
    }

    let Some(protocol) = negotiate_protocol(&request.headers, supported) else {
        let requested: Vec<&str> = request
            .headers
            .get_all(STREAM_PROTOCOL_VERSION_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let message = format!(
            "unable to upgrade: unable to negotiate protocol: client supports {:?}, server accepts {:?}",
            requested, supported
        );
        reject(
            &mut io,
            StatusCode::FORBIDDEN,
            Some((ACCEPTED_STREAM_PROTOCOL_VERSIONS_HEADER, supported.join(", "))),
            &message,
        )
        .await?;
        return Err(TransportError::ProtocolNegotiation(message));
    };

    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, SPDY_UPGRADE)
        .header(STREAM_PROTOCOL_VERSION_HEADER, protocol.as_str())
        .body(())
        .map_err(|e| TransportError::ProtocolError(format!("Invalid response: {}", e)))?;
    io.write_all(&encode_response_head(&response)).await?;
    io.flush().await?;

    request.protocol = protocol;
    let session = MuxSession::new(io, buf, Role::Server, config)?;
    Ok((request, session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtunnel_proto::portforward::PROTOCOL_V1;

    #[test]
    fn test_upgrade_request_head() {
        let request = upgrade_request(
            "10.0.0.1:6443",
            "/api/v1/namespaces/default/pods/web-0/portforward",
            PROTOCOL_V1,
            Some("Bearer abc"),
        )
        .unwrap();
        let head = String::from_utf8(encode_request_head(&request)).unwrap();

        assert!(head.starts_with(
            "POST /api/v1/namespaces/default/pods/web-0/portforward HTTP/1.1\r\n"
        ));
        assert!(head.contains("connection: Upgrade\r\n"));
        assert!(head.contains("upgrade: SPDY/3.1\r\n"));
        assert!(head.contains("x-stream-protocol-version: portforward.k8s.io\r\n"));
        assert!(head.contains("authorization: Bearer abc\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_verify_upgrade_response() {
        let ok = Response::builder()
            .status(101)
            .header("Upgrade", "SPDY/3.1")
            .header("X-Stream-Protocol-Version", PROTOCOL_V1)
            .body(())
            .unwrap();
        assert!(verify_upgrade_response(&ok, PROTOCOL_V1).is_ok());

        let missing = Response::builder()
            .status(101)
            .header("Upgrade", "spdy/3.1")
            .body(())
            .unwrap();
        assert!(matches!(
            verify_upgrade_response(&missing, PROTOCOL_V1),
            Err(TransportError::ProtocolNegotiation(_))
        ));

        let websocket = Response::builder()
            .status(101)
            .header("Upgrade", "websocket")
            .header("X-Stream-Protocol-Version", PROTOCOL_V1)
            .body(())
            .unwrap();
        assert!(verify_upgrade_response(&websocket, PROTOCOL_V1).is_err());
    }

    #[test]
    fn test_negotiate_protocol() {
        let mut headers = HeaderMap::new();
        headers.append(
            STREAM_PROTOCOL_VERSION_HEADER,
            HeaderValue::from_static("v2.portforward.k8s.io, portforward.k8s.io"),
        );

        assert_eq!(
            negotiate_protocol(&headers, &[PROTOCOL_V1]),
            Some(PROTOCOL_V1.to_string())
        );
        assert_eq!(negotiate_protocol(&headers, &["channel.k8s.io"]), None);
        assert_eq!(negotiate_protocol(&HeaderMap::new(), &[PROTOCOL_V1]), None);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_carries_body() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            read_head(&mut server, &mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 12\r\n\r\nUnauthorized")
                .await
                .unwrap();
        });

        let request = upgrade_request("localhost", "/x", PROTOCOL_V1, None).unwrap();
        let err = client_handshake(&mut client, &request, PROTOCOL_V1)
            .await
            .unwrap_err();

        match err {
            TransportError::UpgradeRejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Unauthorized");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_returned() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            read_head(&mut server, &mut buf).await.unwrap();
            server
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: SPDY/3.1\r\nX-Stream-Protocol-Version: portforward.k8s.io\r\n\r\n\x80\x03",
                )
                .await
                .unwrap();
        });

        let request = upgrade_request("localhost", "/x", PROTOCOL_V1, None).unwrap();
        let leftover = client_handshake(&mut client, &request, PROTOCOL_V1)
            .await
            .unwrap();

        assert_eq!(&leftover[..], b"\x80\x03");
    }
}
