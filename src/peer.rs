//! Client address resolution
//!
//! The real client IP either comes straight from the socket or, behind a load
//! balancer, from a PROXY protocol v1 line that precedes the SSH preamble.
//! The header is read one byte at a time so nothing after its newline is
//! consumed; those bytes belong to the SSH version exchange.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::debug;

const PROXY_SIGNATURE: &[u8] = b"PROXY ";

/// Longest header line accepted after the signature (v1 lines never exceed 107 bytes)
const MAX_HEADER_LINE: usize = 110;

/// Longest textual IP kept (INET6_ADDRSTRLEN - 1)
const MAX_IP_LEN: usize = 45;

/// Resolved client address, as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(String);

impl ClientIp {
    pub fn new(ip: impl Into<String>) -> Self {
        let mut ip = ip.into();
        if ip.len() > MAX_IP_LEN {
            let mut end = MAX_IP_LEN;
            while !ip.is_char_boundary(end) {
                end -= 1;
            }
            ip.truncate(end);
        }
        Self(ip)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum IdentifyError {
    /// Peer closed before sending anything; usually a health checker
    #[error("disconnected before sending any data")]
    NoData,
    #[error("connection closed inside the proxy header")]
    Truncated,
    #[error("missing PROXY signature")]
    BadSignature,
    #[error("proxy header line exceeds {MAX_HEADER_LINE} bytes")]
    HeaderTooLong,
    #[error("proxy header has {0} tokens, expected 5")]
    TokenCount(usize),
    #[error("cannot read peer address: {0}")]
    PeerAddr(#[source] io::Error),
    #[error("i/o error reading proxy header: {0}")]
    Io(#[from] io::Error),
}

impl IdentifyError {
    /// Expected conditions that should not be reported as failures
    pub fn is_quiet(&self) -> bool {
        matches!(self, IdentifyError::NoData)
    }
}

/// Resolve the client address of an accepted connection
pub async fn identify(
    stream: &mut TcpStream,
    use_proxy_protocol: bool,
) -> Result<ClientIp, IdentifyError> {
    if use_proxy_protocol {
        read_proxy_header(stream).await
    } else {
        socket_peer_ip(stream)
    }
}

/// Address reported by the OS for the remote end of the socket
pub fn socket_peer_ip(stream: &TcpStream) -> Result<ClientIp, IdentifyError> {
    let addr = stream.peer_addr().map_err(IdentifyError::PeerAddr)?;
    Ok(ClientIp::new(addr.ip().to_string()))
}

/// Consume a PROXY v1 header and return its source address
///
/// `PROXY <proto> <src-ip> <dst-ip> <src-port> <dst-port>\r\n`
pub async fn read_proxy_header<R>(reader: &mut R) -> Result<ClientIp, IdentifyError>
where
    R: AsyncRead + Unpin,
{
    let mut signature = [0u8; PROXY_SIGNATURE.len()];
    let mut filled = 0;
    while filled < signature.len() {
        let n = reader.read(&mut signature[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                IdentifyError::NoData
            } else {
                IdentifyError::Truncated
            });
        }
        filled += n;
    }
    if signature != PROXY_SIGNATURE {
        return Err(IdentifyError::BadSignature);
    }

    let line = read_single_line(reader).await?;
    debug!(header = %line, "proxy header");

    parse_proxy_line(&line)
}

/// Split a header line (signature already stripped) into its five tokens
pub fn parse_proxy_line(line: &str) -> Result<ClientIp, IdentifyError> {
    let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
    if tokens.len() != 5 {
        return Err(IdentifyError::TokenCount(tokens.len()));
    }
    Ok(ClientIp::new(tokens[1]))
}

/// Read up to and including `\n`, never beyond it
async fn read_single_line<R>(reader: &mut R) -> Result<String, IdentifyError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LINE);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(IdentifyError::Truncated);
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() == MAX_HEADER_LINE {
            return Err(IdentifyError::HeaderTooLong);
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp4_header() {
        let mut input: &[u8] = b"PROXY TCP4 192.0.2.1 198.51.100.7 51234 22\r\nSSH-2.0-OpenSSH\r\n";
        let ip = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(ip.as_str(), "192.0.2.1");
        // The SSH preamble is left untouched
        assert_eq!(input, b"SSH-2.0-OpenSSH\r\n");
    }

    #[tokio::test]
    async fn test_tcp6_header_without_cr() {
        let mut input: &[u8] = b"PROXY TCP6 2001:db8::1 2001:db8::2 40000 22\nrest";
        let ip = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(ip.as_str(), "2001:db8::1");
        assert_eq!(input, b"rest");
    }

    #[tokio::test]
    async fn test_empty_stream_is_no_data() {
        let mut input: &[u8] = b"";
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::NoData));
        assert!(err.is_quiet());
    }

    #[tokio::test]
    async fn test_short_signature_is_truncated() {
        let mut input: &[u8] = b"PRO";
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::Truncated));
        assert!(!err.is_quiet());
    }

    #[tokio::test]
    async fn test_ssh_preamble_is_bad_signature() {
        let mut input: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::BadSignature));
        // Only the signature-sized prefix was consumed
        assert_eq!(input, b"0-OpenSSH_9.6\r\n");
    }

    #[tokio::test]
    async fn test_wrong_token_count() {
        let mut four: &[u8] = b"PROXY TCP4 192.0.2.1 198.51.100.7 51234\r\nSSH";
        let err = read_proxy_header(&mut four).await.unwrap_err();
        assert!(matches!(err, IdentifyError::TokenCount(4)));
        assert_eq!(four, b"SSH");

        let mut six: &[u8] = b"PROXY TCP4 192.0.2.1 198.51.100.7 51234 22 extra\r\n";
        let err = read_proxy_header(&mut six).await.unwrap_err();
        assert!(matches!(err, IdentifyError::TokenCount(6)));
    }

    #[tokio::test]
    async fn test_unknown_proto_still_needs_five_tokens() {
        let mut input: &[u8] = b"PROXY UNKNOWN\r\n";
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::TokenCount(1)));
    }

    #[tokio::test]
    async fn test_missing_newline_is_truncated() {
        let mut input: &[u8] = b"PROXY TCP4 192.0.2.1 198.51.100.7 51234 22";
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::Truncated));
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let mut header = b"PROXY ".to_vec();
        header.extend(std::iter::repeat(b'a').take(200));
        header.extend_from_slice(b"\r\n");
        let mut input: &[u8] = &header;
        let err = read_proxy_header(&mut input).await.unwrap_err();
        assert!(matches!(err, IdentifyError::HeaderTooLong));
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"PRO")
            .read(b"XY TCP4 10.0.0.")
            .read(b"9 10.0.0.1 1 2\r\n")
            .build();
        let ip = read_proxy_header(&mut mock).await.unwrap();
        assert_eq!(ip.as_str(), "10.0.0.9");
    }

    #[test]
    fn test_repeated_spaces_collapse() {
        let ip = parse_proxy_line("TCP4  192.0.2.1 198.51.100.7  1 2").unwrap();
        assert_eq!(ip.as_str(), "192.0.2.1");
    }

    #[test]
    fn test_client_ip_truncated_to_buffer() {
        let ip = ClientIp::new("x".repeat(80));
        assert_eq!(ip.as_str().len(), 45);
    }

    #[tokio::test]
    async fn test_socket_peer_ip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();

        let ip = identify(&mut server_side, false).await.unwrap();
        assert_eq!(ip.as_str(), "127.0.0.1");
    }
}
