//! Minimal SOCKS5 / HTTP `CONNECT` front end used by the relay.
//!
//! Only the no-authentication method and the `CONNECT` command are offered,
//! which is all a remote solving service needs to tunnel its browser through
//! this host.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::RelayError;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HTTP_HEADER: usize = 16 * 1024;

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Addr(addr) => write!(f, "{addr}"),
            Target::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl Target {
    async fn connect(&self) -> std::io::Result<TcpStream> {
        let attempt = async {
            match self {
                Target::Addr(addr) => TcpStream::connect(addr).await,
                Target::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            }
        };
        tokio::time::timeout(CONNECT_TIMEOUT, attempt)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream connect timed out"))?
    }
}

/// Serve one accepted client: negotiate, connect upstream, then pump bytes
/// both ways until either side closes.
pub async fn serve(mut client: TcpStream) -> Result<(), RelayError> {
    let mut first = [0u8; 1];
    client.read_exact(&mut first).await?;

    let upstream = if first[0] == SOCKS_VERSION {
        socks5_handshake(&mut client).await?
    } else {
        http_connect_handshake(&mut client, first[0]).await?
    };

    let Some(mut upstream) = upstream else {
        return Ok(());
    };
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    log::trace!("relay session closed ({sent} bytes up, {received} bytes down)");
    Ok(())
}

/// SOCKS5 negotiation after the version byte has been consumed.
async fn socks5_handshake(client: &mut TcpStream) -> Result<Option<TcpStream>, RelayError> {
    let methods = read_methods(client).await?;
    if !methods.contains(&NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(RelayError::Protocol("client offered no usable auth method".into()));
    }
    client.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let (command, target) = match read_request(client).await {
        Ok(request) => request,
        Err(RelayError::UnsupportedAddress(atyp)) => {
            write_reply(client, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(RelayError::UnsupportedAddress(atyp));
        }
        Err(err) => return Err(err),
    };

    if command != CMD_CONNECT {
        write_reply(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(RelayError::Protocol(format!("unsupported SOCKS command {command:#04x}")));
    }

    match target.connect().await {
        Ok(upstream) => {
            log::debug!("socks5 tunnel to {target}");
            write_reply(client, REPLY_SUCCEEDED).await?;
            Ok(Some(upstream))
        }
        Err(err) => {
            let code = if err.kind() == std::io::ErrorKind::ConnectionRefused {
                REPLY_CONNECTION_REFUSED
            } else {
                REPLY_HOST_UNREACHABLE
            };
            write_reply(client, code).await?;
            log::debug!("socks5 connect to {target} failed: {err}");
            Ok(None)
        }
    }
}

async fn read_methods<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, RelayError> {
    let count = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(count)];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Parse `VER CMD RSV ATYP DST.ADDR DST.PORT`.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u8, Target), RelayError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != SOCKS_VERSION {
        return Err(RelayError::Protocol(format!("bad SOCKS version {version}")));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Target::Addr(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Target::Addr(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(name)
                .map_err(|_| RelayError::Protocol("domain name is not utf-8".into()))?;
            Target::Domain(host, port)
        }
        other => return Err(RelayError::UnsupportedAddress(other)),
    };

    Ok((command, target))
}

async fn write_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: u8) -> Result<(), RelayError> {
    let reply = [SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    Ok(())
}

/// HTTP `CONNECT host:port` tunnelling; `first` is the already-read byte.
async fn http_connect_handshake(client: &mut TcpStream, first: u8) -> Result<Option<TcpStream>, RelayError> {
    let mut head = vec![first];
    {
        let mut reader = BufReader::new(&mut *client);
        loop {
            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 {
                return Err(RelayError::Protocol("connection closed during http handshake".into()));
            }
            head.extend_from_slice(&line);
            if line == b"\r\n" || line == b"\n" {
                break;
            }
            if head.len() > MAX_HTTP_HEADER {
                return Err(RelayError::Protocol("http proxy header too large".into()));
            }
        }
        if !reader.buffer().is_empty() {
            return Err(RelayError::Protocol("client sent data before tunnel was established".into()));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let request_line = head.lines().next().unwrap_or_default();
    let target = match parse_connect_line(request_line) {
        Some(target) => target,
        None => {
            client
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return Err(RelayError::Protocol(format!("unsupported proxy request `{request_line}`")));
        }
    };

    match target.connect().await {
        Ok(upstream) => {
            log::debug!("http tunnel to {target}");
            client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
            Ok(Some(upstream))
        }
        Err(err) => {
            log::debug!("http connect to {target} failed: {err}");
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n").await?;
            Ok(None)
        }
    }
}

/// Parse `CONNECT host:port HTTP/1.1`.
pub fn parse_connect_line(line: &str) -> Option<Target> {
    let mut parts = line.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("CONNECT") {
        return None;
    }
    let authority = parts.next()?;
    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Some(Target::Addr(addr));
    }
    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some(Target::Domain(host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_socks_requests() {
        let mut ipv4: &[u8] = &[5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90];
        let (command, target) = read_request(&mut ipv4).await.unwrap();
        assert_eq!(command, CMD_CONNECT);
        assert_eq!(target, Target::Addr("127.0.0.1:8080".parse().unwrap()));

        let mut domain: Vec<u8> = vec![5, 1, 0, 3, 11];
        domain.extend_from_slice(b"example.com");
        domain.extend_from_slice(&443u16.to_be_bytes());
        let (_, target) = read_request(&mut domain.as_slice()).await.unwrap();
        assert_eq!(target, Target::Domain("example.com".into(), 443));

        let mut bogus: &[u8] = &[5, 1, 0, 9];
        assert!(matches!(
            read_request(&mut bogus).await,
            Err(RelayError::UnsupportedAddress(9))
        ));
    }

    #[test]
    fn parses_http_connect_lines() {
        assert_eq!(
            parse_connect_line("CONNECT example.com:443 HTTP/1.1"),
            Some(Target::Domain("example.com".into(), 443))
        );
        assert_eq!(
            parse_connect_line("CONNECT 10.0.0.1:8443 HTTP/1.1"),
            Some(Target::Addr("10.0.0.1:8443".parse().unwrap()))
        );
        assert_eq!(parse_connect_line("GET http://example.com/ HTTP/1.1"), None);
    }
}
