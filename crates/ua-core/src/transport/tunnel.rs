//! UDP traffic carried over an HTTP proxy connection.
//!
//! The proxy is asked with a bare `GET / HTTP/1.1` whose `UdpHost` header
//! names the SIP outbound proxy; after a `200 OK` the connection carries SIP
//! messages framed like TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::errors::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SIP_PORT: u16 = 5060;

/// `UdpHost` value for `outbound_proxy`, which may omit its port.
fn udp_host(outbound_proxy: &str) -> String {
    let has_port = outbound_proxy
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    if has_port {
        outbound_proxy.to_string()
    } else {
        format!("{}:{}", outbound_proxy, DEFAULT_SIP_PORT)
    }
}

/// Ask the HTTP proxy on `stream` for a tunnel to `outbound_proxy`.
pub async fn handshake<S>(stream: &mut S, outbound_proxy: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET / HTTP/1.1\r\nUdpHost: {}\r\n\r\n", udp_host(outbound_proxy));
    stream.write_all(request.as_bytes()).await?;

    let mut reply = [0u8; 2048];
    let n = timeout(HANDSHAKE_TIMEOUT, stream.read(&mut reply))
        .await
        .map_err(|_| Error::Transport("HTTP tunnel handshake timed out".into()))??;
    let reply = &reply[..n];
    if reply.starts_with(b"HTTP/1.0 200 OK\r\n") || reply.starts_with(b"HTTP/1.1 200 OK\r\n") {
        debug!("HTTP tunnel to {} accepted", outbound_proxy);
        Ok(())
    } else {
        let status = String::from_utf8_lossy(reply);
        let status = status.lines().next().unwrap_or_default();
        Err(Error::Transport(format!("HTTP tunnel refused: {}", status)))
    }
}

/// Connect to the HTTP proxy `proxy` on `port` and open the tunnel.
pub async fn open(proxy: &str, port: u16, outbound_proxy: &str) -> Result<(TcpStream, SocketAddr)> {
    if proxy.is_empty() || outbound_proxy.is_empty() {
        return Err(Error::Config("HTTP tunnel needs a proxy and an outbound proxy".into()));
    }
    let host = proxy.rsplit_once(':').map_or(proxy, |(host, _)| host);
    let addr = lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Transport(format!("cannot resolve HTTP proxy {}", proxy)))?;
    let mut stream = TcpStream::connect(addr).await?;
    handshake(&mut stream, outbound_proxy).await?;
    info!("SIP over HTTP tunnel through {}", addr);
    Ok((stream, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_host_default_port() {
        assert_eq!(udp_host("proxy.example.com"), "proxy.example.com:5060");
        assert_eq!(udp_host("10.0.0.1:5070"), "10.0.0.1:5070");
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        handshake(&mut client, "sip.example.com").await.unwrap();
        let request = proxy.await.unwrap();
        assert_eq!(request, "GET / HTTP/1.1\r\nUdpHost: sip.example.com:5060\r\n\r\n");
    }

    #[tokio::test]
    async fn test_handshake_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        });
        let err = handshake(&mut client, "sip.example.com").await.unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
