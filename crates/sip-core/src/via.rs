use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::param::Params;
use crate::uri::split_host_port;

/// Magic cookie that prefixes every RFC 3261 branch parameter
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Transport protocol named in a Via header or a `transport` URI param
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
        }
    }

    /// Unreliable transports need request retransmission (timers A and E).
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Transport::Udp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UDP" => Ok(Transport::Udp),
            "TCP" => Ok(Transport::Tcp),
            "TLS" => Ok(Transport::Tls),
            other => Err(Error::invalid_header("Via", other)),
        }
    }
}

/// One Via header value: `SIP/2.0/UDP host:port;branch=...;rport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: Transport,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: Transport, host: impl Into<String>, port: u16, branch: &str) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(branch));
        Via {
            transport,
            host: host.into(),
            port: Some(port),
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }

    /// True when the branch carries the RFC 3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch()
            .is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }

    /// `Some(None)` for a bare `rport`, `Some(Some(p))` once filled in.
    pub fn rport(&self) -> Option<Option<u16>> {
        self.params
            .get("rport")
            .map(|v| v.and_then(|p| p.parse().ok()))
    }

    pub fn received(&self) -> Option<&str> {
        self.params.value("received")
    }

    /// Record the observed source address of a request (RFC 3581).
    pub fn set_received(&mut self, host: &str, port: u16) {
        self.params.set("received", Some(host));
        if self.params.contains("rport") {
            self.params.set("rport", Some(&port.to_string()));
        }
    }

    /// Where responses to this hop go: received/rport first, then sent-by.
    pub fn response_target(&self) -> (String, u16) {
        let host = self.received().unwrap_or(self.host.as_str()).to_string();
        let port = self
            .rport()
            .flatten()
            .or(self.port)
            .unwrap_or(5060);
        (host, port)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (proto, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::invalid_header("Via", s))?;
        let mut parts = proto.split('/');
        let (name, version, transport) = (parts.next(), parts.next(), parts.next());
        if !name.is_some_and(|n| n.eq_ignore_ascii_case("SIP"))
            || version != Some("2.0")
        {
            return Err(Error::invalid_header("Via", s));
        }
        let transport = transport
            .ok_or_else(|| Error::invalid_header("Via", s))?
            .parse()?;

        let (hostport, params) = match rest.trim().split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p)),
            None => (rest.trim(), Params::new()),
        };
        let (host, port) =
            split_host_port(hostport).map_err(|_| Error::invalid_header("Via", s))?;

        Ok(Via {
            transport,
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_via_with_rport() {
        let via: Via = "SIP/2.0/UDP 192.168.1.10:5060;rport;branch=z9hG4bK776asdhds"
            .parse()
            .unwrap();
        assert_eq!(via.transport, Transport::Udp);
        assert_eq!(via.host, "192.168.1.10");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.rport(), Some(None));
        assert!(via.has_rfc3261_branch());
    }

    #[test]
    fn test_received_and_rport_fill_in() {
        let mut via: Via = "SIP/2.0/UDP 10.0.0.5:5060;rport;branch=z9hG4bK1"
            .parse()
            .unwrap();
        via.set_received("203.0.113.7", 40000);
        assert_eq!(via.response_target(), ("203.0.113.7".to_string(), 40000));
        assert!(via.to_string().contains("rport=40000"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("HTTP/1.1 host".parse::<Via>().is_err());
    }
}
