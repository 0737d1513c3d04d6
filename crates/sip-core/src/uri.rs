use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::param::{Params, unquote};

/// A `sip:`/`sips:` URI.
///
/// Only the parts the user agent reasons about are broken out; URI
/// headers (`?...`) are carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Option<String>,
}

impl Uri {
    pub fn new(host: impl Into<String>) -> Self {
        Uri {
            scheme: "sip".to_string(),
            user: None,
            password: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// The `transport` URI parameter, if any
    pub fn transport(&self) -> Option<&str> {
        self.params.value("transport")
    }

    /// Port to contact, 5060 when the URI carries none
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }

    pub fn is_loose_router(&self) -> bool {
        self.params.contains("lr")
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
        let scheme = scheme.to_ascii_lowercase();
        if !matches!(scheme.as_str(), "sip" | "sips" | "tel") {
            return Err(Error::InvalidUri(s.to_string()));
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h.to_string())),
            None => (rest, None),
        };

        let (userinfo, hostpart) = match rest.rfind('@') {
            Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
            None => (None, rest),
        };

        let (user, password) = match userinfo {
            Some(ui) => match ui.split_once(':') {
                Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                None => (Some(ui.to_string()), None),
            },
            None => (None, None),
        };

        let (hostport, params) = match hostpart.split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p)),
            None => (hostpart, Params::new()),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(Error::InvalidUri(s.to_string()));
        }

        Ok(Uri {
            scheme,
            user: user.filter(|u| !u.is_empty()),
            password,
            host,
            port,
            params,
            headers,
        })
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 references.
pub fn split_host_port(hostport: &str) -> Result<(String, Option<u16>)> {
    let hostport = hostport.trim();
    if let Some(stripped) = hostport.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| Error::InvalidUri(hostport.to_string()))?;
        let host = stripped[..end].to_string();
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }
    match hostport.rsplit_once(':') {
        Some((h, p)) => Ok((h.to_string(), Some(parse_port(p)?))),
        None => Ok((hostport.to_string(), None)),
    }
}

fn parse_port(p: &str) -> Result<u16> {
    p.trim()
        .parse::<u16>()
        .map_err(|_| Error::InvalidUri(format!("bad port {}", p)))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(pw) = &self.password {
                write!(f, ":{}", pw)?;
            }
            f.write_str("@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if let Some(h) = &self.headers {
            write!(f, "?{}", h)?;
        }
        Ok(())
    }
}

/// `display-name <uri>;params` as used in From, To, Contact, Route and
/// Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        NameAddr {
            display: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag));
    }

    pub fn without_tag(&self) -> NameAddr {
        let mut copy = self.clone();
        copy.params.remove("tag");
        copy
    }
}

impl FromStr for NameAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| i + open)
                .ok_or_else(|| Error::InvalidUri(s.to_string()))?;
            let display = unquote(&s[..open]).trim();
            let uri = s[open + 1..close].parse()?;
            let params = match s[close + 1..].trim().strip_prefix(';') {
                Some(p) => Params::parse(p),
                None => Params::new(),
            };
            Ok(NameAddr {
                display: (!display.is_empty()).then(|| display.to_string()),
                uri,
                params,
            })
        } else {
            // addr-spec form: everything after the first ';' is a header param
            let (uri, params) = match s.split_once(';') {
                Some((u, p)) => (u, Params::parse(p)),
                None => (s, Params::new()),
            };
            Ok(NameAddr {
                display: None,
                uri: uri.parse()?,
                params,
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(d) = &self.display {
            write!(f, "\"{}\" ", d)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sip:bob@10.0.0.2:5060;transport=udp".parse().unwrap();
        assert_eq!(uri.user.as_deref(), Some("bob"));
        assert_eq!(uri.host, "10.0.0.2");
        assert_eq!(uri.port, Some(5060));
        assert_eq!(uri.transport(), Some("udp"));
        assert_eq!(uri.to_string(), "sip:bob@10.0.0.2:5060;transport=udp");
    }

    #[test]
    fn test_parse_ipv6_uri() {
        let uri: Uri = "sip:alice@[2001:db8::1]:5070".parse().unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.to_string(), "sip:alice@[2001:db8::1]:5070");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!("http://example.com".parse::<Uri>().is_err());
    }

    #[test]
    fn test_name_addr_with_display_and_tag() {
        let na: NameAddr = "\"Alice\" <sip:alice@example.com>;tag=1928301774"
            .parse()
            .unwrap();
        assert_eq!(na.display.as_deref(), Some("Alice"));
        assert_eq!(na.tag(), Some("1928301774"));
        assert_eq!(na.uri.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_addr_spec_params_belong_to_header() {
        let na: NameAddr = "sip:bob@example.com;tag=abc".parse().unwrap();
        assert_eq!(na.tag(), Some("abc"));
        assert!(na.uri.params.is_empty());
    }
}
