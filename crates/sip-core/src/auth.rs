//! Digest authentication (RFC 2617) as used by SIP.
//!
//! Parses `WWW-Authenticate` / `Proxy-Authenticate` challenges and
//! computes the matching `Authorization` / `Proxy-Authorization` value.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::param::{split_comma_list, unquote};

/// A parsed digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

impl Challenge {
    /// True when the server offers `qop=auth`.
    pub fn offers_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .is_some_and(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
    }
}

impl FromStr for Challenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::invalid_header("WWW-Authenticate", s))?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(Error::invalid_header("WWW-Authenticate", s));
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop = None;
        let mut stale = false;

        for item in split_comma_list(rest) {
            let Some((name, value)) = item.split_once('=') else {
                continue;
            };
            let value = unquote(value).to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                "qop" => qop = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(Challenge {
            scheme: scheme.to_string(),
            realm: realm.ok_or_else(|| Error::invalid_header("WWW-Authenticate", s))?,
            nonce: nonce.ok_or_else(|| Error::invalid_header("WWW-Authenticate", s))?,
            opaque,
            algorithm,
            qop,
            stale,
        })
    }
}

/// Secret used to answer a challenge: a clear password or a precomputed HA1
#[derive(Debug, Clone, Copy)]
pub enum Secret<'a> {
    Password(&'a str),
    Ha1(&'a str),
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// HA1 = MD5(username:realm:password)
pub fn compute_ha1(username: &str, realm: &str, password: &str) -> String {
    md5_hex(&format!("{}:{}:{}", username, realm, password))
}

/// The `response=` value for a challenge.
///
/// `cnonce` is only used when the challenge offers `qop=auth`.
pub fn digest_response(
    challenge: &Challenge,
    username: &str,
    secret: Secret<'_>,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> String {
    let ha1 = match secret {
        Secret::Password(pw) => compute_ha1(username, &challenge.realm, pw),
        Secret::Ha1(ha1) => ha1.to_string(),
    };
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    if challenge.offers_qop_auth() {
        md5_hex(&format!(
            "{}:{}:00000001:{}:auth:{}",
            ha1, challenge.nonce, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }
}

/// Build the full `Digest ...` credentials value for a challenge.
pub fn authorization_value(
    challenge: &Challenge,
    username: &str,
    secret: Secret<'_>,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> String {
    let response = digest_response(challenge, username, secret, method, uri, cnonce);
    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
        username,
        challenge.realm,
        challenge.nonce,
        uri,
        response,
        challenge.algorithm.as_deref().unwrap_or("MD5"),
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    if challenge.offers_qop_auth() {
        value.push_str(&format!(", qop=auth, nc=00000001, cnonce=\"{}\"", cnonce));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let c: Challenge = r#"Digest realm="example.com", nonce="abc123", opaque="xyz", qop="auth,auth-int""#
            .parse()
            .unwrap();
        assert_eq!(c.realm, "example.com");
        assert_eq!(c.nonce, "abc123");
        assert_eq!(c.opaque.as_deref(), Some("xyz"));
        assert!(c.offers_qop_auth());
    }

    #[test]
    fn test_rejects_basic() {
        assert!("Basic realm=\"x\"".parse::<Challenge>().is_err());
    }

    #[test]
    fn test_rfc2617_style_vector() {
        // HA1 and HA2 taken from the RFC 2617 section 3.5 example, adapted to
        // the no-qop form.
        let c = Challenge {
            scheme: "Digest".into(),
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: None,
            algorithm: None,
            qop: None,
            stale: false,
        };
        let ha1 = compute_ha1("Mufasa", "testrealm@host.com", "Circle Of Life");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
        let by_password = digest_response(
            &c,
            "Mufasa",
            Secret::Password("Circle Of Life"),
            "GET",
            "/dir/index.html",
            "",
        );
        let by_ha1 = digest_response(&c, "Mufasa", Secret::Ha1(&ha1), "GET", "/dir/index.html", "");
        assert_eq!(by_password, by_ha1);
        assert_eq!(by_password.len(), 32);
    }

    #[test]
    fn test_authorization_value_carries_uri_and_opaque() {
        let c: Challenge = r#"Digest realm="example.com", nonce="n", opaque="o""#.parse().unwrap();
        let v = authorization_value(&c, "alice", Secret::Password("pw"), "REGISTER", "sip:example.com", "c");
        assert!(v.starts_with("Digest username=\"alice\""));
        assert!(v.contains("uri=\"sip:example.com\""));
        assert!(v.contains("opaque=\"o\""));
        assert!(!v.contains("qop"));
    }
}
