//! Credentials and challenge answering.
//!
//! Lookup goes by `(username, realm)`: entries for the same username are
//! searched first, then every entry. An exact realm match wins at once;
//! an entry with an empty realm is remembered as a wildcard fallback.

use sipua_sip_core::auth::authorization_value;
use sipua_sip_core::param::unquote;
use sipua_sip_core::random::new_tag;
use sipua_sip_core::{Challenge, Message, Secret};
use tracing::{debug, warn};

use crate::errors::{Error, Result};

/// Credentials for one user, optionally restricted to one realm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    /// Matched against the From user of outgoing requests
    pub username: String,
    /// Name sent in the Authorization header
    pub userid: String,
    pub passwd: Option<String>,
    /// Precomputed MD5(userid:realm:password)
    pub ha1: Option<String>,
    /// Empty means any realm
    pub realm: String,
}

impl AuthInfo {
    fn secret(&self) -> Option<Secret<'_>> {
        match (&self.passwd, &self.ha1) {
            (Some(pw), _) if !pw.is_empty() => Some(Secret::Password(pw)),
            (_, Some(ha1)) if !ha1.is_empty() => Some(Secret::Ha1(ha1)),
            _ => None,
        }
    }

    fn realm_matches(&self, realm: &str) -> bool {
        self.realm == realm || unquote(&self.realm) == unquote(realm)
    }
}

/// Newest-first list of credentials
#[derive(Debug, Clone, Default)]
pub struct AuthStore {
    entries: Vec<AuthInfo>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials. `username` and `userid` are required, and one of
    /// `passwd` / `ha1`.
    pub fn add(
        &mut self,
        username: &str,
        userid: &str,
        passwd: Option<&str>,
        ha1: Option<&str>,
        realm: Option<&str>,
    ) -> Result<()> {
        if username.is_empty() || userid.is_empty() {
            return Err(Error::bad_argument("username and userid are required"));
        }
        let passwd = passwd.filter(|p| !p.is_empty());
        let ha1 = ha1.filter(|h| !h.is_empty());
        if passwd.is_none() && ha1.is_none() {
            return Err(Error::bad_argument("a password or a HA1 is required"));
        }
        debug!("adding credentials for {} realm={:?}", username, realm);
        self.entries.insert(
            0,
            AuthInfo {
                username: username.to_string(),
                userid: userid.to_string(),
                passwd: passwd.map(str::to_string),
                ha1: ha1.map(str::to_string),
                realm: realm.unwrap_or_default().to_string(),
            },
        );
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, username: &str, realm: &str) -> Option<&AuthInfo> {
        let mut fallback = None;
        for entry in self.entries.iter().filter(|e| e.username == username) {
            if entry.realm.is_empty() && fallback.is_none() {
                fallback = Some(entry);
            } else if entry.realm_matches(realm) {
                return Some(entry);
            }
        }
        for entry in &self.entries {
            if entry.realm.is_empty() && fallback.is_none() {
                fallback = Some(entry);
            } else if entry.realm_matches(realm) {
                return Some(entry);
            }
        }
        fallback
    }

    /// Answer every challenge of `challenge_response` on `request`.
    ///
    /// Each `WWW-Authenticate` gets an `Authorization`, each
    /// `Proxy-Authenticate` a `Proxy-Authorization`. The caller removes
    /// stale credentials first.
    pub fn add_authentication(&self, request: &mut Message, challenge_response: &Message) -> Result<()> {
        let username = request
            .from()
            .and_then(|f| f.uri.user.clone())
            .ok_or_else(|| Error::bad_argument("request has no From user"))?;
        let method = request
            .method()
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::bad_argument("not a request"))?;
        let uri = request
            .request_uri()
            .map(|u| u.to_string())
            .ok_or_else(|| Error::bad_argument("not a request"))?;

        let www: Vec<String> = challenge_response
            .headers("WWW-Authenticate")
            .map(str::to_string)
            .collect();
        let proxy: Vec<String> = challenge_response
            .headers("Proxy-Authenticate")
            .map(str::to_string)
            .collect();
        if www.is_empty() && proxy.is_empty() {
            return Err(Error::MissingChallenge);
        }

        let mut answers = Vec::new();
        for (header, values) in [("Authorization", &www), ("Proxy-Authorization", &proxy)] {
            for value in values {
                let challenge: Challenge = value.parse()?;
                let info = self.find(&username, &challenge.realm).ok_or_else(|| {
                    warn!("no credentials for {} in realm {}", username, challenge.realm);
                    Error::NoCredentials {
                        username: username.clone(),
                        realm: challenge.realm.clone(),
                    }
                })?;
                let secret = info.secret().ok_or_else(|| Error::NoCredentials {
                    username: username.clone(),
                    realm: challenge.realm.clone(),
                })?;
                let cnonce = new_tag();
                answers.push((
                    header,
                    authorization_value(&challenge, &info.userid, secret, &method, &uri, &cnonce),
                ));
            }
        }
        for (header, value) in answers {
            request.add_header(header, value);
        }
        Ok(())
    }
}

/// Remove every credential header from a request about to be re-sent.
pub fn strip_credentials(request: &mut Message) {
    request.remove_headers("Authorization");
    request.remove_headers("Proxy-Authorization");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenged() -> (Message, Message) {
        let req = Message::parse(
            b"REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;rport;branch=z9hG4bK1\r\n\
From: <sip:alice@example.com>;tag=1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: r1@10.0.0.1\r\n\
CSeq: 1 REGISTER\r\n\
\r\n",
        )
        .unwrap();
        let mut resp = Message::response_to(&req, 401);
        resp.add_header("WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);
        (req, resp)
    }

    #[test]
    fn test_add_requires_secret() {
        let mut store = AuthStore::new();
        assert!(store.add("alice", "alice", None, None, None).is_err());
        assert!(store.add("", "alice", Some("pw"), None, None).is_err());
        assert!(store.add("alice", "alice", None, Some("abcd"), None).is_ok());
    }

    #[test]
    fn test_exact_realm_beats_wildcard() {
        let mut store = AuthStore::new();
        store.add("alice", "any", Some("pw0"), None, None).unwrap();
        store.add("alice", "exact", Some("pw1"), None, Some("example.com")).unwrap();
        assert_eq!(store.find("alice", "example.com").unwrap().userid, "exact");
        assert_eq!(store.find("alice", "other.org").unwrap().userid, "any");
    }

    #[test]
    fn test_second_pass_searches_other_users() {
        let mut store = AuthStore::new();
        store.add("bob", "bob-id", Some("pw"), None, Some("example.com")).unwrap();
        assert_eq!(store.find("alice", "example.com").unwrap().userid, "bob-id");
        assert!(store.find("alice", "nowhere").is_none());
    }

    #[test]
    fn test_quoted_realm_matches() {
        let mut store = AuthStore::new();
        store.add("alice", "a", Some("pw"), None, Some("\"example.com\"")).unwrap();
        assert!(store.find("alice", "example.com").is_some());
    }

    #[test]
    fn test_add_authentication_answers_each_challenge() {
        let mut store = AuthStore::new();
        store.add("alice", "alice", Some("secret"), None, Some("example.com")).unwrap();
        let (mut req, mut resp) = challenged();
        resp.add_header("Proxy-Authenticate", r#"Digest realm="example.com", nonce="n2""#);
        store.add_authentication(&mut req, &resp).unwrap();
        assert_eq!(req.headers("Authorization").count(), 1);
        assert_eq!(req.headers("Proxy-Authorization").count(), 1);
        assert!(req.header("Authorization").unwrap().contains("nonce=\"n1\""));
    }

    #[test]
    fn test_missing_credentials_leave_request_untouched() {
        let store = AuthStore::new();
        let (mut req, resp) = challenged();
        assert!(matches!(
            store.add_authentication(&mut req, &resp),
            Err(Error::NoCredentials { .. })
        ));
        assert!(!req.has_header("Authorization"));
    }

    #[test]
    fn test_strip_credentials() {
        let (mut req, _) = challenged();
        req.add_header("Authorization", "Digest x");
        req.add_header("Proxy-Authorization", "Digest y");
        strip_credentials(&mut req);
        assert!(!req.has_header("Authorization"));
        assert!(!req.has_header("Proxy-Authorization"));
    }
}
