use proptest::prelude::*;
use sipua_sip_core::{Message, Method};
use sipua_ua_core::auth::AuthStore;
use sipua_ua_core::net::Network;
use sipua_ua_core::requests::Builder;

fn challenged(method: &str, seq: u32, stale: bool) -> Message {
    let stale = if stale {
        "Proxy-Authorization: Digest username=\"alice\", realm=\"old\", nonce=\"x\", uri=\"sip:bob@10.0.0.2\", response=\"00\"\r\n"
    } else {
        ""
    };
    let raw = format!(
        "{method} sip:bob@10.0.0.2 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;rport;branch=z9hG4bKorig\r\n\
From: <sip:alice@example.com>;tag=a1\r\n\
To: <sip:bob@example.com>\r\n\
Call-ID: prop@10.0.0.1\r\n\
CSeq: {seq} {method}\r\n\
{stale}Content-Length: 0\r\n\r\n"
    );
    Message::parse(raw.as_bytes()).unwrap()
}

proptest! {
    #[test]
    fn credential_retry_is_a_fresh_attempt(
        seq in 1u32..1_000_000,
        method in prop::sample::select(vec!["INVITE", "SUBSCRIBE", "MESSAGE", "REGISTER"]),
        stale in any::<bool>(),
        proxy in any::<bool>(),
    ) {
        let net = Network::default();
        let builder = Builder::new(&net, "test-agent");
        let mut auth = AuthStore::new();
        auth.add("alice", "alice", Some("secret"), None, Some("example.com")).unwrap();

        let orig = challenged(method, seq, stale);
        let header = if proxy { "Proxy-Authenticate" } else { "WWW-Authenticate" };
        let mut challenge = Message::response_to(&orig, if proxy { 407 } else { 401 });
        challenge.add_header(header, r#"Digest realm="example.com", nonce="fresh""#);

        let retry = builder.rebuild_with_credentials(&orig, &challenge, &auth).unwrap();
        let cseq = retry.cseq().unwrap();
        prop_assert_eq!(cseq.seq, seq + 1);
        prop_assert_eq!(retry.method(), orig.method());
        prop_assert_eq!(retry.call_id(), orig.call_id());
        let retry_via = retry.top_via().unwrap();
        let orig_via = orig.top_via().unwrap();
        prop_assert_ne!(retry_via.branch(), orig_via.branch());

        let answered = if proxy { "Proxy-Authorization" } else { "Authorization" };
        let stale_kind = if proxy { "Authorization" } else { "Proxy-Authorization" };
        let answers: Vec<&str> = retry.headers(answered).collect();
        prop_assert_eq!(answers.len(), 1);
        prop_assert!(answers[0].contains("nonce=\"fresh\""));
        prop_assert_eq!(retry.headers(stale_kind).count(), 0);
        prop_assert!(!retry.headers("Proxy-Authorization").any(|v| v.contains("realm=\"old\"")));
    }

    #[test]
    fn retry_without_credentials_fails(seq in 1u32..1_000_000) {
        let net = Network::default();
        let builder = Builder::new(&net, "test-agent");
        let auth = AuthStore::new();
        let orig = challenged("INVITE", seq, false);
        let mut challenge = Message::response_to(&orig, 407);
        challenge.add_header("Proxy-Authenticate", r#"Digest realm="example.com", nonce="n""#);
        prop_assert!(builder.rebuild_with_credentials(&orig, &challenge, &auth).is_err());
        prop_assert!(orig.is_method(&Method::Invite));
    }
}
