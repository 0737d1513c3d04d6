//! REGISTER lifecycle: challenge, refresh, un-register.

mod common;

use common::{Harness, only};
use sipua_sip_core::Method;
use sipua_ua_core::EventType;

const AOR: &str = "sip:alice@example.com";
const REGISTRAR: &str = "sip:10.0.0.2";
const CHALLENGE: (&str, &str) = ("WWW-Authenticate", r#"Digest realm="example.com", nonce="n1""#);

#[test]
fn test_register_init_is_idempotent() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    assert_eq!(h.ctx.register_init(AOR, REGISTRAR, None).unwrap(), rid);
    assert_eq!(h.ctx.registrations().len(), 1);

    let other = h.ctx.register_init(AOR, "sip:10.0.0.3", None).unwrap();
    assert_ne!(other, rid);
    assert_eq!(h.ctx.registrations().len(), 2);
}

#[test]
fn test_register_challenge_answered_once() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx.register_send(rid, 3600).unwrap();
    let first = only(h.sent_requests(Method::Register));
    assert_eq!(first.cseq().unwrap().seq, 1);
    assert_eq!(first.header("Expires"), Some("3600"));

    h.reply(&first, 401, None, &[CHALLENGE]);
    let events = h.events();
    let failure = events.iter().find(|e| e.kind == EventType::RegistrationFailure).unwrap();
    assert_eq!(failure.rid, rid);
    assert_eq!(failure.status(), Some(401));

    h.ctx
        .add_authentication_info("alice", "alice", Some("secret"), None, Some("example.com"))
        .unwrap();
    h.execute();
    let second = only(h.sent_requests(Method::Register));
    assert_eq!(second.cseq().unwrap().seq, 2);
    assert_eq!(second.call_id(), first.call_id());
    assert_eq!(second.from_tag(), first.from_tag());
    let authorization = second.header("Authorization").unwrap();
    assert!(authorization.contains(r#"realm="example.com""#));
    assert_eq!(h.ctx.registration(rid).unwrap().retry, 1);

    h.reply(&second, 200, Some("reg1"), &[("Expires", "3600")]);
    let events = h.events();
    let success = events.iter().find(|e| e.kind == EventType::RegistrationSuccess).unwrap();
    assert_eq!(success.rid, rid);
    assert_eq!(h.ctx.registration(rid).unwrap().retry, 0);

    // nothing more to do until the refresh is due
    h.execute();
    assert!(h.sent_requests(Method::Register).is_empty());
}

#[test]
fn test_register_challenge_retries_capped() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx
        .add_authentication_info("alice", "alice", Some("wrong"), None, None)
        .unwrap();
    h.ctx.register_send(rid, 3600).unwrap();

    let mut last = only(h.sent_requests(Method::Register));
    for _ in 0..3 {
        h.reply(&last, 401, None, &[CHALLENGE]);
        h.execute();
        last = only(h.sent_requests(Method::Register));
    }
    assert_eq!(h.ctx.registration(rid).unwrap().retry, 3);

    h.reply(&last, 401, None, &[CHALLENGE]);
    h.execute();
    assert!(h.sent_requests(Method::Register).is_empty());
}

#[test]
fn test_period_clamped() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx.register_send(rid, 30).unwrap();
    let register = only(h.sent_requests(Method::Register));
    assert_eq!(register.header("Expires"), Some("200"));
    assert_eq!(h.ctx.registration(rid).unwrap().period, 200);
}

#[test]
fn test_refresh_before_expiry() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx.register_send(rid, 600).unwrap();
    let first = only(h.sent_requests(Method::Register));
    h.reply(&first, 200, Some("reg1"), &[]);
    h.events();

    h.advance(500);
    h.execute();
    assert!(h.sent_requests(Method::Register).is_empty());

    h.advance(50);
    h.execute();
    let refresh = only(h.sent_requests(Method::Register));
    assert_eq!(refresh.cseq().unwrap().seq, 2);
    assert_eq!(refresh.header("Expires"), Some("600"));
    assert!(refresh.header("Authorization").is_none());
}

#[test]
fn test_unanswered_register_resent() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx.register_send(rid, 3600).unwrap();
    let first = only(h.sent_requests(Method::Register));
    h.reply(&first, 503, None, &[]);

    h.advance(121);
    h.execute();
    let again = only(h.sent_requests(Method::Register));
    assert_eq!(again.cseq().unwrap().seq, 2);
}

#[test]
fn test_unregister_frees_registration() {
    let mut h = Harness::new();
    let rid = h.ctx.register_init(AOR, REGISTRAR, None).unwrap();
    h.ctx.register_send(rid, 3600).unwrap();
    let first = only(h.sent_requests(Method::Register));
    h.reply(&first, 200, Some("reg1"), &[]);

    h.ctx.register_send(rid, 0).unwrap();
    let unregister = only(h.sent_requests(Method::Register));
    assert_eq!(unregister.header("Expires"), Some("0"));
    h.reply(&unregister, 200, Some("reg1"), &[]);
    assert!(h.event_kinds().contains(&EventType::RegistrationTerminated));

    h.execute();
    assert!(h.ctx.registration(rid).is_none());
}

#[test]
fn test_register_remove_unknown() {
    let mut h = Harness::new();
    assert!(h.ctx.register_remove(7).is_err());
    assert!(h.ctx.register_send(7, 3600).is_err());
}
