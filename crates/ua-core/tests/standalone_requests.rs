//! MESSAGE, OPTIONS and PUBLISH outside any dialog.

mod common;

use common::{Harness, only};
use sipua_sip_core::Method;
use sipua_ua_core::EventType;
use sipua_ua_core::api::PublishRequest;

const INCOMING_MESSAGE: &str = "MESSAGE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKmsg1\r\n\
From: <sip:bob@example.com>;tag=m1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: msg1@10.0.0.2\r\n\
CSeq: 1 MESSAGE\r\n\
Content-Type: text/plain\r\n\
Content-Length: 5\r\n\r\nhello";

#[test]
fn test_incoming_message_left_to_application() {
    let mut h = Harness::new();
    h.inject_raw(INCOMING_MESSAGE);
    assert!(h.sent_responses().is_empty());

    let events = h.events();
    let new = only_event(&events, EventType::MessageNew);
    let request = new.request.as_ref().unwrap();
    assert_eq!(request.body(), b"hello");

    h.ctx.answer_request(new.tid, 200, None).unwrap();
    let ok = only(h.sent_responses());
    assert_eq!(ok.status(), Some(200));
    assert!(ok.to_tag().is_some());
    assert!(h.ctx.answer_request(new.tid, 200, None).is_err());
}

#[test]
fn test_unanswered_request_reclaimed_at_abandon_window() {
    let mut h = Harness::new();
    h.inject_raw(INCOMING_MESSAGE);
    assert_eq!(h.ctx.transaction_count(), 1);

    h.advance(179);
    h.execute();
    assert_eq!(h.ctx.transaction_count(), 1);

    h.advance(1);
    h.execute();
    assert_eq!(h.ctx.transaction_count(), 0);
    assert!(h.sent_responses().is_empty());
}

#[test]
fn test_incoming_options_surfaced() {
    let mut h = Harness::new();
    h.inject_raw(
        &INCOMING_MESSAGE
            .replace("MESSAGE", "OPTIONS")
            .replace("Content-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello", "Content-Length: 0\r\n\r\n"),
    );
    assert!(h.event_kinds().contains(&EventType::MessageNew));
}

#[test]
fn test_outgoing_message_answered() {
    let mut h = Harness::new();
    let mut request = h
        .ctx
        .build_message(Method::Message, "sip:bob@10.0.0.2", "sip:alice@example.com", None)
        .unwrap();
    request.set_body("text/plain", &b"hi bob"[..]);
    let tid = h.ctx.send_message(request).unwrap();
    let sent = only(h.sent_requests(Method::Message));
    assert_eq!(sent.body(), b"hi bob");

    h.reply(&sent, 202, Some("b2"), &[]);
    let events = h.events();
    let answered = only_event(&events, EventType::MessageAnswered);
    assert_eq!(answered.tid, tid);
    assert_eq!(answered.status(), Some(202));
}

#[test]
fn test_build_message_refuses_dialog_methods() {
    let h = Harness::new();
    for method in [Method::Invite, Method::Register, Method::Subscribe, Method::Cancel] {
        assert!(
            h.ctx
                .build_message(method, "sip:bob@10.0.0.2", "sip:alice@example.com", None)
                .is_err()
        );
    }
}

fn publish(h: &mut Harness) -> sipua_sip_core::Message {
    let request = h
        .ctx
        .build_publish(&PublishRequest {
            to: "sip:alice@10.0.0.2",
            from: "sip:alice@10.0.0.2",
            event: "presence",
            expires: 60,
            content_type: Some("application/pidf+xml"),
            body: Some(b"<presence/>"),
            ..Default::default()
        })
        .unwrap();
    h.ctx.publish(request).unwrap();
    only(h.sent_requests(Method::Publish))
}

#[test]
fn test_publish_reuses_entity_tag() {
    let mut h = Harness::new();
    let first = publish(&mut h);
    assert!(first.header("SIP-If-Match").is_none());
    assert_eq!(first.event(), Some("presence"));

    h.reply(&first, 200, Some("p1"), &[("SIP-ETag", "etag-1"), ("Expires", "60")]);
    let publication = &h.ctx.publications()[0];
    assert_eq!(publication.etag.as_deref(), Some("etag-1"));

    let second = publish(&mut h);
    assert_eq!(second.header("SIP-If-Match"), Some("etag-1"));
    assert_eq!(h.ctx.publications().len(), 1);

    // the server lost our state
    h.reply(&second, 412, Some("p1"), &[]);
    let third = publish(&mut h);
    assert!(third.header("SIP-If-Match").is_none());
}

#[test]
fn test_expired_entity_tag_not_sent() {
    let mut h = Harness::new();
    let first = publish(&mut h);
    h.reply(&first, 200, Some("p1"), &[("SIP-ETag", "etag-1"), ("Expires", "60")]);

    h.advance(60);
    let again = publish(&mut h);
    assert!(again.header("SIP-If-Match").is_none());
}

fn only_event(events: &[sipua_ua_core::Event], kind: EventType) -> &sipua_ua_core::Event {
    let found: Vec<_> = events.iter().filter(|e| e.kind == kind).collect();
    assert_eq!(found.len(), 1, "{:?} in {:?}", kind, events);
    found[0]
}
