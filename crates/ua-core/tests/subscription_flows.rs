//! Outgoing SUBSCRIBE/NOTIFY and the notifier side.

mod common;

use common::{Harness, only};
use sipua_sip_core::{Message, Method};
use sipua_ua_core::{EventType, SubscriptionStatus, TerminationReason};

fn subscribe(h: &mut Harness) -> (i32, Message) {
    let request = h
        .ctx
        .build_initial_subscribe("sip:bob@10.0.0.2", "sip:alice@example.com", None, "presence", 600)
        .unwrap();
    let sid = h.ctx.send_initial_subscribe(request).unwrap();
    (sid, only(h.sent_requests(Method::Subscribe)))
}

fn notify_for(subscribe: &Message, cseq: u32, state: &str) -> String {
    format!(
        "NOTIFY sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKnotify{cseq}\r\n\
From: <sip:bob@10.0.0.2>;tag=srv1\r\n\
To: <sip:alice@example.com>;tag={tag}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} NOTIFY\r\n\
Contact: <sip:bob@10.0.0.2:5060>\r\n\
Event: presence\r\n\
Subscription-State: {state}\r\n\
Content-Length: 0\r\n\r\n",
        tag = subscribe.from_tag().unwrap(),
        call_id = subscribe.call_id().unwrap(),
    )
}

fn accept(h: &mut Harness, subscribe: &Message) -> i32 {
    h.reply(
        subscribe,
        200,
        Some("srv1"),
        &[("Contact", "<sip:bob@10.0.0.2:5060>"), ("Expires", "600")],
    );
    let events = h.events();
    let answered = events
        .iter()
        .find(|e| e.kind == EventType::SubscriptionAnswered)
        .unwrap();
    assert!(answered.did > 0);
    answered.did
}

#[test]
fn test_subscribe_shape() {
    let mut h = Harness::new();
    let (sid, request) = subscribe(&mut h);
    assert!(sid > 0);
    assert_eq!(request.event(), Some("presence"));
    assert_eq!(request.expires(), Some(600));
    assert!(request.header("Contact").is_some());
    assert_eq!(h.ctx.subscribes().len(), 1);
}

#[test]
fn test_terminating_notify_closes_subscription() {
    let mut h = Harness::new();
    let (sid, request) = subscribe(&mut h);
    accept(&mut h, &request);

    h.inject_raw(&notify_for(&request, 1, "terminated;reason=timeout"));
    let answer = only(h.sent_responses());
    assert_eq!(answer.status(), Some(200));
    assert_eq!(answer.cseq_method(), Some(Method::Notify));

    let events = h.events();
    let notifies: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventType::SubscriptionNotify)
        .collect();
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].sid, sid);
    assert!(h.ctx.subscribes().is_empty());

    h.advance(600);
    h.execute();
    assert!(h.sent_requests(Method::Subscribe).is_empty());
}

#[test]
fn test_active_notify_keeps_subscription() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);
    accept(&mut h, &request);

    h.inject_raw(&notify_for(&request, 1, "active;expires=600"));
    assert_eq!(only(h.sent_responses()).status(), Some(200));
    assert!(h.event_kinds().contains(&EventType::SubscriptionNotify));
    let sub = &h.ctx.subscribes()[0];
    assert_eq!(sub.ss_status, SubscriptionStatus::Active);
}

#[test]
fn test_notify_without_state_rejected() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);
    accept(&mut h, &request);

    let text = notify_for(&request, 1, "active").replace("Subscription-State: active\r\n", "");
    h.inject_raw(&text);
    assert_eq!(only(h.sent_responses()).status(), Some(400));
    assert_eq!(h.ctx.subscribes().len(), 1);
}

#[test]
fn test_notify_before_answer_creates_dialog() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);

    h.inject_raw(&notify_for(&request, 1, "pending"));
    assert_eq!(only(h.sent_responses()).status(), Some(200));
    assert!(h.event_kinds().contains(&EventType::SubscriptionNotify));
    let sub = &h.ctx.subscribes()[0];
    assert_eq!(sub.dialogs.len(), 1);
    assert_eq!(sub.ss_status, SubscriptionStatus::Pending);
}

#[test]
fn test_stray_notify_gets_481() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);
    let text = notify_for(&request, 1, "active").replace(request.call_id().unwrap(), "unknown@10.0.0.2");
    h.inject_raw(&text);
    assert_eq!(only(h.sent_responses()).status(), Some(481));
}

#[test]
fn test_subscription_refreshed_in_dialog() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);
    let did = accept(&mut h, &request);

    h.advance(530);
    h.execute();
    assert!(h.sent_requests(Method::Subscribe).is_empty());

    h.advance(20);
    h.execute();
    let refresh = only(h.sent_requests(Method::Subscribe));
    assert_eq!(refresh.to_tag().as_deref(), Some("srv1"));
    assert_eq!(refresh.call_id(), request.call_id());
    assert!(refresh.cseq().unwrap().seq > request.cseq().unwrap().seq);
    assert_eq!(refresh.event(), Some("presence"));

    // a refresh already in flight blocks a manual one
    assert!(h.ctx.refresh_subscribe(did, None).is_err());
}

#[test]
fn test_terminate_subscribe_sends_expires_zero() {
    let mut h = Harness::new();
    let (_, request) = subscribe(&mut h);
    let did = accept(&mut h, &request);

    h.ctx.terminate_subscribe(did).unwrap();
    let unsubscribe = only(h.sent_requests(Method::Subscribe));
    assert_eq!(unsubscribe.expires(), Some(0));
    assert_eq!(h.ctx.subscribes()[0].ss_status, SubscriptionStatus::Terminated);
    assert_eq!(h.ctx.subscribes()[0].ss_reason, TerminationReason::Deactivated);
}

const WATCHER_SUBSCRIBE: &str = "SUBSCRIBE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKwatch1\r\n\
From: <sip:bob@example.com>;tag=w1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: watch1@10.0.0.2\r\n\
CSeq: 1 SUBSCRIBE\r\n\
Contact: <sip:bob@10.0.0.2:5060>\r\n\
Event: presence\r\n\
Expires: 600\r\n\
Content-Length: 0\r\n\r\n";

#[test]
fn test_incoming_subscribe_answered_and_notified() {
    let mut h = Harness::new();
    h.inject_raw(WATCHER_SUBSCRIBE);
    let provisional = only(h.sent_responses());
    assert_eq!(provisional.status(), Some(101));

    let events = h.events();
    let new = events
        .iter()
        .find(|e| e.kind == EventType::InSubscriptionNew)
        .unwrap();
    assert!(new.nid > 0);
    let (tid, did) = (new.tid, new.did);

    h.ctx.answer_subscribe(tid, 200, None).unwrap();
    let ok = only(h.sent_responses());
    assert_eq!(ok.status(), Some(200));
    let expires: u32 = ok.header("Expires").unwrap().parse().unwrap();
    assert!(expires <= 600 && expires > 590);

    h.ctx
        .notify(did, SubscriptionStatus::Active, TerminationReason::Timeout, Some(b"<presence/>"))
        .unwrap();
    let notify = only(h.sent_requests(Method::Notify));
    assert_eq!(notify.call_id(), Some("watch1@10.0.0.2"));
    assert_eq!(notify.to_tag().as_deref(), Some("w1"));
    assert!(notify.subscription_state().unwrap().starts_with("active;expires="));
    assert_eq!(notify.content_type(), Some("application/pidf+xml"));

    // a second NOTIFY waits for the first
    assert!(
        h.ctx
            .notify(did, SubscriptionStatus::Active, TerminationReason::Timeout, None)
            .is_err()
    );
}

#[test]
fn test_incoming_subscribe_unknown_package() {
    let mut h = Harness::new();
    h.inject_raw(&WATCHER_SUBSCRIBE.replace("Event: presence", "Event: dialog"));
    assert_eq!(only(h.sent_responses()).status(), Some(489));
    assert!(h.ctx.notifies().is_empty());
}

#[test]
fn test_incoming_subscribe_without_event() {
    let mut h = Harness::new();
    h.inject_raw(&WATCHER_SUBSCRIBE.replace("Event: presence\r\n", ""));
    assert_eq!(only(h.sent_responses()).status(), Some(400));
}
