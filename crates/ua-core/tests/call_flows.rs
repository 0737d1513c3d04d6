//! Outgoing and incoming calls driven through a hand-cranked context.

mod common;

use common::{Harness, only};
use sipua_sip_core::Method;
use sipua_ua_core::EventType;

const PROXY_CHALLENGE: (&str, &str) = ("Proxy-Authenticate", r#"Digest realm="example.com", nonce="abc123""#);

fn start_call(h: &mut Harness) -> i32 {
    let invite = h
        .ctx
        .build_initial_invite("sip:bob@10.0.0.2", "sip:alice@example.com", None, Some("test"))
        .unwrap();
    h.ctx.initiate_call(invite, Some(42)).unwrap()
}

#[test]
fn test_invite_retried_with_credentials() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    assert_eq!(cid, 1);
    let invite = only(h.sent_requests(Method::Invite));

    h.reply(&invite, 407, None, &[PROXY_CHALLENGE]);
    assert!(h.event_kinds().contains(&EventType::CallRequestFailure));
    h.ctx
        .add_authentication_info("alice", "alice", Some("secret"), None, Some("example.com"))
        .unwrap();
    h.execute();

    let retried = only(h.sent_requests(Method::Invite));
    assert_eq!(retried.cseq().unwrap().seq, invite.cseq().unwrap().seq + 1);
    assert_eq!(retried.call_id(), invite.call_id());
    assert_ne!(retried.top_via().unwrap().branch(), invite.top_via().unwrap().branch());
    let credentials = retried.header("Proxy-Authorization").unwrap();
    assert!(credentials.contains(r#"username="alice""#));
    assert!(credentials.contains(r#"nonce="abc123""#));

    let call = h.ctx.call(cid).unwrap();
    assert_eq!(call.retry, 1);
    assert_eq!(call.external_reference, Some(42));
}

#[test]
fn test_challenge_answered_just_inside_window() {
    let mut h = Harness::new();
    start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));
    h.reply(&invite, 407, None, &[PROXY_CHALLENGE]);
    h.ctx
        .add_authentication_info("alice", "alice", Some("secret"), None, None)
        .unwrap();

    h.advance(119);
    h.execute();
    assert_eq!(h.sent_requests(Method::Invite).len(), 1);
    assert_eq!(h.ctx.calls().len(), 1);
}

#[test]
fn test_stale_challenge_releases_call() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));
    h.reply(&invite, 407, None, &[PROXY_CHALLENGE]);
    h.events();
    h.ctx
        .add_authentication_info("alice", "alice", Some("secret"), None, None)
        .unwrap();

    h.advance(120);
    h.execute();
    assert!(h.sent_requests(Method::Invite).is_empty());
    let events = h.events();
    let released = events.iter().find(|e| e.kind == EventType::CallReleased).unwrap();
    assert_eq!(released.cid, cid);
    assert!(h.ctx.calls().is_empty());
}

#[test]
fn test_credential_retries_capped() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    h.ctx
        .add_authentication_info("alice", "alice", Some("wrong"), None, None)
        .unwrap();

    let mut invite = only(h.sent_requests(Method::Invite));
    for attempt in 1..=3 {
        h.reply(&invite, 407, None, &[PROXY_CHALLENGE]);
        h.execute();
        invite = only(h.sent_requests(Method::Invite));
        assert_eq!(h.ctx.call(cid).unwrap().retry, attempt);
    }
    h.reply(&invite, 407, None, &[PROXY_CHALLENGE]);
    h.execute();
    assert!(h.sent_requests(Method::Invite).is_empty());
    assert_eq!(h.ctx.call(cid).unwrap().retry, 3);
}

#[test]
fn test_redirect_follows_contact() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));
    let first_tr = h.ctx.call(cid).unwrap().out_tr;

    h.reply(&invite, 302, Some("r1"), &[("Contact", "<sip:carol@10.0.0.3:5070>")]);
    assert!(h.event_kinds().contains(&EventType::CallRedirected));
    // the 3xx is acknowledged by the transaction
    assert_eq!(h.sent_requests(Method::Ack).len(), 1);

    h.execute();
    let redirected = only(h.sent_requests(Method::Invite));
    let target = redirected.request_uri().unwrap();
    assert_eq!(target.user.as_deref(), Some("carol"));
    assert_eq!(target.host, "10.0.0.3");
    assert_eq!(target.port, Some(5070));
    assert_eq!(redirected.cseq().unwrap().seq, invite.cseq().unwrap().seq + 1);
    assert_eq!(redirected.call_id(), invite.call_id());

    let call = h.ctx.call(cid).unwrap();
    assert_ne!(call.out_tr, first_tr);
    assert_eq!(call.retry, 0);
}

#[test]
fn test_redirect_drops_early_dialog() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));

    h.reply(&invite, 180, Some("early1"), &[("Contact", "<sip:bob@10.0.0.2>")]);
    assert!(h.event_kinds().contains(&EventType::CallRinging));
    assert_eq!(h.ctx.call(cid).unwrap().dialogs.len(), 1);

    h.reply(&invite, 302, Some("early1"), &[("Contact", "<sip:carol@10.0.0.3>")]);
    h.execute();
    assert_eq!(h.sent_requests(Method::Invite).len(), 1);
    let call = h.ctx.call(cid).unwrap();
    assert!(call.dialogs.is_empty());
}

#[test]
fn test_unanswered_ringing_call_abandoned() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));
    h.reply(&invite, 180, Some("ring1"), &[]);
    h.events();

    h.advance(179);
    h.execute();
    assert!(h.events().is_empty());
    assert_eq!(h.ctx.calls().len(), 1);

    h.advance(1);
    h.execute();
    let kinds = h.event_kinds();
    let no_answer = kinds.iter().position(|k| *k == EventType::CallNoAnswer).unwrap();
    let released = kinds.iter().position(|k| *k == EventType::CallReleased).unwrap();
    assert!(no_answer < released);
    assert!(h.ctx.call(cid).is_none());
}

#[test]
fn test_timer_b_releases_silent_call() {
    let mut h = Harness::new();
    start_call(&mut h);
    h.flush();

    h.advance(40);
    h.execute();
    assert!(h.event_kinds().contains(&EventType::CallReleased));
    assert!(h.ctx.calls().is_empty());
}

#[test]
fn test_answered_call_acknowledged_and_closed() {
    let mut h = Harness::new();
    let cid = start_call(&mut h);
    let invite = only(h.sent_requests(Method::Invite));

    h.reply(&invite, 200, Some("ok1"), &[("Contact", "<sip:bob@10.0.0.2:5060>")]);
    let events = h.events();
    let answered = events.iter().find(|e| e.kind == EventType::CallAnswered).unwrap();
    assert_eq!(answered.cid, cid);
    assert!(answered.did > 0);
    assert_eq!(answered.status(), Some(200));

    h.ctx.send_ack(answered.did, None).unwrap();
    let ack = only(h.sent_requests(Method::Ack));
    assert_eq!(ack.cseq().unwrap().seq, invite.cseq().unwrap().seq);
    assert_eq!(ack.to_tag().as_deref(), Some("ok1"));

    h.ctx.terminate_call(cid, answered.did).unwrap();
    let bye = only(h.sent_requests(Method::Bye));
    assert_eq!(bye.call_id(), invite.call_id());
    assert!(bye.cseq().unwrap().seq > invite.cseq().unwrap().seq);
    let uri = bye.request_uri().unwrap();
    assert_eq!(uri.host, "10.0.0.2");
}

#[test]
fn test_unmatched_cancel_gets_481() {
    let mut h = Harness::new();
    h.inject_raw(
        "CANCEL sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKnomatch\r\n\
From: <sip:bob@example.com>;tag=x1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: nomatch@10.0.0.2\r\n\
CSeq: 1 CANCEL\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
    );
    let answer = only(h.sent_responses());
    assert_eq!(answer.status(), Some(481));
    assert!(h.events().is_empty());
    assert!(h.ctx.calls().is_empty());
}

#[test]
fn test_incoming_invite_cancelled() {
    let mut h = Harness::new();
    h.inject_raw(
        "INVITE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKinv1\r\n\
From: <sip:bob@example.com>;tag=b1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: incoming1@10.0.0.2\r\n\
CSeq: 7 INVITE\r\n\
Contact: <sip:bob@10.0.0.2:5060>\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
    );
    let provisional: Vec<u16> = h.sent_responses().iter().filter_map(|r| r.status()).collect();
    assert_eq!(provisional, vec![100, 101]);
    let events = h.events();
    let invite = events.iter().find(|e| e.kind == EventType::CallInvite).unwrap();
    assert!(invite.cid > 0);
    assert!(invite.did > 0);

    h.inject_raw(
        "CANCEL sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKinv1\r\n\
From: <sip:bob@example.com>;tag=b1\r\n\
To: <sip:alice@example.com>\r\n\
Call-ID: incoming1@10.0.0.2\r\n\
CSeq: 7 CANCEL\r\n\
Max-Forwards: 70\r\n\
Content-Length: 0\r\n\r\n",
    );
    let answers = h.sent_responses();
    let mut finals: Vec<(u16, Method)> = answers
        .iter()
        .filter_map(|r| Some((r.status()?, r.cseq_method()?)))
        .collect();
    finals.sort_by_key(|(s, _)| *s);
    assert_eq!(finals, vec![(200, Method::Cancel), (487, Method::Invite)]);
    let terminated = answers.iter().find(|r| r.status() == Some(487)).unwrap();
    assert_eq!(terminated.reason(), Some("Request Terminated"));
    assert!(h.event_kinds().contains(&EventType::CallCancelled));
}

#[test]
fn test_bye_outside_dialog_gets_481() {
    let mut h = Harness::new();
    h.inject_raw(
        "BYE sip:alice@10.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKbye1\r\n\
From: <sip:bob@example.com>;tag=b1\r\n\
To: <sip:alice@example.com>;tag=gone\r\n\
Call-ID: gone@10.0.0.2\r\n\
CSeq: 2 BYE\r\n\
Content-Length: 0\r\n\r\n",
    );
    assert_eq!(only(h.sent_responses()).status(), Some(481));
}
