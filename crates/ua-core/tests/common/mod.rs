//! Drives a [`Context`] by hand: inject messages as if they came from the
//! peer at 10.0.0.2:5060, move a manual clock, collect what would have
//! been sent.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sipua_sip_core::{Message, Method, Outgoing, Transport};
use sipua_ua_core::{Context, Event, EventType, ManualClock, UaConfig};

pub const PEER: &str = "10.0.0.2:5060";

pub struct Harness {
    pub ctx: Context,
    pub clock: ManualClock,
    sent: Vec<Outgoing>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(UaConfig::default().with_local_ip("10.0.0.1"))
    }

    pub fn with_config(config: UaConfig) -> Self {
        let clock = ManualClock::default();
        let ctx = Context::new(config, Arc::new(clock.clone())).expect("context");
        Harness {
            ctx,
            clock,
            sent: Vec::new(),
        }
    }

    pub fn peer() -> SocketAddr {
        PEER.parse().unwrap()
    }

    /// Feed `message` as received from the peer over UDP.
    pub fn inject(&mut self, message: Message) {
        self.ctx.handle_incoming(message, Self::peer(), Transport::Udp);
    }

    pub fn inject_raw(&mut self, text: &str) {
        assert!(
            self.ctx.handle_datagram(text.as_bytes(), Self::peer(), Transport::Udp),
            "not SIP: {}",
            text
        );
    }

    /// Answer `request` with `status` from the peer, with an optional To
    /// tag and extra headers.
    pub fn reply(&mut self, request: &Message, status: u16, to_tag: Option<&str>, headers: &[(&str, &str)]) {
        let response = response(request, status, to_tag, headers);
        self.inject(response);
    }

    pub fn execute(&mut self) {
        self.ctx.execute();
    }

    pub fn advance(&mut self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    /// Everything queued for the network since the last call.
    pub fn flush(&mut self) -> Vec<Message> {
        self.sent.extend(self.ctx.drain_outbox());
        std::mem::take(&mut self.sent)
            .into_iter()
            .map(|o| o.message)
            .collect()
    }

    /// Requests of `method` queued since the last flush.
    pub fn sent_requests(&mut self, method: Method) -> Vec<Message> {
        self.flush()
            .into_iter()
            .filter(|m| m.is_method(&method))
            .collect()
    }

    /// Responses queued since the last flush.
    pub fn sent_responses(&mut self) -> Vec<Message> {
        self.flush().into_iter().filter(|m| m.is_response()).collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.ctx.events().drain()
    }

    pub fn event_kinds(&self) -> Vec<EventType> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

/// `status` answer to `request`, as the peer would send it.
pub fn response(request: &Message, status: u16, to_tag: Option<&str>, headers: &[(&str, &str)]) -> Message {
    let mut response = Message::response_to(request, status);
    if let Some(tag) = to_tag {
        response.set_to_tag(tag).unwrap();
    }
    for (name, value) in headers {
        response.add_header(name, *value);
    }
    response
}

pub fn only(mut messages: Vec<Message>) -> Message {
    assert_eq!(messages.len(), 1, "expected exactly one message: {:?}", messages);
    messages.remove(0)
}
