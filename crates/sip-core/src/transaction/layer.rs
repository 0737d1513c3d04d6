use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::state::TransactionState;
use super::timer::{TimerSettings, TimerType, Timers};
use super::{Destination, Transaction, TransactionId, TransactionKind};
use crate::error::{Error, Result};
use crate::message::{CSeq, Message};
use crate::method::Method;

/// Everything the transaction layer reports to its user.
///
/// One variant per kind of transition; the user matches on it instead of
/// registering a callback per transition.
#[derive(Debug, Clone)]
pub enum SubstrateEvent {
    /// A client transaction accepted a response (1xx or first final)
    ResponseReceived { tid: TransactionId, response: Message },
    /// A server transaction sent a response
    ResponseSent { tid: TransactionId, response: Message },
    /// A non-INVITE server transaction was created for a request
    RequestReceived { tid: TransactionId, request: Message },
    /// The ACK for a non-2xx final response reached an IST
    AckReceived { tid: TransactionId, ack: Message },
    /// The transaction reached `Terminated`
    Killed { tid: TransactionId, kind: TransactionKind },
    /// Sending failed; `Killed` follows
    TransportError { tid: TransactionId, kind: TransactionKind },
}

impl SubstrateEvent {
    pub fn tid(&self) -> TransactionId {
        match self {
            SubstrateEvent::ResponseReceived { tid, .. }
            | SubstrateEvent::ResponseSent { tid, .. }
            | SubstrateEvent::RequestReceived { tid, .. }
            | SubstrateEvent::AckReceived { tid, .. }
            | SubstrateEvent::Killed { tid, .. }
            | SubstrateEvent::TransportError { tid, .. } => *tid,
        }
    }
}

/// A message the layer wants on the wire
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// `None` for stateless sends (ACK for 2xx)
    pub tid: Option<TransactionId>,
    pub message: Message,
    pub destination: Destination,
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn terminate(tr: &mut Transaction, events: &mut VecDeque<SubstrateEvent>) {
    trace!("{} {} -> Terminated", tr.kind, tr.id);
    tr.state = TransactionState::Terminated;
    tr.timers.clear();
    events.push_back(SubstrateEvent::Killed {
        tid: tr.id,
        kind: tr.kind,
    });
}

/// ACK for a non-2xx final response (RFC 3261 17.1.1.3)
fn build_ack(invite: &Message, response: &Message) -> Option<Message> {
    let uri = invite.request_uri()?.clone();
    let cseq = invite.cseq()?;
    let mut ack = Message::request(Method::Ack, uri);
    ack.add_header("Via", invite.header("Via")?);
    for route in invite.headers("Route") {
        ack.add_header("Route", route);
    }
    ack.add_header("From", invite.header("From")?);
    ack.add_header("To", response.header("To")?);
    ack.add_header("Call-ID", invite.call_id()?);
    ack.set_cseq(&CSeq {
        seq: cseq.seq,
        method: Method::Ack,
    });
    ack.add_header("Max-Forwards", "70");
    Some(ack)
}

/// Owns every transaction of one user agent.
///
/// Terminated transactions are kept until [`TransactionLayer::remove`] is
/// called so that their requests and responses stay inspectable by the
/// aggregate that owns them.
#[derive(Debug)]
pub struct TransactionLayer {
    settings: TimerSettings,
    next_id: u32,
    transactions: BTreeMap<TransactionId, Transaction>,
    events: VecDeque<SubstrateEvent>,
    outbox: VecDeque<Outgoing>,
}

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(TimerSettings::default())
    }
}

impl TransactionLayer {
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings,
            next_id: 1,
            transactions: BTreeMap::new(),
            events: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let id = TransactionId(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.transactions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Start an ICT or NICT and queue the request for sending.
    pub fn create_client(
        &mut self,
        request: Message,
        destination: Destination,
        now_ms: u64,
    ) -> Result<TransactionId> {
        let method = request
            .method()
            .cloned()
            .ok_or_else(|| Error::Other("client transaction needs a request".into()))?;
        if method == Method::Ack {
            return Err(Error::Other("ACK is never sent in a transaction".into()));
        }
        let branch = request
            .top_via()
            .and_then(|v| v.branch().map(str::to_string))
            .ok_or(Error::MissingHeader("Via"))?;

        let kind = TransactionKind::for_request(&method, true);
        let t1 = ms(self.settings.t1);
        let timeout = ms(self.settings.transaction_timeout());
        let unreliable = !destination.transport.is_reliable();

        let mut timers = Timers {
            retransmit_interval: t1,
            ..Timers::default()
        };
        let state = match kind {
            TransactionKind::Ict => {
                if unreliable {
                    timers.retransmit = Some((TimerType::A, now_ms + t1));
                }
                timers.timeout = Some((TimerType::B, now_ms + timeout));
                TransactionState::Calling
            }
            _ => {
                if unreliable {
                    timers.retransmit = Some((TimerType::E, now_ms + t1));
                }
                timers.timeout = Some((TimerType::F, now_ms + timeout));
                TransactionState::Trying
            }
        };

        let id = self.allocate_id();
        debug!("new {} {} for {} to {}", kind, id, method, destination);
        self.outbox.push_back(Outgoing {
            tid: Some(id),
            message: request.clone(),
            destination: destination.clone(),
        });
        self.transactions.insert(
            id,
            Transaction {
                id,
                kind,
                state,
                birth_time: now_ms / 1000,
                orig_request: request,
                last_response: None,
                ack: None,
                branch,
                method,
                destination,
                timers,
            },
        );
        Ok(id)
    }

    /// Start an IST or NIST for a request that matched no transaction.
    ///
    /// `destination` is where responses go (derived from the top Via).
    pub fn create_server(
        &mut self,
        request: Message,
        destination: Destination,
        now_ms: u64,
    ) -> Result<TransactionId> {
        let method = request
            .method()
            .cloned()
            .ok_or_else(|| Error::Other("server transaction needs a request".into()))?;
        if method == Method::Ack {
            return Err(Error::Other("ACK never creates a transaction".into()));
        }
        let branch = request
            .top_via()
            .and_then(|v| v.branch().map(str::to_string))
            .unwrap_or_default();
        let kind = TransactionKind::for_request(&method, false);
        let state = match kind {
            TransactionKind::Ist => TransactionState::Proceeding,
            _ => TransactionState::Trying,
        };

        let id = self.allocate_id();
        debug!("new {} {} for incoming {}", kind, id, method);
        if kind == TransactionKind::Nist {
            self.events.push_back(SubstrateEvent::RequestReceived {
                tid: id,
                request: request.clone(),
            });
        }
        self.transactions.insert(
            id,
            Transaction {
                id,
                kind,
                state,
                birth_time: now_ms / 1000,
                orig_request: request,
                last_response: None,
                ack: None,
                branch,
                method,
                destination,
                timers: Timers::default(),
            },
        );
        Ok(id)
    }

    /// Answer a server transaction.
    pub fn send_response(&mut self, tid: TransactionId, response: Message, now_ms: u64) -> Result<()> {
        let settings = self.settings;
        let tr = self
            .transactions
            .get_mut(&tid)
            .ok_or(Error::TransactionNotFound(tid))?;
        if tr.kind.is_client() {
            return Err(Error::InvalidState {
                tid,
                reason: "responses are only sent on server transactions".into(),
            });
        }
        if tr.state.is_finished() {
            return Err(Error::InvalidState {
                tid,
                reason: format!("already answered ({})", tr.state),
            });
        }
        let status = response
            .status()
            .ok_or_else(|| Error::Other("send_response needs a response".into()))?;

        tr.last_response = Some(response.clone());
        self.outbox.push_back(Outgoing {
            tid: Some(tid),
            message: response.clone(),
            destination: tr.destination.clone(),
        });
        self.events
            .push_back(SubstrateEvent::ResponseSent { tid, response });

        let unreliable = !tr.destination.transport.is_reliable();
        let t1 = ms(settings.t1);
        if status < 200 {
            tr.state = TransactionState::Proceeding;
            return Ok(());
        }
        match tr.kind {
            TransactionKind::Ist if status < 300 => terminate(tr, &mut self.events),
            TransactionKind::Ist => {
                tr.state = TransactionState::Completed;
                tr.timers.clear();
                if unreliable {
                    tr.timers.retransmit = Some((TimerType::G, now_ms + t1));
                    tr.timers.retransmit_interval = t1;
                }
                tr.timers.timeout = Some((
                    TimerType::H,
                    now_ms + ms(settings.transaction_timeout()),
                ));
            }
            _ => {
                tr.state = TransactionState::Completed;
                tr.timers.clear();
                if unreliable {
                    tr.timers.wait = Some((
                        TimerType::J,
                        now_ms + ms(settings.transaction_timeout()),
                    ));
                } else {
                    terminate(tr, &mut self.events);
                }
            }
        }
        Ok(())
    }

    /// Queue a message that belongs to no transaction (ACK for a 2xx).
    pub fn send_stateless(&mut self, message: Message, destination: Destination) {
        self.outbox.push_back(Outgoing {
            tid: None,
            message,
            destination,
        });
    }

    /// Feed an incoming message to the transaction it belongs to.
    ///
    /// Gives the message back when no live transaction matches, so the
    /// caller can treat it as a new request (or a stray response).
    pub fn receive(&mut self, msg: Message, now_ms: u64) -> std::result::Result<TransactionId, Message> {
        let Some(branch) = msg
            .top_via()
            .and_then(|v| v.branch().map(str::to_string))
        else {
            return Err(msg);
        };

        if msg.is_response() {
            let Some(method) = msg.cseq_method() else {
                return Err(msg);
            };
            let found = self
                .transactions
                .values()
                .find(|t| {
                    t.kind.is_client() && !t.is_terminated() && t.branch == branch && t.method == method
                })
                .map(|t| t.id);
            match found {
                Some(tid) => {
                    self.on_response(tid, msg, now_ms);
                    Ok(tid)
                }
                None => Err(msg),
            }
        } else {
            let Some(method) = msg.method().cloned() else {
                return Err(msg);
            };
            let wanted = if method == Method::Ack {
                Method::Invite
            } else {
                method
            };
            let found = self
                .transactions
                .values()
                .find(|t| {
                    !t.kind.is_client() && !t.is_terminated() && t.branch == branch && t.method == wanted
                })
                .map(|t| t.id);
            match found {
                Some(tid) => {
                    self.on_request(tid, msg, now_ms);
                    Ok(tid)
                }
                None => Err(msg),
            }
        }
    }

    fn on_response(&mut self, tid: TransactionId, response: Message, now_ms: u64) {
        let settings = self.settings;
        let Some(tr) = self.transactions.get_mut(&tid) else {
            return;
        };
        let Some(status) = response.status() else {
            return;
        };
        let unreliable = !tr.destination.transport.is_reliable();

        match (tr.kind, tr.state) {
            (TransactionKind::Ict, TransactionState::Calling | TransactionState::Proceeding) => {
                tr.last_response = Some(response.clone());
                if status < 200 {
                    tr.state = TransactionState::Proceeding;
                    tr.timers.retransmit = None;
                    tr.timers.timeout = None;
                    self.events
                        .push_back(SubstrateEvent::ResponseReceived { tid, response });
                } else if status < 300 {
                    self.events
                        .push_back(SubstrateEvent::ResponseReceived { tid, response });
                    terminate(tr, &mut self.events);
                } else {
                    if let Some(ack) = build_ack(&tr.orig_request, &response) {
                        self.outbox.push_back(Outgoing {
                            tid: Some(tid),
                            message: ack.clone(),
                            destination: tr.destination.clone(),
                        });
                        tr.ack = Some(ack);
                    }
                    self.events
                        .push_back(SubstrateEvent::ResponseReceived { tid, response });
                    tr.state = TransactionState::Completed;
                    tr.timers.clear();
                    if unreliable {
                        tr.timers.wait = Some((TimerType::D, now_ms + ms(settings.wait_time_d)));
                    } else {
                        terminate(tr, &mut self.events);
                    }
                }
            }
            (TransactionKind::Ict, TransactionState::Completed) => {
                // retransmitted final response: repeat the ACK
                if let Some(ack) = &tr.ack {
                    self.outbox.push_back(Outgoing {
                        tid: Some(tid),
                        message: ack.clone(),
                        destination: tr.destination.clone(),
                    });
                }
            }
            (TransactionKind::Nict, TransactionState::Trying | TransactionState::Proceeding) => {
                tr.last_response = Some(response.clone());
                self.events
                    .push_back(SubstrateEvent::ResponseReceived { tid, response });
                if status < 200 {
                    tr.state = TransactionState::Proceeding;
                } else {
                    tr.state = TransactionState::Completed;
                    tr.timers.clear();
                    if unreliable {
                        tr.timers.wait = Some((TimerType::K, now_ms + ms(settings.t4)));
                    } else {
                        terminate(tr, &mut self.events);
                    }
                }
            }
            _ => trace!("{} absorbed {} in {}", tid, status, tr.state),
        }
    }

    fn on_request(&mut self, tid: TransactionId, request: Message, now_ms: u64) {
        let settings = self.settings;
        let Some(tr) = self.transactions.get_mut(&tid) else {
            return;
        };
        let is_ack = request.is_method(&Method::Ack);
        let unreliable = !tr.destination.transport.is_reliable();

        match (tr.kind, tr.state, is_ack) {
            (TransactionKind::Ist, TransactionState::Completed, true) => {
                tr.ack = Some(request.clone());
                self.events
                    .push_back(SubstrateEvent::AckReceived { tid, ack: request });
                tr.state = TransactionState::Confirmed;
                tr.timers.clear();
                if unreliable {
                    tr.timers.wait = Some((TimerType::I, now_ms + ms(settings.t4)));
                } else {
                    terminate(tr, &mut self.events);
                }
            }
            (_, TransactionState::Proceeding | TransactionState::Completed, false) => {
                // retransmitted request: repeat the last response
                if let Some(response) = &tr.last_response {
                    self.outbox.push_back(Outgoing {
                        tid: Some(tid),
                        message: response.clone(),
                        destination: tr.destination.clone(),
                    });
                }
            }
            _ => trace!("{} absorbed request in {}", tid, tr.state),
        }
    }

    /// Fire every timer due at `now_ms`.
    pub fn execute(&mut self, now_ms: u64) {
        let t2 = ms(self.settings.t2);
        let ids: Vec<TransactionId> = self.transactions.keys().copied().collect();
        for tid in ids {
            let Some(tr) = self.transactions.get_mut(&tid) else {
                continue;
            };
            if tr.is_terminated() {
                continue;
            }

            if let Some((timer, at)) = tr.timers.wait {
                if now_ms >= at {
                    trace!("{} fired for {}", timer, tid);
                    terminate(tr, &mut self.events);
                    continue;
                }
            }

            if let Some((timer, at)) = tr.timers.timeout {
                if now_ms >= at {
                    debug!("{} fired for {} {} in {}", timer, tr.kind, tid, tr.state);
                    terminate(tr, &mut self.events);
                    continue;
                }
            }

            if let Some((timer, at)) = tr.timers.retransmit {
                if now_ms >= at {
                    let message = match tr.kind {
                        TransactionKind::Ist => tr.last_response.clone(),
                        _ => Some(tr.orig_request.clone()),
                    };
                    if let Some(message) = message {
                        trace!("{} retransmission for {}", timer, tid);
                        self.outbox.push_back(Outgoing {
                            tid: Some(tid),
                            message,
                            destination: tr.destination.clone(),
                        });
                    }
                    let interval = match timer {
                        TimerType::A => tr.timers.retransmit_interval * 2,
                        TimerType::E if tr.state == TransactionState::Proceeding => t2,
                        _ => (tr.timers.retransmit_interval * 2).min(t2),
                    };
                    tr.timers.retransmit_interval = interval;
                    tr.timers.retransmit = Some((timer, now_ms + interval));
                }
            }
        }
    }

    /// Earliest pending deadline over all live transactions
    pub fn next_timeout(&self) -> Option<u64> {
        self.transactions
            .values()
            .filter(|t| !t.is_terminated())
            .filter_map(|t| t.timers.next_deadline())
            .min()
    }

    /// The transport could not deliver a message of this transaction.
    pub fn transport_error(&mut self, tid: TransactionId) {
        let Some(tr) = self.transactions.get_mut(&tid) else {
            return;
        };
        if tr.is_terminated() {
            return;
        }
        warn!("transport error on {} {}", tr.kind, tid);
        self.events.push_back(SubstrateEvent::TransportError {
            tid,
            kind: tr.kind,
        });
        terminate(tr, &mut self.events);
    }

    pub fn drain_events(&mut self) -> Vec<SubstrateEvent> {
        self.events.drain(..).collect()
    }

    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        self.outbox.drain(..).collect()
    }

    pub fn get(&self, tid: TransactionId) -> Option<&Transaction> {
        self.transactions.get(&tid)
    }

    pub fn get_mut(&mut self, tid: TransactionId) -> Option<&mut Transaction> {
        self.transactions.get_mut(&tid)
    }

    pub fn remove(&mut self, tid: TransactionId) -> Option<Transaction> {
        self.transactions.remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.transactions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::via::Transport;

    fn request(method: &str, branch: &str) -> Message {
        let raw = format!(
            "{m} sip:bob@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5070;rport;branch={b}\r\n\
From: <sip:alice@127.0.0.1>;tag=a1\r\n\
To: <sip:bob@127.0.0.1>\r\n\
Call-ID: call-1\r\n\
CSeq: 1 {m}\r\n\
\r\n",
            m = method,
            b = branch
        );
        Message::parse(raw.as_bytes()).unwrap()
    }

    fn response_for(req: &Message, status: u16) -> Message {
        let mut r = Message::response_to(req, status);
        if status > 100 {
            r.set_to_tag("b1").unwrap();
        }
        r
    }

    fn udp() -> Destination {
        Destination::new("127.0.0.1", 5060, Transport::Udp)
    }

    #[test]
    fn test_ict_retransmits_and_times_out() {
        let mut layer = TransactionLayer::default();
        let tid = layer
            .create_client(request("INVITE", "z9hG4bKa"), udp(), 0)
            .unwrap();
        assert_eq!(layer.drain_outbox().len(), 1);

        layer.execute(500);
        assert_eq!(layer.drain_outbox().len(), 1);
        // next retransmission after 1s more
        layer.execute(1000);
        assert!(layer.drain_outbox().is_empty());
        layer.execute(1500);
        assert_eq!(layer.drain_outbox().len(), 1);

        layer.execute(32_000);
        assert_eq!(layer.get(tid).unwrap().state, TransactionState::Terminated);
        let events = layer.drain_events();
        assert!(matches!(events.last(), Some(SubstrateEvent::Killed { .. })));
    }

    #[test]
    fn test_ict_non_2xx_sends_ack() {
        let mut layer = TransactionLayer::default();
        let invite = request("INVITE", "z9hG4bKb");
        let tid = layer.create_client(invite.clone(), udp(), 0).unwrap();
        layer.drain_outbox();

        let resp = response_for(&invite, 486);
        assert_eq!(layer.receive(resp.clone(), 10).unwrap(), tid);
        let out = layer.drain_outbox();
        assert_eq!(out.len(), 1);
        assert!(out[0].message.is_method(&Method::Ack));
        assert_eq!(out[0].message.to_tag().as_deref(), Some("b1"));
        assert_eq!(layer.get(tid).unwrap().state, TransactionState::Completed);

        // retransmitted 486 triggers another ACK but no event
        layer.drain_events();
        layer.receive(resp, 20).unwrap();
        assert_eq!(layer.drain_outbox().len(), 1);
        assert!(layer.drain_events().is_empty());

        layer.execute(32_010);
        assert!(layer.get(tid).unwrap().is_terminated());
    }

    #[test]
    fn test_ict_2xx_terminates() {
        let mut layer = TransactionLayer::default();
        let invite = request("INVITE", "z9hG4bKc");
        let tid = layer.create_client(invite.clone(), udp(), 0).unwrap();
        layer.receive(response_for(&invite, 180), 5).unwrap();
        layer.receive(response_for(&invite, 200), 6).unwrap();
        let events = layer.drain_events();
        assert_eq!(events.len(), 3);
        assert!(layer.get(tid).unwrap().is_terminated());
        // a late 2xx retransmission no longer matches
        assert!(layer.receive(response_for(&invite, 200), 7).is_err());
    }

    #[test]
    fn test_nist_absorbs_retransmissions() {
        let mut layer = TransactionLayer::default();
        let options = request("OPTIONS", "z9hG4bKd");
        let tid = layer.create_server(options.clone(), udp(), 0).unwrap();
        assert!(matches!(
            layer.drain_events()[0],
            SubstrateEvent::RequestReceived { .. }
        ));
        layer.send_response(tid, response_for(&options, 200), 1).unwrap();
        layer.drain_outbox();

        assert_eq!(layer.receive(options.clone(), 2).unwrap(), tid);
        assert_eq!(layer.drain_outbox().len(), 1);
        assert!(layer.send_response(tid, response_for(&options, 500), 3).is_err());

        layer.execute(32_001);
        assert!(layer.get(tid).unwrap().is_terminated());
    }

    #[test]
    fn test_ist_ack_confirms() {
        let mut layer = TransactionLayer::default();
        let invite = request("INVITE", "z9hG4bKe");
        let tid = layer.create_server(invite.clone(), udp(), 0).unwrap();
        layer.send_response(tid, response_for(&invite, 486), 1).unwrap();
        layer.drain_events();

        let mut ack = request("ACK", "z9hG4bKe");
        ack.set_to_tag("b1").unwrap();
        assert_eq!(layer.receive(ack, 2).unwrap(), tid);
        assert_eq!(layer.get(tid).unwrap().state, TransactionState::Confirmed);
        assert!(matches!(
            layer.drain_events()[0],
            SubstrateEvent::AckReceived { .. }
        ));
        layer.execute(5_002);
        assert!(layer.get(tid).unwrap().is_terminated());
    }

    #[test]
    fn test_transport_error_reports_then_kills() {
        let mut layer = TransactionLayer::default();
        let tid = layer
            .create_client(request("SUBSCRIBE", "z9hG4bKf"), udp(), 0)
            .unwrap();
        layer.transport_error(tid);
        let events = layer.drain_events();
        assert!(matches!(events[0], SubstrateEvent::TransportError { .. }));
        assert!(matches!(events[1], SubstrateEvent::Killed { .. }));
    }

    #[test]
    fn test_cancel_does_not_match_invite_server_transaction() {
        let mut layer = TransactionLayer::default();
        layer
            .create_server(request("INVITE", "z9hG4bKg"), udp(), 0)
            .unwrap();
        assert!(layer.receive(request("CANCEL", "z9hG4bKg"), 1).is_err());
    }
}
