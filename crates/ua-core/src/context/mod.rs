//! The user-agent engine.
//!
//! [`Context`] owns every aggregate, the transaction layer, the credential
//! store and the event queue. It performs no I/O: the network loop feeds it
//! with [`Context::handle_incoming`], ticks it with [`Context::execute`] and
//! ships whatever [`Context::drain_outbox`] returns.
//!
//! The public API (`api::*`), the substrate callbacks and the dispatcher for
//! unmatched requests are all `impl Context` blocks in their own modules.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sipua_sip_core::{
    Destination, Message, Method, Outgoing, Transaction, TransactionId, TransactionLayer, Transport,
};
use tracing::{debug, trace};

use crate::auth::AuthStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{UaConfig, UaOption};
use crate::errors::{Error, Result};
use crate::events::{Event, EventQueue, EventType};
use crate::logging::WIRE_TARGET;
use crate::model::{
    Aggregate, Call, Dialog, DialogOwner, Key, Notify, Owner, Parent, Publication, Registration,
    Subscribe,
};
use crate::net::{Network, guess_local_ip};
use crate::requests::{Builder, destination_for};

/// Public ids wrap back to 1 past this value
const MAX_PUBLIC_ID: i32 = 100_000;

pub struct Context {
    pub(crate) config: UaConfig,
    clock: Arc<dyn Clock>,
    pub(crate) layer: TransactionLayer,
    pub(crate) events: EventQueue,
    pub(crate) calls: Vec<Call>,
    pub(crate) subscribes: Vec<Subscribe>,
    pub(crate) notifies: Vec<Notify>,
    pub(crate) registrations: Vec<Registration>,
    pub(crate) publications: Vec<Publication>,
    /// Which aggregate (and dialog) started or received a transaction
    pub(crate) owners: HashMap<TransactionId, Owner>,
    /// Transactions nobody owns any more, reclaimed by the collector
    pub(crate) garbage: Vec<TransactionId>,
    pub(crate) auth: AuthStore,
    pub(crate) net: Network,
    next_id: i32,
    next_key: u64,
    next_rid: i32,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("calls", &self.calls.len())
            .field("subscribes", &self.subscribes.len())
            .field("notifies", &self.notifies.len())
            .field("registrations", &self.registrations.len())
            .field("transactions", &self.layer.len())
            .field("garbage", &self.garbage.len())
            .finish()
    }
}

impl Context {
    pub fn new(config: UaConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_events(config, clock, EventQueue::new())
    }

    /// Engine on the wall clock
    pub fn with_system_clock(config: UaConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Engine publishing into an existing queue.
    pub fn with_events(config: UaConfig, clock: Arc<dyn Clock>, events: EventQueue) -> Result<Self> {
        config.validate()?;
        let local_ip = config
            .forced_local_ip
            .clone()
            .or_else(|| guess_local_ip(false))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mut net = Network::default();
        net.udp.ip = local_ip.clone();
        net.tcp.ip = local_ip;
        net.firewall_ip = config.firewall_ip.clone().filter(|ip| !ip.is_empty());
        debug!("user agent core on {} (firewall {:?})", net.udp.ip, net.firewall_ip);

        Ok(Context {
            layer: TransactionLayer::new(config.substrate),
            config,
            clock,
            events,
            calls: Vec::new(),
            subscribes: Vec::new(),
            notifies: Vec::new(),
            registrations: Vec::new(),
            publications: Vec::new(),
            owners: HashMap::new(),
            garbage: Vec::new(),
            auth: AuthStore::new(),
            net,
            next_id: 1,
            next_key: 1,
            next_rid: 1,
        })
    }

    pub fn config(&self) -> &UaConfig {
        &self.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn network(&self) -> &Network {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.net
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn call(&self, cid: i32) -> Option<&Call> {
        self.calls.iter().find(|c| c.id == cid && cid > 0)
    }

    pub fn subscribes(&self) -> &[Subscribe] {
        &self.subscribes
    }

    pub fn notifies(&self) -> &[Notify] {
        &self.notifies
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    pub fn registration(&self, rid: i32) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == rid && rid > 0)
    }

    pub fn publications(&self) -> &[Publication] {
        &self.publications
    }

    pub fn transaction(&self, tid: TransactionId) -> Option<&Transaction> {
        self.layer.get(tid)
    }

    /// Number of transactions still held by the substrate
    pub fn transaction_count(&self) -> usize {
        self.layer.len()
    }

    pub fn set_option(&mut self, option: UaOption) {
        debug!("option {:?}", option);
        self.config.network.apply(option);
    }

    /// Advertise `ip:port` in Via and Contact instead of the local address.
    pub fn masquerade_contact(&mut self, ip: &str, port: u16) {
        self.net.masquerade_contact(ip, port);
        self.config.firewall_ip = self.net.firewall_ip.clone();
    }

    /// Record the locally bound port of a transport.
    pub fn set_local_port(&mut self, transport: Transport, port: u16) {
        self.net.interface_mut(transport).port = port;
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    pub(crate) fn new_key(&mut self) -> Key {
        let key = Key(self.next_key);
        self.next_key += 1;
        key
    }

    pub(crate) fn new_rid(&mut self) -> i32 {
        let rid = self.next_rid;
        self.next_rid = if rid >= MAX_PUBLIC_ID { 1 } else { rid + 1 };
        rid
    }

    pub(crate) fn builder(&self) -> Builder<'_> {
        Builder::new(&self.net, &self.config.user_agent)
    }

    /// Hand out public ids to every aggregate and dialog that lacks one.
    ///
    /// Dialogs whose underlying SIP dialog is gone get `-1`.
    pub fn update(&mut self) {
        fn assign(counter: &mut i32) -> i32 {
            if *counter > MAX_PUBLIC_ID {
                *counter = 1;
            }
            let id = *counter;
            *counter += 1;
            id
        }

        fn visit<T: Aggregate>(list: &mut [T], counter: &mut i32) {
            for agg in list.iter_mut() {
                if agg.id() < 1 {
                    agg.set_id(assign(counter));
                }
                for dialog in agg.dialogs_mut().iter_mut() {
                    if dialog.sip.is_some() {
                        if dialog.id < 1 {
                            dialog.id = assign(counter);
                        }
                    } else {
                        dialog.id = -1;
                    }
                }
            }
        }

        let mut counter = self.next_id;
        visit(&mut self.calls, &mut counter);
        visit(&mut self.subscribes, &mut counter);
        visit(&mut self.notifies, &mut counter);
        self.next_id = counter;
    }

    // ---- aggregate lookup ----

    pub(crate) fn call_by_key(&self, key: Key) -> Option<&Call> {
        self.calls.iter().find(|c| c.key == key)
    }

    pub(crate) fn call_by_key_mut(&mut self, key: Key) -> Option<&mut Call> {
        self.calls.iter_mut().find(|c| c.key == key)
    }

    pub(crate) fn subscribe_by_key(&self, key: Key) -> Option<&Subscribe> {
        self.subscribes.iter().find(|s| s.key == key)
    }

    pub(crate) fn subscribe_by_key_mut(&mut self, key: Key) -> Option<&mut Subscribe> {
        self.subscribes.iter_mut().find(|s| s.key == key)
    }

    pub(crate) fn notify_by_key(&self, key: Key) -> Option<&Notify> {
        self.notifies.iter().find(|n| n.key == key)
    }

    pub(crate) fn notify_by_key_mut(&mut self, key: Key) -> Option<&mut Notify> {
        self.notifies.iter_mut().find(|n| n.key == key)
    }

    pub(crate) fn parent(&self, parent: Parent) -> Option<&dyn DialogOwner> {
        match parent {
            Parent::Call(k) => self.call_by_key(k).map(|c| c as &dyn DialogOwner),
            Parent::Subscribe(k) => self.subscribe_by_key(k).map(|s| s as &dyn DialogOwner),
            Parent::Notify(k) => self.notify_by_key(k).map(|n| n as &dyn DialogOwner),
        }
    }

    pub(crate) fn parent_mut(&mut self, parent: Parent) -> Option<&mut dyn DialogOwner> {
        match parent {
            Parent::Call(k) => self.call_by_key_mut(k).map(|c| c as &mut dyn DialogOwner),
            Parent::Subscribe(k) => self
                .subscribe_by_key_mut(k)
                .map(|s| s as &mut dyn DialogOwner),
            Parent::Notify(k) => self.notify_by_key_mut(k).map(|n| n as &mut dyn DialogOwner),
        }
    }

    pub(crate) fn dialog(&self, owner: Owner) -> Option<&Dialog> {
        let key = owner.dialog?;
        self.parent(owner.parent)?.dialog_by_key(key)
    }

    pub(crate) fn dialog_mut(&mut self, owner: Owner) -> Option<&mut Dialog> {
        let key = owner.dialog?;
        self.parent_mut(owner.parent)?.dialog_by_key_mut(key)
    }

    pub(crate) fn owner_of(&self, tid: TransactionId) -> Option<Owner> {
        self.owners.get(&tid).copied()
    }

    pub(crate) fn is_terminated(&self, tid: TransactionId) -> bool {
        self.layer.get(tid).is_none_or(Transaction::is_terminated)
    }

    pub(crate) fn method_of(&self, tid: TransactionId) -> Option<Method> {
        self.layer.get(tid).map(|t| t.method.clone())
    }

    /// Newest transaction of `method` among `tids`
    pub(crate) fn find_transaction(&self, tids: &[TransactionId], method: &Method) -> Option<TransactionId> {
        tids.iter()
            .copied()
            .find(|t| self.layer.get(*t).is_some_and(|tr| tr.method == *method))
    }

    pub(crate) fn last_inc_of(&self, dialog: &Dialog, method: &Method) -> Option<TransactionId> {
        self.find_transaction(&dialog.inc_trs, method)
    }

    pub(crate) fn last_out_of(&self, dialog: &Dialog, method: &Method) -> Option<TransactionId> {
        self.find_transaction(&dialog.out_trs, method)
    }

    pub(crate) fn registration_by_tid_mut(&mut self, tid: TransactionId) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.last_tr == Some(tid))
    }

    pub(crate) fn publication_by_tid_mut(&mut self, tid: TransactionId) -> Option<&mut Publication> {
        self.publications.iter_mut().find(|p| p.last_tr == Some(tid))
    }

    // ---- sending ----

    /// Start a client transaction for `request` and remember its owner.
    pub(crate) fn start_client(&mut self, request: Message, owner: Option<Owner>) -> Result<TransactionId> {
        let destination = destination_for(&request)?;
        let now = self.now_ms();
        let tid = self.layer.create_client(request, destination, now)?;
        if let Some(owner) = owner {
            self.owners.insert(tid, owner);
        }
        Ok(tid)
    }

    pub(crate) fn respond(&mut self, tid: TransactionId, response: Message) -> Result<()> {
        let now = self.now_ms();
        self.layer.send_response(tid, response, now)?;
        Ok(())
    }

    /// Send a message outside any transaction (ACK for a 2xx).
    pub(crate) fn send_stateless(&mut self, message: Message, destination: Destination) {
        self.layer.send_stateless(message, destination);
    }

    /// Put a transaction on the garbage list and forget its owner.
    pub(crate) fn discard(&mut self, tid: TransactionId) {
        self.owners.remove(&tid);
        if !self.garbage.contains(&tid) {
            self.garbage.push(tid);
        }
    }

    pub(crate) fn free_call(&mut self, key: Key) {
        let Some(pos) = self.calls.iter().position(|c| c.key == key) else {
            return;
        };
        let call = self.calls.remove(pos);
        debug!("releasing call {}", call.id);
        for tid in call.transactions() {
            self.discard(tid);
        }
    }

    pub(crate) fn free_subscribe(&mut self, key: Key) {
        let Some(pos) = self.subscribes.iter().position(|s| s.key == key) else {
            return;
        };
        let sub = self.subscribes.remove(pos);
        debug!("releasing subscription {}", sub.id);
        for tid in sub.transactions() {
            self.discard(tid);
        }
    }

    pub(crate) fn free_notify(&mut self, key: Key) {
        let Some(pos) = self.notifies.iter().position(|n| n.key == key) else {
            return;
        };
        let notify = self.notifies.remove(pos);
        debug!("releasing incoming subscription {}", notify.id);
        for tid in notify.transactions() {
            self.discard(tid);
        }
    }

    pub(crate) fn free_registration(&mut self, rid: i32) {
        if let Some(pos) = self.registrations.iter().position(|r| r.id == rid) {
            let reg = self.registrations.remove(pos);
            debug!("releasing registration {}", rid);
            if let Some(tid) = reg.last_tr {
                self.discard(tid);
            }
        }
    }

    // ---- events ----

    /// Event for `kind` filled from a transaction and its owner.
    pub(crate) fn event_for(&self, kind: EventType, tid: Option<TransactionId>, owner: Option<Owner>) -> Event {
        let mut event = Event::new(kind);
        if let Some(tr) = tid.and_then(|t| self.layer.get(t)) {
            event = event
                .with_transaction(tr)
                .with_status_text(tr.last_response.as_ref());
        }
        if let Some(owner) = owner {
            match owner.parent {
                Parent::Call(k) => {
                    if let Some(call) = self.call_by_key(k) {
                        event.cid = call.id;
                        event.external_reference = call.external_reference;
                    }
                }
                Parent::Subscribe(k) => {
                    if let Some(sub) = self.subscribe_by_key(k) {
                        event.sid = sub.id;
                        event.ss_status = Some(sub.ss_status);
                        event.ss_reason = Some(sub.ss_reason);
                    }
                }
                Parent::Notify(k) => {
                    if let Some(notify) = self.notify_by_key(k) {
                        event.nid = notify.id;
                        event.ss_status = Some(notify.ss_status);
                        event.ss_reason = Some(notify.ss_reason);
                    }
                }
            }
            if let Some(dialog) = self.dialog(owner) {
                event.did = dialog.id;
            }
        }
        event
    }

    pub(crate) fn report(&self, kind: EventType, tid: Option<TransactionId>, owner: Option<Owner>) {
        self.events.push(self.event_for(kind, tid, owner));
    }

    pub(crate) fn report_registration(&self, kind: EventType, rid: i32, tid: Option<TransactionId>) {
        let mut event = self.event_for(kind, tid, None);
        event.rid = rid;
        self.events.push(event);
    }

    // ---- driving ----

    /// Feed one message read from the network.
    ///
    /// The top Via of a request is stamped with the observed source, then
    /// the message goes to its transaction or, for a request matching none,
    /// to the dispatcher. Stray responses are dropped.
    pub fn handle_incoming(&mut self, mut message: Message, source: SocketAddr, transport: Transport) {
        let host = source.ip().to_string();
        if message.is_request() {
            if let Some(mut via) = message.top_via() {
                if via.host != host || via.rport().is_some() {
                    via.set_received(&host, source.port());
                    message.set_top_via(&via);
                }
            }
        }
        let now = self.now_ms();
        match self.layer.receive(message, now) {
            Ok(tid) => trace!("{} matched {}", source, tid),
            Err(message) if message.is_request() => {
                self.dispatch_request(message, transport);
            }
            Err(message) => {
                debug!(
                    "dropping response {:?} from {} outside any transaction",
                    message.status(),
                    source
                );
            }
        }
        self.process_substrate_events();
    }

    /// Parse and feed raw bytes. Returns false when they are not SIP.
    pub fn handle_datagram(&mut self, data: &[u8], source: SocketAddr, transport: Transport) -> bool {
        trace!(target: WIRE_TARGET, "<- {} {}\n{}", source, transport, String::from_utf8_lossy(data));
        match Message::parse(data) {
            Ok(message) => {
                self.handle_incoming(message, source, transport);
                true
            }
            Err(e) => {
                debug!("unparsable message from {}: {}", source, e);
                false
            }
        }
    }

    /// Drain the substrate until it has nothing more to say.
    pub(crate) fn process_substrate_events(&mut self) {
        loop {
            let events = self.layer.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.on_substrate_event(event);
            }
        }
    }

    /// One iteration of the engine: transaction timers, the automatic
    /// actions (credentials, redirects, refreshes) and garbage collection.
    pub fn execute(&mut self) {
        let now = self.now_ms();
        self.layer.execute(now);
        self.process_substrate_events();
        self.automatic_action();
        self.process_substrate_events();
        self.release_terminated_calls();
        self.release_terminated_subscriptions();
        self.release_terminated_registrations();
        self.collect_garbage();
    }

    /// Messages waiting for the network
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        self.layer.drain_outbox()
    }

    /// The network could not deliver a message of `tid`.
    pub fn transport_error(&mut self, tid: TransactionId) {
        self.layer.transport_error(tid);
        self.process_substrate_events();
    }

    /// How long the network loop may sleep before calling
    /// [`Context::execute`] again.
    pub fn next_wait(&self) -> Duration {
        let ceiling = Duration::from_secs(self.config.timing.max_select_wait);
        match self.layer.next_timeout() {
            Some(at) => Duration::from_millis(at.saturating_sub(self.now_ms())).min(ceiling),
            None => ceiling,
        }
    }

    /// Registrar addresses that receive UDP keep-alives
    pub fn keep_alive_targets(&self) -> Vec<SocketAddr> {
        self.registrations
            .iter()
            .filter(|r| r.transport == Transport::Udp)
            .filter_map(|r| r.keep_alive_addr)
            .collect()
    }

    /// Drop every aggregate, transaction, credential and queued event.
    pub fn clear(&mut self) {
        debug!("clearing user agent state");
        self.calls.clear();
        self.subscribes.clear();
        self.notifies.clear();
        self.registrations.clear();
        self.publications.clear();
        self.owners.clear();
        self.garbage.clear();
        self.auth.clear();
        let ids: Vec<TransactionId> = self.layer.ids().collect();
        for tid in ids {
            self.layer.remove(tid);
        }
        self.layer.drain_events();
        self.layer.drain_outbox();
        self.events.drain();
    }

    pub(crate) fn ensure_call(&self, cid: i32) -> Result<Key> {
        self.call(cid)
            .map(|c| c.key)
            .ok_or_else(|| Error::not_found("call", cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::DialogStatus;

    fn context() -> Context {
        Context::new(
            UaConfig::default().with_local_ip("10.0.0.1"),
            Arc::new(ManualClock::default()),
        )
        .unwrap()
    }

    fn sip_dialog() -> sipua_sip_core::SipDialog {
        let resp = Message::parse(
            b"SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
From: <sip:alice@a.example>;tag=111\r\n\
To: <sip:bob@b.example>;tag=222\r\n\
Call-ID: c1@10.0.0.1\r\n\
CSeq: 20 INVITE\r\n\
\r\n",
        )
        .unwrap();
        sipua_sip_core::SipDialog::init_as_uac(&resp).unwrap()
    }

    #[test]
    fn test_update_assigns_ids_once() {
        let mut ctx = context();
        let k = ctx.new_key();
        ctx.calls.insert(0, Call::new(k));
        ctx.update();
        let cid = ctx.calls[0].id;
        assert_eq!(cid, 1);
        ctx.update();
        assert_eq!(ctx.calls[0].id, cid);
    }

    #[test]
    fn test_dialog_without_sip_gets_minus_one() {
        let mut ctx = context();
        let k = ctx.new_key();
        let mut call = Call::new(k);
        let dk = ctx.new_key();
        let mut dialog = Dialog {
            key: dk,
            id: 0,
            status: DialogStatus::Initialized,
            sip: Some(sip_dialog()),
            retry: 0,
            inc_trs: Vec::new(),
            out_trs: Vec::new(),
            ok200: None,
            ack: None,
        };
        call.add_dialog(dialog.clone());
        dialog.sip = None;
        dialog.key = ctx.new_key();
        call.add_dialog(dialog);
        ctx.calls.push(call);
        ctx.update();
        let ids: Vec<i32> = ctx.calls[0].dialogs.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![-1, 2]);
    }

    #[test]
    fn test_ids_wrap_after_limit() {
        let mut ctx = context();
        ctx.next_id = MAX_PUBLIC_ID + 1;
        let k = ctx.new_key();
        ctx.calls.push(Call::new(k));
        ctx.update();
        assert_eq!(ctx.calls[0].id, 1);
    }

    #[test]
    fn test_next_wait_capped() {
        let ctx = context();
        assert_eq!(ctx.next_wait(), Duration::from_secs(15));
    }
}
