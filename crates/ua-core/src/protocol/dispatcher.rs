//! Requests that matched no live transaction.
//!
//! ```text
//!  ACK ───────────────► call dialog? ── CALL_ACK / dropped
//!  CANCEL ────────────► pending INVITE? ── 200 + 487 / 481
//!  anything else ─┬──► call dialog      ── per-method handler
//!                 ├──► INFO/BYE ─► 481, OPTIONS ─► absorbed, INVITE ─► new call
//!                 ├──► subscribe dialog ── NOTIFY handler
//!                 ├──► NOTIFY for a pending SUBSCRIBE ── dialog created lazily
//!                 ├──► notify dialog    ── SUBSCRIBE refresh
//!                 └──► MESSAGE/REFER/unknown absorbed, SUBSCRIBE ─► new notify
//! ```
//!
//! "Absorbed" requests get a server transaction and nothing else: no
//! owner, no answer. They surface as `MESSAGE_NEW` and the application may
//! answer them; otherwise the collector reclaims them.

use sipua_sip_core::{
    Destination, Message, Method, NameAddr, TransactionId, TransactionState, Transport,
};
use tracing::{debug, info, trace, warn};

use crate::context::Context;
use crate::events::EventType;
use crate::model::{
    Call, Dialog, DialogOwner, Key, Notify, Owner, Parent, SubscriptionStatus, TerminationReason,
};

/// Expiry granted to a SUBSCRIBE without an Expires header
const DEFAULT_SUBSCRIBE_EXPIRES: u64 = 600;

/// Where responses to `request` go: the top Via, corrected by received/rport.
fn response_destination(request: &Message, transport: Transport) -> Option<Destination> {
    let via = request.top_via()?;
    let (host, port) = via.response_target();
    Some(Destination::new(host, port, transport))
}

/// Does `cancel` target the INVITE `invite`?
///
/// Branches decide when both carry one; otherwise the RFC 2543 rules apply.
fn cancel_matches(invite: &Message, cancel: &Message) -> bool {
    let (Some(iv), Some(cv)) = (invite.top_via(), cancel.top_via()) else {
        return false;
    };
    match (iv.branch(), cv.branch()) {
        (Some(a), Some(b)) => a == b,
        (None, None) => {
            invite.call_id() == cancel.call_id()
                && invite.to_tag() == cancel.to_tag()
                && invite.from_tag() == cancel.from_tag()
                && iv.host == cv.host
                && iv.port == cv.port
        }
        _ => false,
    }
}

impl Context {
    pub(crate) fn dispatch_request(&mut self, request: Message, transport: Transport) {
        let Some(method) = request.method().cloned() else {
            return;
        };
        if method == Method::Ack {
            self.process_ack(request);
            return;
        }
        let Some(destination) = response_destination(&request, transport) else {
            debug!("{} without Via dropped", method);
            return;
        };
        let now = self.now_ms();
        let tid = match self.layer.create_server(request.clone(), destination, now) {
            Ok(tid) => tid,
            Err(e) => {
                warn!("cannot create server transaction for {}: {}", method, e);
                return;
            }
        };
        debug!("{} {} matched no transaction", tid, method);

        if method == Method::Invite {
            match self.builder().response(&request, 100, None) {
                Ok(trying) => {
                    if let Err(e) = self.respond(tid, trying) {
                        debug!("{} cannot send 100: {}", tid, e);
                    }
                }
                Err(e) => {
                    debug!("{} cannot build 100: {}", tid, e);
                    self.discard(tid);
                    return;
                }
            }
        }

        if method == Method::Cancel {
            self.process_cancel(tid, &request);
            return;
        }

        if let Some(owner) = self.find_dialog_in(Parent::Call, &request) {
            self.dispatch_in_call(owner, tid, &request, method);
            return;
        }

        match method {
            Method::Info | Method::Bye => {
                self.send_default_answer(tid, &request, None, 481, None);
                return;
            }
            Method::Options => {
                self.discard(tid);
                return;
            }
            Method::Invite => {
                self.process_new_invite(tid, &request);
                return;
            }
            _ => {}
        }

        if let Some(owner) = self.find_dialog_in(Parent::Subscribe, &request) {
            self.dispatch_in_subscribe(owner, tid, &request, method);
            return;
        }

        if method == Method::Notify {
            self.process_unmatched_notify(tid, &request);
            return;
        }

        if let Some(owner) = self.find_dialog_in(Parent::Notify, &request) {
            self.dispatch_in_notify(owner, tid, &request, method);
            return;
        }

        match method {
            Method::Subscribe => self.process_new_subscribe(tid, &request),
            // MESSAGE and REFER are the application's to answer; anything
            // else is left unanswered
            _ => self.discard(tid),
        }
    }

    /// First dialog of the given aggregate family that `request` belongs to.
    fn find_dialog_in(&self, family: fn(Key) -> Parent, request: &Message) -> Option<Owner> {
        let matches = |d: &Dialog| d.sip.as_ref().is_some_and(|s| s.match_as_uas(request));
        let probe = |p: Parent| -> Option<Owner> {
            let parent = self.parent(p)?;
            let dialog = parent.dialogs().iter().find(|d| matches(d))?;
            Some(Owner::new(p, Some(dialog.key)))
        };
        let keys: Vec<Key> = match family(Key(0)) {
            Parent::Call(_) => self.calls.iter().map(|c| c.key).collect(),
            Parent::Subscribe(_) => self.subscribes.iter().map(|s| s.key).collect(),
            Parent::Notify(_) => self.notifies.iter().map(|n| n.key).collect(),
        };
        keys.into_iter().find_map(|k| probe(family(k)))
    }

    fn local_tag(&self, owner: Owner) -> Option<String> {
        self.dialog(owner)
            .and_then(|d| d.sip.as_ref())
            .map(|s| s.local_tag.clone())
    }

    /// Answer a request the engine refuses, then forget the transaction.
    ///
    /// INVITE is never answered here with 101..=298.
    pub(crate) fn send_default_answer(
        &mut self,
        tid: TransactionId,
        request: &Message,
        local_tag: Option<&str>,
        status: u16,
        reason: Option<&str>,
    ) {
        self.discard(tid);
        if request.is_method(&Method::Invite) && (101..299).contains(&status) {
            return;
        }
        let mut answer = match self.builder().response(request, status, local_tag) {
            Ok(a) => a,
            Err(e) => {
                debug!("{} cannot build {}: {}", tid, status, e);
                return;
            }
        };
        if let Some(reason) = reason {
            answer.set_reason(reason);
        }
        if status == 500 {
            answer.set_header("Retry-After", "10");
        }
        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send {}: {}", tid, status, e);
        }
    }

    /// Give a request to a dialog: owner set, kept in its incoming list.
    fn attach_incoming(&mut self, owner: Owner, tid: TransactionId) {
        self.owners.insert(tid, owner);
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_inc_tr(tid);
        }
    }

    fn process_ack(&mut self, ack: Message) {
        let Some(owner) = self.find_dialog_in(Parent::Call, &ack) else {
            trace!("ACK outside any dialog dropped");
            return;
        };
        let mut event = self.event_for(EventType::CallAck, None, Some(owner));
        event.ack = Some(ack);
        self.events.push(event);
    }

    fn process_cancel(&mut self, tid: TransactionId, cancel: &Message) {
        let mut found: Option<(TransactionId, Key, Option<Key>)> = None;
        'calls: for call in &self.calls {
            if let Some(inc) = call.inc_tr {
                if self.layer.get(inc).is_some_and(|t| cancel_matches(&t.orig_request, cancel)) {
                    found = Some((inc, call.key, call.dialogs.first().map(|d| d.key)));
                    break;
                }
            }
            for dialog in &call.dialogs {
                for inc in &dialog.inc_trs {
                    if self.layer.get(*inc).is_some_and(|t| {
                        t.method == Method::Invite && cancel_matches(&t.orig_request, cancel)
                    }) {
                        found = Some((*inc, call.key, Some(dialog.key)));
                        break 'calls;
                    }
                }
            }
        }

        let Some((invite_tid, ck, dk)) = found else {
            debug!("{} CANCEL for no known INVITE", tid);
            self.send_default_answer(tid, cancel, None, 481, None);
            return;
        };
        let owner = Owner::new(Parent::Call(ck), dk);
        let local_tag = self.local_tag(owner);
        let invite_state = self.layer.get(invite_tid).map(|t| t.state);

        // the CANCEL itself is bookkept with the dialog but has no owner
        match self.dialog_mut(owner) {
            Some(dialog) => dialog.push_inc_tr(tid),
            None => self.discard(tid),
        }

        if invite_state.is_none_or(|s| s.is_finished()) {
            debug!("{} CANCEL after the INVITE was answered", tid);
            if let Ok(answer) = self.builder().response(cancel, 481, local_tag.as_deref()) {
                if let Err(e) = self.respond(tid, answer) {
                    debug!("{} cannot send 481: {}", tid, e);
                }
            }
            return;
        }

        let built = self.builder().response(cancel, 200, local_tag.as_deref());
        if let Ok(ok) = built {
            if let Err(e) = self.respond(tid, ok) {
                debug!("{} cannot answer CANCEL: {}", tid, e);
            }
        }
        info!("{} cancelled by {}", invite_tid, tid);
        self.report(EventType::CallCancelled, Some(invite_tid), Some(owner));

        let Some(invite) = self.layer.get(invite_tid).map(|t| t.orig_request.clone()) else {
            return;
        };
        match self.builder().response(&invite, 487, local_tag.as_deref()) {
            Ok(terminated) => {
                if let Err(e) = self.respond(invite_tid, terminated) {
                    debug!("{} cannot send 487: {}", invite_tid, e);
                }
            }
            Err(e) => debug!("{} cannot build 487: {}", invite_tid, e),
        }
    }

    fn dispatch_in_call(&mut self, owner: Owner, tid: TransactionId, request: &Message, method: Method) {
        let local_tag = self.local_tag(owner);
        let tag = local_tag.as_deref();
        let Some(dialog) = self.dialog(owner) else {
            return;
        };
        let (call_inc, call_out) = match owner.parent {
            Parent::Call(k) => self
                .call_by_key(k)
                .map_or((None, None), |c| (c.inc_tr, c.out_tr)),
            _ => (None, None),
        };
        let inc_bye = self.last_inc_of(dialog, &Method::Bye);
        let out_bye = self.last_out_of(dialog, &Method::Bye);
        let inc_invite = self
            .last_inc_of(dialog, &Method::Invite)
            .or(call_inc.filter(|t| self.method_of(*t) == Some(Method::Invite)));
        let out_invite = self
            .last_out_of(dialog, &Method::Invite)
            .or(call_out.filter(|t| self.method_of(*t) == Some(Method::Invite)));
        let out_refer = self.last_out_of(dialog, &Method::Refer);

        // a dialog with a BYE in progress accepts nothing but that BYE
        if method != Method::Bye && (inc_bye.is_some() || out_bye.is_some()) {
            self.send_default_answer(tid, request, tag, 481, None);
            return;
        }

        match method {
            Method::Invite => {
                if inc_invite.is_some_and(|t| !self.is_terminated(t)) {
                    self.send_default_answer(tid, request, tag, 500, Some("Retry Later"));
                    return;
                }
                if out_invite.is_some_and(|t| !self.is_terminated(t)) {
                    self.send_default_answer(tid, request, tag, 491, None);
                    return;
                }
                if let Some(sip) = self.dialog_mut(owner).and_then(|d| d.sip.as_mut()) {
                    sip.update_cseq_as_uas(request);
                    sip.update_route_set_as_uas(request);
                }
                self.process_reinvite(owner, tid, request);
            }
            Method::Bye => {
                if inc_bye.is_some() {
                    self.send_default_answer(tid, request, tag, 500, Some("Call Already Terminated"));
                    return;
                }
                self.process_bye(owner, tid, request);
            }
            Method::Refer => {
                let Some(refer_to) = request.header("Refer-To") else {
                    self.send_default_answer(tid, request, tag, 400, Some("Missing Refer-To header"));
                    return;
                };
                if refer_to.parse::<NameAddr>().is_err() {
                    self.send_default_answer(tid, request, tag, 400, Some("Non valid Refer-To header"));
                    return;
                }
                self.attach_incoming(owner, tid);
            }
            Method::Notify => self.process_notify_for_refer(owner, tid, request, out_refer),
            Method::Prack => {
                self.attach_incoming(owner, tid);
                match self.builder().response(request, 200, tag) {
                    Ok(ok) => {
                        if let Err(e) = self.respond(tid, ok) {
                            debug!("{} cannot answer PRACK: {}", tid, e);
                        }
                    }
                    Err(e) => debug!("{} cannot build PRACK answer: {}", tid, e),
                }
            }
            Method::Subscribe => {
                self.send_default_answer(tid, request, tag, 489, None);
            }
            // OPTIONS, INFO, MESSAGE and the rest wait for the application
            _ => self.attach_incoming(owner, tid),
        }
    }

    fn process_reinvite(&mut self, owner: Owner, tid: TransactionId, request: &Message) {
        let tag = self.local_tag(owner);
        let mut trying = match self.builder().response(request, 100, tag.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                debug!("{} cannot build answer for re-INVITE: {}", tid, e);
                self.send_default_answer(tid, request, tag.as_deref(), 500, Some("Internal SIP Error"));
                return;
            }
        };
        self.builder().complete_answer(&mut trying, request);
        self.attach_incoming(owner, tid);
        if let Err(e) = self.respond(tid, trying) {
            debug!("{} cannot send 100: {}", tid, e);
        }
        self.report(EventType::CallReinvite, Some(tid), Some(owner));
    }

    fn process_bye(&mut self, owner: Owner, tid: TransactionId, request: &Message) {
        let tag = self.local_tag(owner);
        let answer = match self.builder().response(request, 200, tag.as_deref()) {
            Ok(a) => a,
            Err(e) => {
                debug!("{} cannot answer BYE: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        // the BYE belongs to the call, not to the dialog it ends
        self.owners.insert(tid, Owner::new(owner.parent, None));
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_inc_tr(tid);
            dialog.sip = None;
        }
        self.report(EventType::CallClosed, Some(tid), Some(owner));
        self.update();
        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send 200 for BYE: {}", tid, e);
        }
    }

    fn process_notify_for_refer(
        &mut self,
        owner: Owner,
        tid: TransactionId,
        request: &Message,
        out_refer: Option<TransactionId>,
    ) {
        let tag = self.local_tag(owner);
        let tag = tag.as_deref();

        let rejection = match request.event() {
            None => Some((400, "Missing Event header in Notify")),
            Some(e) if !e.contains("refer") => Some((501, "Unsupported Event header")),
            Some(_) if request.subscription_state().is_none() => Some((400, "Missing Header")),
            Some(_) => match request.content_type().map(|c| {
                c.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
            }) {
                None => Some((400, "Missing Header")),
                Some(ct) if ct.is_empty() => Some((400, "Missing Header")),
                Some(ct) if ct != "message/sipfrag" => Some((501, "Unsupported body type")),
                Some(_) if request.body().is_empty() => Some((400, "Missing Body")),
                Some(_) => None,
            },
        };
        if let Some((status, reason)) = rejection {
            self.send_default_answer(tid, request, tag, status, Some(reason));
            return;
        }
        if out_refer.is_none() {
            self.send_default_answer(tid, request, tag, 481, None);
            return;
        }

        let mut answer = match self.builder().response(request, 200, tag) {
            Ok(a) => a,
            Err(e) => {
                debug!("{} cannot answer NOTIFY: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        self.builder().complete_answer(&mut answer, request);
        self.attach_incoming(owner, tid);
        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send 200 for NOTIFY: {}", tid, e);
        }
        self.report(EventType::CallReferStatus, Some(tid), Some(owner));
    }

    fn process_new_invite(&mut self, tid: TransactionId, request: &Message) {
        let key = self.new_key();
        let builder = self.builder();
        let mut answer = match builder.response(request, 101, None) {
            Ok(a) => a,
            Err(e) => {
                warn!("{} cannot answer new INVITE: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        builder.complete_answer(&mut answer, request);

        let dk = self.new_key();
        let dialog = match Dialog::init_as_uas(dk, request, &answer) {
            Ok(d) => d,
            Err(e) => {
                warn!("{} cannot create dialog: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        let mut call = Call::new(key);
        call.add_dialog(dialog);
        call.inc_tr = Some(tid);
        self.calls.insert(0, call);
        let owner = Owner::new(Parent::Call(key), Some(dk));
        self.owners.insert(tid, owner);
        self.update();

        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send 101: {}", tid, e);
        }
        info!("new incoming call {}", self.call_by_key(key).map_or(0, |c| c.id));
        self.report(EventType::CallInvite, Some(tid), Some(owner));
    }

    fn dispatch_in_subscribe(&mut self, owner: Owner, tid: TransactionId, request: &Message, method: Method) {
        let tag = self.local_tag(owner);
        match method {
            Method::Notify => {
                let pending = self
                    .dialog(owner)
                    .and_then(|d| self.last_inc_of(d, &Method::Notify))
                    .and_then(|t| self.layer.get(t))
                    .is_some_and(|t| t.state != TransactionState::Terminated);
                if pending {
                    self.send_default_answer(tid, request, tag.as_deref(), 500, Some("Retry Later"));
                    return;
                }
                if let Some(sip) = self.dialog_mut(owner).and_then(|d| d.sip.as_mut()) {
                    sip.update_cseq_as_uas(request);
                    sip.update_route_set_as_uas(request);
                }
                self.notify_within_dialog(owner, tid, request);
            }
            _ => self.send_default_answer(tid, request, tag.as_deref(), 501, None),
        }
    }

    fn notify_within_dialog(&mut self, owner: Owner, tid: TransactionId, request: &Message) {
        let tag = self.local_tag(owner);
        let Some(state) = request.subscription_state() else {
            self.send_default_answer(tid, request, tag.as_deref(), 400, None);
            return;
        };
        let answer = match self.builder().response(request, 200, tag.as_deref()) {
            Ok(a) => a,
            Err(e) => {
                debug!("{} cannot answer NOTIFY: {}", tid, e);
                self.send_default_answer(tid, request, tag.as_deref(), 500, Some("Internal SIP Error"));
                return;
            }
        };
        let Parent::Subscribe(sk) = owner.parent else {
            return;
        };
        let parsed = SubscriptionStatus::parse_header(state);
        if let Some(sub) = self.subscribe_by_key_mut(sk) {
            if let Some((status, reason)) = parsed {
                sub.ss_status = status;
                if let Some(reason) = reason {
                    sub.ss_reason = reason;
                }
            }
        }

        if matches!(parsed, Some((SubscriptionStatus::Terminated, _))) {
            info!("subscription closed by NOTIFY ({})", state);
            self.discard(tid);
            if let Err(e) = self.respond(tid, answer) {
                debug!("{} cannot send 200 for NOTIFY: {}", tid, e);
            }
            self.report(EventType::SubscriptionNotify, Some(tid), Some(owner));
            self.free_subscribe(sk);
            return;
        }

        self.attach_incoming(owner, tid);
        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send 200 for NOTIFY: {}", tid, e);
        }
    }

    /// A NOTIFY may beat the 2xx of our SUBSCRIBE; match it on Call-ID and
    /// our From tag, and create the dialog from it.
    fn process_unmatched_notify(&mut self, tid: TransactionId, request: &Message) {
        let Some(notify_to_tag) = request.to_tag() else {
            debug!("{} NOTIFY without To tag", tid);
            self.send_default_answer(tid, request, None, 481, None);
            return;
        };

        let mut found = None;
        for sub in &self.subscribes {
            let last = sub
                .dialogs
                .iter()
                .find_map(|d| self.last_out_of(d, &Method::Subscribe))
                .or(sub.out_tr);
            let Some(orig) = last.and_then(|t| self.layer.get(t)).map(|t| &t.orig_request) else {
                continue;
            };
            if orig.call_id() == request.call_id() && orig.from_tag().as_deref() == Some(notify_to_tag.as_str()) {
                let local_cseq = orig.cseq().map_or(0, |c| c.seq);
                found = Some((sub.key, local_cseq));
                break;
            }
        }

        let Some((sk, local_cseq)) = found else {
            self.send_default_answer(tid, request, None, 481, None);
            return;
        };
        let dk = self.new_key();
        let dialog = match Dialog::init_as_uac_with_remote_request(dk, request, local_cseq) {
            Ok(d) => d,
            Err(e) => {
                warn!("{} cannot establish a dialog from NOTIFY: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        if let Some(sub) = self.subscribe_by_key_mut(sk) {
            sub.add_dialog(dialog);
        }
        self.update();
        debug!("{} NOTIFY created the subscription dialog", tid);
        self.notify_within_dialog(Owner::new(Parent::Subscribe(sk), Some(dk)), tid, request);
    }

    fn dispatch_in_notify(&mut self, owner: Owner, tid: TransactionId, request: &Message, method: Method) {
        let tag = self.local_tag(owner);
        match method {
            Method::Subscribe => {
                let inc_tr = match owner.parent {
                    Parent::Notify(k) => self.notify_by_key(k).and_then(|n| n.inc_tr),
                    _ => None,
                };
                let pending = self
                    .dialog(owner)
                    .and_then(|d| self.last_inc_of(d, &Method::Subscribe))
                    .or(inc_tr)
                    .and_then(|t| self.layer.get(t))
                    .is_some_and(|t| !matches!(t.state, TransactionState::Terminated | TransactionState::Completed));
                if pending {
                    self.send_default_answer(tid, request, tag.as_deref(), 500, Some("Retry Later"));
                    return;
                }
                if let Some(sip) = self.dialog_mut(owner).and_then(|d| d.sip.as_mut()) {
                    sip.update_cseq_as_uas(request);
                    sip.update_route_set_as_uas(request);
                }
                self.subscribe_within_dialog(owner, tid, request);
            }
            _ => self.send_default_answer(tid, request, tag.as_deref(), 501, None),
        }
    }

    fn set_refresh_interval(&mut self, nk: Key, request: &Message) {
        let now = self.now_secs();
        let expires = request.expires().map_or(DEFAULT_SUBSCRIBE_EXPIRES, u64::from);
        if let Some(notify) = self.notify_by_key_mut(nk) {
            notify.ss_expires = now + expires;
        }
    }

    /// Refresh (or, with Expires: 0, end) an incoming subscription.
    fn subscribe_within_dialog(&mut self, owner: Owner, tid: TransactionId, request: &Message) {
        let Parent::Notify(nk) = owner.parent else {
            return;
        };
        self.set_refresh_interval(nk, request);
        let now = self.now_secs();
        if let Some(notify) = self.notify_by_key_mut(nk) {
            if notify.remaining(now) == 0 {
                notify.ss_status = SubscriptionStatus::Terminated;
                notify.ss_reason = TerminationReason::Timeout;
            }
        }
        self.attach_incoming(owner, tid);
    }

    fn process_new_subscribe(&mut self, tid: TransactionId, request: &Message) {
        match request.event() {
            None => {
                self.send_default_answer(tid, request, None, 400, None);
                return;
            }
            Some(e) if !e.trim().eq_ignore_ascii_case("presence") => {
                debug!("{} unsupported event package {}", tid, e);
                self.send_default_answer(tid, request, None, 489, None);
                return;
            }
            Some(_) => {}
        }

        let builder = self.builder();
        let mut answer = match builder.response(request, 101, None) {
            Ok(a) => a,
            Err(e) => {
                warn!("{} cannot answer SUBSCRIBE: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        builder.complete_answer(&mut answer, request);

        let dk = self.new_key();
        let dialog = match Dialog::init_as_uas(dk, request, &answer) {
            Ok(d) => d,
            Err(e) => {
                warn!("{} cannot create dialog: {}", tid, e);
                self.discard(tid);
                return;
            }
        };
        let key = self.new_key();
        let uri = request
            .request_uri()
            .map(|u| u.to_string())
            .unwrap_or_default();
        let mut notify = Notify::new(key, uri);
        notify.add_dialog(dialog);
        notify.inc_tr = Some(tid);
        self.notifies.insert(0, notify);
        self.set_refresh_interval(key, request);
        self.owners.insert(tid, Owner::new(Parent::Notify(key), Some(dk)));

        if let Err(e) = self.respond(tid, answer) {
            debug!("{} cannot send 101: {}", tid, e);
        }
        self.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(raw: &str) -> Message {
        Message::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_cancel_matches_on_branch() {
        let invite = msg("INVITE sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKaaa\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: x@10.0.0.2\r\n\
CSeq: 1 INVITE\r\n\r\n");
        let cancel = msg("CANCEL sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKaaa\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: x@10.0.0.2\r\n\
CSeq: 1 CANCEL\r\n\r\n");
        assert!(cancel_matches(&invite, &cancel));
        let other = msg("CANCEL sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKbbb\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: x@10.0.0.2\r\n\
CSeq: 1 CANCEL\r\n\r\n");
        assert!(!cancel_matches(&invite, &other));
    }

    #[test]
    fn test_cancel_legacy_match_without_branch() {
        let invite = msg("INVITE sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: x@10.0.0.2\r\n\
CSeq: 1 INVITE\r\n\r\n");
        let cancel = msg("CANCEL sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.2:5060\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: x@10.0.0.2\r\n\
CSeq: 1 CANCEL\r\n\r\n");
        assert!(cancel_matches(&invite, &cancel));
    }

    #[test]
    fn test_response_destination_uses_rport() {
        let mut req = msg("OPTIONS sip:bob@b.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.5:5060;rport;branch=z9hG4bKccc\r\n\
From: <sip:alice@a.example>;tag=1\r\n\
To: <sip:bob@b.example>\r\n\
Call-ID: y@10.0.0.2\r\n\
CSeq: 1 OPTIONS\r\n\r\n");
        let mut via = req.top_via().unwrap();
        via.set_received("203.0.113.7", 40000);
        req.set_top_via(&via);
        let dest = response_destination(&req, Transport::Udp).unwrap();
        assert_eq!((dest.host.as_str(), dest.port), ("203.0.113.7", 40000));
    }
}
