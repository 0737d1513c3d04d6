//! Substrate event handling.
//!
//! Every [`SubstrateEvent`] is routed through the `TransactionId -> Owner`
//! map back to the call, subscribe or notify that owns the transaction.
//! Transactions without an owner are standalone requests (MESSAGE, OPTIONS
//! outside a call, REGISTER, PUBLISH).

use sipua_sip_core::{
    DialogState, Message, Method, SipDialog, SubstrateEvent, TransactionId, TransactionKind,
    Transport,
};
use tracing::{debug, info, trace};

use crate::context::Context;
use crate::events::EventType;
use crate::model::{Dialog, DialogStatus, Owner, Parent, SubscriptionStatus};

/// Event kinds for a 3xx/4xx/5xx/6xx, by family
struct FailureKinds {
    redirected: EventType,
    request: EventType,
    server: EventType,
    global: EventType,
}

impl FailureKinds {
    fn pick(&self, status: u16) -> EventType {
        match status {
            300..=399 => self.redirected,
            400..=499 => self.request,
            500..=599 => self.server,
            _ => self.global,
        }
    }
}

const CALL_FAILURES: FailureKinds = FailureKinds {
    redirected: EventType::CallRedirected,
    request: EventType::CallRequestFailure,
    server: EventType::CallServerFailure,
    global: EventType::CallGlobalFailure,
};

const CALL_MESSAGE_FAILURES: FailureKinds = FailureKinds {
    redirected: EventType::CallMessageRedirected,
    request: EventType::CallMessageRequestFailure,
    server: EventType::CallMessageServerFailure,
    global: EventType::CallMessageGlobalFailure,
};

const MESSAGE_FAILURES: FailureKinds = FailureKinds {
    redirected: EventType::MessageRedirected,
    request: EventType::MessageRequestFailure,
    server: EventType::MessageServerFailure,
    global: EventType::MessageGlobalFailure,
};

const SUBSCRIPTION_FAILURES: FailureKinds = FailureKinds {
    redirected: EventType::SubscriptionRedirected,
    request: EventType::SubscriptionRequestFailure,
    server: EventType::SubscriptionServerFailure,
    global: EventType::SubscriptionGlobalFailure,
};

fn failure_status(status: u16) -> DialogStatus {
    match status {
        300..=399 => DialogStatus::Redirected,
        401 | 407 => DialogStatus::AuthRequired,
        400..=499 => DialogStatus::ClientError,
        500..=599 => DialogStatus::ServerError,
        _ => DialogStatus::GlobalFailure,
    }
}

fn is_call(owner: Option<Owner>) -> bool {
    matches!(owner.map(|o| o.parent), Some(Parent::Call(_)))
}

impl Context {
    pub(crate) fn on_substrate_event(&mut self, event: SubstrateEvent) {
        match event {
            SubstrateEvent::ResponseReceived { tid, response } => match response.status() {
                Some(100..=199) => self.on_provisional(tid, &response),
                Some(200..=299) => self.on_success(tid, &response),
                Some(300..=699) => self.on_failure(tid, &response),
                other => debug!("{} ignoring status {:?}", tid, other),
            },
            SubstrateEvent::ResponseSent { tid, response } => self.on_response_sent(tid, &response),
            SubstrateEvent::RequestReceived { tid, request } => self.on_request_received(tid, &request),
            SubstrateEvent::AckReceived { tid, .. } => trace!("{} ACK for a final response", tid),
            SubstrateEvent::Killed { tid, kind } => self.on_killed(tid, kind),
            SubstrateEvent::TransportError { tid, kind } => self.on_transport_error(tid, kind),
        }
    }

    /// Adopt the `rport` a registrar or proxy saw as our public UDP port.
    fn learn_port(&mut self, response: &Message) {
        if !self.config.network.learn_port {
            return;
        }
        if self.net.firewall_ip.as_deref().is_none_or(str::is_empty) {
            return;
        }
        let Some(via) = response.top_via() else {
            return;
        };
        if via.transport != Transport::Udp {
            return;
        }
        if let Some(Some(port)) = via.rport() {
            if port != self.net.udp.port {
                info!("learned public UDP port {} from rport", port);
                self.net.udp.port = port;
            }
        }
    }

    /// Find or create the caller-side dialog a 1xx/2xx belongs to, and
    /// point the transaction's owner at it.
    fn attach_uac_dialog(&mut self, tid: TransactionId, owner: Owner, response: &Message, by_tag: bool) -> Option<Owner> {
        if let Some(dialog) = self.dialog_mut(owner) {
            if let Some(sip) = dialog.sip.as_mut() {
                sip.update_route_set_as_uac(response);
            }
            return Some(owner);
        }

        // a NOTIFY may have created the dialog before the SUBSCRIBE's answer
        if by_tag {
            let remote_tag = response.to_tag();
            let found = remote_tag.as_ref().and_then(|tag| {
                self.parent(owner.parent)?
                    .dialogs()
                    .iter()
                    .find(|d| {
                        d.sip
                            .as_ref()
                            .is_some_and(|s| s.remote_tag.as_deref() == Some(tag.as_str()))
                    })
                    .map(|d| d.key)
            });
            if let Some(key) = found {
                debug!("{} joins the dialog created by an earlier NOTIFY", tid);
                let attached = Owner::new(owner.parent, Some(key));
                self.owners.insert(tid, attached);
                if let Some(sip) = self.dialog_mut(attached).and_then(|d| d.sip.as_mut()) {
                    sip.update_route_set_as_uac(response);
                }
                return Some(attached);
            }
        }

        let key = self.new_key();
        let dialog = match Dialog::init_as_uac(key, response) {
            Ok(d) => d,
            Err(e) => {
                debug!("cannot establish a dialog from {}: {}", tid, e);
                return None;
            }
        };
        self.parent_mut(owner.parent)?.add_dialog(dialog);
        let attached = Owner::new(owner.parent, Some(key));
        self.owners.insert(tid, attached);
        self.update();
        Some(attached)
    }

    fn on_provisional(&mut self, tid: TransactionId, response: &Message) {
        self.learn_port(response);
        let Some(owner) = self.owner_of(tid) else {
            if self.method_of(tid) == Some(Method::Options) {
                self.report(EventType::MessageProceeding, Some(tid), None);
            }
            return;
        };
        let Some(method) = self.method_of(tid) else {
            return;
        };
        let status = response.status().unwrap_or(100);

        if method == Method::Options {
            if is_call(Some(owner)) {
                self.report(EventType::CallMessageProceeding, Some(tid), Some(owner));
            }
            return;
        }
        if method == Method::Invite && status == 100 {
            self.report(EventType::CallProceeding, Some(tid), Some(owner));
            return;
        }
        if !matches!(method, Method::Invite | Method::Subscribe) {
            return;
        }

        let Some(owner) = self.attach_uac_dialog(tid, owner, response, method == Method::Subscribe) else {
            return;
        };
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.status = match status {
                180 => DialogStatus::Ringing,
                183 => DialogStatus::Queued,
                _ => DialogStatus::Trying,
            };
        }
        let kind = match method {
            Method::Invite if status < 180 => EventType::CallProceeding,
            Method::Invite => EventType::CallRinging,
            _ => EventType::SubscriptionProceeding,
        };
        self.report(kind, Some(tid), Some(owner));
    }

    fn on_success(&mut self, tid: TransactionId, response: &Message) {
        let Some(method) = self.method_of(tid) else {
            return;
        };
        match method {
            Method::Publish => {
                if let Err(e) = self.pub_update(tid, response) {
                    debug!("{}: {}", tid, e);
                }
                self.report(EventType::MessageAnswered, Some(tid), None);
                return;
            }
            Method::Register => {
                self.on_register_success(tid, response);
                return;
            }
            Method::Cancel => {
                trace!("{} CANCEL accepted", tid);
                return;
            }
            _ => {}
        }

        let Some(owner) = self.owner_of(tid) else {
            self.report(EventType::MessageAnswered, Some(tid), None);
            return;
        };

        // a 2xx ends any credential retry cycle
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.retry = 0;
        }
        match owner.parent {
            Parent::Call(k) => {
                if let Some(call) = self.call_by_key_mut(k) {
                    call.retry = 0;
                }
            }
            Parent::Subscribe(k) => {
                if let Some(sub) = self.subscribe_by_key_mut(k) {
                    sub.retry = 0;
                }
            }
            Parent::Notify(k) => {
                if let Some(notify) = self.notify_by_key_mut(k) {
                    notify.retry = 0;
                }
            }
        }

        match (&method, owner.parent) {
            (Method::Invite, Parent::Call(_)) => self.on_invite_answered(tid, owner, response),
            (Method::Subscribe, Parent::Subscribe(_)) => self.on_subscribe_answered(tid, owner, response),
            (Method::Bye, _) => {
                if let Some(dialog) = self.dialog_mut(owner) {
                    dialog.status = DialogStatus::Terminated;
                }
            }
            (Method::Notify, Parent::Notify(k)) => {
                let terminated = self
                    .layer
                    .get(tid)
                    .and_then(|t| t.orig_request.subscription_state())
                    .is_some_and(|s| s.trim_start().to_ascii_lowercase().starts_with("terminated"));
                if terminated {
                    self.report(EventType::InSubscriptionReleased, Some(tid), Some(owner));
                    self.free_notify(k);
                }
            }
            (_, Parent::Call(_)) => self.report(EventType::CallMessageAnswered, Some(tid), Some(owner)),
            _ => {}
        }
    }

    fn on_register_success(&mut self, tid: TransactionId, response: &Message) {
        self.learn_port(response);
        let Some(reg) = self.registration_by_tid_mut(tid) else {
            debug!("{} answers no known registration", tid);
            return;
        };
        reg.retry = 0;
        let (rid, period) = (reg.id, reg.period);
        let kind = if period == 0 {
            EventType::RegistrationTerminated
        } else {
            EventType::RegistrationSuccess
        };
        info!("registration {} answered by {:?}", rid, response.status());
        self.report_registration(kind, rid, Some(tid));
    }

    fn on_invite_answered(&mut self, tid: TransactionId, owner: Owner, response: &Message) {
        let owner = match self.dialog_mut(owner) {
            Some(dialog) => {
                let Some(sip) = dialog.sip.as_mut() else {
                    // a BYE overtook this 2xx
                    debug!("{} 2xx for a dialog already gone", tid);
                    return;
                };
                if sip.remote_tag.is_some() && sip.remote_tag != response.to_tag() {
                    // another fork answered: replace the early dialog
                    match SipDialog::init_as_uac(response) {
                        Ok(replacement) => {
                            info!("{} dialog replaced by the answering fork", tid);
                            *sip = replacement;
                        }
                        Err(e) => {
                            debug!("cannot replace dialog: {}", e);
                            return;
                        }
                    }
                } else {
                    sip.update_route_set_as_uac(response);
                    sip.set_state(DialogState::Confirmed);
                }
                owner
            }
            None => match self.attach_uac_dialog(tid, owner, response, false) {
                Some(o) => o,
                None => return,
            },
        };
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.status = DialogStatus::Established;
            dialog.set_200ok(response);
        }
        self.report(EventType::CallAnswered, Some(tid), Some(owner));
    }

    fn on_subscribe_answered(&mut self, tid: TransactionId, owner: Owner, response: &Message) {
        if let Parent::Subscribe(k) = owner.parent {
            if let (Some(sub), Some(expires)) = (self.subscribe_by_key_mut(k), response.expires()) {
                sub.refresh_interval = expires;
            }
        }
        let Some(owner) = self.attach_uac_dialog(tid, owner, response, true) else {
            return;
        };
        if let Some(dialog) = self.dialog_mut(owner) {
            if let Some(sip) = dialog.sip.as_mut() {
                sip.set_state(DialogState::Confirmed);
            }
            dialog.status = DialogStatus::Established;
        }
        self.report(EventType::SubscriptionAnswered, Some(tid), Some(owner));
    }

    fn on_failure(&mut self, tid: TransactionId, response: &Message) {
        let Some(method) = self.method_of(tid) else {
            return;
        };
        let status = response.status().unwrap_or(500);

        match method {
            Method::Publish => {
                if let Err(e) = self.pub_update(tid, response) {
                    debug!("{}: {}", tid, e);
                }
                self.report(MESSAGE_FAILURES.pick(status), Some(tid), None);
                return;
            }
            Method::Register => {
                if let Some(rid) = self.registration_by_tid_mut(tid).map(|r| r.id) {
                    self.report_registration(EventType::RegistrationFailure, rid, Some(tid));
                }
                return;
            }
            Method::Cancel => {
                debug!("{} CANCEL refused with {}", tid, status);
                return;
            }
            _ => {}
        }

        let Some(owner) = self.owner_of(tid) else {
            self.report(MESSAGE_FAILURES.pick(status), Some(tid), None);
            return;
        };
        match (&method, owner.parent) {
            (Method::Invite, Parent::Call(_)) => self.report(CALL_FAILURES.pick(status), Some(tid), Some(owner)),
            (Method::Subscribe, Parent::Subscribe(_)) => {
                self.report(SUBSCRIPTION_FAILURES.pick(status), Some(tid), Some(owner))
            }
            (_, Parent::Call(_)) => {
                self.report(CALL_MESSAGE_FAILURES.pick(status), Some(tid), Some(owner));
                return;
            }
            _ => return,
        }

        if let Parent::Call(k) = owner.parent {
            if matches!(status, 401 | 407) {
                if let Some(call) = self.call_by_key_mut(k) {
                    call.response_auth = Some(response.clone());
                }
            }
        }
        let dropped = match self.dialog_mut(owner) {
            Some(dialog) => {
                let dropped = dialog.delete_if_early();
                if (300..400).contains(&status) {
                    if dialog.sip.is_none() {
                        dialog.status = DialogStatus::Redirected;
                    }
                } else {
                    dialog.status = failure_status(status);
                }
                dropped
            }
            None => false,
        };
        if dropped {
            self.update();
        }
    }

    fn on_response_sent(&mut self, tid: TransactionId, response: &Message) {
        let Some(owner) = self.owner_of(tid) else {
            return;
        };
        let Some(status) = response.status() else {
            return;
        };
        let method = response.cseq_method();
        let dialog_creating = matches!(method, Some(Method::Invite | Method::Subscribe));
        let initial_invite = method == Some(Method::Invite)
            && matches!(owner.parent, Parent::Call(k) if self.call_by_key(k).is_some_and(|c| c.inc_tr == Some(tid)));

        let Some(dialog) = self.dialog_mut(owner) else {
            return;
        };
        match status {
            100..=199 => dialog.status = DialogStatus::Trying,
            200..=299 => dialog.status = DialogStatus::Established,
            _ => {
                let dropped = dialog_creating && dialog.delete_if_early();
                dialog.status = failure_status(status);
                if dropped {
                    self.update();
                }
                // only the initial INVITE closes the call
                if initial_invite {
                    self.report(EventType::CallClosed, Some(tid), Some(owner));
                }
            }
        }
    }

    /// A non-INVITE server transaction was created.
    ///
    /// Requests the dispatcher already answered with a final response are
    /// not surfaced as `*_MESSAGE_NEW`; the rest are the application's to
    /// answer.
    fn on_request_received(&mut self, tid: TransactionId, request: &Message) {
        let owner = self.owner_of(tid);
        let answered = self
            .layer
            .get(tid)
            .and_then(|t| t.last_status())
            .is_some_and(|s| s >= 200);

        match owner.map(|o| o.parent) {
            None if !answered => self.report(EventType::MessageNew, Some(tid), None),
            Some(Parent::Call(_)) if !answered => self.report(EventType::CallMessageNew, Some(tid), owner),
            Some(Parent::Notify(_)) if request.is_method(&Method::Subscribe) => {
                self.report(EventType::InSubscriptionNew, Some(tid), owner)
            }
            Some(Parent::Subscribe(_)) if request.is_method(&Method::Notify) => {
                self.report(EventType::SubscriptionNotify, Some(tid), owner)
            }
            _ => trace!("{} {:?} already handled", tid, request.method()),
        }
    }

    fn on_killed(&mut self, tid: TransactionId, kind: TransactionKind) {
        if kind != TransactionKind::Nict {
            trace!("{} {} terminated", kind, tid);
            return;
        }
        let Some(tr) = self.layer.get(tid) else {
            return;
        };
        let method = tr.method.clone();
        let status = tr.last_status();
        let unsubscribe = tr
            .orig_request
            .header("Expires")
            .is_some_and(|v| v.trim() == "0");

        if method == Method::Register {
            if status.is_none() {
                if let Some(rid) = self.registration_by_tid_mut(tid).map(|r| r.id) {
                    self.report_registration(EventType::RegistrationFailure, rid, Some(tid));
                }
            }
            return;
        }

        let Some(owner) = self.owner_of(tid) else {
            return;
        };
        match (owner.parent, &method) {
            (Parent::Notify(k), Method::Notify) => {
                let terminated = self
                    .notify_by_key(k)
                    .is_some_and(|n| n.ss_status == SubscriptionStatus::Terminated);
                let release = match status {
                    None => true,
                    Some(401 | 407) => false,
                    Some(s) if s > 299 => true,
                    Some(s) if s >= 200 => terminated,
                    Some(_) => false,
                };
                if release {
                    debug!("NOTIFY {} ended incoming subscription", tid);
                    self.report(EventType::InSubscriptionReleased, Some(tid), Some(owner));
                    self.free_notify(k);
                }
            }
            (Parent::Subscribe(k), Method::Subscribe) => {
                if status.is_none() {
                    self.report(EventType::SubscriptionNoAnswer, Some(tid), Some(owner));
                    self.free_subscribe(k);
                } else if unsubscribe {
                    self.report(EventType::SubscriptionReleased, Some(tid), Some(owner));
                    self.free_subscribe(k);
                }
            }
            _ => {}
        }
    }

    fn on_transport_error(&mut self, tid: TransactionId, kind: TransactionKind) {
        if kind != TransactionKind::Nict {
            return;
        }
        let (Some(owner), Some(method)) = (self.owner_of(tid), self.method_of(tid)) else {
            return;
        };
        match (owner.parent, method) {
            (Parent::Notify(k), Method::Notify) => {
                self.report(EventType::InSubscriptionReleased, Some(tid), Some(owner));
                self.free_notify(k);
            }
            (Parent::Subscribe(k), Method::Subscribe) => {
                self.report(EventType::SubscriptionReleased, Some(tid), Some(owner));
                self.free_subscribe(k);
            }
            (Parent::Call(k), Method::Options) => {
                if self.call_by_key(k).is_some_and(|c| c.dialogs.is_empty()) {
                    self.report(EventType::CallReleased, Some(tid), Some(owner));
                    self.free_call(k);
                }
            }
            _ => {}
        }
    }
}
