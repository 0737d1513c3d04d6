//! Incoming subscriptions (notifier side).

use sipua_sip_core::{DialogState, Message, Method, TransactionId};
use tracing::debug;

use super::dialog_transport;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::{Owner, Parent, SubscriptionStatus, TerminationReason};
use crate::requests::Builder;

/// `Subscription-State` value for a notifier in `status`.
pub fn subscription_state(status: SubscriptionStatus, reason: TerminationReason, remaining: u64) -> String {
    match status {
        SubscriptionStatus::Terminated => format!("terminated;reason={}", reason),
        other => format!("{};expires={}", other, remaining),
    }
}

impl Context {
    /// Answer an incoming SUBSCRIBE (initial or refresh).
    ///
    /// 2xx answers carry the remaining lifetime in `Expires` and confirm the
    /// dialog.
    pub fn answer_subscribe(&mut self, tid: u32, status: u16, answer: Option<Message>) -> Result<()> {
        let tr = self.pending_server(tid)?;
        if tr.method != Method::Subscribe {
            return Err(Error::wrong_state(format!("{} is not a SUBSCRIBE", tr.id)));
        }
        let tid = tr.id;
        let request = tr.orig_request.clone();
        let owner = self
            .owner_of(tid)
            .ok_or_else(|| Error::not_found("incoming subscription for transaction", tid.0 as i32))?;
        let Parent::Notify(nk) = owner.parent else {
            return Err(Error::NoDialog);
        };
        let local_tag = self
            .dialog(owner)
            .and_then(|d| d.sip.as_ref())
            .map(|s| s.local_tag.clone());

        let answer = match answer {
            Some(a) => a,
            None => {
                let builder = self.builder();
                let mut answer = builder.response(&request, status, local_tag.as_deref())?;
                if status < 300 {
                    builder.complete_answer(&mut answer, &request);
                }
                answer
            }
        };
        let status = answer
            .status()
            .ok_or_else(|| Error::bad_argument("answer is not a response"))?;
        let mut answer = answer;
        if (200..300).contains(&status) {
            let now = self.now_secs();
            let remaining = self.notify_by_key(nk).map_or(0, |n| n.remaining(now));
            answer.set_header("Expires", remaining.to_string());
            self.live_sip(owner)?.set_state(DialogState::Confirmed);
        }
        self.respond(tid, answer)?;
        debug!("{} SUBSCRIBE answered with {}", tid, status);
        self.process_substrate_events();
        Ok(())
    }

    /// NOTIFY for incoming subscription dialog `did`, recording the new
    /// state on the subscription.
    pub fn build_notify(
        &mut self,
        did: i32,
        status: SubscriptionStatus,
        reason: TerminationReason,
    ) -> Result<Message> {
        let owner = self.notify_dialog_owner(did)?;
        let Parent::Notify(nk) = owner.parent else {
            return Err(Error::NoDialog);
        };
        let now = self.now_secs();
        let remaining = self.notify_by_key(nk).map_or(0, |n| n.remaining(now));
        let event = self
            .notify_by_key(nk)
            .and_then(|n| n.inc_tr)
            .and_then(|t| self.layer.get(t))
            .and_then(|tr| tr.orig_request.event().map(str::to_string))
            .unwrap_or_else(|| "presence".to_string());

        let net = self.net.clone();
        let user_agent = self.config.user_agent.clone();
        let sip = self.live_sip(owner)?;
        let transport = dialog_transport(sip);
        let mut scratch = sip.clone();
        let mut request = Builder::new(&net, &user_agent).within_dialog(&mut scratch, Method::Notify, transport);
        request.set_header("Event", event);
        request.set_header("Subscription-State", subscription_state(status, reason, remaining));

        if let Some(notify) = self.notify_by_key_mut(nk) {
            notify.ss_status = status;
            notify.ss_reason = reason;
        }
        Ok(request)
    }

    /// Send a NOTIFY built by [`Context::build_notify`]. Returns the
    /// transaction id.
    pub fn send_notify(&mut self, did: i32, request: Message) -> Result<u32> {
        if !request.is_method(&Method::Notify) {
            return Err(Error::bad_argument("not a NOTIFY"));
        }
        let owner = self.notify_dialog_owner(did)?;
        let dialog = self.dialog(owner).ok_or(Error::NoDialog)?;
        if self
            .last_out_of(dialog, &Method::Notify)
            .is_some_and(|t| !self.is_terminated(t))
        {
            return Err(Error::wrong_state("a NOTIFY is already pending"));
        }
        let seq = request.cseq().map(|c| c.seq);
        let sip = self.live_sip(owner)?;
        if let Some(seq) = seq {
            sip.local_cseq = sip.local_cseq.max(seq);
        }
        let tid = self.start_client(request, Some(owner))?;
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_out_tr(tid);
        }
        self.process_substrate_events();
        Ok(tid.0)
    }

    /// Build and send a NOTIFY in one go, with an optional PIDF body.
    pub fn notify(
        &mut self,
        did: i32,
        status: SubscriptionStatus,
        reason: TerminationReason,
        body: Option<&[u8]>,
    ) -> Result<u32> {
        let owner = self.notify_dialog_owner(did)?;
        let previous = self.notify_state(owner);
        let mut request = self.build_notify(did, status, reason)?;
        if let Some(body) = body {
            request.set_body("application/pidf+xml", body.to_vec());
        }
        match self.send_notify(did, request) {
            Ok(tid) => Ok(tid),
            Err(e) => {
                // nothing was sent: keep the state the watcher knows
                if let (Parent::Notify(nk), Some((status, reason))) = (owner.parent, previous) {
                    if let Some(notify) = self.notify_by_key_mut(nk) {
                        notify.ss_status = status;
                        notify.ss_reason = reason;
                    }
                }
                Err(e)
            }
        }
    }

    fn notify_state(&self, owner: Owner) -> Option<(SubscriptionStatus, TerminationReason)> {
        match owner.parent {
            Parent::Notify(nk) => self.notify_by_key(nk).map(|n| (n.ss_status, n.ss_reason)),
            _ => None,
        }
    }

    /// Transaction id of the last incoming SUBSCRIBE of dialog `did`
    pub fn last_incoming_subscribe(&self, did: i32) -> Result<u32> {
        let owner = self.notify_dialog_owner(did)?;
        let dialog = self.dialog(owner).ok_or(Error::NoDialog)?;
        let inc = match owner.parent {
            Parent::Notify(nk) => self.notify_by_key(nk).and_then(|n| n.inc_tr),
            _ => None,
        };
        self.last_inc_of(dialog, &Method::Subscribe)
            .or(inc)
            .map(|t: TransactionId| t.0)
            .ok_or_else(|| Error::wrong_state("no SUBSCRIBE received"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_state_values() {
        assert_eq!(
            subscription_state(SubscriptionStatus::Active, TerminationReason::Timeout, 120),
            "active;expires=120"
        );
        assert_eq!(
            subscription_state(SubscriptionStatus::Pending, TerminationReason::Timeout, 0),
            "pending;expires=0"
        );
        assert_eq!(
            subscription_state(SubscriptionStatus::Terminated, TerminationReason::Timeout, 50),
            "terminated;reason=timeout"
        );
    }
}
