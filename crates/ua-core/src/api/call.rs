//! INVITE sessions: placing, answering, acknowledging and ending calls,
//! plus requests sent inside an established call.

use sipua_sip_core::{
    CSeq, DialogState, Message, Method, NameAddr, TransactionId, TransactionState, Transport,
};
use tracing::{debug, info};

use super::dialog_transport;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::{Call, DialogStatus, Key, Owner, Parent};
use crate::requests::{Builder, destination_for, uri_transport};

/// Transport named by the `transport` parameter of a To/Request-URI value
pub(crate) fn target_transport(to: &str) -> Transport {
    to.parse::<NameAddr>()
        .ok()
        .and_then(|n| uri_transport(&n.uri).ok())
        .unwrap_or(Transport::Udp)
}

impl Context {
    /// Initial INVITE from `from` to `to`, optionally through `route`.
    pub fn build_initial_invite(
        &self,
        to: &str,
        from: &str,
        route: Option<&str>,
        subject: Option<&str>,
    ) -> Result<Message> {
        let mut invite = self
            .builder()
            .out_of_dialog(Method::Invite, to, target_transport(to), from, route)?;
        if let Some(subject) = subject.filter(|s| !s.is_empty()) {
            invite.set_header("Subject", subject);
        }
        Ok(invite)
    }

    /// Send an initial INVITE and create the call that tracks it.
    ///
    /// Returns the call id.
    pub fn initiate_call(&mut self, invite: Message, reference: Option<u64>) -> Result<i32> {
        if !invite.is_method(&Method::Invite) {
            return Err(Error::bad_argument("not an INVITE"));
        }
        if invite.to_tag().is_some() {
            return Err(Error::bad_argument("initial INVITE carries a To tag"));
        }
        let key = self.new_key();
        let tid = self.start_client(invite, Some(Owner::new(Parent::Call(key), None)))?;
        let mut call = Call::new(key);
        call.out_tr = Some(tid);
        call.external_reference = reference;
        self.calls.insert(0, call);
        self.update();
        let cid = self.call_by_key(key).map_or(0, |c| c.id);
        info!("call {} started with {}", cid, tid);
        self.process_substrate_events();
        Ok(cid)
    }

    /// OPTIONS sent outside any dialog but tracked as a call, so that its
    /// answer surfaces as `CALL_MESSAGE_*` and the call is released after.
    pub fn initiate_options(&mut self, options: Message) -> Result<i32> {
        if !options.is_method(&Method::Options) {
            return Err(Error::bad_argument("not an OPTIONS"));
        }
        let key = self.new_key();
        let tid = self.start_client(options, Some(Owner::new(Parent::Call(key), None)))?;
        let mut call = Call::new(key);
        call.out_tr = Some(tid);
        self.calls.insert(0, call);
        self.update();
        self.process_substrate_events();
        Ok(self.call_by_key(key).map_or(0, |c| c.id))
    }

    pub fn set_external_reference(&mut self, cid: i32, reference: Option<u64>) -> Result<()> {
        let key = self.ensure_call(cid)?;
        if let Some(call) = self.call_by_key_mut(key) {
            call.external_reference = reference;
        }
        Ok(())
    }

    /// Default answer to an incoming INVITE (initial or re-INVITE).
    ///
    /// 1xx and 2xx answers carry our Contact and the Record-Route set so
    /// they can establish the dialog.
    pub fn build_answer(&self, tid: u32, status: u16) -> Result<Message> {
        let tr = self.pending_server(tid)?;
        if tr.method != Method::Invite {
            return Err(Error::wrong_state(format!("{} is not an INVITE", tr.id)));
        }
        let owner = self
            .owner_of(tr.id)
            .ok_or_else(|| Error::not_found("call for transaction", tid as i32))?;
        let local_tag = self
            .dialog(owner)
            .and_then(|d| d.sip.as_ref())
            .map(|s| s.local_tag.clone());
        if (101..300).contains(&status) && local_tag.is_none() {
            return Err(Error::NoDialog);
        }
        let builder = self.builder();
        let mut answer = builder.response(&tr.orig_request, status, local_tag.as_deref())?;
        if status < 300 {
            builder.complete_answer(&mut answer, &tr.orig_request);
        }
        Ok(answer)
    }

    /// Answer an incoming INVITE with `status`, or with a prepared
    /// `answer` built by [`Context::build_answer`].
    pub fn answer_call(&mut self, tid: u32, status: u16, answer: Option<Message>) -> Result<()> {
        let answer = match answer {
            Some(a) => a,
            None => self.build_answer(tid, status)?,
        };
        let status = answer
            .status()
            .ok_or_else(|| Error::bad_argument("answer is not a response"))?;
        let tid = TransactionId(tid);
        let owner = self
            .owner_of(tid)
            .ok_or_else(|| Error::not_found("call for transaction", tid.0 as i32))?;

        if (200..300).contains(&status) {
            let sip = self.live_sip(owner)?;
            sip.set_state(DialogState::Confirmed);
            if let Some(dialog) = self.dialog_mut(owner) {
                dialog.set_200ok(&answer);
            }
        }
        self.respond(tid, answer)?;
        debug!("{} answered with {}", tid, status);
        self.process_substrate_events();
        Ok(())
    }

    /// Newest outgoing INVITE of a call dialog
    fn last_out_invite(&self, owner: Owner) -> Option<TransactionId> {
        let dialog = self.dialog(owner)?;
        self.last_out_of(dialog, &Method::Invite).or_else(|| match owner.parent {
            Parent::Call(k) => self.call_by_key(k).and_then(|c| c.out_tr),
            _ => None,
        })
    }

    /// ACK for the 2xx of our last INVITE on dialog `did`.
    pub fn build_ack(&mut self, did: i32) -> Result<Message> {
        let owner = self.call_dialog_owner(did)?;
        let invite = self
            .last_out_invite(owner)
            .and_then(|t| self.layer.get(t))
            .ok_or_else(|| Error::wrong_state("no INVITE to acknowledge"))?;
        if !invite.last_status().is_some_and(|s| (200..300).contains(&s)) {
            return Err(Error::wrong_state("INVITE not answered with 2xx"));
        }
        let orig = invite.orig_request.clone();
        let cseq = orig.cseq().ok_or_else(|| Error::bad_argument("INVITE without CSeq"))?;

        let net = self.net.clone();
        let user_agent = self.config.user_agent.clone();
        let sip = self.live_sip(owner)?;
        let transport = dialog_transport(sip);
        let mut ack = Builder::new(&net, &user_agent).within_dialog(sip, Method::Ack, transport);
        ack.set_cseq(&CSeq {
            seq: cseq.seq,
            method: Method::Ack,
        });
        for name in ["Authorization", "Proxy-Authorization"] {
            for value in orig.headers(name).map(str::to_string).collect::<Vec<_>>() {
                ack.add_header(name, value);
            }
        }
        Ok(ack)
    }

    /// Send (or re-send) the ACK of dialog `did`. The ACK is cached on the
    /// dialog for retransmitted 2xx.
    pub fn send_ack(&mut self, did: i32, ack: Option<Message>) -> Result<()> {
        let ack = match ack {
            Some(a) => a,
            None => self.build_ack(did)?,
        };
        if !ack.is_method(&Method::Ack) {
            return Err(Error::bad_argument("not an ACK"));
        }
        let owner = self.call_dialog_owner(did)?;
        let destination = destination_for(&ack)?;
        self.send_stateless(ack.clone(), destination);
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.ack = Some(ack);
        }
        Ok(())
    }

    /// A request inside the call dialog `did` (INFO, OPTIONS, REFER,
    /// MESSAGE, NOTIFY, UPDATE or re-INVITE).
    pub fn build_request_within_call(&mut self, did: i32, method: Method) -> Result<Message> {
        if matches!(method, Method::Ack | Method::Cancel | Method::Bye) {
            return Err(Error::bad_argument(format!("{} has its own entry point", method)));
        }
        let owner = self.call_dialog_owner(did)?;
        let challenge = match owner.parent {
            Parent::Call(k) => self.call_by_key(k).and_then(|c| c.response_auth.clone()),
            _ => None,
        };
        let net = self.net.clone();
        let user_agent = self.config.user_agent.clone();
        let sip = self.live_sip(owner)?;
        let transport = dialog_transport(sip);
        // the dialog sequence is consumed only when the request is sent
        let mut scratch = sip.clone();
        let mut request = Builder::new(&net, &user_agent).within_dialog(&mut scratch, method, transport);
        if let Some(challenge) = challenge {
            if let Err(e) = self.auth.add_authentication(&mut request, &challenge) {
                debug!("in-call request sent without credentials: {}", e);
            }
        }
        Ok(request)
    }

    /// Send a request built by [`Context::build_request_within_call`].
    ///
    /// Returns the transaction id.
    pub fn send_request_within_call(&mut self, did: i32, request: Message) -> Result<u32> {
        let method = request
            .method()
            .cloned()
            .ok_or_else(|| Error::bad_argument("not a request"))?;
        let owner = self.call_dialog_owner(did)?;
        if method == Method::Invite {
            let dialog = self.dialog(owner).ok_or(Error::NoDialog)?;
            let busy = [self.last_out_of(dialog, &Method::Invite), self.last_inc_of(dialog, &Method::Invite)]
                .into_iter()
                .flatten()
                .any(|t| !self.is_terminated(t));
            if busy {
                return Err(Error::wrong_state("an INVITE is already pending in this dialog"));
            }
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
        debug!("{} {} sent in dialog {}", tid, method, did);
        self.process_substrate_events();
        Ok(tid.0)
    }

    /// End call `cid` (or only its dialog `did` when positive).
    ///
    /// - unanswered outgoing INVITE: CANCEL
    /// - unanswered incoming INVITE: 603 Decline
    /// - confirmed dialog: BYE
    pub fn terminate_call(&mut self, cid: i32, did: i32) -> Result<()> {
        let ck = self.ensure_call(cid)?;
        let call = self.call_by_key(ck).ok_or_else(|| Error::not_found("call", cid))?;
        let dialog = if did > 0 {
            Some(
                call.dialogs
                    .iter()
                    .find(|d| d.id == did)
                    .ok_or_else(|| Error::not_found("dialog", did))?,
            )
        } else {
            call.dialogs.iter().find(|d| d.sip.is_some())
        };
        let dk = dialog.map(|d| d.key);
        let confirmed = dialog.is_some_and(|d| d.is_confirmed());
        let (out_tr, inc_tr) = (call.out_tr, call.inc_tr);

        if confirmed {
            return self.send_bye(Owner::new(Parent::Call(ck), dk));
        }

        if let Some(out) = out_tr.filter(|t| self.method_of(*t) == Some(Method::Invite)) {
            let state = self.layer.get(out).map(|t| t.state);
            return match state {
                Some(TransactionState::Proceeding) => self.send_cancel(ck, out),
                Some(TransactionState::Calling) => {
                    Err(Error::wrong_state("no provisional answer yet, cannot CANCEL"))
                }
                _ => Err(Error::wrong_state("call already answered or finished")),
            };
        }

        if let Some(inc) = inc_tr {
            if self.layer.get(inc).is_some_and(|t| !t.state.is_finished()) {
                let answer = self.build_answer(inc.0, 603)?;
                self.respond(inc, answer)?;
                self.process_substrate_events();
                return Ok(());
            }
        }
        Err(Error::wrong_state("nothing to terminate"))
    }

    fn send_cancel(&mut self, ck: Key, invite_tid: TransactionId) -> Result<()> {
        let invite = self
            .layer
            .get(invite_tid)
            .map(|t| t.orig_request.clone())
            .ok_or_else(|| Error::not_found("transaction", invite_tid.0 as i32))?;
        let cancel = self.builder().cancel(&invite)?;
        let tid = self.start_client(cancel, None)?;
        info!("{} cancels {} of call {:?}", tid, invite_tid, ck);
        self.discard(tid);
        self.process_substrate_events();
        Ok(())
    }

    fn send_bye(&mut self, owner: Owner) -> Result<()> {
        let Parent::Call(ck) = owner.parent else {
            return Err(Error::NoDialog);
        };
        let dialog = self.dialog(owner).ok_or(Error::NoDialog)?;
        if [self.last_out_of(dialog, &Method::Bye), self.last_inc_of(dialog, &Method::Bye)]
            .into_iter()
            .flatten()
            .next()
            .is_some()
        {
            return Err(Error::wrong_state("BYE already exchanged"));
        }
        let challenge = self.call_by_key(ck).and_then(|c| c.response_auth.clone());
        let net = self.net.clone();
        let user_agent = self.config.user_agent.clone();
        let sip = self.live_sip(owner)?;
        let transport = dialog_transport(sip);
        let mut bye = Builder::new(&net, &user_agent).within_dialog(sip, Method::Bye, transport);
        if let Some(challenge) = challenge {
            if let Err(e) = self.auth.add_authentication(&mut bye, &challenge) {
                debug!("BYE sent without credentials: {}", e);
            }
        }
        let tid = self.start_client(bye, Some(owner))?;
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_out_tr(tid);
            dialog.status = DialogStatus::Terminated;
        }
        info!("{} BYE sent", tid);
        self.process_substrate_events();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_transport() {
        assert_eq!(target_transport("<sip:bob@b.example;transport=tcp>"), Transport::Tcp);
        assert_eq!(target_transport("sip:bob@b.example"), Transport::Udp);
        assert_eq!(target_transport("garbage <"), Transport::Udp);
    }
}
