//! Standalone requests (MESSAGE, OPTIONS, INFO...) and answers to requests
//! surfaced as `MESSAGE_NEW` / `CALL_MESSAGE_NEW`.

use sipua_sip_core::{Message, Method, TransactionId};
use tracing::debug;

use super::call::target_transport;
use crate::context::Context;
use crate::errors::{Error, Result};

impl Context {
    /// Request outside any dialog.
    pub fn build_message(&self, method: Method, to: &str, from: &str, route: Option<&str>) -> Result<Message> {
        if matches!(method, Method::Invite | Method::Ack | Method::Cancel | Method::Register | Method::Subscribe) {
            return Err(Error::bad_argument(format!("{} has its own entry point", method)));
        }
        self.builder()
            .out_of_dialog(method, to, target_transport(to), from, route)
    }

    /// Send a request built by [`Context::build_message`]. Its answers
    /// surface as `MESSAGE_*` events. Returns the transaction id.
    pub fn send_message(&mut self, request: Message) -> Result<u32> {
        let method = request
            .method()
            .cloned()
            .ok_or_else(|| Error::bad_argument("not a request"))?;
        if matches!(method, Method::Invite | Method::Ack) {
            return Err(Error::bad_argument(format!("{} cannot be sent as a message", method)));
        }
        let tid = self.start_client(request, None)?;
        self.discard(tid);
        self.process_substrate_events();
        Ok(tid.0)
    }

    /// Default answer to a received non-INVITE request.
    pub fn build_request_answer(&self, tid: u32, status: u16) -> Result<Message> {
        let tr = self.pending_server(tid)?;
        let local_tag = self
            .owner_of(tr.id)
            .and_then(|o| self.dialog(o))
            .and_then(|d| d.sip.as_ref())
            .map(|s| s.local_tag.clone());
        Ok(self.builder().response(&tr.orig_request, status, local_tag.as_deref())?)
    }

    /// Answer a request the engine left to the application.
    pub fn answer_request(&mut self, tid: u32, status: u16, answer: Option<Message>) -> Result<()> {
        let tr = self.pending_server(tid)?;
        if tr.kind.is_invite() {
            return Err(Error::wrong_state("INVITE is answered with answer_call"));
        }
        let answer = match answer {
            Some(a) => a,
            None => self.build_request_answer(tid, status)?,
        };
        let tid = TransactionId(tid);
        self.respond(tid, answer)?;
        if self.owner_of(tid).is_none() {
            self.discard(tid);
        }
        debug!("{} answered", tid);
        self.process_substrate_events();
        Ok(())
    }
}
