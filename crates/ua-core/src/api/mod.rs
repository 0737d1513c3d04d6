//! Application entry points.
//!
//! Each submodule adds methods to [`Context`]: building a request, sending
//! it, answering an incoming one. Builders never change state; senders
//! either succeed completely or return an error with nothing changed.
//! Sending drains the substrate before returning, so events caused by the
//! call are already queued when it returns.
//!
//! Ids are the public ones handed out by [`Context::update`]: `cid`, `did`,
//! `sid`, `nid`, `rid`, and the transaction number `tid` found in
//! [`crate::Event::tid`].

mod auth;
mod call;
mod insubscription;
mod message;
mod publish;
mod register;
mod subscribe;

pub use insubscription::subscription_state;
pub use publish::PublishRequest;

use sipua_sip_core::{SipDialog, Transaction, TransactionId, Transport};

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::{DialogOwner, Owner, Parent};
use crate::requests::uri_transport;

/// Transport towards the remote target of a dialog
pub(crate) fn dialog_transport(sip: &SipDialog) -> Transport {
    uri_transport(&sip.remote_target).unwrap_or(Transport::Udp)
}

impl Context {
    pub(crate) fn call_dialog_owner(&self, did: i32) -> Result<Owner> {
        self.calls
            .iter()
            .find_map(|c| c.dialog(did).map(|d| Owner::new(Parent::Call(c.key), Some(d.key))))
            .ok_or_else(|| Error::not_found("dialog", did))
    }

    pub(crate) fn subscribe_dialog_owner(&self, did: i32) -> Result<Owner> {
        self.subscribes
            .iter()
            .find_map(|s| s.dialog(did).map(|d| Owner::new(Parent::Subscribe(s.key), Some(d.key))))
            .ok_or_else(|| Error::not_found("dialog", did))
    }

    pub(crate) fn notify_dialog_owner(&self, did: i32) -> Result<Owner> {
        self.notifies
            .iter()
            .find_map(|n| n.dialog(did).map(|d| Owner::new(Parent::Notify(n.key), Some(d.key))))
            .ok_or_else(|| Error::not_found("dialog", did))
    }

    /// Underlying dialog of `owner`, which must still be alive.
    pub(crate) fn live_sip(&mut self, owner: Owner) -> Result<&mut SipDialog> {
        self.dialog_mut(owner)
            .and_then(|d| d.sip.as_mut())
            .ok_or(Error::NoDialog)
    }

    /// Server transaction `tid` that still waits for a final answer.
    pub(crate) fn pending_server(&self, tid: u32) -> Result<&Transaction> {
        let tr = self
            .layer
            .get(TransactionId(tid))
            .ok_or_else(|| Error::not_found("transaction", tid as i32))?;
        if tr.kind.is_client() {
            return Err(Error::wrong_state(format!("{} is not a server transaction", tr.id)));
        }
        if tr.state.is_finished() {
            return Err(Error::wrong_state(format!("{} already answered", tr.id)));
        }
        Ok(tr)
    }
}
