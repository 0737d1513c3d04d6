//! Outgoing subscriptions (watcher side).

use sipua_sip_core::{Message, Method};
use tracing::{debug, info};

use super::call::target_transport;
use super::dialog_transport;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::{Owner, Parent, Subscribe, SubscriptionStatus, TerminationReason};
use crate::requests::Builder;

const DEFAULT_EVENT: &str = "presence";
const PIDF: &str = "application/pidf+xml";

impl Context {
    /// Initial SUBSCRIBE for `event` (presence when empty) lasting
    /// `expires` seconds.
    pub fn build_initial_subscribe(
        &self,
        to: &str,
        from: &str,
        route: Option<&str>,
        event: &str,
        expires: u32,
    ) -> Result<Message> {
        let mut request = self
            .builder()
            .out_of_dialog(Method::Subscribe, to, target_transport(to), from, route)?;
        let event = if event.trim().is_empty() { DEFAULT_EVENT } else { event };
        request.set_header("Event", event);
        request.set_header("Expires", expires.to_string());
        request.set_header("Accept", PIDF);
        Ok(request)
    }

    /// Send an initial SUBSCRIBE. Returns the subscription id.
    pub fn send_initial_subscribe(&mut self, request: Message) -> Result<i32> {
        if !request.is_method(&Method::Subscribe) {
            return Err(Error::bad_argument("not a SUBSCRIBE"));
        }
        let uri = request
            .request_uri()
            .map(|u| u.to_string())
            .unwrap_or_default();
        let expires = request.expires().unwrap_or(600);
        let key = self.new_key();
        let tid = self.start_client(request, Some(Owner::new(Parent::Subscribe(key), None)))?;
        let mut sub = Subscribe::new(key, uri, expires);
        sub.out_tr = Some(tid);
        self.subscribes.insert(0, sub);
        self.update();
        let sid = self.subscribe_by_key(key).map_or(0, |s| s.id);
        info!("subscription {} started with {}", sid, tid);
        self.process_substrate_events();
        Ok(sid)
    }

    /// Refresh subscription dialog `did`, keeping the current interval
    /// unless `expires` is given.
    pub fn refresh_subscribe(&mut self, did: i32, expires: Option<u32>) -> Result<u32> {
        let owner = self.subscribe_dialog_owner(did)?;
        self.send_subscribe_refresh(owner, expires)
    }

    /// End subscription dialog `did` with an `Expires: 0` SUBSCRIBE. The
    /// subscription is released once that request completes.
    pub fn terminate_subscribe(&mut self, did: i32) -> Result<u32> {
        let owner = self.subscribe_dialog_owner(did)?;
        let tid = self.send_subscribe_refresh(owner, Some(0))?;
        if let Parent::Subscribe(k) = owner.parent {
            if let Some(sub) = self.subscribe_by_key_mut(k) {
                sub.ss_status = SubscriptionStatus::Terminated;
                sub.ss_reason = TerminationReason::Deactivated;
            }
        }
        Ok(tid)
    }

    /// Forget subscription `sid` locally, without telling the notifier.
    pub fn remove_subscribe(&mut self, sid: i32) -> Result<()> {
        let key = self
            .subscribes
            .iter()
            .find(|s| s.id == sid)
            .map(|s| s.key)
            .ok_or_else(|| Error::not_found("subscription", sid))?;
        self.free_subscribe(key);
        Ok(())
    }

    /// In-dialog SUBSCRIBE carrying the event of the initial one.
    pub(crate) fn send_subscribe_refresh(&mut self, owner: Owner, expires: Option<u32>) -> Result<u32> {
        let Parent::Subscribe(sk) = owner.parent else {
            return Err(Error::NoDialog);
        };
        let dialog = self.dialog(owner).ok_or(Error::NoDialog)?;
        let last = self.last_out_of(dialog, &Method::Subscribe);
        if last.is_some_and(|t| self.layer.get(t).is_some_and(|tr| !tr.state.is_finished())) {
            return Err(Error::wrong_state("a SUBSCRIBE is already pending"));
        }
        let sub = self.subscribe_by_key(sk).ok_or(Error::NoDialog)?;
        let event = last
            .or(sub.out_tr)
            .and_then(|t| self.layer.get(t))
            .and_then(|tr| tr.orig_request.event().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_EVENT.to_string());
        let expires = expires.unwrap_or(sub.refresh_interval);

        let net = self.net.clone();
        let user_agent = self.config.user_agent.clone();
        let sip = self.live_sip(owner)?;
        let transport = dialog_transport(sip);
        let mut request = Builder::new(&net, &user_agent).within_dialog(sip, Method::Subscribe, transport);
        request.set_header("Event", event);
        request.set_header("Expires", expires.to_string());
        request.set_header("Accept", PIDF);

        let tid = self.start_client(request, Some(owner))?;
        if let Some(dialog) = self.dialog_mut(owner) {
            dialog.push_out_tr(tid);
        }
        debug!("{} refreshes subscription for {}s", tid, expires);
        self.process_substrate_events();
        Ok(tid.0)
    }
}
