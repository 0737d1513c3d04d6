//! REGISTER lifecycle of an account.
//!
//! A registration is created once per `(from, registrar)` pair and then
//! re-sent: every new REGISTER is a re-sequenced copy of the previous one,
//! so Call-ID and From tag stay stable across refreshes.

use std::net::{SocketAddr, ToSocketAddrs};

use sipua_sip_core::{Message, NameAddr, Transport};
use tracing::{debug, info};

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::{Registration, clamp_period};
use crate::requests::{destination_for, uri_transport};

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

impl Context {
    /// Registration for `from` at `proxy`, reusing an existing one for
    /// the same pair. Returns the registration id.
    pub fn register_init(&mut self, from: &str, proxy: &str, contact: Option<&str>) -> Result<i32> {
        if let Some(reg) = self
            .registrations
            .iter()
            .find(|r| r.aor == from && r.registrar == proxy)
        {
            debug!("registration {} reused for {}", reg.id, from);
            return Ok(reg.id);
        }
        from.parse::<NameAddr>()
            .map_err(|_| Error::bad_argument(format!("invalid from: {}", from)))?;
        let registrar = proxy
            .parse::<NameAddr>()
            .map_err(|_| Error::bad_argument(format!("invalid registrar: {}", proxy)))?;
        let transport = uri_transport(&registrar.uri)?;

        let rid = self.new_rid();
        let contact = contact.filter(|c| !c.trim().is_empty()).map(str::to_string);
        let mut reg = Registration::new(rid, from, proxy, contact);
        reg.transport = transport;
        self.registrations.insert(0, reg);
        info!("registration {} created for {} at {}", rid, from, proxy);
        Ok(rid)
    }

    /// Next REGISTER of registration `rid`.
    ///
    /// The previous REGISTER is re-sequenced when there is one, and answers
    /// its challenge if it got a 401/407. `Expires` is the current period.
    pub fn build_register(&self, rid: i32) -> Result<Message> {
        let reg = self.registration(rid).ok_or_else(|| Error::not_found("registration", rid))?;
        let builder = self.builder();
        let previous = reg.last_tr.and_then(|t| self.layer.get(t));
        let mut request = match previous {
            Some(tr) => {
                let mut request = builder.resequence(&tr.orig_request)?;
                if let Some(challenge) = tr
                    .last_response
                    .as_ref()
                    .filter(|r| matches!(r.status(), Some(401 | 407)))
                {
                    if let Err(e) = self.auth.add_authentication(&mut request, challenge) {
                        debug!("REGISTER sent without credentials: {}", e);
                    }
                }
                request
            }
            None => builder.register(reg.transport, &reg.aor, &reg.registrar, reg.contact.as_deref(), reg.period)?,
        };
        request.set_header("Expires", reg.period.to_string());
        Ok(request)
    }

    /// Send a REGISTER asking for `expires` seconds (clamped to
    /// [200, 3600]; 0 un-registers and stops refreshing).
    pub fn register_send(&mut self, rid: i32, expires: u32) -> Result<u32> {
        let reg = self.registration(rid).ok_or_else(|| Error::not_found("registration", rid))?;
        let old_period = reg.period;
        let period = clamp_period(expires);
        self.set_period(rid, period);
        match self.build_register(rid).and_then(|r| self.send_register(rid, r)) {
            Ok(tid) => Ok(tid),
            Err(e) => {
                self.set_period(rid, old_period);
                Err(e)
            }
        }
    }

    /// Forget registration `rid` without un-registering.
    pub fn register_remove(&mut self, rid: i32) -> Result<()> {
        if self.registration(rid).is_none() {
            return Err(Error::not_found("registration", rid));
        }
        self.free_registration(rid);
        Ok(())
    }

    /// Re-send the last REGISTER of `rid` (refresh or challenge answer).
    pub(crate) fn register_resend(&mut self, rid: i32) -> Result<()> {
        let request = self.build_register(rid)?;
        self.send_register(rid, request)?;
        Ok(())
    }

    fn set_period(&mut self, rid: i32, period: u32) {
        if let Some(reg) = self.registrations.iter_mut().find(|r| r.id == rid) {
            reg.period = period;
        }
    }

    fn send_register(&mut self, rid: i32, request: Message) -> Result<u32> {
        let destination = destination_for(&request)?;
        let tid = self.start_client(request, None)?;
        let wants_keep_alive = destination.transport == Transport::Udp
            && self.config.network.keep_alive_ms > 0
            && self.registration(rid).is_some_and(|r| r.keep_alive_addr.is_none());
        let keep_alive = wants_keep_alive
            .then(|| resolve(&destination.host, destination.port))
            .flatten();
        let mut old = None;
        if let Some(reg) = self.registrations.iter_mut().find(|r| r.id == rid) {
            old = reg.last_tr.replace(tid);
            if keep_alive.is_some() {
                reg.keep_alive_addr = keep_alive;
            }
        }
        if let Some(old) = old {
            self.discard(old);
        }
        debug!("{} REGISTER for registration {}", tid, rid);
        self.process_substrate_events();
        Ok(tid.0)
    }
}
