//! PUBLISH with entity-tag tracking (RFC 3903).

use sipua_sip_core::{Message, Method, TransactionId};
use tracing::debug;

use super::call::target_transport;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::model::Publication;

/// Parameters of one PUBLISH
#[derive(Debug, Clone, Default)]
pub struct PublishRequest<'a> {
    pub to: &'a str,
    pub from: &'a str,
    pub route: Option<&'a str>,
    pub event: &'a str,
    pub expires: u32,
    pub content_type: Option<&'a str>,
    pub body: Option<&'a [u8]>,
}

impl Context {
    /// PUBLISH for the address of record `to`. A live entity tag from a
    /// previous 2xx goes into `SIP-If-Match`.
    pub fn build_publish(&self, p: &PublishRequest<'_>) -> Result<Message> {
        if p.event.trim().is_empty() {
            return Err(Error::bad_argument("PUBLISH needs an event package"));
        }
        let mut request = self
            .builder()
            .out_of_dialog(Method::Publish, p.to, target_transport(p.to), p.from, p.route)?;
        request.set_header("Event", p.event);
        request.set_header("Expires", p.expires.to_string());
        let now = self.now_secs();
        let aor = request.to().map(|t| t.uri.to_string()).unwrap_or_default();
        if let Some(etag) = self
            .publications
            .iter()
            .find(|x| x.aor == aor)
            .and_then(|x| x.live_etag(now))
        {
            request.set_header("SIP-If-Match", etag);
        }
        match (p.content_type, p.body) {
            (Some(ct), Some(body)) => request.set_body(ct, body.to_vec()),
            (None, Some(_)) => return Err(Error::bad_argument("body without content type")),
            _ => {}
        }
        Ok(request)
    }

    /// Send a PUBLISH. Returns the transaction id.
    pub fn publish(&mut self, request: Message) -> Result<u32> {
        if !request.is_method(&Method::Publish) {
            return Err(Error::bad_argument("not a PUBLISH"));
        }
        let aor = request
            .to()
            .map(|t| t.uri.to_string())
            .ok_or_else(|| Error::bad_argument("PUBLISH without To"))?;
        let expires = request.expires().unwrap_or(3600);
        let tid = self.start_client(request, None)?;

        let previous = match self.publications.iter_mut().find(|p| p.aor == aor) {
            Some(p) => {
                p.period = expires;
                p.last_tr.replace(tid)
            }
            None => {
                let mut p = Publication::new(aor, expires);
                p.last_tr = Some(tid);
                self.publications.insert(0, p);
                None
            }
        };
        if let Some(old) = previous {
            self.discard(old);
        }
        self.process_substrate_events();
        Ok(tid.0)
    }

    /// Cache entity tag and expiry from the answer to a PUBLISH.
    pub(crate) fn pub_update(&mut self, tid: TransactionId, response: &Message) -> Result<()> {
        let now = self.now_secs();
        let publication = self
            .publication_by_tid_mut(tid)
            .ok_or_else(|| Error::not_found("publication for transaction", tid.0 as i32))?;
        match response.status() {
            Some(s) if (200..300).contains(&s) => {
                if let Some(etag) = response.header("SIP-ETag") {
                    publication.etag = Some(etag.trim().to_string());
                }
                let granted = response.expires().unwrap_or(publication.period);
                publication.expires_at = now + u64::from(granted);
                debug!("publication of {} valid for {}s", publication.aor, granted);
            }
            // the entity tag we sent is unknown to the server
            Some(412) => publication.etag = None,
            _ => {}
        }
        Ok(())
    }
}
