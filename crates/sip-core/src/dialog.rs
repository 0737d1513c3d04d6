//! RFC 3261 dialog state (section 12).
//!
//! [`SipDialog`] holds what is needed to recognise and build in-dialog
//! messages: Call-ID, tags, URIs, the remote target, the route set and
//! both CSeq counters. Creating and matching dialogs is driven by the
//! user-agent layer.

use crate::error::{Error, Result};
use crate::message::{CSeq, Message};
use crate::method::Method;
use crate::uri::{NameAddr, Uri};

/// Early or confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipDialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    /// Local party, without tag
    pub local_uri: NameAddr,
    /// Remote party, without tag
    pub remote_uri: NameAddr,
    pub remote_target: Uri,
    pub route_set: Vec<NameAddr>,
    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    pub state: DialogState,
    pub is_uac: bool,
}

fn state_for(response: &Message) -> DialogState {
    match response.status() {
        Some(code) if code < 200 => DialogState::Early,
        _ => DialogState::Confirmed,
    }
}

fn first_contact_uri(msg: &Message) -> Option<Uri> {
    msg.contacts().into_iter().next().map(|c| c.uri)
}

impl SipDialog {
    /// Dialog seen from the caller's side, built from a 1xx/2xx response.
    pub fn init_as_uac(response: &Message) -> Result<Self> {
        let call_id = response.call_id().ok_or(Error::MissingHeader("Call-ID"))?;
        let from = response.from().ok_or(Error::MissingHeader("From"))?;
        let to = response.to().ok_or(Error::MissingHeader("To"))?;
        let cseq = response.cseq().ok_or(Error::MissingHeader("CSeq"))?;
        let local_tag = from
            .tag()
            .ok_or_else(|| Error::invalid_header("From", "missing tag"))?
            .to_string();

        let mut route_set = response.record_routes();
        route_set.reverse();

        Ok(SipDialog {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: to.tag().map(str::to_string),
            remote_target: first_contact_uri(response).unwrap_or_else(|| to.uri.clone()),
            local_uri: from.without_tag(),
            remote_uri: to.without_tag(),
            route_set,
            local_cseq: cseq.seq,
            remote_cseq: None,
            state: state_for(response),
            is_uac: true,
        })
    }

    /// Dialog created on the subscriber side from a NOTIFY that arrives
    /// before (or instead of) the SUBSCRIBE's 2xx.
    pub fn init_as_uac_with_remote_request(request: &Message, local_cseq: u32) -> Result<Self> {
        let call_id = request.call_id().ok_or(Error::MissingHeader("Call-ID"))?;
        let from = request.from().ok_or(Error::MissingHeader("From"))?;
        let to = request.to().ok_or(Error::MissingHeader("To"))?;
        let cseq = request.cseq().ok_or(Error::MissingHeader("CSeq"))?;
        let local_tag = to
            .tag()
            .ok_or_else(|| Error::invalid_header("To", "missing tag"))?
            .to_string();

        Ok(SipDialog {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: from.tag().map(str::to_string),
            remote_target: first_contact_uri(request).unwrap_or_else(|| from.uri.clone()),
            local_uri: to.without_tag(),
            remote_uri: from.without_tag(),
            route_set: request.record_routes(),
            local_cseq,
            remote_cseq: Some(cseq.seq),
            state: DialogState::Confirmed,
            is_uac: true,
        })
    }

    /// Dialog seen from the callee's side: the request plus the response
    /// (carrying our To tag) that establishes it.
    pub fn init_as_uas(request: &Message, response: &Message) -> Result<Self> {
        let call_id = request.call_id().ok_or(Error::MissingHeader("Call-ID"))?;
        let from = request.from().ok_or(Error::MissingHeader("From"))?;
        let to = request.to().ok_or(Error::MissingHeader("To"))?;
        let cseq = request.cseq().ok_or(Error::MissingHeader("CSeq"))?;
        let local_tag = response
            .to_tag()
            .ok_or_else(|| Error::invalid_header("To", "response without tag"))?;

        Ok(SipDialog {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: from.tag().map(str::to_string),
            remote_target: first_contact_uri(request).unwrap_or_else(|| from.uri.clone()),
            local_uri: to.without_tag(),
            remote_uri: from.without_tag(),
            route_set: request.record_routes(),
            local_cseq: 0,
            remote_cseq: Some(cseq.seq),
            state: state_for(response),
            is_uac: false,
        })
    }

    /// Does an incoming request belong to this dialog?
    pub fn match_as_uas(&self, request: &Message) -> bool {
        if request.call_id() != Some(self.call_id.as_str()) {
            return false;
        }
        let Some(to_tag) = request.to_tag() else {
            return false;
        };
        to_tag == self.local_tag && request.from_tag() == self.remote_tag
    }

    /// Does a response to one of our requests belong to this dialog?
    pub fn match_as_uac(&self, response: &Message) -> bool {
        response.call_id() == Some(self.call_id.as_str())
            && response.from_tag().as_deref() == Some(self.local_tag.as_str())
            && response.to_tag() == self.remote_tag
    }

    /// Refresh target and route set from a response while still early.
    pub fn update_route_set_as_uac(&mut self, response: &Message) {
        if let Some(target) = first_contact_uri(response) {
            self.remote_target = target;
        }
        if self.state == DialogState::Early {
            let mut route_set = response.record_routes();
            route_set.reverse();
            self.route_set = route_set;
            if self.remote_tag.is_none() {
                self.remote_tag = response.to_tag();
            }
        }
    }

    /// Target refresh from an in-dialog request (re-INVITE, NOTIFY, ...).
    pub fn update_route_set_as_uas(&mut self, request: &Message) {
        if let Some(target) = first_contact_uri(request) {
            self.remote_target = target;
        }
    }

    pub fn update_cseq_as_uas(&mut self, request: &Message) {
        if let Some(cseq) = request.cseq() {
            self.remote_cseq = Some(cseq.seq);
        }
    }

    pub fn set_state(&mut self, state: DialogState) {
        self.state = state;
    }

    /// Build an in-dialog request (RFC 3261 12.2.1.1) without a Via.
    ///
    /// The local CSeq is incremented except for ACK and CANCEL, which
    /// reuse the sequence number of the request they belong to.
    pub fn build_request(&mut self, method: Method) -> Message {
        let (request_uri, routes) = match self.route_set.first() {
            Some(first) if !first.uri.is_loose_router() => {
                // strict routing: first route becomes the Request-URI
                let mut rest: Vec<NameAddr> = self.route_set[1..].to_vec();
                rest.push(NameAddr::new(self.remote_target.clone()));
                (first.uri.clone(), rest)
            }
            _ => (self.remote_target.clone(), self.route_set.clone()),
        };

        if !matches!(method, Method::Ack | Method::Cancel) {
            self.local_cseq += 1;
        }

        let mut from = self.local_uri.clone();
        from.set_tag(&self.local_tag);
        let mut to = self.remote_uri.clone();
        if let Some(tag) = &self.remote_tag {
            to.set_tag(tag);
        }

        let mut request = Message::request(method.clone(), request_uri);
        for route in &routes {
            request.add_header("Route", route.to_string());
        }
        request.add_header("From", from.to_string());
        request.add_header("To", to.to_string());
        request.add_header("Call-ID", self.call_id.clone());
        request.set_cseq(&CSeq {
            seq: self.local_cseq,
            method,
        });
        request.add_header("Max-Forwards", "70");
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Message {
        Message::parse(
            b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Record-Route: <sip:p1.example.com;lr>, <sip:p2.example.com;lr>\r\n\
\r\n",
        )
        .unwrap()
    }

    fn ringing() -> Message {
        let mut r = Message::response_to(&invite(), 180);
        r.set_to_tag("a6c85cf").unwrap();
        r.add_header("Contact", "<sip:bob@192.0.2.4>");
        r.add_header("Record-Route", "<sip:p1.example.com;lr>");
        r.add_header("Record-Route", "<sip:p2.example.com;lr>");
        r
    }

    #[test]
    fn test_uac_dialog_reverses_route_set() {
        let d = SipDialog::init_as_uac(&ringing()).unwrap();
        assert_eq!(d.state, DialogState::Early);
        assert_eq!(d.local_tag, "1928301774");
        assert_eq!(d.remote_tag.as_deref(), Some("a6c85cf"));
        assert_eq!(d.remote_target.host, "192.0.2.4");
        assert_eq!(d.route_set[0].uri.host, "p2.example.com");
        assert_eq!(d.local_cseq, 314159);
    }

    #[test]
    fn test_uas_dialog_matches_in_dialog_request() {
        let mut resp = Message::response_to(&invite(), 200);
        resp.set_to_tag("xyz").unwrap();
        let mut uas = SipDialog::init_as_uas(&invite(), &resp).unwrap();
        assert_eq!(uas.state, DialogState::Confirmed);
        assert_eq!(uas.route_set[0].uri.host, "p1.example.com");

        let bye = uas.build_request(Method::Bye);
        assert_eq!(bye.cseq().unwrap().seq, 1);
        assert_eq!(bye.request_uri().unwrap().host, "pc33.atlanta.com");

        // a BYE coming from the caller has the tags swapped
        let mut incoming = invite();
        incoming.set_to_tag("xyz").unwrap();
        assert!(uas.match_as_uas(&incoming));
        incoming.set_to_tag("other").unwrap();
        assert!(!uas.match_as_uas(&incoming));
    }

    #[test]
    fn test_build_request_increments_cseq_except_ack() {
        let mut d = SipDialog::init_as_uac(&ringing()).unwrap();
        let ack = d.build_request(Method::Ack);
        assert_eq!(ack.cseq().unwrap().seq, 314159);
        let info = d.build_request(Method::Info);
        assert_eq!(info.cseq().unwrap().seq, 314160);
        assert_eq!(info.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(info.routes().len(), 2);
    }

    #[test]
    fn test_match_as_uac() {
        let d = SipDialog::init_as_uac(&ringing()).unwrap();
        assert!(d.match_as_uac(&ringing()));
        let mut other = ringing();
        other.set_to_tag("fork2").unwrap();
        assert!(!d.match_as_uac(&other));
    }
}
