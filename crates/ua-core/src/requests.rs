//! Building requests and responses.
//!
//! [`Builder`] knows the local addresses and the User-Agent string; every
//! message the engine originates goes through it. The two `rebuild_*`
//! functions produce the follow-up request after a 401/407 or a 3xx:
//!
//! ```text
//!  orig request ──clone──► strip credentials ──► CSeq + 1 ──► fresh Via
//!                                                                │
//!                 401/407: answer challenges ◄───────────────────┤
//!                 3xx:     Request-URI := first usable Contact ◄─┘
//! ```

use sipua_sip_core::random::{new_branch, new_call_id, new_tag};
use sipua_sip_core::{
    CSeq, Destination, Message, Method, NameAddr, SipDialog, Transport, Uri, Via,
};

use crate::auth::{AuthStore, strip_credentials};
use crate::errors::{Error, Result};
use crate::net::{Network, is_public_address};

/// Methods advertised in `Allow` on requests that may create a dialog
const ALLOW_REQUEST: &str = "INVITE, ACK, UPDATE, INFO, CANCEL, BYE, OPTIONS, REFER, SUBSCRIBE, NOTIFY, MESSAGE";
/// Methods advertised in `Allow` on responses
const ALLOW_RESPONSE: &str = "INVITE, ACK, OPTIONS, CANCEL, BYE, SUBSCRIBE, NOTIFY, MESSAGE, INFO, REFER, UPDATE";

/// Initial CSeq of requests outside a dialog, REGISTER excepted
const INITIAL_CSEQ: u32 = 20;

fn parse_name_addr(what: &str, value: &str) -> Result<NameAddr> {
    if value.trim().is_empty() {
        return Err(Error::bad_argument(format!("empty {}", what)));
    }
    value
        .parse()
        .map_err(|_| Error::bad_argument(format!("invalid {}: {}", what, value)))
}

/// Transport named by a URI's `transport` parameter, UDP when absent.
pub fn uri_transport(uri: &Uri) -> Result<Transport> {
    match uri.transport() {
        None => Ok(Transport::Udp),
        Some(t) => t
            .parse()
            .map_err(|_| Error::UnsupportedTransport(t.to_string())),
    }
}

/// Where a request goes: the first Route if it is a loose router, the
/// Request-URI otherwise. The top Via decides the transport.
pub fn destination_for(request: &Message) -> Result<Destination> {
    let transport = request
        .top_via()
        .map(|v| v.transport)
        .unwrap_or(Transport::Udp);
    let target = match request.routes().into_iter().next() {
        Some(route) if route.uri.is_loose_router() => route.uri,
        _ => request
            .request_uri()
            .cloned()
            .ok_or_else(|| Error::bad_argument("not a request"))?,
    };
    let port = target.port.unwrap_or(match transport {
        Transport::Tls => 5061,
        _ => 5060,
    });
    Ok(Destination::new(target.host, port, transport))
}

/// Builds every message the user agent originates
#[derive(Debug, Clone, Copy)]
pub struct Builder<'a> {
    pub net: &'a Network,
    pub user_agent: &'a str,
}

impl<'a> Builder<'a> {
    pub fn new(net: &'a Network, user_agent: &'a str) -> Self {
        Builder { net, user_agent }
    }

    /// `SIP/2.0/<transport> ip:port;rport;branch=z9hG4bK...`
    ///
    /// IPv6 hosts get no `rport`.
    pub fn new_top_via(&self, transport: Transport, peer_host: &str) -> Via {
        let ip = self.net.advertised_ip(transport, peer_host);
        let mut via = Via::new(transport, ip, self.net.port(transport), &new_branch());
        if !ip.contains(':') {
            let branch = via.branch().map(str::to_string).unwrap_or_default();
            via.params.remove("branch");
            via.params.set("rport", None);
            via.params.set("branch", Some(&branch));
        }
        via
    }

    fn contact_for(&self, user: Option<&str>, transport: Transport, peer_host: &str) -> String {
        let ip = self.net.advertised_ip(transport, peer_host);
        let mut uri = Uri::new(ip).with_port(self.net.port(transport));
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            uri = uri.with_user(user);
        }
        if transport != Transport::Udp {
            uri.params.set("transport", Some(&transport.as_str().to_ascii_lowercase()));
        }
        NameAddr::new(uri).to_string()
    }

    /// A request that starts a new exchange (no dialog yet).
    ///
    /// With a loose-routing `proxy` the request goes to `to` via a Route;
    /// with a strict one the proxy becomes the Request-URI. REGISTER is
    /// always sent to `proxy` with `To` equal to `from`.
    pub fn out_of_dialog(
        &self,
        method: Method,
        to: &str,
        transport: Transport,
        from: &str,
        proxy: Option<&str>,
    ) -> Result<Message> {
        let mut from = parse_name_addr("from", from)?;
        let proxy = proxy
            .filter(|p| !p.trim().is_empty())
            .map(|p| parse_name_addr("proxy", p))
            .transpose()?;

        let (to, request_uri, route) = if method == Method::Register {
            let registrar = proxy.ok_or_else(|| Error::bad_argument("REGISTER needs a registrar"))?;
            (from.without_tag(), registrar.uri, None)
        } else {
            let to = parse_name_addr("to", to)?;
            match proxy {
                Some(p) if p.uri.is_loose_router() => (to.clone(), to.uri.clone(), Some(p.to_string())),
                Some(p) => (to.clone(), p.uri.clone(), Some(NameAddr::new(to.uri.clone()).to_string())),
                None => (to.clone(), to.uri.clone(), None),
            }
        };

        let peer_host = request_uri.host.clone();
        from.set_tag(&new_tag());
        let local_ip = self.net.interface(transport).ip.clone();

        let mut request = Message::request(method.clone(), request_uri);
        request.add_header("Via", self.new_top_via(transport, &peer_host).to_string());
        if let Some(route) = route {
            request.add_header("Route", route);
        }
        request.add_header("Max-Forwards", "70");
        request.add_header("From", from.to_string());
        request.add_header("To", to.to_string());
        request.add_header("Call-ID", new_call_id(&local_ip));
        request.set_cseq(&CSeq {
            seq: if method == Method::Register { 1 } else { INITIAL_CSEQ },
            method: method.clone(),
        });

        if matches!(method, Method::Invite | Method::Subscribe) {
            let contact = self.contact_for(from.uri.user.as_deref(), transport, &peer_host);
            request.add_header("Contact", contact);
            request.add_header("Allow", ALLOW_REQUEST);
        }
        if method == Method::Options {
            request.add_header("Accept", "application/sdp");
        }
        request.add_header("User-Agent", self.user_agent);
        Ok(request)
    }

    /// REGISTER with a Contact (ours when none is given) and Expires.
    pub fn register(
        &self,
        transport: Transport,
        from: &str,
        registrar: &str,
        contact: Option<&str>,
        expires: u32,
    ) -> Result<Message> {
        let mut request = self.out_of_dialog(Method::Register, "", transport, from, Some(registrar))?;
        let contact = match contact.filter(|c| !c.trim().is_empty()) {
            Some(c) => c.to_string(),
            None => {
                let user = request.from().and_then(|f| f.uri.user);
                let peer = request.request_uri().map(|u| u.host.clone()).unwrap_or_default();
                self.contact_for(user.as_deref(), transport, &peer)
            }
        };
        request.add_header("Contact", contact);
        request.add_header("Expires", expires.to_string());
        Ok(request)
    }

    /// An in-dialog request with a fresh Via and our Contact.
    pub fn within_dialog(&self, dialog: &mut SipDialog, method: Method, transport: Transport) -> Message {
        let mut request = dialog.build_request(method.clone());
        let peer_host = request
            .request_uri()
            .map(|u| u.host.clone())
            .unwrap_or_default();
        request.insert_header_first("Via", self.new_top_via(transport, &peer_host).to_string());
        if method != Method::Ack {
            let user = dialog.local_uri.uri.user.clone();
            request.add_header("Contact", self.contact_for(user.as_deref(), transport, &peer_host));
        }
        if method == Method::Options {
            request.add_header("Accept", "application/sdp");
        }
        request.add_header("User-Agent", self.user_agent);
        request
    }

    /// Default response to `request`.
    ///
    /// A To tag is added when the request had none: the dialog's local tag
    /// if there is a dialog, a fresh one otherwise (except for 100).
    pub fn response(&self, request: &Message, status: u16, local_tag: Option<&str>) -> Result<Message> {
        if !(100..=699).contains(&status) {
            return Err(Error::bad_argument(format!("status {} out of range", status)));
        }
        let method = request
            .method()
            .cloned()
            .ok_or_else(|| Error::bad_argument("not a request"))?;
        let mut response = Message::response_to(request, status);
        match (status, &method) {
            (481, Method::Notify) => response.set_reason("Subcription Does Not Exist"),
            (202, Method::Subscribe) => response.set_reason("Accepted subscription"),
            _ => {}
        }
        if request.to_tag().is_none() {
            match local_tag {
                Some(tag) => response.set_to_tag(tag)?,
                None if status != 100 => response.set_to_tag(&new_tag())?,
                None => {}
            }
        }
        if method == Method::Subscribe {
            response.add_header("Event", request.event().unwrap_or("presence"));
        }
        response.add_header("Allow", ALLOW_RESPONSE);
        response.add_header("User-Agent", self.user_agent);
        Ok(response)
    }

    /// Make a 1xx/2xx able to establish a dialog: copy Record-Route and
    /// add our Contact.
    pub fn complete_answer(&self, response: &mut Message, request: &Message) {
        for rr in request.headers("Record-Route").map(str::to_string).collect::<Vec<_>>() {
            response.add_header("Record-Route", rr);
        }
        let transport = request
            .top_via()
            .map(|v| v.transport)
            .unwrap_or(Transport::Udp);
        let peer_host = request
            .contacts()
            .into_iter()
            .next()
            .map(|c| c.uri.host)
            .unwrap_or_default();
        let user = request.to().and_then(|t| t.uri.user);
        response.set_header("Contact", self.contact_for(user.as_deref(), transport, &peer_host));
    }

    /// CANCEL for a pending INVITE (RFC 3261 9.1).
    pub fn cancel(&self, invite: &Message) -> Result<Message> {
        let uri = invite
            .request_uri()
            .cloned()
            .ok_or_else(|| Error::bad_argument("not a request"))?;
        let via = invite.header("Via").ok_or(sipua_sip_core::Error::MissingHeader("Via"))?;
        let cseq = invite.cseq().ok_or(sipua_sip_core::Error::MissingHeader("CSeq"))?;
        let mut cancel = Message::request(Method::Cancel, uri);
        cancel.add_header("Via", via);
        for route in invite.headers("Route").map(str::to_string).collect::<Vec<_>>() {
            cancel.add_header("Route", route);
        }
        cancel.add_header("Max-Forwards", "70");
        for name in ["From", "To", "Call-ID"] {
            if let Some(v) = invite.header(name) {
                cancel.add_header(name, v);
            }
        }
        cancel.set_cseq(&CSeq {
            seq: cseq.seq,
            method: Method::Cancel,
        });
        cancel.add_header("User-Agent", self.user_agent);
        Ok(cancel)
    }

    /// Clone of `orig` re-sequenced for another attempt: credentials
    /// removed, CSeq + 1, fresh top Via on the original transport.
    pub fn resequence(&self, orig: &Message) -> Result<Message> {
        let mut request = orig.clone();
        strip_credentials(&mut request);
        let cseq = request.cseq().ok_or(sipua_sip_core::Error::MissingHeader("CSeq"))?;
        request.set_cseq(&CSeq {
            seq: cseq.seq + 1,
            method: cseq.method,
        });
        let transport = orig
            .top_via()
            .map(|v| v.transport)
            .unwrap_or(Transport::Udp);
        let peer_host = orig
            .request_uri()
            .map(|u| u.host.clone())
            .unwrap_or_default();
        request.set_top_via(&self.new_top_via(transport, &peer_host));
        Ok(request)
    }

    /// Follow-up to a 401/407 on `orig`.
    pub fn rebuild_with_credentials(&self, orig: &Message, challenge: &Message, auth: &AuthStore) -> Result<Message> {
        let mut request = self.resequence(orig)?;
        auth.add_authentication(&mut request, challenge)?;
        Ok(request)
    }

    /// Follow-up to a 3xx on `orig`, aimed at the first usable Contact.
    pub fn rebuild_for_redirect(&self, orig: &Message, redirect: &Message) -> Result<Message> {
        let target = redirect_target(redirect)?;
        let mut request = self.resequence(orig)?;
        request.set_request_uri(target);
        let transport = orig
            .top_via()
            .map(|v| v.transport)
            .unwrap_or(Transport::Udp);
        let peer_host = request
            .request_uri()
            .map(|u| u.host.clone())
            .unwrap_or_default();
        request.set_top_via(&self.new_top_via(transport, &peer_host));
        Ok(request)
    }
}

/// First Contact of a 3xx reachable over UDP or TCP.
pub fn redirect_target(redirect: &Message) -> Result<Uri> {
    let contacts = redirect.contacts();
    if contacts.is_empty() {
        return Err(Error::NoUsableContact);
    }
    let mut rejected = None;
    for contact in contacts {
        match contact.uri.transport() {
            None => return Ok(contact.uri),
            Some(t) if t.eq_ignore_ascii_case("udp") || t.eq_ignore_ascii_case("tcp") => {
                return Ok(contact.uri);
            }
            Some(t) => rejected = Some(t.to_string()),
        }
    }
    Err(rejected.map_or(Error::NoUsableContact, Error::UnsupportedTransport))
}

/// Whether an incoming request's Contact is on a public network
pub fn contact_is_public(request: &Message) -> bool {
    request
        .contacts()
        .first()
        .is_some_and(|c| is_public_address(&c.uri.host))
}
