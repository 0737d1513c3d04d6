//! SIP message framing.
//!
//! A [`Message`] is a start line, an ordered list of headers and a body.
//! Headers are stored one value per entry: comma-joined Via, Contact,
//! Route and Record-Route values are split on parse so that "top Via"
//! and "first Contact" are simple list operations. Everything else is
//! kept as text and interpreted on demand by the typed accessors.

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::method::Method;
use crate::param::split_comma_list;
use crate::status::reason_phrase;
use crate::uri::{NameAddr, Uri};
use crate::via::Via;

pub const SIP_VERSION: &str = "SIP/2.0";

/// Headers whose comma-separated values are split into separate entries
const LIST_HEADERS: &[&str] = &["Via", "Contact", "Route", "Record-Route"];

/// Request line or status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: Method, uri: Uri },
    Response { status: u16, reason: String },
}

/// A single header entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Parsed CSeq header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A SIP request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    start: StartLine,
    headers: Vec<Header>,
    body: Bytes,
}

/// Expand compact header forms and normalise capitalisation of the
/// headers this crate looks up.
pub fn canonical_name(name: &str) -> String {
    let name = name.trim();
    let canonical = match name.to_ascii_lowercase().as_str() {
        "v" | "via" => "Via",
        "f" | "from" => "From",
        "t" | "to" => "To",
        "i" | "call-id" => "Call-ID",
        "m" | "contact" => "Contact",
        "l" | "content-length" => "Content-Length",
        "c" | "content-type" => "Content-Type",
        "e" | "content-encoding" => "Content-Encoding",
        "o" | "event" => "Event",
        "u" | "allow-events" => "Allow-Events",
        "r" | "refer-to" => "Refer-To",
        "s" | "subject" => "Subject",
        "k" | "supported" => "Supported",
        "cseq" => "CSeq",
        "max-forwards" => "Max-Forwards",
        "route" => "Route",
        "record-route" => "Record-Route",
        "expires" => "Expires",
        "subscription-state" => "Subscription-State",
        "www-authenticate" => "WWW-Authenticate",
        "proxy-authenticate" => "Proxy-Authenticate",
        "authorization" => "Authorization",
        "proxy-authorization" => "Proxy-Authorization",
        "user-agent" => "User-Agent",
        "allow" => "Allow",
        "retry-after" => "Retry-After",
        "sip-etag" => "SIP-ETag",
        "sip-if-match" => "SIP-If-Match",
        "rseq" => "RSeq",
        "rack" => "RAck",
        "accept" => "Accept",
        _ => return name.to_string(),
    };
    canonical.to_string()
}

impl Message {
    pub fn request(method: Method, uri: Uri) -> Self {
        Message {
            start: StartLine::Request { method, uri },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(status: u16, reason: impl Into<String>) -> Self {
        Message {
            start: StartLine::Response {
                status,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Response skeleton for `request`: Via list, From, To, Call-ID and
    /// CSeq are copied. The caller decides about the To tag.
    pub fn response_to(request: &Message, status: u16) -> Self {
        let mut response = Message::response(status, reason_phrase(status));
        for h in &request.headers {
            if matches!(
                h.name.as_str(),
                "Via" | "From" | "To" | "Call-ID" | "CSeq"
            ) {
                response.headers.push(h.clone());
            }
        }
        response
    }

    /// Parse one complete message from `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head_end, body_start) = find_head_end(data)
            .ok_or_else(|| Error::Parse("no end of headers".to_string()))?;
        let head = std::str::from_utf8(&data[..head_end])
            .map_err(|e| Error::Parse(e.to_string()))?;

        let mut lines = head
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .skip_while(|l| l.trim().is_empty());

        let first = lines
            .next()
            .ok_or_else(|| Error::Parse("empty message".to_string()))?;
        let start = parse_start_line(first)?;

        let mut raw: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                match raw.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                    None => return Err(Error::Parse("continuation before header".into())),
                }
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("bad header line: {}", line)))?;
            raw.push((canonical_name(name), value.trim().to_string()));
        }

        let mut headers = Vec::with_capacity(raw.len());
        for (name, value) in raw {
            if LIST_HEADERS.contains(&name.as_str()) {
                for v in split_comma_list(&value) {
                    headers.push(Header {
                        name: name.clone(),
                        value: v,
                    });
                }
            } else {
                headers.push(Header { name, value });
            }
        }

        let mut message = Message {
            start,
            headers,
            body: Bytes::new(),
        };

        let rest = &data[body_start..];
        let body = match message.header("Content-Length") {
            Some(cl) => {
                let len: usize = cl
                    .trim()
                    .parse()
                    .map_err(|_| Error::invalid_header("Content-Length", cl))?;
                if len > rest.len() {
                    return Err(Error::Parse(format!(
                        "truncated body: {} of {} bytes",
                        rest.len(),
                        len
                    )));
                }
                &rest[..len]
            }
            None => rest,
        };
        message.body = Bytes::copy_from_slice(body);
        Ok(message)
    }

    /// Serialise for the wire. Content-Length always reflects the body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(512);
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} {}\r\n", method, uri, SIP_VERSION));
            }
            StartLine::Response { status, reason } => {
                out.push_str(&format!("{} {} {}\r\n", SIP_VERSION, status, reason));
            }
        }
        for h in &self.headers {
            if h.name == "Content-Length" {
                continue;
            }
            out.push_str(&h.name);
            out.push_str(": ");
            out.push_str(&h.value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// Request method, `None` for responses
    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    /// True when this is a request with the given method.
    pub fn is_method(&self, m: &Method) -> bool {
        self.method() == Some(m)
    }

    pub fn request_uri(&self) -> Option<&Uri> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn set_request_uri(&mut self, new_uri: Uri) {
        if let StartLine::Request { uri, .. } = &mut self.start {
            *uri = new_uri;
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn set_reason(&mut self, new_reason: &str) {
        if let StartLine::Response { reason, .. } = &mut self.start {
            *reason = new_reason.to_string();
        }
    }

    // ----- raw header access -----

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = canonical_name(name);
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(&name))
            .map(|h| h.value.as_str())
    }

    pub fn headers<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let name = canonical_name(name);
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(&name))
            .map(|h| h.value.as_str())
    }

    pub fn all_headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Append a header entry after any existing ones.
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(Header {
            name: canonical_name(name),
            value: value.into(),
        });
    }

    /// Replace every entry of `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_name(name);
        let value = value.into();
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                self.headers[pos].value = value;
                let mut index = 0;
                self.headers.retain(|h| {
                    let keep = index <= pos || !h.name.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push(Header { name, value }),
        }
    }

    /// Insert before the first entry of the same name, or at the top.
    pub fn insert_header_first(&mut self, name: &str, value: impl Into<String>) {
        let name = canonical_name(name);
        let pos = self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(&name))
            .unwrap_or(0);
        self.headers.insert(
            pos,
            Header {
                name,
                value: value.into(),
            },
        );
    }

    /// Remove every entry of `name`; returns how many were removed.
    pub fn remove_headers(&mut self, name: &str) -> usize {
        let name = canonical_name(name);
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(&name));
        before - self.headers.len()
    }

    fn replace_first(&mut self, name: &str, value: String) -> bool {
        let name = canonical_name(name);
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(&name))
        {
            Some(h) => {
                h.value = value;
                true
            }
            None => false,
        }
    }

    // ----- typed accessors -----

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<CSeq> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = Method::from(parts.next()?);
        Some(CSeq { seq, method })
    }

    pub fn set_cseq(&mut self, cseq: &CSeq) {
        self.set_header("CSeq", cseq.to_string());
    }

    /// Method a response answers, or the request's own method
    pub fn cseq_method(&self) -> Option<Method> {
        self.cseq().map(|c| c.method)
    }

    pub fn from(&self) -> Option<NameAddr> {
        self.header("From")?.parse().ok()
    }

    pub fn to(&self) -> Option<NameAddr> {
        self.header("To")?.parse().ok()
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from()?.tag().map(str::to_string)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to()?.tag().map(str::to_string)
    }

    pub fn set_to_tag(&mut self, tag: &str) -> Result<()> {
        let mut to = self.to().ok_or(Error::MissingHeader("To"))?;
        to.set_tag(tag);
        self.set_header("To", to.to_string());
        Ok(())
    }

    pub fn set_from_tag(&mut self, tag: &str) -> Result<()> {
        let mut from = self.from().ok_or(Error::MissingHeader("From"))?;
        from.set_tag(tag);
        self.set_header("From", from.to_string());
        Ok(())
    }

    pub fn vias(&self) -> Vec<Via> {
        self.headers("Via").filter_map(|v| v.parse().ok()).collect()
    }

    pub fn top_via(&self) -> Option<Via> {
        self.header("Via")?.parse().ok()
    }

    /// Replace the topmost Via, or add one when none exists.
    pub fn set_top_via(&mut self, via: &Via) {
        if !self.replace_first("Via", via.to_string()) {
            self.insert_header_first("Via", via.to_string());
        }
    }

    pub fn push_top_via(&mut self, via: &Via) {
        self.insert_header_first("Via", via.to_string());
    }

    pub fn remove_top_via(&mut self) -> Option<Via> {
        let pos = self.headers.iter().position(|h| h.name == "Via")?;
        self.headers.remove(pos).value.parse().ok()
    }

    pub fn contacts(&self) -> Vec<NameAddr> {
        self.headers("Contact")
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    pub fn record_routes(&self) -> Vec<NameAddr> {
        self.headers("Record-Route")
            .filter_map(|v| v.parse().ok())
            .collect()
    }

    pub fn routes(&self) -> Vec<NameAddr> {
        self.headers("Route").filter_map(|v| v.parse().ok()).collect()
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("Expires")?.trim().parse().ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn event(&self) -> Option<&str> {
        self.header("Event")
    }

    pub fn subscription_state(&self) -> Option<&str> {
        self.header("Subscription-State")
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn clear_body(&mut self) {
        self.remove_headers("Content-Type");
        self.body = Bytes::new();
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(SIP_VERSION) {
        let rest = rest.trim_start();
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status: u16 = code
            .parse()
            .map_err(|_| Error::Parse(format!("bad status line: {}", line)))?;
        if !(100..700).contains(&status) {
            return Err(Error::Parse(format!("status out of range: {}", status)));
        }
        return Ok(StartLine::Response {
            status,
            reason: reason.trim().to_string(),
        });
    }

    let mut parts = line.split_whitespace();
    let (method, uri, version) = (parts.next(), parts.next(), parts.next());
    match (method, uri, version) {
        (Some(m), Some(u), Some(SIP_VERSION)) => Ok(StartLine::Request {
            method: Method::from(m),
            uri: u.parse()?,
        }),
        _ => Err(Error::Parse(format!("bad request line: {}", line))),
    }
}

/// Locate the blank line ending the header block. Returns the end of the
/// header text and the start of the body.
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// Length of the first complete message in a stream buffer, if the whole
/// message (headers and Content-Length body) has arrived.
pub fn frame_length(buf: &[u8]) -> Option<usize> {
    let (head_end, body_start) = find_head_end(buf)?;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let content_length = head
        .split('\n')
        .filter_map(|l| l.split_once(':'))
        .find(|(n, _)| canonical_name(n) == "Content-Length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let total = body_start + content_length;
    (buf.len() >= total).then_some(total)
}
