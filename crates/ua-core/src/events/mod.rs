//! Application-facing events
//!
//! Every observable state change of a call, subscription, registration or
//! standalone request produces one [`Event`]. Events own clones of the
//! messages involved; later changes to the live transaction never show up
//! in an event that is already queued.
//!
//! Ids that do not apply to an event are `0`.

mod queue;

pub use queue::EventQueue;

use std::fmt;

use sipua_sip_core::{Message, Transaction};

use crate::model::{SubscriptionStatus, TerminationReason};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    // registrations
    RegistrationSuccess,
    RegistrationFailure,
    RegistrationTerminated,

    // INVITE-initiated calls
    CallInvite,
    CallReinvite,
    CallNoAnswer,
    CallProceeding,
    CallRinging,
    CallAnswered,
    CallRedirected,
    CallRequestFailure,
    CallServerFailure,
    CallGlobalFailure,
    CallAck,
    CallCancelled,
    CallClosed,
    CallReleased,
    CallReferStatus,

    // requests inside a call
    CallMessageNew,
    CallMessageProceeding,
    CallMessageAnswered,
    CallMessageRedirected,
    CallMessageRequestFailure,
    CallMessageServerFailure,
    CallMessageGlobalFailure,

    // requests outside any call
    MessageNew,
    MessageProceeding,
    MessageAnswered,
    MessageRedirected,
    MessageRequestFailure,
    MessageServerFailure,
    MessageGlobalFailure,

    // outgoing subscriptions
    SubscriptionNoAnswer,
    SubscriptionProceeding,
    SubscriptionAnswered,
    SubscriptionRedirected,
    SubscriptionRequestFailure,
    SubscriptionServerFailure,
    SubscriptionGlobalFailure,
    SubscriptionNotify,
    SubscriptionReleased,

    // incoming subscriptions
    InSubscriptionNew,
    InSubscriptionReleased,
}

impl EventType {
    /// Fixed human readable summary carried in [`Event::textinfo`]
    pub fn text(&self) -> &'static str {
        use EventType::*;
        match self {
            CallNoAnswer => "No answer for this Call!",
            CallProceeding => "Call is being processed!",
            CallRinging => "Remote phone is ringing!",
            CallAnswered => "Remote phone has answered!",
            CallRedirected => "Call is redirected!",
            CallRequestFailure => "4xx received for Call!",
            CallServerFailure => "5xx received for Call!",
            CallGlobalFailure => "6xx received for Call!",
            CallInvite => "New call received!",
            CallAck => "ACK received!",
            CallCancelled => "Call has been cancelled!",
            CallReinvite => "INVITE within call received!",
            CallClosed => "Bye Received!",
            CallReleased => "Call Context is released!",
            RegistrationSuccess => "User is successfully registred!",
            RegistrationFailure => "Registration failed!",
            CallMessageNew => "New request received!",
            CallMessageProceeding => "request is being processed!",
            CallMessageAnswered => "2xx received for request!",
            CallMessageRedirected => "3xx received for request!",
            CallMessageRequestFailure => "4xx received for request!",
            CallMessageServerFailure => "5xx received for request!",
            CallMessageGlobalFailure => "6xx received for request!",
            MessageNew => "New request outside call received!",
            MessageProceeding => "request outside call is being processed!",
            MessageAnswered => "2xx received for request outside call!",
            MessageRedirected => "3xx received for request outside call!",
            MessageRequestFailure => "4xx received for request outside call!",
            MessageServerFailure => "5xx received for request outside call!",
            MessageGlobalFailure => "6xx received for request outside call!",
            SubscriptionNoAnswer => "No answer for this SUBSCRIBE!",
            SubscriptionProceeding => "SUBSCRIBE is being processed!",
            SubscriptionAnswered => "2xx received for SUBSCRIBE!",
            SubscriptionRedirected => "3xx received for SUBSCRIBE!",
            SubscriptionRequestFailure => "4xx received for SUBSCRIBE!",
            SubscriptionServerFailure => "5xx received for SUBSCRIBE!",
            SubscriptionGlobalFailure => "6xx received for SUBSCRIBE!",
            SubscriptionNotify => "NOTIFY request for subscription!",
            SubscriptionReleased => "Subscription has terminate!",
            InSubscriptionNew => "New incoming SUBSCRIBE!",
            InSubscriptionReleased => "Incoming Subscription has terminate!",
            _ => "",
        }
    }

    pub fn is_call_event(&self) -> bool {
        use EventType::*;
        matches!(
            self,
            CallInvite
                | CallReinvite
                | CallNoAnswer
                | CallProceeding
                | CallRinging
                | CallAnswered
                | CallRedirected
                | CallRequestFailure
                | CallServerFailure
                | CallGlobalFailure
                | CallAck
                | CallCancelled
                | CallClosed
                | CallReleased
                | CallReferStatus
                | CallMessageNew
                | CallMessageProceeding
                | CallMessageAnswered
                | CallMessageRedirected
                | CallMessageRequestFailure
                | CallMessageServerFailure
                | CallMessageGlobalFailure
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Longest [`Event::textinfo`], in bytes
pub const TEXTINFO_MAX: usize = 256;

/// Cut `text` to [`TEXTINFO_MAX`] bytes on a char boundary.
fn clip(text: &mut String) {
    if text.len() > TEXTINFO_MAX {
        let mut end = TEXTINFO_MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

/// One state change, consumed exactly once through the [`EventQueue`]
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventType,
    /// Call id
    pub cid: i32,
    /// Dialog id
    pub did: i32,
    /// Outgoing subscription id
    pub sid: i32,
    /// Incoming subscription (notify) id
    pub nid: i32,
    /// Registration id
    pub rid: i32,
    /// Transaction the event was raised for
    pub tid: u32,
    /// Opaque value attached to the call by the application
    pub external_reference: Option<u64>,
    pub ss_status: Option<SubscriptionStatus>,
    pub ss_reason: Option<TerminationReason>,
    pub request: Option<Message>,
    pub response: Option<Message>,
    pub ack: Option<Message>,
    /// Summary text, at most [`TEXTINFO_MAX`] bytes
    pub textinfo: String,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Event {
            kind,
            cid: 0,
            did: 0,
            sid: 0,
            nid: 0,
            rid: 0,
            tid: 0,
            external_reference: None,
            ss_status: None,
            ss_reason: None,
            request: None,
            response: None,
            ack: None,
            textinfo: kind.text().to_string(),
        }
    }

    /// Clone the messages of `tr` into the event.
    pub(crate) fn with_transaction(mut self, tr: &Transaction) -> Self {
        self.tid = tr.id.0;
        self.request = Some(tr.orig_request.clone());
        self.response = tr.last_response.clone();
        self.ack = tr.ack.clone();
        self
    }

    /// Append the status line of a response to the summary text.
    pub(crate) fn with_status_text(mut self, response: Option<&Message>) -> Self {
        if let Some(resp) = response {
            if let (Some(code), Some(reason)) = (resp.status(), resp.reason()) {
                if self.textinfo.is_empty() {
                    self.textinfo = format!("{} {}", code, reason);
                } else {
                    self.textinfo = format!("{} ({} {})", self.textinfo, code, reason);
                }
                clip(&mut self.textinfo);
            }
        }
        self
    }

    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().and_then(Message::status)
    }
}
