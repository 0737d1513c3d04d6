//! RFC 3261 transaction layer (section 17).
//!
//! The layer is synchronous and clock-agnostic: callers hand it messages
//! and the current time, then drain the resulting [`SubstrateEvent`]s and
//! [`Outgoing`] messages. Nothing here performs I/O.
//!
//! ```text
//!  receive()/create_*()/send_response()/execute(now)
//!                     │
//!            ┌────────▼────────┐
//!            │ TransactionLayer│──► drain_outbox()  -> wire
//!            └────────┬────────┘
//!                     └────────► drain_events()  -> user agent
//! ```

mod layer;
mod state;
mod timer;

use std::fmt;

use crate::message::Message;
use crate::method::Method;
use crate::via::Transport;

pub use layer::{Outgoing, SubstrateEvent, TransactionLayer};
pub use state::TransactionState;
pub use timer::{TimerSettings, TimerType};

/// Identifier of a transaction inside one [`TransactionLayer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u32);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid#{}", self.0)
    }
}

/// The four RFC 3261 transaction state machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// INVITE client transaction
    Ict,
    /// INVITE server transaction
    Ist,
    /// Non-INVITE client transaction
    Nict,
    /// Non-INVITE server transaction
    Nist,
}

impl TransactionKind {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionKind::Ict | TransactionKind::Nict)
    }

    pub fn is_invite(&self) -> bool {
        matches!(self, TransactionKind::Ict | TransactionKind::Ist)
    }

    pub fn for_request(method: &Method, client: bool) -> Self {
        match (method.is_invite(), client) {
            (true, true) => TransactionKind::Ict,
            (false, true) => TransactionKind::Nict,
            (true, false) => TransactionKind::Ist,
            (false, false) => TransactionKind::Nist,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Ict => "ICT",
            TransactionKind::Ist => "IST",
            TransactionKind::Nict => "NICT",
            TransactionKind::Nist => "NIST",
        };
        f.write_str(name)
    }
}

/// Where a message goes (client side) or came from (server side)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Destination {
            host: host.into(),
            port,
            transport,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.transport)
    }
}

/// One transaction and everything the user agent may want to inspect.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub state: TransactionState,
    /// Creation time in seconds on the layer's clock
    pub birth_time: u64,
    pub orig_request: Message,
    pub last_response: Option<Message>,
    /// ACK generated (ICT) or received (IST) for a non-2xx final response
    pub ack: Option<Message>,
    pub branch: String,
    pub method: Method,
    /// Request destination (client) or response destination (server)
    pub destination: Destination,
    pub(crate) timers: timer::Timers,
}

impl Transaction {
    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Final status of the last response, if any
    pub fn last_status(&self) -> Option<u16> {
        self.last_response.as_ref().and_then(|r| r.status())
    }

    /// Seconds since creation
    pub fn age(&self, now_secs: u64) -> u64 {
        now_secs.saturating_sub(self.birth_time)
    }
}
