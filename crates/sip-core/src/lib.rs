//! # sipua-sip-core
//!
//! The SIP substrate underneath the `sipua` user agent: message framing,
//! URIs and headers, digest authentication, RFC 3261 dialogs and the four
//! transaction state machines.
//!
//! The crate performs no I/O. Bytes go in through [`Message::parse`] and
//! [`TransactionLayer::receive`]; messages to send come out of
//! [`TransactionLayer::drain_outbox`]; everything the user agent must react
//! to comes out of [`TransactionLayer::drain_events`] as one
//! [`SubstrateEvent`] stream.
//!
//! ```text
//!  wire bytes ─► Message::parse ─► TransactionLayer ─► SubstrateEvent
//!                                      │
//!                                      └──► Outgoing ─► wire bytes
//! ```

pub mod auth;
pub mod dialog;
pub mod error;
pub mod message;
pub mod method;
pub mod param;
pub mod random;
pub mod status;
pub mod transaction;
pub mod uri;
pub mod via;

pub use auth::{Challenge, Secret};
pub use dialog::{DialogState, SipDialog};
pub use error::{Error, Result};
pub use message::{CSeq, Message, StartLine};
pub use method::Method;
pub use param::Params;
pub use transaction::{
    Destination, Outgoing, SubstrateEvent, TimerSettings, Transaction, TransactionId,
    TransactionKind, TransactionLayer, TransactionState,
};
pub use uri::{NameAddr, Uri};
pub use via::{Transport, Via};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
