//! # sipua-ua-core
//!
//! SIP user-agent core: calls, in-dialog requests, outgoing and incoming
//! subscriptions, registrations and publications on top of the
//! transaction substrate in `sipua-sip-core`.
//!
//! ```text
//!   application ──► api::*  (impl Context) ──┐
//!        ▲                                   │ requests/responses
//!        │ Event                             ▼
//!   EventQueue ◄── protocol::callbacks ◄── TransactionLayer ◄── transport
//!                  protocol::dispatcher ◄── unmatched requests ──┘
//!                  protocol::retry / gc  (every loop iteration)
//! ```
//!
//! [`Context`] is the synchronous engine and can be driven by hand (the
//! integration tests do this with a [`ManualClock`]). [`UserAgent`] wraps it
//! behind a lock and runs the network loop on tokio.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod logging;
pub mod model;
pub mod net;
pub mod requests;
pub mod transport;
pub mod ua;

mod protocol;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NetOptions, Timing, UaConfig, UaOption};
pub use context::Context;
pub use errors::{Error, Result};
pub use events::{Event, EventQueue, EventType};
pub use model::{DialogStatus, SubscriptionStatus, TerminationReason};
pub use ua::UserAgent;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
