//! Engine internals driven by the network loop
//!
//! - `callbacks`: substrate events (responses, kills, transport errors)
//!   mapped onto aggregate state and application events
//! - `dispatcher`: requests that matched no transaction
//! - `retry`: the automatic-action sweep (credentials, redirects, refreshes)
//! - `gc`: release of finished calls, subscriptions, registrations and
//!   orphaned transactions

mod callbacks;
mod dispatcher;
mod gc;
mod retry;
