//! Aggregates tracked by the user agent
//!
//! ```text
//! Context
//!   ├── calls:         Vec<Call>          ─┐
//!   ├── subscribes:    Vec<Subscribe>      ├─ each owns Vec<Dialog>
//!   ├── notifies:      Vec<Notify>        ─┘
//!   ├── registrations: Vec<Registration>
//!   └── publications:  Vec<Publication>
//! ```
//!
//! Every list is kept newest first. A [`Dialog`] lives inside exactly one
//! parent's `dialogs` vector, so it can never be shared or orphaned.
//! Transactions are referenced by [`TransactionId`]; the context keeps a
//! `TransactionId -> Owner` map to route substrate events back to the
//! aggregate that started them.
//!
//! Public ids (`id`) are small integers handed out by
//! [`crate::Context::update`]. Internal [`Key`]s never change and are never
//! reused, which is what the ownership map stores.

mod call;
mod dialog;
mod notify;
mod publication;
mod registration;
mod subscribe;

pub use call::Call;
pub use dialog::{Dialog, DialogStatus};
pub use notify::Notify;
pub use publication::Publication;
pub use registration::{Registration, clamp_period};
pub use subscribe::Subscribe;

use std::fmt;
use std::str::FromStr;

use sipua_sip_core::TransactionId;

/// Stable internal identity of an aggregate or dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub(crate) u64);

/// Which aggregate a transaction belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    Call(Key),
    Subscribe(Key),
    Notify(Key),
}

/// Typed replacement for the per-transaction back reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub parent: Parent,
    pub dialog: Option<Key>,
}

impl Owner {
    pub fn new(parent: Parent, dialog: Option<Key>) -> Self {
        Owner { parent, dialog }
    }
}

/// State of a subscription as carried in `Subscription-State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Terminated,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Terminated => "terminated",
        }
    }

    /// Status and reason from a `Subscription-State` header value.
    pub fn parse_header(value: &str) -> Option<(Self, Option<TerminationReason>)> {
        let mut parts = value.split(';').map(str::trim);
        let status = match parts.next()?.to_ascii_lowercase().as_str() {
            "pending" => SubscriptionStatus::Pending,
            "active" => SubscriptionStatus::Active,
            "terminated" => SubscriptionStatus::Terminated,
            _ => return None,
        };
        let reason = parts
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("reason"))
            .and_then(|(_, v)| v.trim().parse().ok());
        Some((status, reason))
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `reason=` of a terminated subscription (RFC 3265 3.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TerminationReason {
    Deactivated,
    Probation,
    Rejected,
    Timeout,
    GiveUp,
    #[default]
    NoResource,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Deactivated => "deactivated",
            TerminationReason::Probation => "probation",
            TerminationReason::Rejected => "rejected",
            TerminationReason::Timeout => "timeout",
            TerminationReason::GiveUp => "giveup",
            TerminationReason::NoResource => "noresource",
        }
    }
}

impl FromStr for TerminationReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "deactivated" => TerminationReason::Deactivated,
            "probation" => TerminationReason::Probation,
            "rejected" => TerminationReason::Rejected,
            "timeout" => TerminationReason::Timeout,
            "giveup" => TerminationReason::GiveUp,
            "noresource" => TerminationReason::NoResource,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared dialog bookkeeping of calls, subscribes and notifies.
pub trait DialogOwner {
    fn dialogs(&self) -> &[Dialog];
    fn dialogs_mut(&mut self) -> &mut Vec<Dialog>;

    fn dialog(&self, did: i32) -> Option<&Dialog> {
        self.dialogs().iter().find(|d| d.id == did && did > 0)
    }

    fn dialog_mut(&mut self, did: i32) -> Option<&mut Dialog> {
        self.dialogs_mut().iter_mut().find(|d| d.id == did && did > 0)
    }

    fn dialog_by_key(&self, key: Key) -> Option<&Dialog> {
        self.dialogs().iter().find(|d| d.key == key)
    }

    fn dialog_by_key_mut(&mut self, key: Key) -> Option<&mut Dialog> {
        self.dialogs_mut().iter_mut().find(|d| d.key == key)
    }

    /// Newest first, like every other list.
    fn add_dialog(&mut self, dialog: Dialog) {
        self.dialogs_mut().insert(0, dialog);
    }

    fn remove_dialog(&mut self, key: Key) -> Option<Dialog> {
        let pos = self.dialogs().iter().position(|d| d.key == key)?;
        Some(self.dialogs_mut().remove(pos))
    }

    /// Dialog whose pending lists contain `tid`
    fn dialog_with_transaction(&self, tid: TransactionId) -> Option<&Dialog> {
        self.dialogs()
            .iter()
            .find(|d| d.inc_trs.contains(&tid) || d.out_trs.contains(&tid))
    }
}

/// Calls, subscribes and notifies: dialog owners with a stable key and a
/// public id.
pub trait Aggregate: DialogOwner {
    fn key(&self) -> Key;
    fn id(&self) -> i32;
    fn set_id(&mut self, id: i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscription_state() {
        assert_eq!(
            SubscriptionStatus::parse_header("terminated;reason=timeout"),
            Some((SubscriptionStatus::Terminated, Some(TerminationReason::Timeout)))
        );
        assert_eq!(
            SubscriptionStatus::parse_header("active;expires=180"),
            Some((SubscriptionStatus::Active, None))
        );
        assert_eq!(SubscriptionStatus::parse_header("bogus"), None);
    }

    #[test]
    fn test_reason_round_trip_names() {
        for r in [
            TerminationReason::Deactivated,
            TerminationReason::Probation,
            TerminationReason::Rejected,
            TerminationReason::Timeout,
            TerminationReason::GiveUp,
            TerminationReason::NoResource,
        ] {
            assert_eq!(r.as_str().parse::<TerminationReason>(), Ok(r));
        }
        assert_eq!(TerminationReason::default(), TerminationReason::NoResource);
    }
}
