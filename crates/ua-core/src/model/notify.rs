use sipua_sip_core::TransactionId;

use super::{Aggregate, Dialog, DialogOwner, Key, SubscriptionStatus, TerminationReason};

/// Notifier side of an event subscription, created by an incoming SUBSCRIBE
#[derive(Debug, Clone)]
pub struct Notify {
    pub(crate) key: Key,
    pub id: i32,
    /// Resource the watcher subscribed to
    pub uri: String,
    pub dialogs: Vec<Dialog>,
    /// SUBSCRIBE server transaction that created the notify
    pub inc_tr: Option<TransactionId>,
    pub out_tr: Option<TransactionId>,
    pub retry: u32,
    pub ss_status: SubscriptionStatus,
    pub ss_reason: TerminationReason,
    /// Epoch second at which the subscription expires
    pub ss_expires: u64,
}

impl Notify {
    pub fn new(key: Key, uri: impl Into<String>) -> Self {
        Notify {
            key,
            id: 0,
            uri: uri.into(),
            dialogs: Vec::new(),
            inc_tr: None,
            out_tr: None,
            retry: 0,
            ss_status: SubscriptionStatus::Pending,
            ss_reason: TerminationReason::default(),
            ss_expires: 0,
        }
    }

    /// Seconds left before expiry, never negative
    pub fn remaining(&self, now_secs: u64) -> u64 {
        self.ss_expires.saturating_sub(now_secs)
    }

    pub fn transactions(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.inc_tr.into_iter().chain(self.out_tr).chain(
            self.dialogs
                .iter()
                .flat_map(|d| d.inc_trs.iter().chain(d.out_trs.iter()).copied()),
        )
    }
}

impl DialogOwner for Notify {
    fn dialogs(&self) -> &[Dialog] {
        &self.dialogs
    }

    fn dialogs_mut(&mut self) -> &mut Vec<Dialog> {
        &mut self.dialogs
    }
}

impl Aggregate for Notify {
    fn key(&self) -> Key {
        self.key
    }

    fn id(&self) -> i32 {
        self.id
    }

    fn set_id(&mut self, id: i32) {
        self.id = id;
    }
}
