use sipua_sip_core::TransactionId;

use super::{Aggregate, Dialog, DialogOwner, Key, SubscriptionStatus, TerminationReason};

/// Watcher side of an event subscription
#[derive(Debug, Clone)]
pub struct Subscribe {
    pub(crate) key: Key,
    pub id: i32,
    /// Resource we subscribed to
    pub uri: String,
    pub dialogs: Vec<Dialog>,
    /// Initial SUBSCRIBE transaction
    pub out_tr: Option<TransactionId>,
    pub retry: u32,
    /// Refresh period in seconds, from the Expires we sent or were granted
    pub refresh_interval: u32,
    pub ss_status: SubscriptionStatus,
    pub ss_reason: TerminationReason,
}

impl Subscribe {
    pub fn new(key: Key, uri: impl Into<String>, expires: u32) -> Self {
        Subscribe {
            key,
            id: 0,
            uri: uri.into(),
            dialogs: Vec::new(),
            out_tr: None,
            retry: 0,
            refresh_interval: expires,
            ss_status: SubscriptionStatus::Pending,
            ss_reason: TerminationReason::default(),
        }
    }

    pub fn transactions(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.out_tr.into_iter().chain(
            self.dialogs
                .iter()
                .flat_map(|d| d.inc_trs.iter().chain(d.out_trs.iter()).copied()),
        )
    }
}

impl DialogOwner for Subscribe {
    fn dialogs(&self) -> &[Dialog] {
        &self.dialogs
    }

    fn dialogs_mut(&mut self) -> &mut Vec<Dialog> {
        &mut self.dialogs
    }
}

impl Aggregate for Subscribe {
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
