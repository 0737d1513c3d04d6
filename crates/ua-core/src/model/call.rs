use sipua_sip_core::{Message, TransactionId};

use super::{Aggregate, Dialog, DialogOwner, Key};

/// An INVITE-initiated session and the dialogs it produced
#[derive(Debug, Clone)]
pub struct Call {
    pub(crate) key: Key,
    pub id: i32,
    /// Newest first
    pub dialogs: Vec<Dialog>,
    /// INVITE server transaction that created the call
    pub inc_tr: Option<TransactionId>,
    /// Initial outgoing transaction (INVITE, or OPTIONS outside a dialog)
    pub out_tr: Option<TransactionId>,
    pub retry: u32,
    pub external_reference: Option<u64>,
    /// Last challenge seen, reused to stamp later in-dialog requests
    pub response_auth: Option<Message>,
}

impl Call {
    pub fn new(key: Key) -> Self {
        Call {
            key,
            id: 0,
            dialogs: Vec::new(),
            inc_tr: None,
            out_tr: None,
            retry: 0,
            external_reference: None,
            response_auth: None,
        }
    }

    /// Every transaction that belongs to the call, dialogs included
    pub fn transactions(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.inc_tr
            .into_iter()
            .chain(self.out_tr)
            .chain(
                self.dialogs
                    .iter()
                    .flat_map(|d| d.inc_trs.iter().chain(d.out_trs.iter()).copied()),
            )
    }
}

impl DialogOwner for Call {
    fn dialogs(&self) -> &[Dialog] {
        &self.dialogs
    }

    fn dialogs_mut(&mut self) -> &mut Vec<Dialog> {
        &mut self.dialogs
    }
}

impl Aggregate for Call {
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
